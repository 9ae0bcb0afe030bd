//! Stable string identifiers.
//!
//! Task groups and named threads are referred to by 64-bit string hashes.
//! [`StringHash64`] records the hashed string in a global registry so ids
//! stay printable in logs; [`ConstStringHash64`] is for literals hashed at
//! compile time.

#[macro_use]
mod macros;

use lazy_static::lazy_static;
use std::{
    cmp,
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Mutex,
};

/// A 64-bit hash.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash64(u64);

/// A 64-bit hash of a string.
///
/// This object stores the string in a global registry and can be formatted
/// into it by means of the [`Display`](fmt::Display) trait.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StringHash64(Hash64);

/// A 64-bit hash of a string literal. Can be constructed at compile time.
///
/// This object remembers the original string and can be formatted into it by
/// means of the [`Display`](fmt::Display) trait.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConstStringHash64 {
    hash: Hash64,
    string: &'static str,
}

lazy_static! {
    static ref STRING_HASH_64_REGISTRY: Mutex<HashMap<Hash64, String>> = Mutex::new(HashMap::new());
}

impl From<Hash64> for u64 {
    fn from(hash: Hash64) -> Self {
        hash.0
    }
}

impl From<u64> for Hash64 {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl StringHash64 {
    /// Creates a new [`StringHash64`] for the given string.
    ///
    /// The string and associated hash are inserted into a global registry so
    /// that the string can be looked up.
    ///
    /// # Concurrency
    /// The method has to temporarily acquire a lock on the global string
    /// registry in order to record the hash and string pair.
    pub fn new<S: ToString>(string: S) -> Self {
        let string = string.to_string();
        let hash = compute_hash_str_64(&string);
        Self::new_with_hash(string, hash)
    }

    /// Creates a new [`StringHash64`] for the given string with the given
    /// precomputed hash.
    ///
    /// # Concurrency
    /// The method has to temporarily acquire a lock on the global string
    /// registry in order to record the hash and string pair.
    pub fn new_with_hash<S: ToString>(string: S, hash: Hash64) -> Self {
        STRING_HASH_64_REGISTRY
            .lock()
            .unwrap()
            .entry(hash)
            .or_insert_with(|| string.to_string());
        Self(hash)
    }

    /// The 64-bit hash value.
    pub fn hash(&self) -> Hash64 {
        self.0
    }
}

impl ConstStringHash64 {
    /// Creates a hash of the given string literal. This method is evaluated
    /// at compile time.
    pub const fn new(string: &'static str) -> Self {
        Self {
            hash: compute_hash_str_64(string),
            string,
        }
    }

    /// Returns the string literal.
    pub const fn string(&self) -> &'static str {
        self.string
    }

    /// Unwraps the string hash to obtain the underlying [`Hash64`].
    pub const fn into_hash(self) -> Hash64 {
        let Self { hash, string: _ } = self;
        hash
    }
}

/// Looks up the string behind a hash, if it was registered through
/// [`StringHash64`].
pub fn lookup_hash_64(hash: Hash64) -> Option<String> {
    STRING_HASH_64_REGISTRY.lock().unwrap().get(&hash).cloned()
}

/// Computes a 64-bit hash of the given string.
pub const fn compute_hash_str_64(string: &str) -> Hash64 {
    Hash64(const_fnv1a_hash::fnv1a_hash_str_64(string))
}

impl fmt::Display for Hash64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StringHash64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(string) = STRING_HASH_64_REGISTRY.lock().unwrap().get(&self.0) {
            write!(f, "{string}")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Display for ConstStringHash64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string)
    }
}

impl AsRef<str> for ConstStringHash64 {
    fn as_ref(&self) -> &str {
        self.string
    }
}

impl Ord for ConstStringHash64 {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl PartialOrd for ConstStringHash64 {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

// Disabling this error because the requirement for `Hash`,
// `k1 == k2 -> hash(k1) == hash(k2)`, is still upheld
// even though we only hash one of the fields
#[allow(clippy::derived_hash_with_manual_eq)]
impl Hash for ConstStringHash64 {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}
