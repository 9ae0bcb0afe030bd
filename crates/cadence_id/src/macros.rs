//! Macros for creating string hashes.

/// Creates a [`StringHash64`](crate::StringHash64) for the given string,
/// registering the string so the hash stays printable.
#[macro_export]
macro_rules! hash64 {
    ($string:expr) => {
        $crate::StringHash64::new($string)
    };
}
