//! Named worker-thread configuration.
//!
//! Worker threads can register under a name, making them addressable by task
//! groups ([`GroupConfig::restrict_to_named_thread`]) and by targeted
//! long-duration tasks.
//!
//! [`GroupConfig::restrict_to_named_thread`]: crate::dependency_graph::GroupConfig

use crate::{INVALID_NAMED_THREAD, NO_NAMED_THREAD, NamedThreadId};
use cadence_containers::HashMap;
use cadence_id::{Hash64, StringHash64};

/// What a named thread is allowed to pick up besides the work targeted at it.
///
/// Tasks targeted at the thread always take priority over general work, and
/// running general work on a named thread costs it responsiveness to its own
/// queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NamedThreadConfig {
    /// Whether the thread may run tasks of groups not restricted to it.
    pub can_run_general_tasks: bool,
    /// Whether the thread may run long-duration tasks not targeted at it.
    pub can_run_general_long_duration_tasks: bool,
}

impl Default for NamedThreadConfig {
    fn default() -> Self {
        Self {
            can_run_general_tasks: true,
            can_run_general_long_duration_tasks: false,
        }
    }
}

/// Builder assigning ids to named threads.
#[derive(Debug)]
pub struct ThreadsConfiguration {
    resolved: ResolvedThreadsConfig,
    next_id: NamedThreadId,
}

impl ThreadsConfiguration {
    pub fn new() -> Self {
        Self {
            resolved: ResolvedThreadsConfig::default(),
            next_id: NO_NAMED_THREAD + 1,
        }
    }

    /// Registers a named thread and returns its id.
    ///
    /// A name that is already registered returns the existing id with a
    /// warning. When the id space is exhausted, [`INVALID_NAMED_THREAD`] is
    /// returned.
    pub fn add_named_thread(
        &mut self,
        name: StringHash64,
        config: NamedThreadConfig,
    ) -> NamedThreadId {
        let id = self.next_id;
        if id == NO_NAMED_THREAD || id == INVALID_NAMED_THREAD {
            cadence_log::error!("named-thread id space exhausted; thread {name} not added");
            return INVALID_NAMED_THREAD;
        }

        if let Some(&existing) = self.resolved.named_threads.get(&name.hash()) {
            cadence_log::warn!(
                "a named thread called {name} already exists (id {existing}); keeping it"
            );
            return existing;
        }

        self.next_id += 1;
        self.resolved.named_threads.insert(name.hash(), id);
        self.resolved.debug_names.insert(id, name.to_string());
        self.resolved.configuration.insert(id, config);
        id
    }

    pub fn into_configuration(self) -> ResolvedThreadsConfig {
        self.resolved
    }
}

impl Default for ThreadsConfiguration {
    fn default() -> Self {
        Self::new()
    }
}

/// The named-thread tables consumed by the task manager at load time.
#[derive(Clone, Debug, Default)]
pub struct ResolvedThreadsConfig {
    pub(crate) named_threads: HashMap<Hash64, NamedThreadId>,
    pub(crate) debug_names: HashMap<NamedThreadId, String>,
    pub(crate) configuration: HashMap<NamedThreadId, NamedThreadConfig>,
}

impl ResolvedThreadsConfig {
    /// Looks up a named thread by name.
    pub fn named_thread(&self, name: Hash64) -> Option<NamedThreadId> {
        self.named_threads.get(&name).copied()
    }

    /// The configuration of the given thread, or the default for threads
    /// without one (including the unnamed thread id).
    pub fn thread_config(&self, thread: NamedThreadId) -> NamedThreadConfig {
        self.configuration
            .get(&thread)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn max_thread_id(&self) -> NamedThreadId {
        self.configuration.keys().copied().max().unwrap_or(0)
    }

    /// Logs the registered threads and their capabilities.
    pub fn print_debug(&self) {
        if self.debug_names.is_empty() {
            cadence_log::debug!("no named threads are configured");
            return;
        }
        let mut ids: Vec<_> = self.debug_names.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let config = self.thread_config(id);
            cadence_log::debug!(
                "named thread {id}: {} [general tasks: {}, general long-duration tasks: {}]",
                self.debug_names[&id],
                config.can_run_general_tasks,
                config.can_run_general_long_duration_tasks,
            );
        }
    }
}
