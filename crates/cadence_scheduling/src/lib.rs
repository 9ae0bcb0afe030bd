//! Frame-based cooperative task scheduling.
//!
//! The scheduler is driven by a compiled plan: a user-declared DAG of *task
//! groups* is compiled into a linear opcode stream walked by a small number of
//! parallel *chains*. Within a frame, every group starts exactly once, its
//! accumulated tasks are drained by whichever threads offer their time to the
//! [`TaskManager`], and the group completes once its last task is destroyed.
//! When every chain reaches its end, the frame state is reset and the next
//! frame begins.
//!
//! Threads are not owned by the manager: any thread can participate through
//! [`TaskManager::run_a_task`], [`TaskManager::wait_for_a_task`] or
//! [`TaskManager::run_tasks_for`]. Threads registered under a name can be
//! targeted by groups via
//! [`GroupConfig::restrict_to_named_thread`](dependency_graph::GroupConfig).

pub mod dependency_graph;
pub mod for_each;
pub mod manager;
pub mod named_threads;
pub mod pool;
pub mod task;

pub use dependency_graph::{CompiledGraph, GroupConfig, Opcode, TaskGroupGraph};
pub use for_each::for_each;
pub use manager::{SelectionMode, TaskManager};
pub use named_threads::{NamedThreadConfig, ResolvedThreadsConfig, ThreadsConfiguration};
pub use task::{CompletionMarker, TaskHandle};

/// Identifies a task group. Groups are allocated by the
/// [`TaskGroupGraph`] builder; the id space is deliberately small.
pub type GroupId = u8;

/// The reserved group for long-duration tasks. It is always started and never
/// completes while the manager lives.
pub const LONG_DURATION_GROUP: GroupId = 0;

/// Sentinel for "no such group". Also the value of
/// [`TaskManager::current_group`] outside of any task.
pub const INVALID_GROUP: GroupId = GroupId::MAX;

/// Identifies a named worker thread.
pub type NamedThreadId = u8;

/// The id carried by ordinary (unnamed) worker threads.
pub const NO_NAMED_THREAD: NamedThreadId = 0;

/// Sentinel for "no such named thread".
pub const INVALID_NAMED_THREAD: NamedThreadId = NamedThreadId::MAX;

/// Monotonic counter identifying the current frame, wrapping modulo 2^24.
/// Transient tasks snapshot it at creation so that use outside their frame is
/// a detected error.
pub type FrameKey = u32;

pub(crate) const FRAME_KEY_MASK: FrameKey = 0xFF_FFFF;

/// The work executed by a task: a move-only, one-shot callable.
pub type TaskFn = Box<dyn FnOnce() + Send>;

/// A start- or end-of-group hook, invoked once per frame, every frame, with
/// the manager passed back in so the hook can create tasks.
pub type GroupCallback = Box<dyn FnMut(&manager::TaskManager) + Send>;
