//! Lifetime-distinct task storage.
//!
//! Transient tasks live exactly one frame and are reclaimed en masse when the
//! frame resets; long-duration tasks are allocated and released individually;
//! completion flags are tracked so leaked markers show up in the outstanding
//! count.

use crate::task::{CompletionFlag, Task};
use cadence_containers::HashMap;
use parking_lot::Mutex;
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Frame-scoped storage for transient tasks.
///
/// Allocation just appends; nothing is freed individually. [`fast_clear`]
/// drops every task of the frame at once during the frame reset, at which
/// point all of them must have completed.
///
/// [`fast_clear`]: TransientTaskArena::fast_clear
pub(crate) struct TransientTaskArena {
    tasks: Mutex<Vec<Arc<Task>>>,
}

impl TransientTaskArena {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn retain(&self, task: Arc<Task>) {
        self.tasks.lock().push(task);
    }

    /// Reclaims every task created during the frame.
    pub(crate) fn fast_clear(&self) {
        let mut tasks = self.tasks.lock();
        for task in tasks.iter() {
            assert!(
                task.is_completed(),
                "a transient task reached the end of its frame without completing"
            );
        }
        tasks.clear();
    }
}

/// Storage for long-duration tasks, which survive frame resets and are
/// released one by one as they complete.
pub(crate) struct LongDurationTaskPool {
    tasks: Mutex<HashMap<usize, Arc<Task>>>,
}

impl LongDurationTaskPool {
    pub(crate) fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::default()),
        }
    }

    pub(crate) fn insert(&self, task: &Arc<Task>) {
        let previous = self
            .tasks
            .lock()
            .insert(Arc::as_ptr(task) as usize, Arc::clone(task));
        assert!(previous.is_none(), "long-duration task inserted twice");
    }

    pub(crate) fn release(&self, task: &Arc<Task>) {
        let removed = self.tasks.lock().remove(&(Arc::as_ptr(task) as usize));
        assert!(
            removed.is_some(),
            "releasing a long-duration task that is not in the pool"
        );
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.lock().len()
    }
}

/// Allocation point for completion flags, with an outstanding count for
/// observability.
pub(crate) struct MarkerPool {
    outstanding: AtomicUsize,
}

impl MarkerPool {
    pub(crate) fn new() -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocate(&self) -> Arc<CompletionFlag> {
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Arc::new(CompletionFlag::new())
    }

    pub(crate) fn release(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "marker released twice");
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed_task() -> Arc<Task> {
        let task = Arc::new(Task::new(1, 0, 0, None, Box::new(|| {})));
        task.mark_ready(true);
        let function = task.begin_run();
        function();
        task.finish_run();
        task
    }

    #[test]
    fn arena_clears_completed_tasks() {
        let arena = TransientTaskArena::new();
        for _ in 0..3 {
            arena.retain(completed_task());
        }
        arena.fast_clear();
        arena.fast_clear();
    }

    #[test]
    #[should_panic(expected = "without completing")]
    fn arena_clear_with_incomplete_task_panics() {
        let arena = TransientTaskArena::new();
        arena.retain(Arc::new(Task::new(1, 0, 0, None, Box::new(|| {}))));
        arena.fast_clear();
    }

    #[test]
    fn long_duration_pool_tracks_individual_tasks() {
        let pool = LongDurationTaskPool::new();
        let first = completed_task();
        let second = completed_task();

        pool.insert(&first);
        pool.insert(&second);
        assert_eq!(pool.len(), 2);

        pool.release(&first);
        assert_eq!(pool.len(), 1);
        pool.release(&second);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    #[should_panic(expected = "not in the pool")]
    fn releasing_unknown_task_panics() {
        let pool = LongDurationTaskPool::new();
        pool.release(&completed_task());
    }

    #[test]
    fn marker_pool_counts_outstanding_flags() {
        let pool = MarkerPool::new();
        let _first = pool.allocate();
        let _second = pool.allocate();
        assert_eq!(pool.outstanding(), 2);
        pool.release();
        assert_eq!(pool.outstanding(), 1);
    }
}
