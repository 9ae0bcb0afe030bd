//! Chunked parallel iteration within a task group.

use crate::{GroupId, manager::TaskManager, task::Task};
use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

struct ForEachState<'s, T, F> {
    items: &'s [T],
    function: F,
    next_index: AtomicUsize,
    entries_per_task: usize,
}

/// Calls `function` for every element of `items` (with its index), spread
/// over tasks of the given group, and returns once every element has been
/// visited. The calling thread participates, so this can be called from
/// within a task of the same group; either way the group must already be
/// started.
///
/// `entries_per_task` is the number of elements each task handles. Tasks
/// replenish themselves from worker threads, so large slices do not pay for
/// all their tasks up front; the initial dispatch is capped near the
/// available parallelism.
pub fn for_each<T, F>(
    manager: &TaskManager,
    group: GroupId,
    items: &[T],
    function: F,
    entries_per_task: usize,
) where
    T: Sync,
    F: Fn(&T, usize) + Sync,
{
    assert!(entries_per_task > 0, "entries_per_task must be at least 1");
    if items.is_empty() {
        return;
    }

    let state = ForEachState {
        items,
        function,
        next_index: AtomicUsize::new(0),
        entries_per_task,
    };

    // Gathering point every chunk task feeds into
    let final_handle = manager.get_task(group, || {});
    let final_task = Arc::clone(final_handle.task());

    let max_dispatch = (thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
        + 2)
        * 2;
    let chunk_count = items.len().div_ceil(entries_per_task);
    let dispatch_count = chunk_count.min(max_dispatch).max(1);
    for _ in 0..dispatch_count {
        let task = manager.get_task_scoped(group, chunk_task(manager, group, &state, &final_task));
        Task::add_dependency(&final_task, task.task());
    }

    let marker = final_handle.create_completion_marker();
    drop(final_handle);

    // Waiting here is what keeps `state` and the caller's borrows alive until
    // every chunk task has completed, making the scoped tasks sound.
    manager.actively_wait_for(&marker);
}

fn chunk_task<'s, T, F>(
    manager: &'s TaskManager,
    group: GroupId,
    state: &'s ForEachState<'s, T, F>,
    final_task: &'s Arc<Task>,
) -> Box<dyn FnOnce() + Send + 's>
where
    T: Sync,
    F: Fn(&T, usize) + Sync,
{
    Box::new(move || {
        let base = state
            .next_index
            .fetch_add(state.entries_per_task, Ordering::AcqRel);
        let end = (base + state.entries_per_task).min(state.items.len());
        for index in base..end {
            (state.function)(&state.items[index], index);
        }

        // Replenish from the worker, so the dispatching thread did not have
        // to enqueue every chunk up front. The replacement is wired into the
        // gathering task before this task completes, so the gathering task
        // cannot run early.
        if state.next_index.load(Ordering::Acquire) < state.items.len() {
            let task = manager.get_task_scoped(group, chunk_task(manager, group, state, final_task));
            Task::add_dependency(final_task, task.task());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency_graph::{GroupConfig, TaskGroupGraph};
    use crate::manager::{SelectionMode, TaskManager};
    use crate::named_threads::ResolvedThreadsConfig;
    use crate::GroupId;
    use cadence_id::hash64;
    use std::sync::atomic::{AtomicBool, AtomicU32};
    use std::time::{Duration, Instant};

    /// Sets the flag when dropped, so worker loops wind down even when the
    /// test body panics.
    struct StopGuard<'a>(&'a AtomicBool);

    impl Drop for StopGuard<'_> {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    fn manager_with_group(name: &str) -> (TaskManager, GroupId) {
        let mut graph = TaskGroupGraph::new();
        let group = graph.add_task_group(hash64!(name), GroupConfig::default());
        let mut manager = TaskManager::new();
        manager
            .load(graph.compile().unwrap(), ResolvedThreadsConfig::default())
            .unwrap();
        (manager, group)
    }

    /// Installs a start callback that signals once the group is running and
    /// keeps the group open until the first for_each chunk has been seen, at
    /// which point the chunk tasks themselves keep it open.
    fn hold_group_until_first_chunk(
        manager: &TaskManager,
        group: GroupId,
        started: &Arc<AtomicBool>,
        chunk_seen: &Arc<AtomicBool>,
    ) {
        let started = Arc::clone(started);
        let chunk_seen = Arc::clone(chunk_seen);
        let submitted = AtomicBool::new(false);
        manager.set_start_task_group_callback(group, move |tm| {
            if !submitted.swap(true, Ordering::AcqRel) {
                let started = Arc::clone(&started);
                tm.get_task(group, move || {
                    started.store(true, Ordering::Release);
                });
                let chunk_seen = Arc::clone(&chunk_seen);
                tm.get_task(group, move || {
                    let begin = Instant::now();
                    while !chunk_seen.load(Ordering::Acquire)
                        && begin.elapsed() < Duration::from_secs(10)
                    {
                        thread::yield_now();
                    }
                });
            }
        });
    }

    #[test]
    fn visits_every_element_exactly_once() {
        let (manager, group) = manager_with_group("fe-once");

        let started = Arc::new(AtomicBool::new(false));
        let chunk_seen = Arc::new(AtomicBool::new(false));
        hold_group_until_first_chunk(&manager, group, &started, &chunk_seen);

        let counters: Vec<AtomicU32> = (0..500).map(|_| AtomicU32::new(0)).collect();

        let stop = AtomicBool::new(false);
        thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    while !stop.load(Ordering::Acquire) {
                        manager.run_a_task(false, SelectionMode::Normal);
                        thread::yield_now();
                    }
                });
            }

            let _guard = StopGuard(&stop);

            let begin = Instant::now();
            while !started.load(Ordering::Acquire) {
                assert!(begin.elapsed() < Duration::from_secs(10), "test timed out");
                thread::yield_now();
            }

            for_each(
                &manager,
                group,
                &counters,
                |counter, _index| {
                    chunk_seen.store(true, Ordering::Release);
                    counter.fetch_add(1, Ordering::AcqRel);
                },
                32,
            );
        });

        assert!(
            counters
                .iter()
                .all(|counter| counter.load(Ordering::Acquire) == 1)
        );
    }

    #[test]
    fn passes_matching_indices() {
        let (manager, group) = manager_with_group("fe-index");

        // A signal task marks the group as running; with no other thread
        // driving the manager, the group cannot complete between the signal
        // and the for_each call below anchoring it with its own tasks.
        let started = Arc::new(AtomicBool::new(false));
        {
            let started = Arc::clone(&started);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(group, move |tm| {
                if !submitted.swap(true, Ordering::AcqRel) {
                    let started = Arc::clone(&started);
                    tm.get_task(group, move || {
                        started.store(true, Ordering::Release);
                    });
                }
            });
        }

        let begin = Instant::now();
        while !started.load(Ordering::Acquire) {
            assert!(begin.elapsed() < Duration::from_secs(10), "test timed out");
            manager.run_a_task(false, SelectionMode::Normal);
        }

        let items: Vec<usize> = (0..100).collect();
        let mismatches = AtomicU32::new(0);
        for_each(
            &manager,
            group,
            &items,
            |item, index| {
                if *item != index {
                    mismatches.fetch_add(1, Ordering::AcqRel);
                }
            },
            7,
        );

        assert_eq!(mismatches.load(Ordering::Acquire), 0);
    }

    #[test]
    fn empty_slice_is_a_no_op() {
        let (manager, group) = manager_with_group("fe-empty");
        let items: [u32; 0] = [];
        for_each(&manager, group, &items, |_, _| unreachable!(), 16);
    }
}
