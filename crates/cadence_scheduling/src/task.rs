//! The task object and its state machine.

use crate::{FrameKey, GroupId, LONG_DURATION_GROUP, NamedThreadId, TaskFn, manager::TaskManager,
            pool::MarkerPool};
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

/// Upper bound on the number of tasks a single task can notify on completion.
/// Overflowing it is a detected error; wide fan-in should go through a
/// dedicated task group instead.
pub const MAX_REVERSE_DEPS: usize = 32;

/// A unit of work tracked by the [`TaskManager`]: a one-shot callable plus the
/// bookkeeping needed to order it against other tasks of the same group.
///
/// All mutable state sits behind a single short-lived lock. The lock is never
/// held while the task's function runs, so a task may create and wire new
/// tasks of its own group from within its function.
pub(crate) struct Task {
    group: GroupId,
    frame_key: FrameKey,
    target_thread: NamedThreadId,
    execution_time_point: Option<Instant>,
    state: Mutex<TaskState>,
}

struct TaskState {
    phase: TaskPhase,
    function: Option<TaskFn>,
    reverse_deps: Vec<Arc<Task>>,
    marker: Option<Arc<CompletionFlag>>,
    held_by_wrapper: bool,
}

/// Where a task is in its lifecycle. The prerequisite count is folded into
/// the pending phase; the other phases are terminal-ordered sentinels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TaskPhase {
    /// Waiting for `remaining` prerequisites to complete.
    Pending { remaining: u32 },
    /// All prerequisites met; queued for execution.
    WaitingToRun,
    Running,
    Completed,
}

impl Task {
    pub(crate) fn new(
        group: GroupId,
        frame_key: FrameKey,
        target_thread: NamedThreadId,
        execution_time_point: Option<Instant>,
        function: TaskFn,
    ) -> Self {
        Self {
            group,
            frame_key,
            target_thread,
            execution_time_point,
            state: Mutex::new(TaskState {
                phase: TaskPhase::Pending { remaining: 0 },
                function: Some(function),
                reverse_deps: Vec::new(),
                marker: None,
                held_by_wrapper: true,
            }),
        }
    }

    pub(crate) fn group(&self) -> GroupId {
        self.group
    }

    pub(crate) fn frame_key(&self) -> FrameKey {
        self.frame_key
    }

    pub(crate) fn target_thread(&self) -> NamedThreadId {
        self.target_thread
    }

    pub(crate) fn execution_time_point(&self) -> Option<Instant> {
        self.execution_time_point
    }

    pub(crate) fn is_long_duration(&self) -> bool {
        self.group == LONG_DURATION_GROUP
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.state.lock().phase == TaskPhase::Completed
    }

    pub(crate) fn is_waiting_to_run(&self) -> bool {
        self.state.lock().phase == TaskPhase::WaitingToRun
    }

    pub(crate) fn can_run(&self) -> bool {
        matches!(self.state.lock().phase, TaskPhase::Pending { remaining: 0 })
    }

    /// Makes `dependent` wait for `dependency` to complete.
    ///
    /// Both tasks must belong to the same group (cross-group ordering is only
    /// expressible through the group graph) and, for transient tasks, to the
    /// same frame. A dependency on an already completed task is skipped; a
    /// dependency on a running task is honored, since notification happens
    /// after the function returns.
    pub(crate) fn add_dependency(dependent: &Arc<Task>, dependency: &Arc<Task>) {
        assert!(
            !Arc::ptr_eq(dependent, dependency),
            "a task cannot depend on itself"
        );
        assert_eq!(
            dependent.group, dependency.group,
            "a task cannot depend on a task in a different group; order groups through the group graph"
        );
        if dependent.group != LONG_DURATION_GROUP {
            assert_eq!(
                dependent.frame_key, dependency.frame_key,
                "transient task used outside the frame it was created in"
            );
        }

        let mut state = dependent.state.lock();
        match state.phase {
            TaskPhase::Pending { .. } => {}
            phase => panic!("cannot add a dependency to a task that is {phase:?}"),
        }

        let mut dependency_state = dependency.state.lock();
        if dependency_state.phase == TaskPhase::Completed {
            cadence_log::debug!("making a task depend on an already completed task; skipped");
            return;
        }
        assert!(
            dependency_state.reverse_deps.len() < MAX_REVERSE_DEPS,
            "reverse-dependency overflow: one task cannot notify more than {MAX_REVERSE_DEPS} others"
        );

        let TaskPhase::Pending { remaining } = &mut state.phase else {
            unreachable!()
        };
        *remaining += 1;
        dependency_state.reverse_deps.push(Arc::clone(dependent));
    }

    /// Attaches a completion flag, set when the task completes. At most one
    /// marker per task.
    pub(crate) fn attach_marker(&self, flag: Arc<CompletionFlag>) {
        let mut state = self.state.lock();
        assert!(
            state.marker.is_none(),
            "a completion marker is already attached to this task"
        );
        match state.phase {
            TaskPhase::Pending { .. } => {}
            phase => panic!("cannot attach a completion marker to a task that is {phase:?}"),
        }
        assert!(!flag.is_set(), "cannot reuse an already completed marker");
        state.marker = Some(flag);
    }

    /// Transitions the task towards the run queue. Called with `from_wrapper`
    /// when the owning [`TaskHandle`] releases the task, and without it when
    /// a prerequisite completion may have made the task runnable.
    ///
    /// Returns whether the caller must now enqueue the task. While the
    /// wrapper still holds the task it is never enqueued, which keeps
    /// dependency setup race-free.
    pub(crate) fn mark_ready(&self, from_wrapper: bool) -> bool {
        let mut state = self.state.lock();
        if from_wrapper {
            assert!(state.held_by_wrapper, "task released twice");
            state.held_by_wrapper = false;
        } else if state.held_by_wrapper {
            return false;
        }
        match state.phase {
            TaskPhase::Pending { remaining: 0 } => {
                state.phase = TaskPhase::WaitingToRun;
                true
            }
            TaskPhase::Pending { .. } => false,
            phase => panic!("cannot queue a task that is {phase:?}"),
        }
    }

    /// Records the completion of one prerequisite. Returns whether the task
    /// became runnable and must be enqueued; the decision is made under the
    /// task lock so the zero-transition and the enqueue claim are atomic.
    pub(crate) fn complete_dependency(&self) -> bool {
        let mut state = self.state.lock();
        let TaskPhase::Pending { remaining } = &mut state.phase else {
            panic!(
                "prerequisite completion notified for a task that is {:?}",
                state.phase
            );
        };
        assert!(
            *remaining > 0,
            "prerequisite completion notified for a task with no pending prerequisites"
        );
        *remaining -= 1;
        if *remaining == 0 && !state.held_by_wrapper {
            state.phase = TaskPhase::WaitingToRun;
            true
        } else {
            false
        }
    }

    /// Claims the task for execution and hands out its function. The lock is
    /// released before the function is invoked.
    pub(crate) fn begin_run(&self) -> TaskFn {
        let mut state = self.state.lock();
        assert_eq!(
            state.phase,
            TaskPhase::WaitingToRun,
            "run called on a task that is not waiting to run"
        );
        state.phase = TaskPhase::Running;
        state
            .function
            .take()
            .expect("task function executed more than once")
    }

    /// Completes the task and drains its notification list and marker. The
    /// caller performs the actual notification without holding this task's
    /// lock, so dependents can be locked without ordering hazards.
    pub(crate) fn finish_run(&self) -> (Vec<Arc<Task>>, Option<Arc<CompletionFlag>>) {
        let mut state = self.state.lock();
        assert_eq!(state.phase, TaskPhase::Running, "task completed twice");
        state.phase = TaskPhase::Completed;
        (
            std::mem::take(&mut state.reverse_deps),
            state.marker.take(),
        )
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("group", &self.group)
            .field("frame_key", &self.frame_key)
            .finish_non_exhaustive()
    }
}

/// The boolean behind a [`CompletionMarker`], set exactly once when the
/// associated task completes.
pub(crate) struct CompletionFlag(AtomicBool);

impl CompletionFlag {
    pub(crate) fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub(crate) fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Observer for the completion of a single task, usable from any thread.
///
/// Dropping a marker whose task has not completed is a detected error: the
/// flag would be written after the observer is gone.
pub struct CompletionMarker {
    flag: Arc<CompletionFlag>,
    group: GroupId,
    pool: Arc<MarkerPool>,
}

impl CompletionMarker {
    pub(crate) fn new(flag: Arc<CompletionFlag>, group: GroupId, pool: Arc<MarkerPool>) -> Self {
        Self { flag, group, pool }
    }

    /// Whether the associated task has completed.
    pub fn is_completed(&self) -> bool {
        self.flag.is_set()
    }

    /// The group of the associated task.
    pub fn task_group(&self) -> GroupId {
        self.group
    }

    pub(crate) fn set_group(&mut self, group: GroupId) {
        self.group = group;
    }

    pub(crate) fn flag(&self) -> &Arc<CompletionFlag> {
        &self.flag
    }
}

impl Drop for CompletionMarker {
    fn drop(&mut self) {
        assert!(
            self.flag.is_set(),
            "a completion marker must not be destroyed before its task completes"
        );
        self.pool.release();
    }
}

impl fmt::Debug for CompletionMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionMarker")
            .field("completed", &self.is_completed())
            .field("group", &self.group)
            .finish_non_exhaustive()
    }
}

/// Scope guard for a freshly created task.
///
/// While the handle lives, the task is exempt from being queued even if it
/// has no pending prerequisites, so dependencies and markers can be wired
/// without racing the workers. Dropping the handle releases the task; a task
/// that is never released never runs (and, for a transient task, trips the
/// end-of-frame completion check).
pub struct TaskHandle<'m> {
    task: Option<Arc<Task>>,
    manager: &'m TaskManager,
}

impl<'m> TaskHandle<'m> {
    pub(crate) fn new(task: Arc<Task>, manager: &'m TaskManager) -> Self {
        Self {
            task: Some(task),
            manager,
        }
    }

    pub(crate) fn task(&self) -> &Arc<Task> {
        self.task
            .as_ref()
            .expect("task handle used after release")
    }

    /// The group the task belongs to.
    pub fn task_group(&self) -> GroupId {
        self.task().group()
    }

    /// Whether the task has completed. Always false while the handle lives,
    /// unless the task completed through another path.
    pub fn is_completed(&self) -> bool {
        self.task().is_completed()
    }

    /// Whether every prerequisite of the task has completed.
    pub fn can_run(&self) -> bool {
        self.task().can_run()
    }

    /// Whether the task is queued for execution.
    pub fn is_waiting_to_run(&self) -> bool {
        self.task().is_waiting_to_run()
    }

    /// Makes this task wait for `other` to complete. Both tasks must belong
    /// to the same group.
    pub fn add_dependency_to(&self, other: &TaskHandle<'_>) {
        Task::add_dependency(self.task(), other.task());
    }

    /// Chains a continuation: creates a new task in the same group that runs
    /// only after this one has completed.
    pub fn then(&self, function: impl FnOnce() + Send + 'static) -> TaskHandle<'m> {
        let next = self.manager.get_task(self.task_group(), function);
        Task::add_dependency(next.task(), self.task());
        next
    }

    /// Allocates a completion marker and attaches it to this task.
    pub fn create_completion_marker(&self) -> CompletionMarker {
        let mut marker = self.manager.allocate_completion_marker();
        marker.set_group(self.task_group());
        self.task().attach_marker(Arc::clone(marker.flag()));
        marker
    }
}

impl Drop for TaskHandle<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.manager.release_task(task);
        }
    }
}

impl fmt::Debug for TaskHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}
