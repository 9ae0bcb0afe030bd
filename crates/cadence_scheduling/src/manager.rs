//! The task manager runtime.
//!
//! A [`TaskManager`] owns the per-frame state of a compiled group graph:
//! group state machines, chain cursors, run queues and the transient and
//! long-duration task storage. It does not own any threads. Threads offer
//! their time through [`run_a_task`](TaskManager::run_a_task),
//! [`wait_for_a_task`](TaskManager::wait_for_a_task) and friends, and any of
//! them may end up advancing the frame interpreter, running group callbacks
//! or resetting the frame.

use crate::{
    FRAME_KEY_MASK, FrameKey, GroupCallback, GroupId, INVALID_GROUP, INVALID_NAMED_THREAD,
    LONG_DURATION_GROUP, NO_NAMED_THREAD, NamedThreadId, TaskFn,
    dependency_graph::{CompiledGraph, Opcode},
    named_threads::{NamedThreadConfig, ResolvedThreadsConfig},
    pool::{LongDurationTaskPool, MarkerPool, TransientTaskArena},
    task::{CompletionMarker, Task, TaskHandle},
};
use anyhow::{Result, anyhow, bail};
use cadence_id::Hash64;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    cell::Cell,
    collections::BTreeMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

/// How a thread entering the worker loop selects tasks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionMode {
    /// Honor the calling thread's configuration.
    #[default]
    Normal,
    /// A named thread only runs work targeted at it.
    OnlyOwnTasks,
    /// A named thread also takes general work its configuration excludes.
    /// This never lets an unnamed worker take tasks restricted to a named
    /// thread.
    Anything,
}

const MAX_SPIN_COUNT: u32 = 1000;
const MAX_YIELD_COUNT: u32 = 100;
const WAIT_SLEEP: Duration = Duration::from_micros(100);

/// Consecutive misses after which `run_tasks_for` gives up early.
const MAX_UNLUCKY_STRIKES: u32 = 16;

type StopCallback = Box<dyn FnOnce(&TaskManager) + Send>;

thread_local! {
    static CURRENT_GROUP: Cell<GroupId> = const { Cell::new(INVALID_GROUP) };
    static CURRENT_THREAD: Cell<NamedThreadId> = const { Cell::new(NO_NAMED_THREAD) };
    /// Manager address and state key last observed by `advance` on this
    /// thread, so idle threads do not hammer the chain locks.
    static LAST_STATE_KEY: Cell<(usize, u32)> = const { Cell::new((0, u32::MAX)) };
    static SCAN_ROTATION: Cell<usize> = const { Cell::new(0) };
}

/// MPMC queue of ready tasks.
struct TaskQueue {
    sender: Sender<Arc<Task>>,
    receiver: Receiver<Arc<Task>>,
}

impl TaskQueue {
    fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    fn push(&self, task: Arc<Task>) {
        self.sender.send(task).expect("task queue disconnected");
    }

    fn try_pop(&self) -> Option<Arc<Task>> {
        self.receiver.try_recv().ok()
    }
}

struct GroupState {
    tasks_to_run: TaskQueue,
    /// Tasks created minus tasks destroyed.
    remaining_tasks: AtomicU32,
    is_started: AtomicBool,
    is_completed: AtomicBool,
    will_start: AtomicBool,
    /// Wakeups staged while the group has not started, transferred to the
    /// manager-wide ready counter by `execute_task_group`.
    tasks_that_can_run: AtomicU32,
    required_thread: NamedThreadId,
    start_callback: Mutex<Option<GroupCallback>>,
    end_callback: Mutex<Option<GroupCallback>>,
}

impl GroupState {
    fn new(required_thread: NamedThreadId) -> Self {
        Self {
            tasks_to_run: TaskQueue::new(),
            remaining_tasks: AtomicU32::new(0),
            is_started: AtomicBool::new(false),
            is_completed: AtomicBool::new(false),
            will_start: AtomicBool::new(false),
            tasks_that_can_run: AtomicU32::new(0),
            required_thread,
            start_callback: Mutex::new(None),
            end_callback: Mutex::new(None),
        }
    }
}

/// Progress of one chain through the opcode stream. Advancement within a
/// chain is serialized by the surrounding mutex; chains advance concurrently.
struct ChainCursor {
    index: usize,
    ended: bool,
}

struct ThreadState {
    config: NamedThreadConfig,
    /// Groups restricted to this thread.
    groups: Vec<GroupId>,
    long_duration_tasks_to_run: TaskQueue,
}

/// Time-ordered set of delayed tasks behind a coarse lock. Delayed tasks are
/// best-effort and lowest priority; the polling step opportunistically skips
/// when the lock is contended.
struct DelayedTaskSet {
    tasks: Mutex<BTreeMap<(Instant, u64), Arc<Task>>>,
    sequence: AtomicU64,
}

impl DelayedTaskSet {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
        }
    }

    fn insert(&self, execution_time_point: Instant, task: Arc<Task>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.tasks
            .lock()
            .insert((execution_time_point, sequence), task);
    }

    /// Removes the tasks whose time has come, or all of them when `force` is
    /// set.
    fn take_due(&self, force: bool) -> Vec<Arc<Task>> {
        let mut tasks = if force {
            self.tasks.lock()
        } else {
            match self.tasks.try_lock() {
                Some(tasks) => tasks,
                None => return Vec::new(),
            }
        };
        if tasks.is_empty() {
            return Vec::new();
        }
        if force {
            return std::mem::take(&mut *tasks).into_values().collect();
        }
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(entry) = tasks.first_entry() {
            if entry.key().0 <= now {
                due.push(entry.remove());
            } else {
                break;
            }
        }
        due
    }
}

/// Gate stopping the interpreter from advancing the frame graph. Unlike a
/// mutex, it can be queried and released from a different thread than the one
/// that locked it, which the stop protocol relies on.
struct FrameLock {
    locked: AtomicBool,
}

impl FrameLock {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    fn lock(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            thread::yield_now();
        }
    }

    fn unlock(&self) {
        let was_locked = self.locked.swap(false, Ordering::Release);
        debug_assert!(was_locked, "frame lock released while unlocked");
    }

    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}

struct StopState {
    should_stop: bool,
    flush_delayed: bool,
    on_stopped: Option<StopCallback>,
}

struct FrameState {
    /// Manager-wide conservative count of tasks ready to be picked up.
    tasks_that_can_run: AtomicU32,
    running_tasks: AtomicU32,
    ended_chains: AtomicU32,
    /// Bumped whenever the interpreter could make new progress; `advance`
    /// short-circuits when a thread has already seen the current value.
    global_state_key: AtomicU32,
    frame_key: AtomicU32,
    frame_lock: FrameLock,
    stopping: Mutex<StopState>,
    /// Honored by `wait_for_a_task` only while the frame lock is held.
    should_threads_leave: AtomicBool,
    ensure_on_task_insertion: AtomicBool,
}

impl FrameState {
    fn new() -> Self {
        Self {
            tasks_that_can_run: AtomicU32::new(0),
            running_tasks: AtomicU32::new(0),
            ended_chains: AtomicU32::new(0),
            global_state_key: AtomicU32::new(0),
            frame_key: AtomicU32::new(0),
            frame_lock: FrameLock::new(),
            stopping: Mutex::new(StopState {
                should_stop: false,
                flush_delayed: false,
                on_stopped: None,
            }),
            should_threads_leave: AtomicBool::new(false),
            ensure_on_task_insertion: AtomicBool::new(false),
        }
    }
}

enum WaitOutcome {
    NotStarted,
    StillRunning,
    AlreadyCompleted,
    JustCompleted,
}

/// The task manager. See the [crate docs](crate) for the overall model.
///
/// All worker-facing methods take `&self`; the manager is meant to be shared
/// by reference across every participating thread. A process normally has a
/// single manager: the current-group and current-thread observables are
/// thread-local and do not distinguish managers.
pub struct TaskManager {
    plan: Option<CompiledGraph>,
    threads_config: ResolvedThreadsConfig,
    groups: Vec<GroupState>,
    chains: Vec<Mutex<ChainCursor>>,
    threads: Vec<ThreadState>,
    transient_tasks: TransientTaskArena,
    long_duration_tasks: LongDurationTaskPool,
    markers: Arc<MarkerPool>,
    delayed_tasks: DelayedTaskSet,
    frame: FrameState,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            plan: None,
            threads_config: ResolvedThreadsConfig::default(),
            groups: Vec::new(),
            chains: Vec::new(),
            threads: Vec::new(),
            transient_tasks: TransientTaskArena::new(),
            long_duration_tasks: LongDurationTaskPool::new(),
            markers: Arc::new(MarkerPool::new()),
            delayed_tasks: DelayedTaskSet::new(),
            frame: FrameState::new(),
        }
    }

    /// Installs the compiled plan and named-thread tables.
    ///
    /// Must be called before any task is created, and is not thread safe.
    ///
    /// # Errors
    /// Returns an error if the plan is empty, malformed, or restricts a group
    /// to a thread name that is not configured.
    pub fn load(&mut self, plan: CompiledGraph, threads: ResolvedThreadsConfig) -> Result<()> {
        if plan.chain_count() == 0 {
            bail!("compiled plan declares no chains");
        }

        let mut chains = Vec::with_capacity(plan.chain_count());
        for index in 0..plan.chain_count() {
            let Opcode::DeclareChainIndex(start) = plan.opcodes()[index] else {
                bail!("opcode {index} should be a chain declaration");
            };
            let start = start as usize;
            if start < plan.chain_count() || start >= plan.opcodes().len() {
                bail!("chain {index} starts at invalid offset {start}");
            }
            chains.push(Mutex::new(ChainCursor {
                index: start,
                ended: false,
            }));
        }

        let max_group = plan.max_group_id();
        let mut groups = Vec::with_capacity(max_group as usize + 1);
        for id in 0..=max_group {
            let required_thread = match plan
                .configuration
                .get(&id)
                .and_then(|config| config.restrict_to_named_thread)
            {
                Some(name) => threads.named_thread(name).ok_or_else(|| {
                    anyhow!("group {id} is restricted to unknown named thread {name}")
                })?,
                None => NO_NAMED_THREAD,
            };
            groups.push(GroupState::new(required_thread));
        }
        groups[LONG_DURATION_GROUP as usize]
            .is_started
            .store(true, Ordering::Release);

        let mut thread_states: Vec<ThreadState> = (0..=threads.max_thread_id())
            .map(|id| ThreadState {
                config: threads.thread_config(id),
                groups: Vec::new(),
                long_duration_tasks_to_run: TaskQueue::new(),
            })
            .collect();
        for (id, group) in groups.iter().enumerate() {
            if group.required_thread != NO_NAMED_THREAD {
                thread_states[group.required_thread as usize]
                    .groups
                    .push(id as GroupId);
            }
        }

        self.plan = Some(plan);
        self.threads_config = threads;
        self.groups = groups;
        self.chains = chains;
        self.threads = thread_states;
        Ok(())
    }

    fn plan(&self) -> &CompiledGraph {
        self.plan
            .as_ref()
            .expect("task manager used before a compiled plan was loaded")
    }

    /// Whether a group with the given name exists.
    pub fn has_group(&self, name: Hash64) -> bool {
        self.plan.as_ref().is_some_and(|plan| plan.group_id(name).is_some())
    }

    /// The id of the named group, or [`INVALID_GROUP`].
    pub fn group_id(&self, name: Hash64) -> GroupId {
        self.plan
            .as_ref()
            .and_then(|plan| plan.group_id(name))
            .unwrap_or(INVALID_GROUP)
    }

    /// The id of the named thread, or [`INVALID_NAMED_THREAD`].
    pub fn named_thread_id(&self, name: Hash64) -> NamedThreadId {
        self.threads_config
            .named_thread(name)
            .unwrap_or(INVALID_NAMED_THREAD)
    }

    /// The current frame key.
    pub fn frame_key(&self) -> FrameKey {
        self.frame.frame_key.load(Ordering::Acquire)
    }

    /// The group of the task (or start callback) running on the calling
    /// thread, or [`INVALID_GROUP`] outside of one.
    pub fn current_group(&self) -> GroupId {
        CURRENT_GROUP.get()
    }

    /// The name id the calling thread registered under, or
    /// [`NO_NAMED_THREAD`].
    pub fn current_thread(&self) -> NamedThreadId {
        CURRENT_THREAD.get()
    }

    /// Declares the calling thread to be the named thread with the given id.
    pub fn register_worker_thread(&self, thread: NamedThreadId) {
        assert!(
            thread == NO_NAMED_THREAD || (thread as usize) < self.threads.len(),
            "registering a worker under unknown named thread {thread}"
        );
        CURRENT_THREAD.set(thread);
    }

    /// Declares the calling thread to be the named thread registered under
    /// `name`.
    pub fn register_worker_thread_by_name(&self, name: Hash64) {
        let thread = self.named_thread_id(name);
        assert_ne!(thread, INVALID_NAMED_THREAD, "named thread does not exist");
        self.register_worker_thread(thread);
    }

    /// Installs the hook run when the group starts, once per frame, with the
    /// current group set to the starting group. Tasks it creates for its own
    /// group are dispatched only after the callback returns.
    pub fn set_start_task_group_callback(
        &self,
        group: GroupId,
        callback: impl FnMut(&TaskManager) + Send + 'static,
    ) {
        self.group_state(group).start_callback.lock().replace(Box::new(callback));
    }

    /// Installs the hook run when the group completes, once per frame,
    /// outside of any group context.
    pub fn set_end_task_group_callback(
        &self,
        group: GroupId,
        callback: impl FnMut(&TaskManager) + Send + 'static,
    ) {
        self.group_state(group).end_callback.lock().replace(Box::new(callback));
    }

    /// [`set_start_task_group_callback`](Self::set_start_task_group_callback)
    /// with the group resolved by name.
    pub fn set_start_task_group_callback_by_name(
        &self,
        name: Hash64,
        callback: impl FnMut(&TaskManager) + Send + 'static,
    ) {
        let group = self.group_id(name);
        assert_ne!(group, INVALID_GROUP, "task group name does not exist");
        self.set_start_task_group_callback(group, callback);
    }

    /// [`set_end_task_group_callback`](Self::set_end_task_group_callback)
    /// with the group resolved by name.
    pub fn set_end_task_group_callback_by_name(
        &self,
        name: Hash64,
        callback: impl FnMut(&TaskManager) + Send + 'static,
    ) {
        let group = self.group_id(name);
        assert_ne!(group, INVALID_GROUP, "task group name does not exist");
        self.set_end_task_group_callback(group, callback);
    }

    fn group_state(&self, group: GroupId) -> &GroupState {
        self.groups
            .get(group as usize)
            .unwrap_or_else(|| panic!("task group {group} does not exist"))
    }

    /// Creates a transient task in the given group. The task becomes eligible
    /// to run when the returned handle is dropped.
    pub fn get_task(
        &self,
        group: GroupId,
        function: impl FnOnce() + Send + 'static,
    ) -> TaskHandle<'_> {
        self.get_task_boxed(group, Box::new(function))
    }

    pub(crate) fn get_task_boxed(&self, group: GroupId, function: TaskFn) -> TaskHandle<'_> {
        if group == LONG_DURATION_GROUP {
            return self.get_long_duration_task_boxed(NO_NAMED_THREAD, None, function);
        }
        let group_state = self.group_state(group);

        debug_assert_ne!(
            CURRENT_GROUP.get(),
            LONG_DURATION_GROUP,
            "transient tasks must not be created from within a long-duration task"
        );
        if self.frame.ensure_on_task_insertion.load(Ordering::Relaxed) {
            cadence_log::error!(
                "unexpected task insertion into group {}",
                self.plan().group_name(group)
            );
        }

        group_state.remaining_tasks.fetch_add(1, Ordering::AcqRel);
        assert!(
            !group_state.is_completed.load(Ordering::Acquire),
            "task created for a group that has already completed this frame"
        );

        let task = Arc::new(Task::new(
            group,
            self.frame.frame_key.load(Ordering::Acquire),
            NO_NAMED_THREAD,
            None,
            function,
        ));
        self.transient_tasks.retain(Arc::clone(&task));
        TaskHandle::new(task, self)
    }

    /// Creates a scope-lived task. The caller must guarantee that everything
    /// the function borrows stays alive until the task has completed.
    pub(crate) fn get_task_scoped<'s>(
        &self,
        group: GroupId,
        function: Box<dyn FnOnce() + Send + 's>,
    ) -> TaskHandle<'_> {
        // SAFETY: the caller does not return control to the owner of the
        // borrowed data before the task has completed (`for_each` actively
        // waits on a task every chunk task feeds into). Once a task has
        // completed its function has been dropped, so no captured reference
        // is dereferenced afterwards.
        let function: TaskFn = unsafe {
            std::mem::transmute::<Box<dyn FnOnce() + Send + 's>, Box<dyn FnOnce() + Send + 'static>>(
                function,
            )
        };
        self.get_task_boxed(group, function)
    }

    /// [`get_task`](Self::get_task) with the group resolved by name.
    pub fn get_task_by_name(
        &self,
        name: Hash64,
        function: impl FnOnce() + Send + 'static,
    ) -> TaskHandle<'_> {
        let group = self.group_id(name);
        assert_ne!(group, INVALID_GROUP, "task group name does not exist");
        self.get_task(group, function)
    }

    /// Creates a task in the group of the task running on the calling thread.
    pub fn get_task_in_current_group(
        &self,
        function: impl FnOnce() + Send + 'static,
    ) -> TaskHandle<'_> {
        let group = CURRENT_GROUP.get();
        assert_ne!(
            group, INVALID_GROUP,
            "get_task_in_current_group called outside of a task"
        );
        self.get_task(group, function)
    }

    /// Creates a long-duration task: it belongs to the reserved group, can be
    /// picked up at any time (frame boundaries included) and survives frame
    /// resets.
    pub fn get_long_duration_task(
        &self,
        function: impl FnOnce() + Send + 'static,
    ) -> TaskHandle<'_> {
        self.get_long_duration_task_boxed(NO_NAMED_THREAD, None, Box::new(function))
    }

    /// A long-duration task that only the given named thread will run.
    pub fn get_long_duration_task_for_thread(
        &self,
        thread: NamedThreadId,
        function: impl FnOnce() + Send + 'static,
    ) -> TaskHandle<'_> {
        assert!(
            thread == NO_NAMED_THREAD || (thread as usize) < self.threads.len(),
            "long-duration task targeted at unknown named thread {thread}"
        );
        self.get_long_duration_task_boxed(thread, None, Box::new(function))
    }

    /// A long-duration task guaranteed not to run before the delay has
    /// expired. The actual execution time can be arbitrarily later; delayed
    /// tasks have the lowest priority.
    pub fn get_delayed_task(
        &self,
        delay: Duration,
        function: impl FnOnce() + Send + 'static,
    ) -> TaskHandle<'_> {
        self.get_long_duration_task_boxed(
            NO_NAMED_THREAD,
            Some(Instant::now() + delay),
            Box::new(function),
        )
    }

    fn get_long_duration_task_boxed(
        &self,
        thread: NamedThreadId,
        execution_time_point: Option<Instant>,
        function: TaskFn,
    ) -> TaskHandle<'_> {
        let group_state = self.group_state(LONG_DURATION_GROUP);
        group_state.remaining_tasks.fetch_add(1, Ordering::AcqRel);

        let task = Arc::new(Task::new(
            LONG_DURATION_GROUP,
            self.frame.frame_key.load(Ordering::Acquire),
            thread,
            execution_time_point,
            function,
        ));
        self.long_duration_tasks.insert(&task);
        TaskHandle::new(task, self)
    }

    /// Allocates a free-standing completion marker. Prefer
    /// [`TaskHandle::create_completion_marker`], which also attaches it.
    pub fn allocate_completion_marker(&self) -> CompletionMarker {
        CompletionMarker::new(self.markers.allocate(), INVALID_GROUP, Arc::clone(&self.markers))
    }

    /// Called by the wrapper when the creating scope lets go of the task.
    pub(crate) fn release_task(&self, task: Arc<Task>) {
        if task.mark_ready(true) {
            self.enqueue_ready_task(task);
        }
    }

    /// Routes a task that just became runnable: delayed tasks whose time has
    /// not come park in the delayed set, everything else is dispatched.
    fn enqueue_ready_task(&self, task: Arc<Task>) {
        if let Some(execution_time_point) = task.execution_time_point() {
            if execution_time_point > Instant::now() {
                self.delayed_tasks.insert(execution_time_point, task);
                return;
            }
        }
        self.dispatch_ready_task(task);
    }

    /// Puts a ready task in its run queue and publishes the wakeup.
    fn dispatch_ready_task(&self, task: Arc<Task>) {
        let group = task.group();
        let group_state = self.group_state(group);
        if group != LONG_DURATION_GROUP {
            assert_eq!(
                task.frame_key(),
                self.frame.frame_key.load(Ordering::Acquire),
                "queueing a transient task outside the frame it was created in"
            );
            assert!(
                !group_state.is_completed.load(Ordering::Acquire),
                "queueing a task into a group that has already completed this frame"
            );
        }

        // Wakeups for groups that have not started are staged on the group,
        // so waiting workers are not woken for tasks they cannot take yet.
        // The missing atomicity against the started flags is handled by
        // execute_task_group, which transfers the staged count after flipping
        // them.
        if group == LONG_DURATION_GROUP
            || group_state.will_start.load(Ordering::SeqCst)
            || group_state.is_started.load(Ordering::SeqCst)
        {
            self.frame.tasks_that_can_run.fetch_add(1, Ordering::Release);
        } else {
            group_state.tasks_that_can_run.fetch_add(1, Ordering::SeqCst);
        }

        if group == LONG_DURATION_GROUP && task.target_thread() != NO_NAMED_THREAD {
            self.threads[task.target_thread() as usize]
                .long_duration_tasks_to_run
                .push(task);
        } else {
            group_state.tasks_to_run.push(task);
        }
    }

    /// Tears a completed task down and releases its accounting. The last
    /// destroyed task of a group unparks the chains waiting on it.
    fn destroy_task(&self, task: &Arc<Task>) {
        let group = task.group();
        assert!(task.is_completed(), "destroying a task that has not completed");
        if task.is_long_duration() {
            self.long_duration_tasks.release(task);
        } else {
            assert_eq!(
                task.frame_key(),
                self.frame.frame_key.load(Ordering::Acquire),
                "a transient task outlived its frame"
            );
        }

        let group_state = self.group_state(group);
        let previous = group_state.remaining_tasks.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "task count underflow for group {group}");
        if previous == 1 && group != LONG_DURATION_GROUP {
            self.frame.global_state_key.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn do_run_task(&self, task: Arc<Task>) {
        self.frame.running_tasks.fetch_add(1, Ordering::AcqRel);
        let previous_group = CURRENT_GROUP.replace(task.group());

        let function = task.begin_run();
        function();

        let (to_notify, marker) = task.finish_run();
        for dependent in to_notify {
            if dependent.complete_dependency() {
                self.enqueue_ready_task(dependent);
            }
        }
        if let Some(flag) = marker {
            flag.set();
        }

        CURRENT_GROUP.set(previous_group);
        self.frame.running_tasks.fetch_sub(1, Ordering::AcqRel);
        self.destroy_task(&task);
    }

    /// Moves due delayed tasks into the run queues.
    fn poll_delayed_tasks(&self, force: bool) {
        for task in self.delayed_tasks.take_due(force) {
            self.dispatch_ready_task(task);
        }
    }

    /// Forces every delayed task into the run queues regardless of deadline.
    pub fn flush_all_delayed_tasks(&self) {
        self.poll_delayed_tasks(true);
    }

    /// Picks one ready task for the calling thread, or nothing.
    fn get_task_to_run(
        &self,
        exclude_long_duration: bool,
        mode: SelectionMode,
    ) -> Option<Arc<Task>> {
        if self.groups.is_empty() {
            return None;
        }

        self.poll_delayed_tasks(false);

        if self.frame.tasks_that_can_run.load(Ordering::Acquire) == 0 {
            return None;
        }

        let thread = CURRENT_THREAD.get();

        // Work targeted at this thread comes first.
        if thread != NO_NAMED_THREAD {
            let thread_state = &self.threads[thread as usize];
            if !exclude_long_duration {
                if let Some(task) = thread_state.long_duration_tasks_to_run.try_pop() {
                    let previous = self.frame.tasks_that_can_run.fetch_sub(1, Ordering::AcqRel);
                    assert!(previous != 0, "ready-task counter underflow");
                    return Some(task);
                }
            }
            for &group in &thread_state.groups {
                let group_state = self.group_state(group);
                if !group_state.is_started.load(Ordering::Acquire)
                    || group_state.is_completed.load(Ordering::Acquire)
                {
                    continue;
                }
                if let Some(task) = self.try_pop_group_task(group) {
                    return Some(task);
                }
            }
            if mode == SelectionMode::OnlyOwnTasks {
                return None;
            }
        }

        let config = self.threads[thread as usize].config;
        let allow_general = thread == NO_NAMED_THREAD
            || mode == SelectionMode::Anything
            || config.can_run_general_tasks;
        let allow_general_long_duration = !exclude_long_duration
            && (thread == NO_NAMED_THREAD
                || mode == SelectionMode::Anything
                || config.can_run_general_long_duration_tasks);

        // Rotating start index for round-robin fairness across groups
        let group_count = self.groups.len();
        let start = SCAN_ROTATION.get();
        SCAN_ROTATION.set(start.wrapping_add(1));

        for offset in 0..group_count {
            let group = (start.wrapping_add(offset) % group_count) as GroupId;
            let group_state = &self.groups[group as usize];
            if group == LONG_DURATION_GROUP {
                if !allow_general_long_duration {
                    continue;
                }
            } else {
                if !allow_general {
                    continue;
                }
                if group_state.required_thread != NO_NAMED_THREAD
                    && group_state.required_thread != thread
                {
                    continue;
                }
                if !group_state.is_started.load(Ordering::Acquire)
                    || group_state.is_completed.load(Ordering::Acquire)
                {
                    continue;
                }
            }
            if group_state.remaining_tasks.load(Ordering::Acquire) == 0 {
                continue;
            }
            if let Some(task) = self.try_pop_group_task(group) {
                return Some(task);
            }
        }
        None
    }

    /// Pops one ready task of the group. The conservative ready counter is
    /// decremented only after the pop succeeded.
    fn try_pop_group_task(&self, group: GroupId) -> Option<Arc<Task>> {
        let group_state = &self.groups[group as usize];
        let task = group_state.tasks_to_run.try_pop()?;
        if group != LONG_DURATION_GROUP {
            assert_eq!(
                task.frame_key(),
                self.frame.frame_key.load(Ordering::Acquire),
                "popped a transient task that outlived its frame"
            );
        }
        assert!(
            task.is_waiting_to_run(),
            "popped a task that is not expecting to run"
        );
        let previous = self.frame.tasks_that_can_run.fetch_sub(1, Ordering::AcqRel);
        assert!(previous != 0, "ready-task counter underflow");
        Some(task)
    }

    /// Tries to advance the frame interpreter. Returns whether it did useful
    /// work: a start or end callback ran or a group transitioned, in which
    /// case the call counts as having run a task. A frame reset alone does
    /// not count.
    fn advance(&self) -> bool {
        if self.chains.is_empty() || self.frame.frame_lock.is_locked() {
            return false;
        }

        // Skip when nothing changed since this thread last looked; this keeps
        // idle workers from hammering the chain locks.
        let manager_addr = std::ptr::from_ref(self) as usize;
        let state_key = self.frame.global_state_key.load(Ordering::Acquire);
        if LAST_STATE_KEY.get() == (manager_addr, state_key) {
            return false;
        }
        LAST_STATE_KEY.set((manager_addr, state_key));

        let chain_count = self.chains.len() as u32;
        let mut did_work = false;
        let mut should_finish_frame =
            self.frame.ended_chains.load(Ordering::Acquire) == chain_count;

        if !should_finish_frame {
            for chain in &self.chains {
                let Some(mut cursor) = chain.try_lock() else {
                    continue;
                };
                if cursor.ended {
                    continue;
                }
                loop {
                    match self.plan().opcodes()[cursor.index] {
                        Opcode::ExecuteTaskGroup(group) => {
                            self.execute_task_group(group);
                            did_work = true;
                            cursor.index += 1;
                        }
                        Opcode::WaitTaskGroup(group) => match self.check_waited_group(group) {
                            WaitOutcome::NotStarted | WaitOutcome::StillRunning => break,
                            WaitOutcome::AlreadyCompleted => cursor.index += 1,
                            WaitOutcome::JustCompleted => {
                                did_work = true;
                                cursor.index += 1;
                            }
                        },
                        Opcode::EndChain => {
                            cursor.ended = true;
                            let previous = self.frame.ended_chains.fetch_add(1, Ordering::AcqRel);
                            if previous + 1 == chain_count {
                                should_finish_frame = true;
                            }
                            break;
                        }
                        Opcode::DeclareChainIndex(_) => {
                            panic!("chain ran into the declaration prefix")
                        }
                    }
                }
            }
        }

        if should_finish_frame && self.finish_frame() {
            // Force a fresh look at the new frame on the next call
            LAST_STATE_KEY.set((0, u32::MAX));
        }
        did_work
    }

    /// Public pump for the interpreter, for boot and shutdown loops.
    pub fn advance_state(&self) {
        self.advance();
    }

    fn execute_task_group(&self, group: GroupId) {
        assert_ne!(
            group, LONG_DURATION_GROUP,
            "the long-duration group cannot be executed"
        );
        let group_state = self.group_state(group);
        assert!(
            !group_state.is_completed.load(Ordering::Relaxed),
            "executing a group that has already completed"
        );

        group_state.will_start.store(true, Ordering::SeqCst);

        // The callback runs before the group is started so that wait opcodes
        // elsewhere cannot complete the group under it, and tasks it creates
        // are staged rather than handed out early.
        self.run_group_callback(&group_state.start_callback, group);

        let staged = group_state.tasks_that_can_run.swap(0, Ordering::SeqCst);
        if staged > 0 {
            self.frame
                .tasks_that_can_run
                .fetch_add(staged, Ordering::Release);
        }

        let was_started = group_state.is_started.swap(true, Ordering::SeqCst);
        assert!(!was_started, "task group {group} was already started");
        group_state.will_start.store(false, Ordering::SeqCst);

        cadence_log::trace!("started task group {}", self.plan().group_name(group));
    }

    fn check_waited_group(&self, group: GroupId) -> WaitOutcome {
        assert_ne!(
            group, LONG_DURATION_GROUP,
            "the long-duration group cannot be waited on"
        );
        let group_state = self.group_state(group);

        if !group_state.is_started.load(Ordering::Acquire) {
            return WaitOutcome::NotStarted;
        }
        if group_state.is_completed.load(Ordering::Acquire) {
            return WaitOutcome::AlreadyCompleted;
        }
        if group_state.remaining_tasks.load(Ordering::Acquire) != 0 {
            return WaitOutcome::StillRunning;
        }

        let completion_already_handled = group_state.is_completed.swap(true, Ordering::AcqRel);
        // Tasks may only be added to a group from itself or from groups
        // ordered before it; anything else materializes as a task here.
        assert_eq!(
            group_state.remaining_tasks.load(Ordering::Acquire),
            0,
            "a task was added to group {group} while it was completing"
        );
        if completion_already_handled {
            // Another chain won the completion race; this one just observed
            // the result
            return WaitOutcome::AlreadyCompleted;
        }

        // The end callback is not part of the group
        self.run_group_callback(&group_state.end_callback, INVALID_GROUP);
        // Other chains might be waiting on this group
        self.frame.global_state_key.fetch_add(1, Ordering::Relaxed);
        cadence_log::trace!("completed task group {}", self.plan().group_name(group));
        WaitOutcome::JustCompleted
    }

    /// Invokes the callback in the slot, if any, with the current group set
    /// to `group_context`.
    fn run_group_callback(&self, slot: &Mutex<Option<GroupCallback>>, group_context: GroupId) {
        let callback = slot.lock().take();
        let Some(mut callback) = callback else {
            return;
        };

        let previous_group = CURRENT_GROUP.replace(group_context);
        cadence_log::with_trace_logging!(
            "Running group callback with current group {}",
            group_context;
            callback(self)
        );
        CURRENT_GROUP.set(previous_group);

        // A callback installed from within the callback wins
        let mut slot = slot.lock();
        if slot.is_none() {
            *slot = Some(callback);
        }
    }

    /// Ends the frame: honors a pending stop request, then resets the frame
    /// state. Returns whether the reset happened.
    fn finish_frame(&self) -> bool {
        let mut stopping = self.frame.stopping.lock();
        if stopping.should_stop {
            // Freeze the graph before anything about the frame is recycled.
            // The callback (or a later unlock_frame call) lifts the freeze.
            self.frame.frame_lock.lock();
            stopping.should_stop = false;
            let flush = stopping.flush_delayed;
            let on_stopped = stopping.on_stopped.take();
            drop(stopping);

            if flush {
                self.poll_delayed_tasks(true);
            }
            if let Some(on_stopped) = on_stopped {
                on_stopped(self);
            }
        } else {
            drop(stopping);
        }

        if self.frame.frame_lock.is_locked() {
            return false;
        }
        self.reset_state()
    }

    /// Resets the frame under exclusive ownership of every chain lock.
    /// Returns false if another thread got there first.
    fn reset_state(&self) -> bool {
        let mut cursors: Vec<_> = self.chains.iter().map(|chain| chain.lock()).collect();
        if self.frame.ended_chains.load(Ordering::Acquire) != self.chains.len() as u32 {
            return false;
        }

        let next_key = (self.frame.frame_key.load(Ordering::Acquire) + 1) & FRAME_KEY_MASK;
        self.frame.frame_key.store(next_key, Ordering::Release);

        let opcodes = self.plan().opcodes();
        for (index, cursor) in cursors.iter_mut().enumerate() {
            let Opcode::DeclareChainIndex(start) = opcodes[index] else {
                unreachable!()
            };
            cursor.index = start as usize;
            cursor.ended = false;
        }

        self.transient_tasks.fast_clear();

        for (group, group_state) in self.groups.iter().enumerate().skip(1) {
            assert_eq!(
                group_state.remaining_tasks.load(Ordering::Acquire),
                0,
                "frame reset while group {group} still has tasks"
            );
            assert!(
                group_state.is_completed.load(Ordering::Acquire),
                "frame reset while group {group} has not completed"
            );
            group_state.is_started.store(false, Ordering::Release);
            group_state.is_completed.store(false, Ordering::Release);
        }

        // Zeroed before the chain locks drop, so late observers cannot act on
        // the old count
        self.frame.ended_chains.store(0, Ordering::Release);
        drop(cursors);

        // Last, so parked advance calls re-observe everything
        self.frame.global_state_key.fetch_add(1, Ordering::Release);
        cadence_log::trace!("frame reset; new frame key {next_key}");
        true
    }

    /// Tentatively runs one task. Advancing the frame state counts when a
    /// group callback ran or a group transitioned.
    ///
    /// Can safely be called from within a task. Looping over this function is
    /// how a thread commits itself to the manager.
    pub fn run_a_task(&self, exclude_long_duration: bool, mode: SelectionMode) {
        if self.advance() {
            return;
        }
        if let Some(task) = self.get_task_to_run(exclude_long_duration, mode) {
            self.do_run_task(task);
        }
    }

    /// Parks the calling thread until work is likely available, the frame
    /// ends, or (while the frame lock is held) threads are asked to leave.
    ///
    /// Spins briefly, then yields, then naps, and keeps nudging the
    /// interpreter so the frame cannot stall on a fully parked pool.
    pub fn wait_for_a_task(&self) {
        if self.chains.is_empty()
            || self.frame.tasks_that_can_run.load(Ordering::Acquire) > 0
        {
            return;
        }
        let original_frame_key = self.frame.frame_key.load(Ordering::Acquire);
        self.advance();

        let mut yield_count = 0;
        while self.frame.frame_key.load(Ordering::Acquire) == original_frame_key {
            if self.frame.should_threads_leave.load(Ordering::Acquire)
                && self.frame.frame_lock.is_locked()
            {
                return;
            }

            let mut spin_count = 0;
            while self.frame.tasks_that_can_run.load(Ordering::Relaxed) == 0
                && spin_count < MAX_SPIN_COUNT
            {
                std::hint::spin_loop();
                spin_count += 1;
            }
            if self.frame.tasks_that_can_run.load(Ordering::Acquire) > 0 {
                return;
            }

            if yield_count >= MAX_YIELD_COUNT {
                thread::sleep(WAIT_SLEEP);
            } else {
                thread::yield_now();
                yield_count += 1;
            }

            self.advance();
        }
    }

    /// Runs tasks until the marker completes.
    ///
    /// The marker's group must already be started; this guards the common
    /// deadlock where the caller is what keeps the group from starting. When
    /// called from within a task, waiting on a marker of a *different*
    /// transient group can deadlock by construction and is not detected
    /// beyond that entry assertion.
    pub fn actively_wait_for(&self, marker: &CompletionMarker) {
        let group = marker.task_group();
        if group != LONG_DURATION_GROUP && group != INVALID_GROUP {
            assert!(
                self.group_state(group).is_started.load(Ordering::Acquire),
                "actively_wait_for requires the marker's group to be started"
            );
        }
        while !marker.is_completed() {
            self.run_a_task(false, SelectionMode::Normal);
        }
    }

    /// Releases the handle and runs tasks until that task completes.
    pub fn actively_wait_for_handle(&self, handle: TaskHandle<'_>) {
        let marker = handle.create_completion_marker();
        drop(handle);
        self.actively_wait_for(&marker);
    }

    /// Runs tasks for roughly the given duration, returning the measured
    /// elapsed time. Gives up early after a run of consecutive misses, and
    /// projects the per-task cost to avoid overshooting.
    pub fn run_tasks_for(&self, duration: Duration) -> Duration {
        let mut unlucky_strikes = 0;
        let mut task_count: u32 = 0;
        let start = Instant::now();

        while unlucky_strikes < MAX_UNLUCKY_STRIKES {
            if let Some(task) = self.get_task_to_run(false, SelectionMode::Normal) {
                self.do_run_task(task);
                task_count += 1;
                unlucky_strikes = 0;
            } else if self.advance() {
                task_count += 1;
                unlucky_strikes = 0;
            } else {
                unlucky_strikes += 1;
            }

            let elapsed = start.elapsed();
            if elapsed >= duration {
                return elapsed;
            }
            if task_count > 0 {
                let projected = elapsed + elapsed / task_count;
                if projected >= duration {
                    return elapsed;
                }
            }
        }
        start.elapsed()
    }

    /// Asks the manager to stop at the next end of frame.
    ///
    /// The frame finishes normally; before the state would be recycled, the
    /// frame lock is taken and `on_stopped` runs under it with the graph
    /// frozen. Calling [`unlock_frame`](Self::unlock_frame) (from the
    /// callback or later) resumes normal operation; leaving the lock held
    /// keeps the graph frozen for tear-down, during which long-duration
    /// tasks still run.
    ///
    /// # Panics
    /// If a stop has already been requested.
    pub fn request_stop(
        &self,
        on_stopped: impl FnOnce(&TaskManager) + Send + 'static,
        flush_all_delayed_tasks: bool,
    ) {
        let accepted = self.try_request_stop(on_stopped, flush_all_delayed_tasks);
        assert!(accepted, "a stop has already been requested");
    }

    /// Non-panicking [`request_stop`](Self::request_stop); returns whether
    /// the request was recorded.
    pub fn try_request_stop(
        &self,
        on_stopped: impl FnOnce(&TaskManager) + Send + 'static,
        flush_all_delayed_tasks: bool,
    ) -> bool {
        let mut stopping = self.frame.stopping.lock();
        if stopping.should_stop {
            return false;
        }
        stopping.should_stop = true;
        stopping.flush_delayed = flush_all_delayed_tasks;
        stopping.on_stopped = Some(Box::new(on_stopped));
        true
    }

    /// Whether the manager is already tasked to stop this frame.
    pub fn is_stop_requested(&self) -> bool {
        self.frame.stopping.lock().should_stop
    }

    /// Makes threads parked in [`wait_for_a_task`](Self::wait_for_a_task)
    /// return without doing anything. Only honored while the frame lock is
    /// held.
    pub fn should_threads_exit_wait(&self, should: bool) {
        self.frame.should_threads_leave.store(should, Ordering::Release);
    }

    /// Prevents the frame graph from advancing, freezing it in its current
    /// state. Long-duration tasks still run. Useful during boot, before core
    /// resources exist.
    pub fn lock_frame(&self) {
        self.frame.frame_lock.lock();
    }

    /// Releases the frame lock and wakes the interpreter.
    pub fn unlock_frame(&self) {
        self.frame.frame_lock.unlock();
        self.frame.global_state_key.fetch_add(1, Ordering::Release);
    }

    pub fn is_frame_locked(&self) -> bool {
        self.frame.frame_lock.is_locked()
    }

    /// Debugging aid: when set, every task insertion is logged as an error.
    /// Useful for finding what keeps inserting tasks when nothing should.
    pub fn should_ensure_on_task_insertion(&self, should_ensure: bool) {
        self.frame
            .ensure_on_task_insertion
            .store(should_ensure, Ordering::Relaxed);
    }

    /// Whether tasks are ready to be picked up right now. Staged tasks of
    /// groups that have not started are not reported.
    pub fn has_pending_tasks(&self) -> bool {
        self.frame.tasks_that_can_run.load(Ordering::Acquire) > 0
    }

    /// The number of tasks ready to be picked up right now.
    pub fn get_pending_tasks_count(&self) -> u32 {
        self.frame.tasks_that_can_run.load(Ordering::Acquire)
    }

    /// Whether any thread is currently executing a task.
    pub fn has_running_tasks(&self) -> bool {
        self.frame.running_tasks.load(Ordering::Acquire) > 0
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskManager")
            .field("groups", &self.groups.len())
            .field("chains", &self.chains.len())
            .field("frame_key", &self.frame.frame_key.load(Ordering::Relaxed))
            .field(
                "pending_tasks",
                &self.frame.tasks_that_can_run.load(Ordering::Relaxed),
            )
            .field("long_duration_tasks", &self.long_duration_tasks.len())
            .field("outstanding_markers", &self.markers.outstanding())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency_graph::{GroupConfig, TaskGroupGraph};
    use crate::named_threads::{NamedThreadConfig, ThreadsConfiguration};
    use cadence_id::hash64;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn manager_with_graph(graph: &TaskGroupGraph) -> TaskManager {
        let mut manager = TaskManager::new();
        manager
            .load(graph.compile().unwrap(), ResolvedThreadsConfig::default())
            .unwrap();
        manager
    }

    fn single_group_manager(name: &str) -> (TaskManager, GroupId) {
        let mut graph = TaskGroupGraph::new();
        let group = graph.add_task_group(hash64!(name), GroupConfig::default());
        (manager_with_graph(&graph), group)
    }

    /// Drives the manager from the calling thread until the condition holds.
    fn pump_until(manager: &TaskManager, condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(10), "test timed out");
            manager.run_a_task(false, SelectionMode::Normal);
        }
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(10), "test timed out");
            thread::yield_now();
        }
    }

    /// Sets the flag when dropped, so worker loops wind down even when the
    /// test body panics.
    struct StopGuard<'a>(&'a AtomicBool);

    impl Drop for StopGuard<'_> {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    /// Runs the closure while `worker_count` generic workers drive the
    /// manager.
    fn with_workers<R>(manager: &TaskManager, worker_count: usize, f: impl FnOnce() -> R) -> R {
        let stop = AtomicBool::new(false);
        thread::scope(|scope| {
            for _ in 0..worker_count {
                scope.spawn(|| {
                    while !stop.load(Ordering::Acquire) {
                        manager.run_a_task(false, SelectionMode::Normal);
                        thread::yield_now();
                    }
                });
            }
            let _guard = StopGuard(&stop);
            f()
        })
    }

    #[test]
    fn empty_plan_fails_to_load() {
        let graph = TaskGroupGraph::new();
        let mut manager = TaskManager::new();
        let error = manager
            .load(graph.compile().unwrap(), ResolvedThreadsConfig::default())
            .unwrap_err();
        assert!(error.to_string().contains("no chains"));
    }

    #[test]
    fn loading_with_unknown_restricted_thread_fails() {
        let mut graph = TaskGroupGraph::new();
        graph.add_task_group(
            hash64!("ghost-group"),
            GroupConfig {
                restrict_to_named_thread: Some(hash64!("ghost-thread").hash()),
            },
        );
        let mut manager = TaskManager::new();
        let error = manager
            .load(graph.compile().unwrap(), ResolvedThreadsConfig::default())
            .unwrap_err();
        assert!(error.to_string().contains("unknown named thread"));
    }

    #[test]
    fn zero_task_group_still_runs_callbacks_in_order() {
        let (manager, group) = single_group_manager("empty-group");

        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            manager.set_start_task_group_callback(group, move |_| {
                events.lock().push("start");
            });
        }
        {
            let events = Arc::clone(&events);
            manager.set_end_task_group_callback(group, move |_| {
                events.lock().push("end");
            });
        }

        pump_until(&manager, || manager.frame_key() >= 3);

        let events = events.lock();
        assert!(events.len() >= 6);
        for pair in events.chunks(2) {
            if pair.len() == 2 {
                assert_eq!(pair, ["start", "end"]);
            }
        }
    }

    #[test]
    fn callbacks_observe_group_context() {
        let (manager, group) = single_group_manager("ctx-group");

        let contexts = Arc::new(Mutex::new(Vec::new()));
        {
            let contexts = Arc::clone(&contexts);
            manager.set_start_task_group_callback(group, move |tm| {
                contexts.lock().push(("start", tm.current_group()));
            });
        }
        {
            let contexts = Arc::clone(&contexts);
            manager.set_end_task_group_callback(group, move |tm| {
                contexts.lock().push(("end", tm.current_group()));
            });
        }

        pump_until(&manager, || manager.frame_key() >= 1);

        let contexts = contexts.lock();
        assert_eq!(contexts[0], ("start", group));
        assert_eq!(contexts[1], ("end", INVALID_GROUP));
    }

    #[test]
    fn linear_frame_runs_groups_in_order() {
        let mut graph = TaskGroupGraph::new();
        let init = graph.add_task_group(hash64!("s1-init"), GroupConfig::default());
        let update = graph.add_task_group(hash64!("s1-update"), GroupConfig::default());
        let render = graph.add_task_group(hash64!("s1-render"), GroupConfig::default());
        graph.add_dependency(update, init);
        graph.add_dependency(render, update);
        let manager = manager_with_graph(&graph);

        let events = Arc::new(Mutex::new(Vec::new()));
        let init_runs = Arc::new(AtomicUsize::new(0));
        let update_order = Arc::new(Mutex::new(Vec::new()));
        let render_runs = Arc::new(AtomicUsize::new(0));

        {
            let events = Arc::clone(&events);
            let init_runs = Arc::clone(&init_runs);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(init, move |tm| {
                events.lock().push("start-init");
                if !submitted.swap(true, Ordering::AcqRel) {
                    for _ in 0..100 {
                        let init_runs = Arc::clone(&init_runs);
                        tm.get_task(init, move || {
                            init_runs.fetch_add(1, Ordering::AcqRel);
                        });
                    }
                }
            });
        }
        {
            let events = Arc::clone(&events);
            let update_order = Arc::clone(&update_order);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(update, move |tm| {
                events.lock().push("start-update");
                if !submitted.swap(true, Ordering::AcqRel) {
                    let mut handles = Vec::new();
                    for i in 0..50_usize {
                        let update_order = Arc::clone(&update_order);
                        let handle = tm.get_task(update, move || {
                            update_order.lock().push(i);
                        });
                        if i >= 1 {
                            handle.add_dependency_to(&handles[i - 1]);
                        }
                        if i >= 2 {
                            handle.add_dependency_to(&handles[i - 2]);
                        }
                        handles.push(handle);
                    }
                }
            });
        }
        {
            let events = Arc::clone(&events);
            let render_runs = Arc::clone(&render_runs);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(render, move |tm| {
                events.lock().push("start-render");
                if !submitted.swap(true, Ordering::AcqRel) {
                    for _ in 0..10 {
                        let render_runs = Arc::clone(&render_runs);
                        tm.get_task(render, move || {
                            render_runs.fetch_add(1, Ordering::AcqRel);
                        });
                    }
                }
            });
        }
        for (group, label) in [(init, "end-init"), (update, "end-update"), (render, "end-render")]
        {
            let events = Arc::clone(&events);
            manager.set_end_task_group_callback(group, move |_| {
                events.lock().push(label);
            });
        }

        with_workers(&manager, 3, || {
            wait_until(|| manager.frame_key() >= 1);
        });

        let events = events.lock();
        assert_eq!(
            &events[..6],
            &[
                "start-init",
                "end-init",
                "start-update",
                "end-update",
                "start-render",
                "end-render",
            ]
        );
        assert_eq!(init_runs.load(Ordering::Acquire), 100);
        assert_eq!(render_runs.load(Ordering::Acquire), 10);
        let update_order = update_order.lock();
        assert_eq!(update_order.len(), 50);
        assert!(
            update_order.windows(2).all(|pair| pair[0] < pair[1]),
            "chained update tasks ran out of order"
        );
    }

    #[test]
    fn parallel_groups_both_follow_init() {
        let mut graph = TaskGroupGraph::new();
        let a = graph.add_task_group(hash64!("s2-a"), GroupConfig::default());
        let b = graph.add_task_group(hash64!("s2-b"), GroupConfig::default());
        let init = graph.add_task_group(hash64!("s2-init"), GroupConfig::default());
        graph.add_dependency(a, init);
        graph.add_dependency(b, init);
        let manager = manager_with_graph(&graph);

        let events = Arc::new(Mutex::new(Vec::new()));
        for (group, label) in [(init, "start-init"), (a, "start-a"), (b, "start-b")] {
            let events = Arc::clone(&events);
            manager.set_start_task_group_callback(group, move |_| {
                events.lock().push(label);
            });
        }
        for (group, label) in [(init, "end-init"), (a, "end-a"), (b, "end-b")] {
            let events = Arc::clone(&events);
            manager.set_end_task_group_callback(group, move |_| {
                events.lock().push(label);
            });
        }

        pump_until(&manager, || manager.frame_key() >= 1);

        let events = events.lock();
        let first = |label: &str| events.iter().position(|event| *event == label).unwrap();
        assert!(first("end-init") < first("start-a"));
        assert!(first("end-init") < first("start-b"));
        assert!(first("start-a") < first("end-a"));
        assert!(first("start-b") < first("end-b"));
    }

    #[test]
    fn actively_waiting_for_marker_returns_after_completion() {
        let (manager, group) = single_group_manager("s3-group");

        let (marker_tx, marker_rx) = mpsc::channel();
        let started = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        {
            let started = Arc::clone(&started);
            let done = Arc::clone(&done);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(group, move |tm| {
                if !submitted.swap(true, Ordering::AcqRel) {
                    let handle = tm.get_task(group, || {
                        thread::sleep(Duration::from_millis(1));
                    });
                    marker_tx.send(handle.create_completion_marker()).unwrap();

                    // Signals that the group is running (tasks only execute
                    // after the group has started)
                    let started = Arc::clone(&started);
                    tm.get_task(group, move || {
                        started.store(true, Ordering::Release);
                    });

                    // Holds the group open until the waiter is finished (or
                    // the test has clearly failed)
                    let done = Arc::clone(&done);
                    tm.get_task(group, move || {
                        let begin = Instant::now();
                        while !done.load(Ordering::Acquire)
                            && begin.elapsed() < Duration::from_secs(10)
                        {
                            thread::yield_now();
                        }
                    });
                }
            });
        }

        with_workers(&manager, 2, || {
            wait_until(|| started.load(Ordering::Acquire));
            let marker = marker_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            manager.actively_wait_for(&marker);
            assert!(marker.is_completed());
            done.store(true, Ordering::Release);
        });
    }

    #[test]
    fn long_duration_and_delayed_tasks_complete() {
        let (manager, group) = single_group_manager("s4-tick");

        let frames = Arc::new(AtomicUsize::new(0));
        let transient_runs = Arc::new(AtomicUsize::new(0));
        {
            let frames = Arc::clone(&frames);
            let transient_runs = Arc::clone(&transient_runs);
            manager.set_start_task_group_callback(group, move |tm| {
                let frame = frames.fetch_add(1, Ordering::AcqRel);
                if frame < 10 {
                    for _ in 0..100 {
                        let transient_runs = Arc::clone(&transient_runs);
                        tm.get_task(group, move || {
                            transient_runs.fetch_add(1, Ordering::AcqRel);
                        });
                    }
                } else {
                    // Later frames keep one task pending so every frame still
                    // has windows where workers pick tasks instead of
                    // advancing the interpreter
                    tm.get_task(group, || {});
                }
            });
        }

        let ld_done = Arc::new(AtomicBool::new(false));
        {
            let ld_done = Arc::clone(&ld_done);
            drop(manager.get_long_duration_task(move || {
                ld_done.store(true, Ordering::Release);
            }));
        }

        let deadline = Instant::now() + Duration::from_millis(5);
        let delayed_ran_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        {
            let delayed_ran_at = Arc::clone(&delayed_ran_at);
            drop(manager.get_delayed_task(Duration::from_millis(5), move || {
                delayed_ran_at.lock().replace(Instant::now());
            }));
        }

        pump_until(&manager, || {
            frames.load(Ordering::Acquire) >= 12
                && ld_done.load(Ordering::Acquire)
                && delayed_ran_at.lock().is_some()
        });

        assert_eq!(transient_runs.load(Ordering::Acquire), 1000);
        assert!(delayed_ran_at.lock().unwrap() >= deadline, "delayed task ran early");
    }

    #[test]
    fn shutdown_freezes_after_one_more_frame() {
        let (manager, group) = single_group_manager("s5-group");

        let transient_runs = Arc::new(AtomicUsize::new(0));
        {
            let transient_runs = Arc::clone(&transient_runs);
            manager.set_start_task_group_callback(group, move |tm| {
                let transient_runs = Arc::clone(&transient_runs);
                tm.get_task(group, move || {
                    transient_runs.fetch_add(1, Ordering::AcqRel);
                });
            });
        }

        let delayed_ran = Arc::new(AtomicBool::new(false));
        {
            let delayed_ran = Arc::clone(&delayed_ran);
            drop(manager.get_delayed_task(Duration::from_millis(500), move || {
                delayed_ran.store(true, Ordering::Release);
            }));
        }

        pump_until(&manager, || manager.frame_key() >= 3);

        let stopped = Arc::new(AtomicBool::new(false));
        let key_at_request = manager.frame_key();
        {
            let stopped = Arc::clone(&stopped);
            manager.request_stop(
                move |_| {
                    stopped.store(true, Ordering::Release);
                },
                true,
            );
        }
        assert!(manager.is_stop_requested());

        pump_until(&manager, || stopped.load(Ordering::Acquire));

        // The frame completed but was not recycled
        assert!(manager.is_frame_locked());
        assert!(!manager.is_stop_requested());
        assert_eq!(manager.frame_key(), key_at_request);

        // The flushed delayed task drains long before its deadline
        pump_until(&manager, || delayed_ran.load(Ordering::Acquire));

        // No further transient work while frozen
        let runs_at_stop = transient_runs.load(Ordering::Acquire);
        for _ in 0..100 {
            manager.run_a_task(false, SelectionMode::Normal);
        }
        assert_eq!(transient_runs.load(Ordering::Acquire), runs_at_stop);
        assert_eq!(manager.frame_key(), key_at_request);

        // Releasing the frame lock resumes normal frames
        manager.unlock_frame();
        pump_until(&manager, || manager.frame_key() > key_at_request);
    }

    #[test]
    fn restricted_group_runs_only_on_named_thread() {
        let mut threads = ThreadsConfiguration::new();
        let io = threads.add_named_thread(hash64!("s6-io"), NamedThreadConfig::default());

        let mut graph = TaskGroupGraph::new();
        let io_group = graph.add_task_group(
            hash64!("s6-io-group"),
            GroupConfig {
                restrict_to_named_thread: Some(hash64!("s6-io").hash()),
            },
        );

        let mut manager = TaskManager::new();
        manager
            .load(graph.compile().unwrap(), threads.into_configuration())
            .unwrap();

        let ran_on: Arc<Mutex<Vec<NamedThreadId>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let ran_on = Arc::clone(&ran_on);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(io_group, move |tm| {
                if !submitted.swap(true, Ordering::AcqRel) {
                    for _ in 0..100 {
                        let ran_on = Arc::clone(&ran_on);
                        tm.get_task(io_group, move || {
                            ran_on.lock().push(CURRENT_THREAD.get());
                        });
                    }
                }
            });
        }

        let stop = AtomicBool::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                manager.register_worker_thread(io);
                while !stop.load(Ordering::Acquire) {
                    manager.run_a_task(false, SelectionMode::Normal);
                    thread::yield_now();
                }
            });
            for _ in 0..4 {
                scope.spawn(|| {
                    while !stop.load(Ordering::Acquire) {
                        manager.run_a_task(false, SelectionMode::Normal);
                        thread::yield_now();
                    }
                });
            }

            let _guard = StopGuard(&stop);
            wait_until(|| ran_on.lock().len() == 100);
        });

        assert!(ran_on.lock().iter().all(|&thread| thread == io));
    }

    #[test]
    fn then_continuation_runs_after_parent() {
        let (manager, group) = single_group_manager("then-group");

        let order = Arc::new(Mutex::new(Vec::new()));
        {
            let order = Arc::clone(&order);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(group, move |tm| {
                if !submitted.swap(true, Ordering::AcqRel) {
                    let first = Arc::clone(&order);
                    let second = Arc::clone(&order);
                    let parent = tm.get_task(group, move || {
                        first.lock().push(1);
                    });
                    let _child = parent.then(move || {
                        second.lock().push(2);
                    });
                }
            });
        }

        pump_until(&manager, || order.lock().len() == 2);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn tasks_can_create_tasks_in_their_own_group() {
        let (manager, group) = single_group_manager("nested-group");

        let child_ran = Arc::new(AtomicBool::new(false));
        {
            let child_ran = Arc::clone(&child_ran);
            let submitted = AtomicBool::new(false);
            manager.set_start_task_group_callback(group, move |tm| {
                if !submitted.swap(true, Ordering::AcqRel) {
                    let child_ran = Arc::clone(&child_ran);
                    drop(tm.get_task_scoped(
                        group,
                        Box::new(move || {
                            let child_ran = Arc::clone(&child_ran);
                            drop(tm.get_task_in_current_group(move || {
                                child_ran.store(true, Ordering::Release);
                            }));
                        }),
                    ));
                }
            });
        }

        pump_until(&manager, || {
            child_ran.load(Ordering::Acquire) && manager.frame_key() >= 1
        });
    }

    #[test]
    fn pending_task_accounting() {
        let (manager, _group) = single_group_manager("acct-group");
        // Park the frame graph; only the long-duration queue matters here
        manager.lock_frame();
        assert!(!manager.has_pending_tasks());

        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = Arc::clone(&ran);
            drop(manager.get_long_duration_task(move || {
                ran.store(true, Ordering::Release);
            }));
        }
        assert!(manager.has_pending_tasks());
        assert_eq!(manager.get_pending_tasks_count(), 1);

        pump_until(&manager, || ran.load(Ordering::Acquire));
        assert_eq!(manager.get_pending_tasks_count(), 0);
    }

    #[test]
    fn actively_wait_for_handle_completes_long_duration_task() {
        let (manager, _group) = single_group_manager("awh-group");
        // Park the frame graph; only the long-duration queue matters here
        manager.lock_frame();

        let ran = Arc::new(AtomicBool::new(false));
        let handle = {
            let ran = Arc::clone(&ran);
            manager.get_long_duration_task(move || {
                ran.store(true, Ordering::Release);
            })
        };
        manager.actively_wait_for_handle(handle);
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn run_tasks_for_executes_queued_work() {
        let (manager, _group) = single_group_manager("timed-group");

        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            drop(manager.get_long_duration_task(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }));
        }

        let elapsed = manager.run_tasks_for(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::Acquire), 32);
        assert!(elapsed <= Duration::from_secs(5));
    }

    #[test]
    fn frame_lock_freezes_the_interpreter() {
        let (manager, _group) = single_group_manager("freeze-group");

        manager.lock_frame();
        for _ in 0..10 {
            manager.run_a_task(false, SelectionMode::Normal);
        }
        assert_eq!(manager.frame_key(), 0);

        manager.unlock_frame();
        pump_until(&manager, || manager.frame_key() >= 1);
    }

    #[test]
    fn wait_for_a_task_honors_leave_request() {
        let (manager, _group) = single_group_manager("leave-group");
        manager.lock_frame();
        manager.should_threads_exit_wait(true);
        // Returns instead of parking forever
        manager.wait_for_a_task();
        manager.unlock_frame();
    }

    #[test]
    fn duplicate_stop_request_is_rejected() {
        let (manager, _group) = single_group_manager("stop-twice");
        assert!(manager.try_request_stop(|_| {}, false));
        assert!(!manager.try_request_stop(|_| {}, false));
    }
}
