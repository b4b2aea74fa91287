//! TaskQueue: bounded-concurrency dispatch of one-shot tasks with drain detection.
//!
//! Flow:
//! 1. `start` marks the queue running, retains it and dispatches every idle task
//! 2. each dispatch unit waits for a permit on the runtime, then starts its task
//! 3. a settling task runs the queue's settle hook, which returns the permit and
//!    re-evaluates drain completion under the queue lock
//! 4. on drain the completion callback fires; a plain queue then stops, a
//!    keep-waiting queue stays open and signals again on the next drain
//!
//! Queue bookkeeping lives in one mutex. Callbacks (user or task) never run while
//! it is held, so a completion callback may call back into the queue.

mod slot;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::permit::{Permit, PermitPool};
use crate::task::{Task, TaskCallback, TaskId, TaskStatus};
use slot::TaskSlot;

/// Tasks run one at a time unless configured otherwise.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Completion callback for a queue. Called once per drain cycle.
pub type QueueCompletion = Arc<dyn Fn(&TaskQueue) + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(uuid::Uuid);

impl QueueId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of tasks executing at once. Zero is treated as one.
    pub concurrency: usize,
    /// Stay open after draining and accept further tasks.
    pub keep_waiting: bool,
    pub label: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            keep_waiting: false,
            label: None,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_keep_waiting(mut self, keep_waiting: bool) -> Self {
        self.keep_waiting = keep_waiting;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Point-in-time view of a queue for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub id: QueueId,
    pub label: String,
    pub running: bool,
    pub keep_waiting: bool,
    pub concurrency: usize,
    pub available_permits: usize,
    pub idle: usize,
    pub executing: usize,
    pub finished: usize,
    pub cancelled: usize,
}

struct QueueState {
    slots: Vec<TaskSlot>,
    running: bool,
    keep_waiting: bool,
    /// Completion already signalled for the current drain cycle.
    cycle_drained: bool,
    completion: Option<QueueCompletion>,
    /// Strong self-reference held from `start` until `stop`.
    retained: Option<Arc<QueueShared>>,
}

impl QueueState {
    fn is_completed(&self) -> bool {
        !self.slots.is_empty() && self.slots.iter().all(TaskSlot::is_settled)
    }
}

struct QueueShared {
    id: QueueId,
    label: String,
    permits: Arc<PermitPool>,
    runtime: Handle,
    state: Mutex<QueueState>,
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        // Wake dispatch units still waiting for a permit of this queue.
        self.permits.close();
        tracing::debug!(queue = %self.id, "Queue released");
    }
}

/// What to do after a drain was detected, run outside the queue lock.
struct DrainAction {
    completion: Option<QueueCompletion>,
    stop: bool,
}

/// Handle to a task queue. Clones refer to the same queue.
#[derive(Clone)]
pub struct TaskQueue {
    shared: Arc<QueueShared>,
}

impl TaskQueue {
    /// Create an empty queue dispatching onto the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime; use [`TaskQueue::with_handle`] there.
    pub fn new(config: QueueConfig) -> Self {
        Self::with_handle(config, Handle::current())
    }

    pub fn with_handle(config: QueueConfig, runtime: Handle) -> Self {
        let id = QueueId::new();
        let label = config.label.unwrap_or_else(|| format!("queue-{id}"));
        let permits = Arc::new(PermitPool::new(config.concurrency));
        tracing::debug!(queue = %id, %label, concurrency = permits.capacity(), "Queue created");

        Self {
            shared: Arc::new(QueueShared {
                id,
                label,
                permits,
                runtime,
                state: Mutex::new(QueueState {
                    slots: Vec::new(),
                    running: false,
                    keep_waiting: config.keep_waiting,
                    cycle_drained: false,
                    completion: None,
                    retained: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> QueueId {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn concurrency(&self) -> usize {
        self.shared.permits.capacity()
    }

    pub fn available_permits(&self) -> usize {
        self.shared.permits.available()
    }

    /// Highest number of tasks that held a permit at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.shared.permits.peak_in_use()
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> Vec<Task> {
        self.lock_state()
            .slots
            .iter()
            .map(|slot| slot.task().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock_state().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_state().slots.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Every task is finished or cancelled and every settle hook has run.
    /// An empty queue is never complete.
    pub fn is_completed(&self) -> bool {
        self.lock_state().is_completed()
    }

    pub fn keep_waiting(&self) -> bool {
        self.lock_state().keep_waiting
    }

    pub fn set_keep_waiting(&self, keep_waiting: bool) {
        self.lock_state().keep_waiting = keep_waiting;
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock_state();
        let mut snapshot = QueueSnapshot {
            id: self.shared.id,
            label: self.shared.label.clone(),
            running: state.running,
            keep_waiting: state.keep_waiting,
            concurrency: self.shared.permits.capacity(),
            available_permits: self.shared.permits.available(),
            idle: 0,
            executing: 0,
            finished: 0,
            cancelled: 0,
        };
        for slot in &state.slots {
            match slot.task().status() {
                TaskStatus::Idle => snapshot.idle += 1,
                TaskStatus::Executing => snapshot.executing += 1,
                TaskStatus::Finished => snapshot.finished += 1,
                TaskStatus::Cancelled => snapshot.cancelled += 1,
            }
        }
        snapshot
    }

    /// Append a task. Returns `false` if the queue already completed.
    pub fn add(&self, task: Task) -> bool {
        self.insert(task, usize::MAX)
    }

    /// Append several tasks, returning how many were accepted.
    pub fn add_all(&self, tasks: impl IntoIterator<Item = Task>) -> usize {
        let mut accepted = 0;
        for task in tasks {
            if self.add(task) {
                accepted += 1;
            }
        }
        accepted
    }

    /// Insert a task at `index` (clamped to the current length).
    ///
    /// A queue that completed and is not keep-waiting rejects the task: the rejection
    /// is logged and `false` returned. A running queue dispatches the task at once.
    pub fn insert(&self, task: Task, index: usize) -> bool {
        let mut state = self.lock_state();

        if !state.keep_waiting && !state.running && state.is_completed() {
            tracing::warn!(
                queue = %self.shared.id,
                task = %task.id(),
                "Cannot add tasks after queue completion"
            );
            return false;
        }

        let already_queued = state.slots.iter().any(|slot| slot.id() == task.id());
        let slot = if already_queued {
            TaskSlot::alias(task)
        } else {
            TaskSlot::new(task)
        };

        let index = index.min(state.slots.len());
        state.slots.insert(index, slot);
        state.cycle_drained = false;

        if state.running {
            self.dispatch_idle(&mut state);
        }
        true
    }

    /// Cancel a task and drop every slot it occupies. Returns `false` if it was not
    /// queued.
    pub fn remove(&self, task: &Task) -> bool {
        let removed: Vec<TaskSlot> = {
            let mut state = self.lock_state();
            let (removed, kept) = std::mem::take(&mut state.slots)
                .into_iter()
                .partition(|slot| slot.id() == task.id());
            state.slots = kept;
            removed
        };
        if removed.is_empty() {
            return false;
        }

        // The owning slot is among the removed ones, so its hook can go.
        task.detach_settle_hook();
        task.cancel();
        let slots = removed.len();
        for mut slot in removed {
            drop(slot.release());
        }
        tracing::debug!(queue = %self.shared.id, task = %task.id(), slots, "Task removed");

        let action = self.drain_action(&mut self.lock_state());
        self.run_drain_action(action);
        true
    }

    /// Start dispatching with a completion callback.
    ///
    /// No-op (returns `false`) if already running, or if empty and not keep-waiting.
    pub fn start<F>(&self, completion: F) -> bool
    where
        F: Fn(&TaskQueue) + Send + Sync + 'static,
    {
        self.start_with(Some(Arc::new(completion)))
    }

    pub fn start_with(&self, completion: Option<QueueCompletion>) -> bool {
        let action = {
            let mut state = self.lock_state();
            if state.running || (state.slots.is_empty() && !state.keep_waiting) {
                return false;
            }

            state.running = true;
            state.cycle_drained = false;
            state.completion = completion;
            state.retained = Some(Arc::clone(&self.shared));
            tracing::debug!(
                queue = %self.shared.id,
                tasks = state.slots.len(),
                "Queue started"
            );

            self.dispatch_idle(&mut state);
            self.drain_action(&mut state)
        };
        self.run_drain_action(action);
        true
    }

    /// Stop the queue: cancel outstanding tasks and release the self-reference.
    pub fn stop(&self) {
        let (tasks, retained) = {
            let mut state = self.lock_state();
            state.running = false;
            state.completion = None;
            let tasks: Vec<Task> = state.slots.iter().map(|slot| slot.task().clone()).collect();
            (tasks, state.retained.take())
        };

        let cancelled = tasks.iter().filter(|task| task.cancel()).count();
        tracing::debug!(queue = %self.shared.id, cancelled, "Queue stopped");
        drop(retained);
    }

    fn dispatch_idle(&self, state: &mut QueueState) {
        for slot in state.slots.iter_mut() {
            if slot.is_dispatched() || slot.task().status() != TaskStatus::Idle {
                continue;
            }
            if !slot.task().attach_settle_hook(self.settle_hook()) {
                continue;
            }
            slot.mark_dispatched();

            let task = slot.task().clone();
            let permits = Arc::clone(&self.shared.permits);
            let queue = Arc::downgrade(&self.shared);
            let queue_id = self.shared.id;

            tracing::debug!(queue = %queue_id, task = %task.id(), "Dispatching task");
            self.shared.runtime.spawn(async move {
                tracing::trace!(
                    queue = %queue_id,
                    task = %task.id(),
                    available = permits.available(),
                    "Waiting for permit"
                );
                let Some(permit) = permits.acquire().await else {
                    tracing::debug!(queue = %queue_id, task = %task.id(), "Permit pool closed");
                    return;
                };
                if let Some(shared) = Weak::upgrade(&queue) {
                    TaskQueue { shared }.begin(task, permit);
                }
            });
        }
    }

    /// Runs in the dispatch unit once a permit is held.
    fn begin(&self, task: Task, permit: Permit) {
        {
            let mut state = self.lock_state();
            let Some(slot) = state
                .slots
                .iter_mut()
                .find(|slot| slot.id() == task.id() && slot.hook_pending())
            else {
                // Removed or settled while waiting; the permit goes straight back.
                return;
            };
            if task.status() != TaskStatus::Idle {
                return;
            }
            slot.hold(permit);
        }
        task.start();
    }

    fn settle_hook(&self) -> TaskCallback {
        let queue = Arc::downgrade(&self.shared);
        Box::new(move |task: &Task| {
            if let Some(shared) = queue.upgrade() {
                TaskQueue { shared }.on_task_settled(task.id());
            }
        })
    }

    fn on_task_settled(&self, id: TaskId) {
        let action = {
            let mut state = self.lock_state();
            if let Some(slot) = state
                .slots
                .iter_mut()
                .find(|slot| slot.id() == id && slot.hook_pending())
            {
                drop(slot.release());
            }

            if tracing::enabled!(tracing::Level::TRACE) {
                let settled = state.slots.iter().filter(|s| s.is_settled()).count();
                tracing::trace!(
                    queue = %self.shared.id,
                    task = %id,
                    settled,
                    total = state.slots.len(),
                    available = self.shared.permits.available(),
                    "Task settled"
                );
            }
            self.drain_action(&mut state)
        };
        self.run_drain_action(action);
    }

    fn drain_action(&self, state: &mut QueueState) -> Option<DrainAction> {
        if !state.running || state.cycle_drained || !state.is_completed() {
            return None;
        }
        state.cycle_drained = true;

        if state.keep_waiting {
            return Some(DrainAction {
                completion: state.completion.clone(),
                stop: false,
            });
        }

        // Closing before the callback runs makes late insertions fail fast.
        state.running = false;
        Some(DrainAction {
            completion: state.completion.take(),
            stop: true,
        })
    }

    fn run_drain_action(&self, action: Option<DrainAction>) {
        let Some(action) = action else {
            return;
        };
        tracing::debug!(queue = %self.shared.id, stop = action.stop, "Queue drained");
        if let Some(completion) = action.completion {
            completion(self);
        }
        if action.stop {
            self.stop();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(queue = %self.shared.id, "Queue state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("id", &self.shared.id)
            .field("label", &self.shared.label)
            .finish_non_exhaustive()
    }
}
