//! Task lifecycle: a one-shot unit of work with fire-once callbacks.
//!
//! Status only moves forward: `idle -> executing -> finished | cancelled`
//! (cancellation is also allowed straight from `idle`). The terminal transition is
//! decided by a single atomic guard, so a `finish` racing a `cancel` settles the task
//! exactly once and the loser is a silent no-op.
//!
//! Callbacks are taken out of the task's lock before they run, which lets a callback
//! call back into the task (an execution callback may `finish()` synchronously).

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
pub use tokio_util::sync::CancellationToken;

/// Callback invoked with the task it belongs to. Runs at most once.
pub type TaskCallback = Box<dyn FnOnce(&Task) + Send + 'static>;

/// Unique identifier for a task. The only stable external reference to a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(uuid::Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Idle,
    Executing,
    Finished,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Executing => "executing",
            Self::Finished => "finished",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Default)]
struct Callbacks {
    execution: Option<TaskCallback>,
    completion: Option<TaskCallback>,
    cancellation: Option<TaskCallback>,
    /// Internal hook owned by the queue the task was dispatched on.
    settle_hook: Option<TaskCallback>,
}

impl Callbacks {
    fn clear(&mut self) {
        self.execution = None;
        self.completion = None;
        self.cancellation = None;
        self.settle_hook = None;
    }
}

struct TaskState {
    status: TaskStatus,
    callbacks: Callbacks,
}

struct TaskInner {
    id: TaskId,
    payload: Option<Arc<dyn Any + Send + Sync>>,
    settled: AtomicBool,
    cancel_token: CancellationToken,
    state: Mutex<TaskState>,
}

/// Shared handle to a task. Clones refer to the same task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// Create an idle task that runs `execution` when started.
    pub fn new<F>(execution: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self::builder(execution).build()
    }

    pub fn builder<F>(execution: F) -> TaskBuilder
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        TaskBuilder {
            execution: Some(Box::new(execution)),
            completion: None,
            cancellation: None,
            payload: None,
        }
    }

    /// Create an idle task from already boxed callbacks. Any of them may be absent.
    pub fn with_callbacks(
        execution: Option<TaskCallback>,
        completion: Option<TaskCallback>,
        cancellation: Option<TaskCallback>,
    ) -> Self {
        TaskBuilder {
            execution,
            completion,
            cancellation,
            payload: None,
        }
        .build()
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn status(&self) -> TaskStatus {
        self.lock_state().status
    }

    pub fn is_terminal(&self) -> bool {
        self.inner.settled.load(Ordering::Acquire)
    }

    /// True once the task has been cancelled. Long-running execution callbacks
    /// should poll this (or await the token) and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel_token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }

    /// The opaque payload attached at build time, if it has type `T`.
    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.inner.payload.as_deref()?.downcast_ref::<T>()
    }

    /// `idle -> executing`, then runs the execution callback on the calling thread.
    ///
    /// Returns `false` (and runs nothing) if the task is not idle.
    pub fn start(&self) -> bool {
        let execution = {
            let mut state = self.lock_state();
            if state.status != TaskStatus::Idle || self.is_terminal() {
                return false;
            }
            state.status = TaskStatus::Executing;
            state.callbacks.execution.take()
        };

        tracing::debug!(task = %self.inner.id, "Task executing");
        if let Some(execution) = execution {
            execution(self);
        }
        true
    }

    /// `executing -> finished`, firing the completion callback once.
    ///
    /// Returns `false` if the task is not executing or already settled
    /// (including losing a race against `cancel`).
    pub fn finish(&self) -> bool {
        let (completion, hook) = {
            let mut state = self.lock_state();
            if state.status != TaskStatus::Executing || !self.try_settle() {
                return false;
            }
            state.status = TaskStatus::Finished;
            let completion = state.callbacks.completion.take();
            let hook = state.callbacks.settle_hook.take();
            state.callbacks.clear();
            (completion, hook)
        };

        tracing::debug!(task = %self.inner.id, "Task finished");
        if let Some(completion) = completion {
            completion(self);
        }
        if let Some(hook) = hook {
            hook(self);
        }
        true
    }

    /// Cancel the task from `idle` or `executing`.
    ///
    /// Every callback is cleared before the cancellation callback runs, so nothing
    /// else fires afterwards. An execution callback that already began is not
    /// interrupted; it observes the cancellation through `is_cancelled`.
    pub fn cancel(&self) -> bool {
        let (cancellation, hook) = {
            let mut state = self.lock_state();
            if !self.try_settle() {
                return false;
            }
            state.status = TaskStatus::Cancelled;
            let cancellation = state.callbacks.cancellation.take();
            let hook = state.callbacks.settle_hook.take();
            state.callbacks.clear();
            (cancellation, hook)
        };

        self.inner.cancel_token.cancel();
        tracing::debug!(task = %self.inner.id, "Task cancelled");
        if let Some(cancellation) = cancellation {
            cancellation(self);
        }
        if let Some(hook) = hook {
            hook(self);
        }
        true
    }

    /// Attach the queue's settle hook. Fails if the task already settled.
    pub(crate) fn attach_settle_hook(&self, hook: TaskCallback) -> bool {
        let mut state = self.lock_state();
        if self.is_terminal() {
            return false;
        }
        state.callbacks.settle_hook = Some(hook);
        true
    }

    /// Detach the queue's settle hook. Returns whether one was still pending.
    pub(crate) fn detach_settle_hook(&self) -> bool {
        self.lock_state().callbacks.settle_hook.take().is_some()
    }

    fn try_settle(&self) -> bool {
        self.inner
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(task = %self.inner.id, "Task state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Builder for tasks with optional terminal callbacks and payload.
pub struct TaskBuilder {
    execution: Option<TaskCallback>,
    completion: Option<TaskCallback>,
    cancellation: Option<TaskCallback>,
    payload: Option<Arc<dyn Any + Send + Sync>>,
}

impl TaskBuilder {
    pub fn on_complete<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn on_cancel<F>(mut self, cancellation: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.cancellation = Some(Box::new(cancellation));
        self
    }

    pub fn payload<T: Any + Send + Sync>(mut self, payload: T) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    pub fn build(self) -> Task {
        Task {
            inner: Arc::new(TaskInner {
                id: TaskId::new(),
                payload: self.payload,
                settled: AtomicBool::new(false),
                cancel_token: CancellationToken::new(),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Idle,
                    callbacks: Callbacks {
                        execution: self.execution,
                        completion: self.completion,
                        cancellation: self.cancellation,
                        settle_hook: None,
                    },
                }),
            }),
        }
    }
}
