//! TaskSlot - holds a queued Task and the queue's private bookkeeping side-by-side.
//!
//! The dispatched flag, pending-hook flag and held permit belong to the queue, not
//! to the task, so a task can be inspected or shared without exposing them.

use crate::permit::Permit;
use crate::task::{Task, TaskId};

pub(crate) struct TaskSlot {
    task: Task,
    dispatched: bool,
    hook_pending: bool,
    permit: Option<Permit>,
}

impl TaskSlot {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            dispatched: false,
            hook_pending: false,
            permit: None,
        }
    }

    /// A second slot for a task instance that is already queued. It is born
    /// dispatched so the task is never handed to the worker twice.
    pub fn alias(task: Task) -> Self {
        Self {
            task,
            dispatched: true,
            hook_pending: false,
            permit: None,
        }
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    pub fn hook_pending(&self) -> bool {
        self.hook_pending
    }

    /// Record that the settle hook is attached and a dispatch unit was submitted.
    pub fn mark_dispatched(&mut self) {
        self.dispatched = true;
        self.hook_pending = true;
    }

    pub fn hold(&mut self, permit: Permit) {
        debug_assert!(self.permit.is_none(), "slot already holds a permit");
        self.permit = Some(permit);
    }

    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }

    /// The task settled: clear the pending hook and hand back the permit, if any.
    pub fn release(&mut self) -> Option<Permit> {
        self.hook_pending = false;
        self.permit.take()
    }

    /// Terminal and no settle hook outstanding.
    pub fn is_settled(&self) -> bool {
        self.task.is_terminal() && !self.hook_pending
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if self.permit.is_some() && !self.task.is_terminal() {
            tracing::error!(
                task = %self.task.id(),
                "Slot dropped while holding a permit for a live task"
            );
        }
    }
}
