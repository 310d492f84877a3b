//! Cooperative task control.
//!
//! Every long-running device task (connection supervisor, async sender,
//! syncer) carries a shared control block. Stopping sets the state and
//! notifies; the task observes it at its next suspension point and exits.
//! Restarting is the same, except the supervisor loops back to the top
//! instead of returning.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Running = 0,
    Exiting = 1,
    Restarting = 2,
}

pub struct TaskCtl {
    state: AtomicU8,
    notify: Notify,
}

impl TaskCtl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(TaskState::Running as u8),
            notify: Notify::new(),
        })
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Running,
            1 => TaskState::Exiting,
            _ => TaskState::Restarting,
        }
    }

    pub fn request(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// True once a stop or restart was requested.
    pub fn should_stop(&self) -> bool {
        self.state() != TaskState::Running
    }

    /// Acknowledge a restart request and resume running.
    pub fn ack_restart(&self) {
        let _ = self.state.compare_exchange(
            TaskState::Restarting as u8,
            TaskState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Resolves when a stop or restart is requested. Returns immediately if
    /// one already is.
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.should_stop() {
                return;
            }
            notified.await;
        }
    }
}
