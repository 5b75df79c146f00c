use crate::{model::SubscriptionId, sync::SyncError};
use std::fmt;
use strum::{Display, EnumString, IntoStaticStr};
use tokio::time::Instant;

/// Declared from most to least urgent, so the derived `Ord` sorts HIGH first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Priority {
    /// Manual refresh by the user.
    High,
    /// Periodic scheduled fetch.
    Normal,
    /// Bulk refresh-all.
    Low,
}

impl Priority {
    pub fn outranks(self, other: Priority) -> bool {
        self < other
    }

    /// The more urgent of the two.
    pub fn escalate(self, other: Priority) -> Priority {
        self.min(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    /// Waiting out a retry backoff.
    Retrying,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FetchTask {
    pub id: TaskId,
    pub subscription_id: SubscriptionId,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub attempt_count: u32,
    pub state: TaskState,
    /// Earliest instant a retry may start.
    pub not_before: Option<Instant>,
    /// Follow-up requests folded into this task while it was running.
    pub absorbed: Vec<TaskId>,
    pub(super) seq: u64,
}

impl FetchTask {
    pub(super) fn is_eligible(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }

    pub(super) fn key(&self) -> (Priority, u64) {
        (self.priority, self.seq)
    }

    pub(super) fn answers(&self, id: TaskId) -> bool {
        self.id == id || self.absorbed.contains(&id)
    }
}

/// Terminal report for one task, delivered through the notification sink.
#[derive(Debug, Clone)]
pub struct SyncResult {
    pub task_id: TaskId,
    pub subscription_id: SubscriptionId,
    pub new_message_count: usize,
    pub attempts: u32,
    pub error: Option<SyncError>,
    pub absorbed: Vec<TaskId>,
}

impl SyncResult {
    pub fn state(&self) -> TaskState {
        match self.error {
            None => TaskState::Completed,
            Some(_) => TaskState::Failed,
        }
    }

    /// Whether this result settles the request that returned `id`.
    pub fn answers(&self, id: TaskId) -> bool {
        self.task_id == id || self.absorbed.contains(&id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub is_running: bool,
    pub pending: usize,
    pub current: Option<SubscriptionId>,
    pub completed: u64,
    pub failed: u64,
}
