//! Events - ドメインイベント
//!
//! 台帳の変更ごとに DomainEvent を 1 つ発行し、EventSink に渡します。
//! 実際の配送（他エージェントへの通知）は baton の範囲外です。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, TaskId};
use super::task::TaskStatus;

/// DomainEvent はドメインで発生したイベント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    TaskClaimed {
        task_id: TaskId,
        agent: AgentId,
        at: DateTime<Utc>,
    },
    ClaimRefreshed {
        task_id: TaskId,
        agent: AgentId,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        task_id: TaskId,
        agent: Option<AgentId>,
        at: DateTime<Utc>,
        /// Dependents that became claimable.
        unblocked: Vec<TaskId>,
    },
    /// A stale claim was released by the coordinator.
    ClaimReclaimed {
        task_id: TaskId,
        agent: Option<AgentId>,
        claimed_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            DomainEvent::TaskClaimed { task_id, .. }
            | DomainEvent::ClaimRefreshed { task_id, .. }
            | DomainEvent::TaskCompleted { task_id, .. }
            | DomainEvent::ClaimReclaimed { task_id, .. } => task_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskClaimed { .. } => "task_claimed",
            DomainEvent::ClaimRefreshed { .. } => "claim_refreshed",
            DomainEvent::TaskCompleted { .. } => "task_completed",
            DomainEvent::ClaimReclaimed { .. } => "claim_reclaimed",
        }
    }
}

/// Notification payload attached to a successful transition, for any
/// observer that wants to tell other agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broadcast {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub message: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unblocked: Vec<TaskId>,
}

impl Broadcast {
    pub fn new(task_id: TaskId, status: TaskStatus) -> Self {
        Self {
            message: format!("BROADCAST: Task {task_id} updated to {status}"),
            task_id,
            status,
            unblocked: Vec::new(),
        }
    }

    pub fn with_unblocked(mut self, unblocked: Vec<TaskId>) -> Self {
        self.unblocked = unblocked;
        self
    }
}
