//! Decision model: what callers get back from `validate` and `transition`.
//!
//! Business-rule failures are never errors here. They come back as a
//! `Refusal` inside a structured record, so callers can branch on
//! `allowed` / `success` alone.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dependency::{Gate, UnmetDependency};
use super::events::Broadcast;
use super::ids::{AgentId, TaskId};
use super::task::TaskStatus;

/// Why a claim or transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Refusal {
    #[error("Task is already completed.")]
    AlreadyCompleted,

    #[error("Task already claimed by {by}")]
    AlreadyClaimed { by: AgentId },

    #[error("Permission denied: Task is claimed by {owner}. Only the owner can complete it.")]
    PermissionDenied { owner: AgentId },

    #[error("Task is blocked by: {}", .blockers.join(", "))]
    Blocked { blockers: Vec<String> },

    #[error("Unmet dependencies: {}", render_unmet(.dependencies))]
    Unmet { dependencies: Vec<UnmetDependency> },

    #[error("Agent ID required to claim task")]
    AgentRequired,

    #[error("Illegal transition {from} -> {to}: only stale claims return to pending")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },
}

fn render_unmet(dependencies: &[UnmetDependency]) -> String {
    dependencies
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Refusal {
    /// Stable machine-readable code (matches the serde tag).
    pub fn code(&self) -> &'static str {
        match self {
            Refusal::AlreadyCompleted => "already_completed",
            Refusal::AlreadyClaimed { .. } => "already_claimed",
            Refusal::PermissionDenied { .. } => "permission_denied",
            Refusal::Blocked { .. } => "blocked",
            Refusal::Unmet { .. } => "unmet",
            Refusal::AgentRequired => "agent_required",
            Refusal::IllegalTransition { .. } => "illegal_transition",
        }
    }

    /// `None` when the gate is open.
    pub fn from_gate(gate: Gate) -> Option<Self> {
        match gate {
            Gate::Open => None,
            Gate::Blocked(blockers) => Some(Refusal::Blocked { blockers }),
            Gate::Unmet(dependencies) => Some(Refusal::Unmet { dependencies }),
        }
    }
}

/// Answer to "may this agent start this task now?" (advisory only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub task_id: TaskId,
    pub allowed: bool,
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<Refusal>,

    /// Holder of a stale claim that was released while evaluating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaimed_from: Option<AgentId>,
}

impl Decision {
    pub fn allow(task_id: TaskId) -> Self {
        Self {
            task_id,
            allowed: true,
            reason: "All dependencies met, no blockers, and not claimed by others.".to_string(),
            refusal: None,
            reclaimed_from: None,
        }
    }

    pub fn refuse(task_id: TaskId, refusal: Refusal) -> Self {
        Self {
            reason: refusal.to_string(),
            task_id,
            allowed: false,
            refusal: Some(refusal),
            reclaimed_from: None,
        }
    }

    pub fn with_reclaimed_from(mut self, agent: Option<AgentId>) -> Self {
        self.reclaimed_from = agent;
        self
    }
}

/// Result of one `transition` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub success: bool,
    pub task_id: TaskId,
    pub old_status: TaskStatus,
    /// Status after the call; equals `old_status` when refused.
    pub new_status: TaskStatus,
    /// `claimed_by` after the call.
    pub agent_id: Option<AgentId>,
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<Refusal>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast: Option<Broadcast>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reclaimed_from: Option<AgentId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case::completed(Refusal::AlreadyCompleted, "Task is already completed.")]
    #[case::claimed(
        Refusal::AlreadyClaimed { by: AgentId::new("Agent_Test_B") },
        "Task already claimed by Agent_Test_B"
    )]
    #[case::permission(
        Refusal::PermissionDenied { owner: AgentId::new("A") },
        "Permission denied: Task is claimed by A. Only the owner can complete it."
    )]
    #[case::blocked(
        Refusal::Blocked { blockers: vec!["vendor outage".into(), "design review".into()] },
        "Task is blocked by: vendor outage, design review"
    )]
    #[case::unmet(
        Refusal::Unmet { dependencies: vec![
            UnmetDependency { id: TaskId::new("T0"), status: Some(TaskStatus::Pending) },
            UnmetDependency { id: TaskId::new("T9"), status: None },
        ] },
        "Unmet dependencies: T0 (pending), T9 (not found)"
    )]
    fn refusals_render_human_readable_reasons(#[case] refusal: Refusal, #[case] expected: &str) {
        assert_eq!(refusal.to_string(), expected);
    }

    #[test]
    fn refusal_code_matches_serde_tag() {
        let refusal = Refusal::AlreadyClaimed {
            by: AgentId::new("A"),
        };
        let value = serde_json::to_value(&refusal).unwrap();
        assert_eq!(value, json!({"kind": "already_claimed", "by": "A"}));
        assert_eq!(value["kind"], refusal.code());
    }

    #[test]
    fn refused_decision_carries_reason_and_refusal() {
        let decision = Decision::refuse(TaskId::new("T1"), Refusal::AlreadyCompleted);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "Task is already completed.");
        assert_eq!(decision.refusal, Some(Refusal::AlreadyCompleted));

        let value = serde_json::to_value(&decision).unwrap();
        assert!(value.get("reclaimed_from").is_none());
    }

    #[test]
    fn open_gate_is_not_a_refusal() {
        assert_eq!(Refusal::from_gate(Gate::Open), None);
        assert_eq!(
            Refusal::from_gate(Gate::Blocked(vec!["x".into()])).map(|r| r.code()),
            Some("blocked")
        );
    }
}
