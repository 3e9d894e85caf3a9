//! Status - 台帳の状態と健全性レポート
//!
//! - `LedgerStatus`: ステータス別の件数と現在の claim 一覧
//! - `DoctorReport`: 読み取り専用の整合性チェック結果
//! - `ReclaimReport`: 古い claim の一括回収結果

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::state::ReclaimedClaim;
use crate::domain::{AgentId, ClaimPolicy, DependencyGraph, TaskId, TaskSet, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl LedgerCounts {
    pub fn from_task_set(tasks: &TaskSet) -> Self {
        let mut counts = Self::default();
        for task in &tasks.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveClaim {
    pub task_id: TaskId,
    pub agent: AgentId,
    pub claimed_at: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    /// Would the next validate/transition reclaim it?
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatus {
    pub ledger: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub counts: LedgerCounts,
    pub claims: Vec<ActiveClaim>,
}

impl LedgerStatus {
    pub fn build(
        ledger: String,
        tasks: &TaskSet,
        now: DateTime<Utc>,
        policy: &ClaimPolicy,
    ) -> Self {
        let claims = tasks
            .tasks
            .iter()
            .filter_map(|task| {
                let agent = task.claimed_by.clone()?;
                Some(ActiveClaim {
                    task_id: task.id.clone(),
                    agent,
                    claimed_at: task.claimed_at,
                    age_secs: task
                        .claimed_at
                        .map(|at| now.signed_duration_since(at).num_seconds()),
                    stale: policy.is_stale(task, now),
                })
            })
            .collect();

        Self {
            ledger,
            last_updated: tasks.last_updated,
            counts: LedgerCounts::from_task_set(tasks),
            claims,
        }
    }
}

/// One consistency problem found by `doctor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum Finding {
    /// Tasks on this path can never be claimed.
    DependencyCycle { path: Vec<TaskId> },
    DanglingDependency { task_id: TaskId, missing: TaskId },
    DuplicateId { task_id: TaskId, occurrences: usize },
    /// `claimed_by` on a task that is not in progress.
    ClaimOutsideProgress { task_id: TaskId, status: TaskStatus },
    /// `claimed_by` and `claimed_at` must be set and cleared together.
    HalfClaim { task_id: TaskId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoctorReport {
    pub ledger: String,
    pub healthy: bool,
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    pub fn examine(ledger: String, tasks: &TaskSet) -> Self {
        let mut findings = Vec::new();

        let mut seen: HashMap<&TaskId, usize> = HashMap::new();
        for task in &tasks.tasks {
            *seen.entry(&task.id).or_default() += 1;
        }
        let mut reported: HashSet<&TaskId> = HashSet::new();
        for task in &tasks.tasks {
            let occurrences = seen.get(&task.id).copied().unwrap_or(0);
            if occurrences > 1 && reported.insert(&task.id) {
                findings.push(Finding::DuplicateId {
                    task_id: task.id.clone(),
                    occurrences,
                });
            }
        }

        for task in &tasks.tasks {
            for dep in &task.dependencies {
                if !tasks.contains(dep.as_str()) {
                    findings.push(Finding::DanglingDependency {
                        task_id: task.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
            if task.claimed_by.is_some() && task.status != TaskStatus::InProgress {
                findings.push(Finding::ClaimOutsideProgress {
                    task_id: task.id.clone(),
                    status: task.status,
                });
            }
            if task.claimed_by.is_some() != task.claimed_at.is_some() {
                findings.push(Finding::HalfClaim {
                    task_id: task.id.clone(),
                });
            }
        }

        if let Some(path) = DependencyGraph::from_task_set(tasks).detect_cycle() {
            findings.push(Finding::DependencyCycle { path });
        }

        Self {
            ledger,
            healthy: findings.is_empty(),
            findings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimedEntry {
    pub task_id: TaskId,
    pub agent: Option<AgentId>,
    pub claimed_at: DateTime<Utc>,
}

impl From<ReclaimedClaim> for ReclaimedEntry {
    fn from(claim: ReclaimedClaim) -> Self {
        Self {
            task_id: claim.task_id,
            agent: claim.agent,
            claimed_at: claim.claimed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReclaimReport {
    pub ledger: String,
    pub reclaimed: Vec<ReclaimedEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Task;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    #[test]
    fn counts_and_claims() {
        let set = TaskSet::new(vec![
            Task::new("T0").with_status(TaskStatus::Completed),
            Task::new("T1").with_claim("A", now() - Duration::minutes(5)),
            Task::new("T2").with_claim("B", now() - Duration::hours(2)),
            Task::new("T3"),
        ]);

        let status = LedgerStatus::build("memory".into(), &set, now(), &ClaimPolicy::default());
        assert_eq!(
            status.counts,
            LedgerCounts {
                pending: 1,
                in_progress: 2,
                completed: 1
            }
        );
        assert_eq!(status.counts.total(), 4);
        assert_eq!(status.claims.len(), 2);
        assert_eq!(status.claims[0].age_secs, Some(300));
        assert!(!status.claims[0].stale);
        assert!(status.claims[1].stale);
    }

    #[test]
    fn healthy_ledger_has_no_findings() {
        let set = TaskSet::new(vec![Task::new("T0"), Task::new("T1").with_dependency("T0")]);
        let report = DoctorReport::examine("memory".into(), &set);
        assert!(report.healthy);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn doctor_reports_every_problem() {
        let mut half = Task::new("T3");
        half.claimed_by = Some(AgentId::new("A"));
        let mut done_but_claimed = Task::new("T4").with_claim("B", now());
        done_but_claimed.status = TaskStatus::Completed;

        let set = TaskSet::new(vec![
            Task::new("T0").with_dependency("T1"),
            Task::new("T1").with_dependency("T0"),
            Task::new("T2").with_dependency("ghost"),
            half,
            done_but_claimed,
            Task::new("T2"),
        ]);

        let report = DoctorReport::examine("memory".into(), &set);
        assert!(!report.healthy);
        assert!(report.findings.contains(&Finding::DuplicateId {
            task_id: TaskId::new("T2"),
            occurrences: 2,
        }));
        assert!(report.findings.contains(&Finding::DanglingDependency {
            task_id: TaskId::new("T2"),
            missing: TaskId::new("ghost"),
        }));
        assert!(report.findings.contains(&Finding::HalfClaim {
            task_id: TaskId::new("T3"),
        }));
        assert!(report.findings.contains(&Finding::ClaimOutsideProgress {
            task_id: TaskId::new("T3"),
            status: TaskStatus::Pending,
        }));
        assert!(report.findings.contains(&Finding::ClaimOutsideProgress {
            task_id: TaskId::new("T4"),
            status: TaskStatus::Completed,
        }));
        assert!(report.findings.contains(&Finding::DependencyCycle {
            path: vec![TaskId::new("T0"), TaskId::new("T1"), TaskId::new("T0")],
        }));
    }
}
