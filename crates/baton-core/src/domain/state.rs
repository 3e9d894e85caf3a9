//! Task state machine.
//!
//! Pure functions over in-memory ledger records. Nothing here touches the
//! store or the lock; the coordinator decides when results are persisted.
//!
//! | From        | To          | Trigger                 | Precondition                         |
//! |-------------|-------------|-------------------------|--------------------------------------|
//! | pending     | in_progress | claim(agent)            | unclaimed, gate open                 |
//! | in_progress | in_progress | claim(owner)            | re-entrant, refreshes `claimed_at`   |
//! | in_progress | pending     | stale reclaim (system)  | claim older than the threshold       |
//! | in_progress | completed   | complete(agent)         | unclaimed or claimed by `agent`      |
//! | pending     | completed   | complete(agent)         | none                                 |
//! | completed   | *           | -                       | terminal                             |

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};

use super::decision::Refusal;
use super::dependency;
use super::ids::{AgentId, TaskId};
use super::task::{Task, TaskSet, TaskStatus};

/// Claims older than this are released by the coordinator.
pub const STALE_CLAIM_AFTER_SECS: i64 = 3600;

/// Policy knobs for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimPolicy {
    pub stale_after: Duration,
}

impl Default for ClaimPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::seconds(STALE_CLAIM_AFTER_SECS),
        }
    }
}

impl ClaimPolicy {
    /// Is the claim on `task` abandoned as of `now`?
    ///
    /// Only `in_progress` tasks with a `claimed_at` can go stale; the age must
    /// strictly exceed the threshold.
    pub fn is_stale(&self, task: &Task, now: DateTime<Utc>) -> bool {
        match (task.status, task.claimed_at) {
            (TaskStatus::InProgress, Some(claimed_at)) => {
                now.signed_duration_since(claimed_at) > self.stale_after
            }
            _ => false,
        }
    }
}

/// A stale claim that was released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedClaim {
    pub task_id: TaskId,
    pub agent: Option<AgentId>,
    pub claimed_at: DateTime<Utc>,
}

/// Release the claim on `task` if it is stale: status back to pending,
/// `claimed_by` / `claimed_at` cleared together.
pub fn reclaim_if_stale(
    task: &mut Task,
    now: DateTime<Utc>,
    policy: &ClaimPolicy,
) -> Option<ReclaimedClaim> {
    if !policy.is_stale(task, now) {
        return None;
    }
    let claimed_at = task.claimed_at?;
    let reclaimed = ReclaimedClaim {
        task_id: task.id.clone(),
        agent: task.claimed_by.clone(),
        claimed_at,
    };
    task.clear_claim();
    task.status = TaskStatus::Pending;
    Some(reclaimed)
}

/// Release every stale claim in the ledger.
pub fn reclaim_stale_claims(
    tasks: &mut TaskSet,
    now: DateTime<Utc>,
    policy: &ClaimPolicy,
) -> Vec<ReclaimedClaim> {
    tasks
        .tasks
        .iter_mut()
        .filter_map(|task| reclaim_if_stale(task, now, policy))
        .collect()
}

/// Could `agent` start `task` right now?
///
/// Checks, in order: terminal state, foreign claim, blockers, dependencies.
/// The task must already have been through stale reclaim.
pub fn evaluate_claim(task: &Task, tasks: &TaskSet, agent: Option<&AgentId>) -> Result<(), Refusal> {
    if task.status.is_terminal() {
        return Err(Refusal::AlreadyCompleted);
    }
    if task.is_claimed_by_other(agent)
        && let Some(holder) = &task.claimed_by
    {
        return Err(Refusal::AlreadyClaimed { by: holder.clone() });
    }
    match Refusal::from_gate(dependency::resolve(task, tasks)) {
        Some(refusal) => Err(refusal),
        None => Ok(()),
    }
}

/// What an accepted transition did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Claimed,
    /// Re-entrant claim by the current owner.
    ClaimRefreshed,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub old_status: TaskStatus,
    pub new_status: TaskStatus,
    /// `claimed_by` after the transition.
    pub claimed_by: Option<AgentId>,
    /// Previous holder, when completing someone's claim or refreshing one.
    pub previous_holder: Option<AgentId>,
    pub effect: Effect,
}

/// Apply an agent's request to move task `id` to `target`.
///
/// `id` must exist in `tasks`; the coordinator checks that first. On refusal
/// the ledger is left untouched.
pub fn apply(
    tasks: &mut TaskSet,
    id: &str,
    target: TaskStatus,
    agent: Option<&AgentId>,
    now: DateTime<Utc>,
) -> Result<Applied, Refusal> {
    let (old_status, holder, gate) = {
        let Some(task) = tasks.get(id) else {
            // Nothing to change; treat like an unresolvable dependency.
            return Err(Refusal::Unmet {
                dependencies: vec![dependency::UnmetDependency {
                    id: TaskId::new(id),
                    status: None,
                }],
            });
        };
        (
            task.status,
            task.claimed_by.clone(),
            dependency::resolve(task, tasks),
        )
    };

    if old_status.is_terminal() {
        return Err(Refusal::AlreadyCompleted);
    }

    match target {
        TaskStatus::Pending => Err(Refusal::IllegalTransition {
            from: old_status,
            to: target,
        }),
        TaskStatus::InProgress => {
            let agent = agent.ok_or(Refusal::AgentRequired)?;
            if let Some(holder) = &holder
                && holder != agent
            {
                return Err(Refusal::AlreadyClaimed { by: holder.clone() });
            }

            let reentrant = holder.is_some() && old_status == TaskStatus::InProgress;
            if !reentrant && let Some(refusal) = Refusal::from_gate(gate) {
                return Err(refusal);
            }

            if let Some(task) = tasks.get_mut(id) {
                task.status = TaskStatus::InProgress;
                task.set_claim(agent.clone(), now);
            }
            Ok(Applied {
                old_status,
                new_status: TaskStatus::InProgress,
                claimed_by: Some(agent.clone()),
                previous_holder: holder,
                effect: if reentrant {
                    Effect::ClaimRefreshed
                } else {
                    Effect::Claimed
                },
            })
        }
        TaskStatus::Completed => {
            if let Some(owner) = &holder
                && agent != Some(owner)
            {
                return Err(Refusal::PermissionDenied {
                    owner: owner.clone(),
                });
            }

            if let Some(task) = tasks.get_mut(id) {
                task.clear_claim();
                task.status = TaskStatus::Completed;
                task.completed_date = Some(local_date(now));
            }
            Ok(Applied {
                old_status,
                new_status: TaskStatus::Completed,
                claimed_by: None,
                previous_holder: holder,
                effect: Effect::Completed,
            })
        }
    }
}

/// Calendar date of `now` in the host's time zone.
pub fn local_date(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    fn agent(name: &str) -> AgentId {
        AgentId::new(name)
    }

    fn claimed(id: &str, by: &str, age_secs: i64) -> Task {
        Task::new(id).with_claim(by, now() - Duration::seconds(age_secs))
    }

    #[rstest]
    #[case::fresh(60, false)]
    #[case::exactly_threshold(3600, false)]
    #[case::just_past(3601, true)]
    #[case::abandoned(86_400, true)]
    fn staleness_is_strictly_past_the_threshold(#[case] age_secs: i64, #[case] stale: bool) {
        let task = claimed("T0", "A", age_secs);
        assert_eq!(ClaimPolicy::default().is_stale(&task, now()), stale);
    }

    #[test]
    fn reclaim_clears_claim_and_returns_to_pending() {
        let mut task = claimed("T0", "A", 7200);
        let reclaimed = reclaim_if_stale(&mut task, now(), &ClaimPolicy::default()).unwrap();

        assert_eq!(reclaimed.agent, Some(agent("A")));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.claimed_by, None);
        assert_eq!(task.claimed_at, None);
    }

    #[test]
    fn reclaim_ignores_fresh_and_non_claimed_tasks() {
        let policy = ClaimPolicy::default();
        let mut set = TaskSet::new(vec![
            claimed("fresh", "A", 10),
            Task::new("pending"),
            Task::new("done").with_status(TaskStatus::Completed),
            claimed("stale", "B", 4000),
        ]);

        let reclaimed = reclaim_stale_claims(&mut set, now(), &policy);
        let ids: Vec<&str> = reclaimed.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(ids, vec!["stale"]);
        assert_eq!(set.get("fresh").unwrap().claimed_by, Some(agent("A")));
    }

    #[test]
    fn evaluate_checks_in_order() {
        let set = TaskSet::new(vec![
            Task::new("T0"),
            claimed("T1", "A", 10).with_blocker("x"),
            Task::new("T2").with_blocker("needs creds").with_dependency("T0"),
            Task::new("T3").with_dependency("T0"),
        ]);

        // A foreign claim wins over blockers.
        assert_eq!(
            evaluate_claim(set.get("T1").unwrap(), &set, Some(&agent("B"))),
            Err(Refusal::AlreadyClaimed { by: agent("A") })
        );
        // Blockers win over dependencies.
        assert!(matches!(
            evaluate_claim(set.get("T2").unwrap(), &set, Some(&agent("B"))),
            Err(Refusal::Blocked { .. })
        ));
        assert!(matches!(
            evaluate_claim(set.get("T3").unwrap(), &set, None),
            Err(Refusal::Unmet { .. })
        ));
        assert_eq!(evaluate_claim(set.get("T0").unwrap(), &set, None), Ok(()));
    }

    #[test]
    fn owner_may_evaluate_own_claim() {
        let set = TaskSet::new(vec![claimed("T0", "A", 10)]);
        assert_eq!(
            evaluate_claim(set.get("T0").unwrap(), &set, Some(&agent("A"))),
            Ok(())
        );
        assert_eq!(
            evaluate_claim(set.get("T0").unwrap(), &set, None),
            Err(Refusal::AlreadyClaimed { by: agent("A") })
        );
    }

    #[test]
    fn claim_sets_owner_and_timestamp() {
        let mut set = TaskSet::new(vec![Task::new("T0")]);
        let applied = apply(&mut set, "T0", TaskStatus::InProgress, Some(&agent("A")), now()).unwrap();

        assert_eq!(applied.effect, Effect::Claimed);
        assert_eq!(applied.old_status, TaskStatus::Pending);
        let task = set.get("T0").unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.claimed_by, Some(agent("A")));
        assert_eq!(task.claimed_at, Some(now()));
    }

    #[test]
    fn reentrant_claim_refreshes_claimed_at() {
        let mut set = TaskSet::new(vec![claimed("T0", "A", 600)]);
        let applied = apply(&mut set, "T0", TaskStatus::InProgress, Some(&agent("A")), now()).unwrap();

        assert_eq!(applied.effect, Effect::ClaimRefreshed);
        assert_eq!(set.get("T0").unwrap().claimed_at, Some(now()));
    }

    #[rstest]
    #[case::no_agent(None, Refusal::AgentRequired)]
    #[case::other_agent(Some("B"), Refusal::AlreadyClaimed { by: AgentId::new("A") })]
    fn claim_refusals(#[case] requester: Option<&str>, #[case] expected: Refusal) {
        let mut set = TaskSet::new(vec![claimed("T0", "A", 10)]);
        let before = set.clone();
        let requester = requester.map(AgentId::new);

        let refused = apply(&mut set, "T0", TaskStatus::InProgress, requester.as_ref(), now());
        assert_eq!(refused, Err(expected));
        assert_eq!(set, before);
    }

    #[test]
    fn claim_respects_blockers_and_dependencies() {
        let mut set = TaskSet::new(vec![
            Task::new("T0"),
            Task::new("T1").with_dependency("T0"),
            Task::new("T2").with_blocker("design review"),
        ]);

        assert!(matches!(
            apply(&mut set, "T1", TaskStatus::InProgress, Some(&agent("A")), now()),
            Err(Refusal::Unmet { .. })
        ));
        assert!(matches!(
            apply(&mut set, "T2", TaskStatus::InProgress, Some(&agent("A")), now()),
            Err(Refusal::Blocked { .. })
        ));
    }

    #[rstest]
    #[case::owner_completes(Some("A"), Some("A"))]
    #[case::unclaimed_pending(None, Some("B"))]
    #[case::unclaimed_without_agent(None, None)]
    fn completion_allowed(#[case] holder: Option<&str>, #[case] requester: Option<&str>) {
        let task = match holder {
            Some(holder) => claimed("T0", holder, 10),
            None => Task::new("T0"),
        };
        let mut set = TaskSet::new(vec![task]);
        let requester = requester.map(AgentId::new);

        let applied = apply(&mut set, "T0", TaskStatus::Completed, requester.as_ref(), now()).unwrap();
        assert_eq!(applied.effect, Effect::Completed);
        assert_eq!(applied.claimed_by, None);

        let task = set.get("T0").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.claimed_by, None);
        assert_eq!(task.claimed_at, None);
        assert_eq!(task.completed_date, Some(local_date(now())));
    }

    #[rstest]
    #[case::other_agent(Some("B"))]
    #[case::anonymous(None)]
    fn completing_a_foreign_claim_is_denied(#[case] requester: Option<&str>) {
        let mut set = TaskSet::new(vec![claimed("T0", "A", 10)]);
        let requester = requester.map(AgentId::new);

        assert_eq!(
            apply(&mut set, "T0", TaskStatus::Completed, requester.as_ref(), now()),
            Err(Refusal::PermissionDenied { owner: agent("A") })
        );
    }

    #[rstest]
    #[case::claim(TaskStatus::InProgress)]
    #[case::complete(TaskStatus::Completed)]
    #[case::reset(TaskStatus::Pending)]
    fn completed_is_terminal(#[case] target: TaskStatus) {
        let mut set = TaskSet::new(vec![Task::new("T0").with_status(TaskStatus::Completed)]);
        assert_eq!(
            apply(&mut set, "T0", target, Some(&agent("A")), now()),
            Err(Refusal::AlreadyCompleted)
        );
    }

    #[test]
    fn agents_cannot_request_pending() {
        let mut set = TaskSet::new(vec![claimed("T0", "A", 10)]);
        assert_eq!(
            apply(&mut set, "T0", TaskStatus::Pending, Some(&agent("A")), now()),
            Err(Refusal::IllegalTransition {
                from: TaskStatus::InProgress,
                to: TaskStatus::Pending,
            })
        );
    }
}
