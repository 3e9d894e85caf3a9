//! Coordinator - validate / transition の入口
//!
//! # データの流れ
//! Store（読む）→ State machine + Resolver（判断）→ [変更あり] Lock（取得）→ Store（書く）→ Lock（解放）
//!
//! # validate
//! ロックを待たない読み取り経路です。古い claim を見つけた場合は
//! 修復後のコピーで判断し、修復の書き込みは `try_acquire` が取れたときだけ行います。
//! 書き込みに失敗しても判断は返します（warn ログのみ）。
//!
//! # transition
//! ロックを取ってから読み直すので、同じタスクへの同時 claim は
//! ちょうど 1 つだけが成功します。ロックはどの経路でも解放されます。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::status::{DoctorReport, LedgerStatus, ReclaimReport};
use crate::domain::state::{self, Applied, Effect, ReclaimedClaim};
use crate::domain::{
    AgentId, Broadcast, ClaimPolicy, CoordinatorError, Decision, DependencyGraph, DomainEvent,
    TaskId, TaskSet, TaskStatus, TransitionOutcome,
};
use crate::ports::{Clock, EventSink, ExclusionLock, LockGuard, LockRetryPolicy, TaskStore};

pub struct Coordinator {
    pub(crate) store: Arc<dyn TaskStore>,
    pub(crate) lock: Arc<dyn ExclusionLock>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) claim_policy: ClaimPolicy,
    pub(crate) retry: LockRetryPolicy,
}

impl Coordinator {
    pub fn claim_policy(&self) -> &ClaimPolicy {
        &self.claim_policy
    }

    pub fn retry_policy(&self) -> &LockRetryPolicy {
        &self.retry
    }

    pub fn ledger(&self) -> String {
        self.store.location()
    }

    /// May `agent` start `task_id` now? Advisory only.
    pub async fn validate(
        &self,
        task_id: &str,
        agent: Option<&AgentId>,
    ) -> Result<Decision, CoordinatorError> {
        let mut tasks = self.store.load().await?;
        let now = self.clock.now();

        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinatorError::NotFound(TaskId::new(task_id)))?;
        let reclaimed = state::reclaim_if_stale(task, now, &self.claim_policy);
        if let Some(claim) = &reclaimed {
            warn!(
                task_id,
                agent = ?claim.agent,
                claimed_at = %claim.claimed_at,
                "stale claim found while validating"
            );
            self.persist_repair(now).await;
        }

        let Some(task) = tasks.get(task_id) else {
            return Err(CoordinatorError::NotFound(TaskId::new(task_id)));
        };
        let decision = match state::evaluate_claim(task, &tasks, agent) {
            Ok(()) => Decision::allow(task.id.clone()),
            Err(refusal) => Decision::refuse(task.id.clone(), refusal),
        }
        .with_reclaimed_from(reclaimed.and_then(|claim| claim.agent));

        debug!(task_id, agent = ?agent, allowed = decision.allowed, reason = %decision.reason, "validated");
        Ok(decision)
    }

    /// Move `task_id` to `target` on behalf of `agent`, under the ledger lock.
    pub async fn transition(
        &self,
        task_id: &str,
        target: TaskStatus,
        agent: Option<&AgentId>,
    ) -> Result<TransitionOutcome, CoordinatorError> {
        let guard = LockGuard::acquire(self.lock.as_ref(), &self.retry).await?;
        let outcome = self.transition_locked(task_id, target, agent).await;
        if let Err(err) = guard.release() {
            warn!(lock = %self.lock.describe(), error = %err, "failed to release lock");
        }
        outcome
    }

    /// Claim shorthand: `transition(task_id, in_progress, agent)`.
    pub async fn claim(
        &self,
        task_id: &str,
        agent: &AgentId,
    ) -> Result<TransitionOutcome, CoordinatorError> {
        self.transition(task_id, TaskStatus::InProgress, Some(agent))
            .await
    }

    /// Completion shorthand: `transition(task_id, completed, agent)`.
    pub async fn complete(
        &self,
        task_id: &str,
        agent: Option<&AgentId>,
    ) -> Result<TransitionOutcome, CoordinatorError> {
        self.transition(task_id, TaskStatus::Completed, agent).await
    }

    async fn transition_locked(
        &self,
        task_id: &str,
        target: TaskStatus,
        agent: Option<&AgentId>,
    ) -> Result<TransitionOutcome, CoordinatorError> {
        let mut tasks = self.store.load().await?;
        let now = self.clock.now();

        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| CoordinatorError::NotFound(TaskId::new(task_id)))?;
        let id = task.id.clone();
        let reclaimed = state::reclaim_if_stale(task, now, &self.claim_policy);
        let old_status = task.status;
        if reclaimed.is_some() {
            tasks.touch(task_id, now);
        }

        match state::apply(&mut tasks, task_id, target, agent, now) {
            Ok(applied) => {
                tasks.touch(task_id, now);
                let unblocked = if applied.effect == Effect::Completed {
                    DependencyGraph::from_task_set(&tasks).newly_unblocked(task_id, &tasks)
                } else {
                    Vec::new()
                };
                self.store.save(&tasks).await?;

                info!(
                    task_id,
                    from = %applied.old_status,
                    to = %applied.new_status,
                    agent = ?agent,
                    unblocked = unblocked.len(),
                    "transition applied"
                );
                if let Some(claim) = &reclaimed {
                    self.events.emit(&reclaim_event(claim, now)).await;
                }
                self.events
                    .emit(&effect_event(&id, &applied, agent, now, &unblocked))
                    .await;

                let broadcast =
                    Broadcast::new(id.clone(), applied.new_status).with_unblocked(unblocked);
                Ok(TransitionOutcome {
                    success: true,
                    reason: broadcast.message.clone(),
                    task_id: id,
                    old_status: applied.old_status,
                    new_status: applied.new_status,
                    agent_id: applied.claimed_by,
                    refusal: None,
                    broadcast: Some(broadcast),
                    reclaimed_from: reclaimed.and_then(|claim| claim.agent),
                })
            }
            Err(refusal) => {
                if let Some(claim) = &reclaimed {
                    self.store.save(&tasks).await?;
                    self.events.emit(&reclaim_event(claim, now)).await;
                }
                info!(task_id, to = %target, agent = ?agent, reason = %refusal, "transition refused");

                let claimed_by = tasks.get(task_id).and_then(|task| task.claimed_by.clone());
                Ok(TransitionOutcome {
                    success: false,
                    reason: refusal.to_string(),
                    task_id: id,
                    old_status,
                    new_status: old_status,
                    agent_id: claimed_by,
                    refusal: Some(refusal),
                    broadcast: None,
                    reclaimed_from: reclaimed.and_then(|claim| claim.agent),
                })
            }
        }
    }

    /// Release every stale claim in one locked write.
    pub async fn reclaim_stale(&self) -> Result<ReclaimReport, CoordinatorError> {
        let guard = LockGuard::acquire(self.lock.as_ref(), &self.retry).await?;
        let now = self.clock.now();
        let reclaimed = self.reclaim_locked(now).await;
        if let Err(err) = guard.release() {
            warn!(lock = %self.lock.describe(), error = %err, "failed to release lock");
        }

        Ok(ReclaimReport {
            ledger: self.ledger(),
            reclaimed: reclaimed?.into_iter().map(Into::into).collect(),
        })
    }

    /// Ids of every task `validate` would allow for `agent` right now.
    ///
    /// Works on a repaired in-memory copy and never writes.
    pub async fn ready(&self, agent: Option<&AgentId>) -> Result<Vec<TaskId>, CoordinatorError> {
        let mut tasks = self.store.load().await?;
        state::reclaim_stale_claims(&mut tasks, self.clock.now(), &self.claim_policy);

        Ok(tasks
            .tasks
            .iter()
            .filter(|task| state::evaluate_claim(task, &tasks, agent).is_ok())
            .map(|task| task.id.clone())
            .collect())
    }

    pub async fn status(&self) -> Result<LedgerStatus, CoordinatorError> {
        let tasks = self.store.load().await?;
        Ok(LedgerStatus::build(
            self.ledger(),
            &tasks,
            self.clock.now(),
            &self.claim_policy,
        ))
    }

    /// Read-only consistency check.
    pub async fn doctor(&self) -> Result<DoctorReport, CoordinatorError> {
        let tasks = self.store.load().await?;
        Ok(DoctorReport::examine(self.ledger(), &tasks))
    }

    /// Best-effort write of a repair found by `validate`. Never waits on the
    /// lock and never fails the caller.
    async fn persist_repair(&self, now: DateTime<Utc>) {
        let guard = match LockGuard::try_acquire(self.lock.as_ref()).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!(lock = %self.lock.describe(), "lock busy, leaving the repair to its holder");
                return;
            }
            Err(err) => {
                warn!(error = %err, "could not take the lock to persist a stale-claim repair");
                return;
            }
        };

        if let Err(err) = self.reclaim_locked(now).await {
            warn!(error = %err, "failed to persist stale-claim repair");
        }
        if let Err(err) = guard.release() {
            warn!(lock = %self.lock.describe(), error = %err, "failed to release lock");
        }
    }

    /// Re-read the ledger, release every stale claim and save. Caller holds
    /// the lock.
    async fn reclaim_locked(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReclaimedClaim>, CoordinatorError> {
        let mut tasks: TaskSet = self.store.load().await?;
        let reclaimed = state::reclaim_stale_claims(&mut tasks, now, &self.claim_policy);
        if reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        for claim in &reclaimed {
            tasks.touch(claim.task_id.as_str(), now);
        }
        self.store.save(&tasks).await?;

        for claim in &reclaimed {
            warn!(
                task_id = %claim.task_id,
                agent = ?claim.agent,
                claimed_at = %claim.claimed_at,
                "reclaimed stale claim"
            );
            self.events.emit(&reclaim_event(claim, now)).await;
        }
        Ok(reclaimed)
    }
}

fn reclaim_event(claim: &ReclaimedClaim, now: DateTime<Utc>) -> DomainEvent {
    DomainEvent::ClaimReclaimed {
        task_id: claim.task_id.clone(),
        agent: claim.agent.clone(),
        claimed_at: claim.claimed_at,
        at: now,
    }
}

fn effect_event(
    id: &TaskId,
    applied: &Applied,
    agent: Option<&AgentId>,
    now: DateTime<Utc>,
    unblocked: &[TaskId],
) -> DomainEvent {
    match (applied.effect, &applied.claimed_by) {
        (Effect::Claimed, Some(agent)) => DomainEvent::TaskClaimed {
            task_id: id.clone(),
            agent: agent.clone(),
            at: now,
        },
        (Effect::ClaimRefreshed, Some(agent)) => DomainEvent::ClaimRefreshed {
            task_id: id.clone(),
            agent: agent.clone(),
            at: now,
        },
        _ => DomainEvent::TaskCompleted {
            task_id: id.clone(),
            agent: agent.cloned(),
            at: now,
            unblocked: unblocked.to_vec(),
        },
    }
}
