//! CoordinatorBuilder - Coordinator の構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 台帳（TaskStore）が指定されていなければ build() で BuildError
//! - ロック未指定でも台帳がファイルなら FileLock を自動で組み立てる
//! - ポリシーの値（リトライ回数・閾値）は build() 時に検証する

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::coordinator::Coordinator;
use crate::config::CoordinatorConfig;
use crate::domain::ClaimPolicy;
use crate::impls::{FileLock, FileTaskStore};
use crate::ports::{
    Clock, EventSink, ExclusionLock, LockRetryPolicy, SystemClock, TaskStore, TracingEventSink,
    UlidGenerator,
};

/// CoordinatorBuilder は Coordinator を構築
///
/// # 使用例
/// ```ignore
/// let coordinator = CoordinatorBuilder::new()
///     .ledger("TASKS/MASTER_TASKS.json")
///     .build()?;
/// ```
#[derive(Default)]
pub struct CoordinatorBuilder {
    ledger: Option<PathBuf>,
    store: Option<Arc<dyn TaskStore>>,
    lock: Option<Arc<dyn ExclusionLock>>,
    clock: Option<Arc<dyn Clock>>,
    events: Option<Arc<dyn EventSink>>,
    claim_policy: ClaimPolicy,
    retry: LockRetryPolicy,
    lease_ttl: Option<chrono::Duration>,
}

/// BuildError は Coordinator 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("No ledger configured. Call .ledger(path) or .store(store) before build().")]
    MissingStore,

    #[error("A custom store needs an explicit lock. Call .lock(lock) before build().")]
    MissingLock,

    #[error("Lock retry policy needs at least one attempt.")]
    NoLockAttempts,

    #[error("Stale-claim threshold must be positive, got {0}s.")]
    InvalidStaleThreshold(i64),

    #[error("Lock lease TTL must be positive, got {0}s.")]
    InvalidLeaseTtl(i64),
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-filled from the environment-derived configuration.
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new()
            .ledger(config.ledger.clone())
            .retry_policy(LockRetryPolicy::new(
                config.lock_attempts,
                Duration::from_millis(config.lock_delay_ms),
            ))
            .lease_ttl(chrono::Duration::seconds(config.lock_ttl_secs))
    }

    /// File-backed ledger; the lock defaults to `<ledger>.lock`.
    pub fn ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger = Some(path.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lock(mut self, lock: Arc<dyn ExclusionLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the stale-claim threshold (embedding and tests).
    pub fn claim_policy(mut self, policy: ClaimPolicy) -> Self {
        self.claim_policy = policy;
        self
    }

    pub fn retry_policy(mut self, retry: LockRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Lease TTL for the default file lock.
    pub fn lease_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<Coordinator, BuildError> {
        if self.retry.max_attempts == 0 {
            return Err(BuildError::NoLockAttempts);
        }
        let stale_secs = self.claim_policy.stale_after.num_seconds();
        if stale_secs <= 0 {
            return Err(BuildError::InvalidStaleThreshold(stale_secs));
        }
        if let Some(ttl) = self.lease_ttl
            && ttl.num_seconds() <= 0
        {
            return Err(BuildError::InvalidLeaseTtl(ttl.num_seconds()));
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let (store, lock): (Arc<dyn TaskStore>, Arc<dyn ExclusionLock>) =
            match (self.store, self.ledger) {
                (Some(store), _) => (store, self.lock.ok_or(BuildError::MissingLock)?),
                (None, Some(ledger)) => {
                    let lock: Arc<dyn ExclusionLock> = match self.lock {
                        Some(lock) => lock,
                        None => {
                            let mut file_lock = FileLock::for_ledger(&ledger)
                                .with_clock(clock.clone())
                                .with_id_generator(Arc::new(UlidGenerator::new(clock.clone())));
                            if let Some(ttl) = self.lease_ttl {
                                file_lock = file_lock.with_lease_ttl(ttl);
                            }
                            Arc::new(file_lock)
                        }
                    };
                    let store: Arc<dyn TaskStore> = Arc::new(FileTaskStore::new(ledger));
                    (store, lock)
                }
                (None, None) => return Err(BuildError::MissingStore),
            };

        Ok(Coordinator {
            store,
            lock,
            clock,
            events: self.events.unwrap_or_else(|| Arc::new(TracingEventSink)),
            claim_policy: self.claim_policy,
            retry: self.retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSet;
    use crate::impls::{InMemoryTaskStore, InProcessLock};

    #[test]
    fn build_from_ledger_path() {
        let coordinator = CoordinatorBuilder::new()
            .ledger("TASKS/MASTER_TASKS.json")
            .build()
            .unwrap();
        assert_eq!(coordinator.ledger(), "TASKS/MASTER_TASKS.json");
        assert_eq!(coordinator.retry_policy(), &LockRetryPolicy::default());
        assert_eq!(coordinator.claim_policy(), &ClaimPolicy::default());
    }

    #[test]
    fn build_without_store_fails() {
        assert!(matches!(
            CoordinatorBuilder::new().build(),
            Err(BuildError::MissingStore)
        ));
    }

    #[test]
    fn custom_store_needs_a_lock() {
        let store = Arc::new(InMemoryTaskStore::new(TaskSet::default()));
        assert!(matches!(
            CoordinatorBuilder::new().store(store.clone()).build(),
            Err(BuildError::MissingLock)
        ));
        assert!(CoordinatorBuilder::new()
            .store(store)
            .lock(Arc::new(InProcessLock::new()))
            .build()
            .is_ok());
    }

    #[test]
    fn policies_are_validated() {
        let zero_attempts = CoordinatorBuilder::new()
            .ledger("t.json")
            .retry_policy(LockRetryPolicy::new(0, Duration::from_millis(1)))
            .build();
        assert!(matches!(zero_attempts, Err(BuildError::NoLockAttempts)));

        let no_threshold = CoordinatorBuilder::new()
            .ledger("t.json")
            .claim_policy(ClaimPolicy {
                stale_after: chrono::Duration::zero(),
            })
            .build();
        assert!(matches!(no_threshold, Err(BuildError::InvalidStaleThreshold(0))));

        let no_ttl = CoordinatorBuilder::new()
            .ledger("t.json")
            .lease_ttl(chrono::Duration::seconds(-1))
            .build();
        assert!(matches!(no_ttl, Err(BuildError::InvalidLeaseTtl(-1))));
    }
}
