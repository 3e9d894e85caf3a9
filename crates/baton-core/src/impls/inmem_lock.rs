//! InProcessLock - プロセス内だけで効くロック
//!
//! FileLock と同じ契約（try_acquire / token 一致時のみ release）を
//! メモリ上のフラグで実現します。1 プロセスに組み込む場合とテスト用です。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{CoordinatorError, LeaseId};
use crate::ports::{Clock, ExclusionLock, IdGenerator, LeaseToken, SystemClock, UlidGenerator};

pub struct InProcessLock {
    holder: Mutex<Option<LeaseId>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InProcessLock {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            holder: Mutex::new(None),
            ids: Arc::new(UlidGenerator::new(clock.clone())),
            clock,
        }
    }

    pub fn is_held(&self) -> bool {
        self.holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl Default for InProcessLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExclusionLock for InProcessLock {
    async fn try_acquire(&self) -> Result<Option<LeaseToken>, CoordinatorError> {
        let mut holder = self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if holder.is_some() {
            return Ok(None);
        }
        let token = LeaseToken {
            lease: self.ids.generate_lease_id(),
            acquired_at: self.clock.now(),
        };
        *holder = Some(token.lease);
        Ok(Some(token))
    }

    fn release(&self, token: &LeaseToken) -> Result<(), CoordinatorError> {
        let mut holder = self
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *holder == Some(token.lease) {
            *holder = None;
            debug!(lease = %token.lease, "in-process lock released");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "in-process".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::LockRetryPolicy;
    use std::time::Duration;
    use ulid::Ulid;

    #[tokio::test]
    async fn second_acquire_waits_then_times_out() {
        let lock = InProcessLock::new();
        let token = lock.try_acquire().await.unwrap().unwrap();
        assert!(lock.is_held());

        let policy = LockRetryPolicy::new(2, Duration::from_millis(5));
        assert!(matches!(
            lock.acquire(&policy).await,
            Err(CoordinatorError::LockTimeout { attempts: 2 })
        ));

        lock.release(&token).unwrap();
        assert!(!lock.is_held());
        assert!(lock.acquire(&policy).await.is_ok());
    }

    #[tokio::test]
    async fn foreign_token_does_not_release() {
        let lock = InProcessLock::new();
        let token = lock.try_acquire().await.unwrap().unwrap();

        let foreign = LeaseToken {
            lease: LeaseId::from_ulid(Ulid::new()),
            acquired_at: token.acquired_at,
        };
        lock.release(&foreign).unwrap();
        assert!(lock.is_held());
    }
}
