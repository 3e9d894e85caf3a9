//! ExclusionLock port - 台帳の書き込みを直列化するロック
//!
//! 1 つの台帳につき 1 つのロックです。タスク単位のロックはありません。
//!
//! # 取得
//! - `try_acquire`: 1 回だけ試す（validate の修復用、待たない）
//! - `acquire`: `LockRetryPolicy` に従って固定間隔でリトライし、尽きたら `LockTimeout`
//!
//! # 解放
//! `LockGuard` がスコープを抜けるときに必ず解放します（エラー経路でも）。
//! 解放は自分の `LeaseToken` と一致する場合だけ効きます。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{CoordinatorError, LeaseId};

/// 取得したロックの所有権
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub lease: LeaseId,
    pub acquired_at: DateTime<Utc>,
}

/// Lock acquisition policy: fixed delay between a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Sleep between two attempts.
    pub delay: Duration,
}

impl Default for LockRetryPolicy {
    /// 5 attempts, 500 ms apart.
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

impl LockRetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Longest time `acquire` can spend sleeping.
    pub fn max_wait(&self) -> Duration {
        self.delay * self.max_attempts.saturating_sub(1)
    }
}

/// ExclusionLock は台帳 1 つ分の相互排他
#[async_trait]
pub trait ExclusionLock: Send + Sync {
    /// 1 回だけ取得を試みる。他者が保持中なら `Ok(None)`。
    async fn try_acquire(&self) -> Result<Option<LeaseToken>, CoordinatorError>;

    /// `token` がまだ自分のものなら解放する。何度呼んでもよい。
    fn release(&self, token: &LeaseToken) -> Result<(), CoordinatorError>;

    /// ログ用の表示（ロックファイルのパスなど）
    fn describe(&self) -> String;

    /// リトライ付きの取得
    async fn acquire(&self, policy: &LockRetryPolicy) -> Result<LeaseToken, CoordinatorError> {
        for attempt in 1..=policy.max_attempts {
            if let Some(token) = self.try_acquire().await? {
                debug!(lock = %self.describe(), lease = %token.lease, attempt, "lock acquired");
                return Ok(token);
            }
            if attempt < policy.max_attempts {
                debug!(lock = %self.describe(), attempt, "lock busy, retrying");
                tokio::time::sleep(policy.delay).await;
            }
        }
        Err(CoordinatorError::LockTimeout {
            attempts: policy.max_attempts,
        })
    }
}

/// スコープ付きのロック保持
///
/// `release` を明示的に呼ぶとエラーを受け取れます。
/// 呼ばずに drop した場合も解放し、失敗は warn ログに残します。
pub struct LockGuard<'a> {
    lock: &'a dyn ExclusionLock,
    token: Option<LeaseToken>,
}

impl<'a> LockGuard<'a> {
    pub fn new(lock: &'a dyn ExclusionLock, token: LeaseToken) -> Self {
        Self {
            lock,
            token: Some(token),
        }
    }

    /// リトライ付きで取得してガードを返す
    pub async fn acquire(
        lock: &'a dyn ExclusionLock,
        policy: &LockRetryPolicy,
    ) -> Result<LockGuard<'a>, CoordinatorError> {
        let token = lock.acquire(policy).await?;
        Ok(Self::new(lock, token))
    }

    /// 待たずに取得を試みる
    pub async fn try_acquire(
        lock: &'a dyn ExclusionLock,
    ) -> Result<Option<LockGuard<'a>>, CoordinatorError> {
        Ok(lock
            .try_acquire()
            .await?
            .map(|token| Self::new(lock, token)))
    }

    pub fn token(&self) -> Option<&LeaseToken> {
        self.token.as_ref()
    }

    pub fn release(mut self) -> Result<(), CoordinatorError> {
        match self.token.take() {
            Some(token) => self.lock.release(&token),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take()
            && let Err(err) = self.lock.release(&token)
        {
            warn!(lock = %self.lock.describe(), error = %err, "failed to release lock on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_ledger_tooling() {
        let policy = LockRetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(500));
        assert_eq!(policy.max_wait(), Duration::from_secs(2));
    }

    #[test]
    fn single_attempt_never_sleeps() {
        let policy = LockRetryPolicy::new(1, Duration::from_secs(10));
        assert_eq!(policy.max_wait(), Duration::ZERO);
    }
}
