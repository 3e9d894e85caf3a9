//! FileLock - 台帳の隣に置く sentinel ファイルによるロック
//!
//! `<ledger>.lock` を create-if-absent で作れたプロセスがロックを持ちます。
//! 中身は lease 記録（JSON）です:
//!
//! ```json
//! {"token": "01J...", "pid": 4242, "host": "build-7", "acquired_at": "2026-10-16T09:00:00Z"}
//! ```
//!
//! # Lease の期限
//! - `acquired_at` から `lease_ttl` を過ぎた sentinel はクラッシュした保持者のものとみなし、
//!   次の競合者が壊します。
//! - 中身が読めない sentinel（書き込み途中など）はファイルの mtime で判定します。
//!
//! # 削除は gate の中だけ
//! sentinel の削除（lease の破棄と解放）は `<ledger>.lock.gate` の OS advisory lock
//! を持ったまま、読み直して確認してから行います。sentinel は create-if-absent でしか
//! 作られないので、確認から削除までの間に別の保持者のものに入れ替わることはありません。
//! gate はプロセスが死ねば OS が外すので、期限を持ちません。
//!
//! # 解放
//! sentinel の token が自分のものと一致するときだけ削除します。
//! lease を壊された保持者が後続のロックを消すことはありません。

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{CoordinatorError, LeaseId};
use crate::ports::{Clock, ExclusionLock, IdGenerator, LeaseToken, SystemClock, UlidGenerator};

/// Default lifetime of a lease before other processes may break it.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 30;

/// Sentinel file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub token: LeaseId,
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

/// What is currently at the sentinel path.
#[derive(Debug)]
enum Sentinel {
    Missing,
    Live,
    Expired(Option<LeaseRecord>),
}

#[derive(Clone)]
pub struct FileLock {
    path: PathBuf,
    lease_ttl: Duration,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for FileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLock")
            .field("path", &self.path)
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

impl FileLock {
    /// Lock guarding the ledger at `ledger`: `<ledger>.lock`.
    pub fn for_ledger(ledger: impl AsRef<Path>) -> Self {
        Self::at(lock_path_for(ledger.as_ref()))
    }

    /// Lock at an explicit sentinel path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lease_ttl: Duration::seconds(DEFAULT_LEASE_TTL_SECS),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Current sentinel content, if it parses.
    pub fn holder(&self) -> Option<LeaseRecord> {
        let raw = fs::read(&self.path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    fn io_error(&self, source: io::Error) -> CoordinatorError {
        CoordinatorError::LockIo {
            path: self.path.clone(),
            source,
        }
    }

    fn try_acquire_blocking(&self) -> io::Result<Option<LeaseToken>> {
        let now = self.clock.now();
        let token = LeaseToken {
            lease: self.ids.generate_lease_id(),
            acquired_at: now,
        };
        let record = LeaseRecord {
            token: token.lease,
            pid: std::process::id(),
            host: host_name(),
            acquired_at: now,
        };

        if create_sentinel(&self.path, &record)? {
            return Ok(Some(token));
        }

        match inspect(&self.path, now, self.lease_ttl)? {
            Sentinel::Live => return Ok(None),
            Sentinel::Missing => {}
            Sentinel::Expired(_) => {
                if !self.break_expired(now)? {
                    return Ok(None);
                }
            }
        }

        // The previous holder is gone; one more create-if-absent decides.
        Ok(create_sentinel(&self.path, &record)?.then_some(token))
    }

    /// Delete the sentinel if it is still expired once the gate is held.
    ///
    /// Returns false when it changed hands in the meantime (a successor
    /// broke it first and now holds a live lease).
    fn break_expired(&self, now: DateTime<Utc>) -> io::Result<bool> {
        let _gate = Gate::enter(&self.path)?;
        match inspect(&self.path, now, self.lease_ttl)? {
            Sentinel::Missing => Ok(true),
            Sentinel::Live => {
                debug!(lock = %self.path.display(), "sentinel changed hands before it was broken");
                Ok(false)
            }
            Sentinel::Expired(record) => {
                remove_if_present(&self.path)?;
                match record {
                    Some(record) => warn!(
                        lock = %self.path.display(),
                        holder_pid = record.pid,
                        holder_host = %record.host,
                        acquired_at = %record.acquired_at,
                        "broke expired lock lease"
                    ),
                    None => warn!(lock = %self.path.display(), "broke unreadable expired lock"),
                }
                Ok(true)
            }
        }
    }

    fn release_blocking(&self, token: &LeaseToken) -> io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let _gate = Gate::enter(&self.path)?;
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        match serde_json::from_slice::<LeaseRecord>(&raw) {
            Ok(record) if record.token == token.lease => {
                remove_if_present(&self.path)?;
                debug!(lock = %self.path.display(), lease = %token.lease, "lock released");
            }
            Ok(record) => warn!(
                lock = %self.path.display(),
                lease = %token.lease,
                current = %record.token,
                "lease was broken by another process, leaving its lock in place"
            ),
            Err(_) => warn!(
                lock = %self.path.display(),
                lease = %token.lease,
                "lock file is unreadable, leaving it in place"
            ),
        }
        Ok(())
    }
}

/// Exclusive OS lock on `<lock>.gate`, held while the sentinel is removed.
///
/// Closing the file on drop releases it.
struct Gate {
    _file: fs::File,
}

impl Gate {
    fn enter(lock: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(gate_path(lock))?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[async_trait]
impl ExclusionLock for FileLock {
    async fn try_acquire(&self) -> Result<Option<LeaseToken>, CoordinatorError> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.try_acquire_blocking())
            .await
            .map_err(|e| CoordinatorError::Join(e.to_string()))?
            .map_err(|e| self.io_error(e))
    }

    // Drop からも呼ばれるので同期。gate を持つのは読み直しと unlink の間だけ
    fn release(&self, token: &LeaseToken) -> Result<(), CoordinatorError> {
        self.release_blocking(token).map_err(|e| self.io_error(e))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// `<ledger>.lock`, next to the ledger.
pub fn lock_path_for(ledger: &Path) -> PathBuf {
    let mut name = OsString::from(ledger.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn gate_path(lock: &Path) -> PathBuf {
    let mut name = OsString::from(lock.as_os_str());
    name.push(".gate");
    PathBuf::from(name)
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Atomic create-if-absent. Ok(false) when the sentinel already exists.
fn create_sentinel(path: &Path, record: &LeaseRecord) -> io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    let body = serde_json::to_vec(record).map_err(io::Error::other)?;
    file.write_all(&body)?;
    file.sync_all()?;
    Ok(true)
}

fn inspect(path: &Path, now: DateTime<Utc>, ttl: Duration) -> io::Result<Sentinel> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Sentinel::Missing),
        Err(e) => return Err(e),
    };

    if let Ok(record) = serde_json::from_slice::<LeaseRecord>(&raw) {
        return Ok(if now.signed_duration_since(record.acquired_at) > ttl {
            Sentinel::Expired(Some(record))
        } else {
            Sentinel::Live
        });
    }

    // mtime comes from the filesystem, so compare it with wall-clock time
    let modified: DateTime<Utc> = match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => modified.into(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Sentinel::Missing),
        Err(e) => return Err(e),
    };
    Ok(if Utc::now().signed_duration_since(modified) > ttl {
        Sentinel::Expired(None)
    } else {
        Sentinel::Live
    })
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, LockGuard, LockRetryPolicy};
    use chrono::TimeZone;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;
    use ulid::Ulid;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap()
    }

    fn lock_in(dir: &TempDir, clock: &FixedClock) -> FileLock {
        FileLock::for_ledger(dir.path().join("MASTER_TASKS.json"))
            .with_clock(Arc::new(clock.clone()))
    }

    fn write_record(path: &Path, acquired_at: DateTime<Utc>) -> LeaseRecord {
        let record = LeaseRecord {
            token: LeaseId::from_ulid(Ulid::new()),
            pid: 1,
            host: "crashed-host".to_string(),
            acquired_at,
        };
        fs::write(path, serde_json::to_vec(&record).unwrap()).unwrap();
        record
    }

    fn quick_policy(max_attempts: u32) -> LockRetryPolicy {
        LockRetryPolicy::new(max_attempts, StdDuration::from_millis(10))
    }

    #[test]
    fn sentinel_sits_next_to_the_ledger() {
        assert_eq!(
            lock_path_for(Path::new("TASKS/MASTER_TASKS.json")),
            PathBuf::from("TASKS/MASTER_TASKS.json.lock")
        );
    }

    #[tokio::test]
    async fn acquire_writes_lease_and_release_removes_it() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);

        let token = lock.try_acquire().await.unwrap().unwrap();
        let holder = lock.holder().unwrap();
        assert_eq!(holder.token, token.lease);
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.acquired_at, start());

        lock.release(&token).unwrap();
        assert!(!lock.path().exists());
        // idempotent
        lock.release(&token).unwrap();
    }

    #[tokio::test]
    async fn held_lock_is_not_acquired_twice() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);
        let contender = lock_in(&dir, &clock);

        let _token = lock.try_acquire().await.unwrap().unwrap();
        assert!(contender.try_acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_sentinel_times_out_after_bounded_attempts() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);
        write_record(lock.path(), start());

        let err = lock.acquire(&quick_policy(3)).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::LockTimeout { attempts: 3 }));
    }

    #[tokio::test]
    async fn expired_lease_is_broken() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);
        let crashed = write_record(lock.path(), start() - Duration::seconds(31));

        let token = lock.try_acquire().await.unwrap().unwrap();
        let holder = lock.holder().unwrap();
        assert_ne!(holder.token, crashed.token);
        assert_eq!(holder.token, token.lease);

        // sentinel and gate only
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["MASTER_TASKS.json.lock", "MASTER_TASKS.json.lock.gate"]);
    }

    #[tokio::test]
    async fn late_breaker_leaves_the_successor_lease_alone() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let successor = lock_in(&dir, &clock);
        let late = lock_in(&dir, &clock);
        let third = lock_in(&dir, &clock);
        write_record(successor.path(), start() - Duration::seconds(31));

        // both saw the crashed lease; the successor broke it first
        let token = successor.try_acquire().await.unwrap().unwrap();
        assert!(!late.break_expired(start()).unwrap());

        assert_eq!(late.holder().unwrap().token, token.lease);
        assert!(third.try_acquire().await.unwrap().is_none());

        successor.release(&token).unwrap();
        assert!(!successor.path().exists());
        assert!(third.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn breaking_a_vanished_sentinel_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);

        assert!(lock.break_expired(start()).unwrap());
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn removal_waits_for_the_gate() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);
        write_record(lock.path(), start() - Duration::seconds(31));

        let gate = Gate::enter(lock.path()).unwrap();
        let breaker = lock.clone();
        let breaking = std::thread::spawn(move || breaker.break_expired(start()));
        std::thread::sleep(StdDuration::from_millis(100));
        assert!(lock.path().exists());

        drop(gate);
        assert!(breaking.join().unwrap().unwrap());
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn lease_within_ttl_is_respected() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);
        write_record(lock.path(), start() - Duration::seconds(30));

        assert!(lock.try_acquire().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_with_foreign_token_leaves_the_sentinel() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);
        let successor = write_record(lock.path(), start());

        let stale_token = LeaseToken {
            lease: LeaseId::from_ulid(Ulid::new()),
            acquired_at: start() - Duration::minutes(5),
        };
        lock.release(&stale_token).unwrap();
        assert_eq!(lock.holder().unwrap().token, successor.token);
    }

    #[tokio::test]
    async fn unreadable_sentinel_is_judged_by_mtime() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);
        fs::write(lock.path(), b"").unwrap();

        // half-written by a live holder
        assert!(lock.try_acquire().await.unwrap().is_none());

        let long_ago = std::time::SystemTime::now() - StdDuration::from_secs(600);
        fs::File::options()
            .write(true)
            .open(lock.path())
            .unwrap()
            .set_modified(long_ago)
            .unwrap();
        assert!(lock.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(start());
        let lock = lock_in(&dir, &clock);

        {
            let guard = LockGuard::acquire(&lock, &quick_policy(1)).await.unwrap();
            assert!(guard.token().is_some());
            assert!(lock.path().exists());
        }
        assert!(!lock.path().exists());

        let guard = LockGuard::try_acquire(&lock).await.unwrap().unwrap();
        guard.release().unwrap();
        assert!(!lock.path().exists());
    }
}
