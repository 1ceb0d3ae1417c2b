//! Cross-process mutual exclusion over named resources.
//!
//! A lock is a record file in a shared directory, created atomically. A
//! record is treated as absent once it has expired, or when its holder ran
//! on this host and that process no longer exists. Reclaiming a stale
//! record and releasing one's own record both happen while holding an
//! advisory `fs2` lock on a per-key guard file, so a process never deletes
//! a record it did not inspect.
//!
//! Locks are not re-entrant: acquiring a key the same manager already holds
//! waits like any other contender.

mod process;
mod record;

pub use process::{hostname, pid_alive};
pub use record::LockRecord;

use crate::clock::{millis, Clock};
use crate::hash::path_stem;
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time `acquire` waits for a busy lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);
/// Default lifetime of a lock record.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);
/// Default delay between attempts on a busy lock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited_ms} ms waiting for lock on '{resource_key}'")]
    Timeout {
        resource_key: String,
        holder: Option<LockRecord>,
        waited_ms: u64,
    },
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        LockError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// How long a record stays valid after it is written.
    pub ttl: Duration,
    /// How long `acquire` waits when the caller passes no timeout.
    pub default_wait: Duration,
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LOCK_TTL,
            default_wait: DEFAULT_LOCK_WAIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

enum Attempt {
    Acquired(LockRecord),
    Busy(Option<LockRecord>),
    Retry,
}

struct Inner {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    settings: LockSettings,
    /// Keys this manager holds, with the token of each acquisition.
    held: Mutex<HashMap<String, String>>,
}

/// Long-lived lock manager; clone it to share. Two managers pointed at the
/// same directory exclude each other exactly like two processes do.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self::with_settings(dir, clock, LockSettings::default())
    }

    pub fn with_settings(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>, settings: LockSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.into(),
                clock,
                settings,
                held: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn settings(&self) -> LockSettings {
        self.inner.settings
    }

    /// Acquire the lock for `resource_key`, polling until it is free or
    /// `wait` (default from settings) runs out.
    pub async fn acquire(
        &self,
        resource_key: &str,
        operation: &str,
        wait: Option<Duration>,
    ) -> Result<LockHandle, LockError> {
        let wait = wait.unwrap_or(self.inner.settings.default_wait);
        let started = tokio::time::Instant::now();
        let deadline = started + wait;
        tokio::fs::create_dir_all(&self.inner.dir)
            .await
            .map_err(|e| LockError::io(&self.inner.dir, e))?;

        loop {
            match self.try_acquire_blocking(resource_key, operation).await? {
                Attempt::Acquired(record) => {
                    self.held().insert(resource_key.to_string(), record.token.clone());
                    info!(
                        "[lock] acquired '{}' for {} (expires {})",
                        resource_key, operation, record.expires_at
                    );
                    return Ok(LockHandle {
                        manager: self.clone(),
                        record,
                        released: false,
                    });
                }
                Attempt::Retry => continue,
                Attempt::Busy(holder) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(LockError::Timeout {
                            resource_key: resource_key.to_string(),
                            holder,
                            waited_ms: (now - started).as_millis() as u64,
                        });
                    }
                    if let Some(h) = &holder {
                        debug!(
                            "[lock] '{}' busy: held by pid {} on {} for {}",
                            resource_key, h.holder_pid, h.holder_host, h.operation
                        );
                    }
                    let pause = self.inner.settings.poll_interval.min(deadline - now);
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }

    /// Release this manager's lock on `resource_key`. Releasing a lock that
    /// is not held is a no-op.
    pub fn release(&self, resource_key: &str) -> Result<(), LockError> {
        let token = self.held().get(resource_key).cloned();
        match token {
            Some(token) => self.release_token(resource_key, &token),
            None => Ok(()),
        }
    }

    /// Current live holder of `resource_key`, if any.
    pub fn holder(&self, resource_key: &str) -> Result<Option<LockRecord>, LockError> {
        let path = self.lock_path(resource_key);
        match LockRecord::read(&path) {
            Ok(record) if self.stale_reason(&record).is_none() => Ok(Some(record)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(None),
            Err(e) => Err(LockError::io(&path, e)),
        }
    }

    /// Run `body` while holding the lock, releasing it on every exit path.
    pub async fn with_lock<F, Fut, T, E>(
        &self,
        resource_key: &str,
        operation: &str,
        wait: Option<Duration>,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let handle = self.acquire(resource_key, operation, wait).await?;
        let result = body().await;
        if let Err(e) = handle.release() {
            warn!("[lock] failed to release '{}': {}", resource_key, e);
        }
        result
    }

    fn held(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.inner.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One attempt off the async workers: the guard lock and the record
    /// file I/O block.
    async fn try_acquire_blocking(&self, resource_key: &str, operation: &str) -> Result<Attempt, LockError> {
        let manager = self.clone();
        let key = resource_key.to_string();
        let operation = operation.to_string();
        tokio::task::spawn_blocking(move || manager.try_acquire(&key, &operation))
            .await
            .map_err(|e| LockError::io(&self.inner.dir, io::Error::other(e)))?
    }

    fn try_acquire(&self, resource_key: &str, operation: &str) -> Result<Attempt, LockError> {
        let path = self.lock_path(resource_key);
        let now = self.inner.clock.now();
        let record = LockRecord {
            resource_key: resource_key.to_string(),
            holder_pid: std::process::id(),
            holder_host: hostname().to_string(),
            operation: operation.to_string(),
            acquired_at: now,
            expires_at: now + millis(self.inner.settings.ttl.as_millis() as u64),
            token: uuid::Uuid::new_v4().to_string(),
        };

        match record.create_exclusive(&path) {
            Ok(()) => return Ok(Attempt::Acquired(record)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(LockError::io(&path, e)),
        }

        let _guard = self.guard(resource_key)?;
        match LockRecord::read(&path) {
            Ok(existing) => match self.stale_reason(&existing) {
                Some(reason) => {
                    warn!(
                        "[lock] reclaiming '{}' from pid {} on {} ({})",
                        resource_key, existing.holder_pid, existing.holder_host, reason
                    );
                    LockRecord::remove(&path).map_err(|e| LockError::io(&path, e))?;
                    Ok(Attempt::Retry)
                }
                None => Ok(Attempt::Busy(Some(existing))),
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Attempt::Retry),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                // Records are published complete, so garbage is never in flight.
                warn!("[lock] removing corrupt lock record for '{}'", resource_key);
                LockRecord::remove(&path).map_err(|e| LockError::io(&path, e))?;
                Ok(Attempt::Retry)
            }
            Err(e) => Err(LockError::io(&path, e)),
        }
    }

    fn release_token(&self, resource_key: &str, token: &str) -> Result<(), LockError> {
        let path = self.lock_path(resource_key);
        let _guard = self.guard(resource_key)?;
        let result = match LockRecord::read(&path) {
            Ok(existing) if existing.token == token => {
                LockRecord::remove(&path).map_err(|e| LockError::io(&path, e))
            }
            Ok(existing) => {
                warn!(
                    "[lock] '{}' was reclaimed by pid {} on {} before release",
                    resource_key, existing.holder_pid, existing.holder_host
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Ok(()),
            Err(e) => Err(LockError::io(&path, e)),
        };

        let mut held = self.held();
        if held.get(resource_key).map(String::as_str) == Some(token) {
            held.remove(resource_key);
        }
        if result.is_ok() {
            info!("[lock] released '{}'", resource_key);
        }
        result
    }

    fn stale_reason(&self, record: &LockRecord) -> Option<&'static str> {
        if record.is_expired(self.inner.clock.now()) {
            return Some("expired");
        }
        if record.holder_host == hostname() && !pid_alive(record.holder_pid) {
            return Some("holder process is gone");
        }
        None
    }

    /// Exclusive advisory lock on the key's guard file, held until dropped.
    fn guard(&self, resource_key: &str) -> Result<GuardFile, LockError> {
        let path = self.file_stem(resource_key).with_extension("guard");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LockError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| LockError::io(&path, e))?;
        Ok(GuardFile { file })
    }

    fn lock_path(&self, resource_key: &str) -> PathBuf {
        self.file_stem(resource_key).with_extension("lock")
    }

    /// `<dir>/<sanitized key>-<hash prefix>`; the hash keeps keys that
    /// sanitize to the same text apart.
    fn file_stem(&self, resource_key: &str) -> PathBuf {
        self.inner.dir.join(path_stem(resource_key))
    }
}

struct GuardFile {
    file: File,
}

impl Drop for GuardFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// A held lock. Dropping the handle releases it.
pub struct LockHandle {
    manager: LockManager,
    record: LockRecord,
    released: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("record", &self.record)
            .field("released", &self.released)
            .finish()
    }
}

impl LockHandle {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.manager
            .release_token(&self.record.resource_key, &self.record.token)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self
                .manager
                .release_token(&self.record.resource_key, &self.record.token)
            {
                warn!(
                    "[lock] failed to release '{}' on drop: {}",
                    self.record.resource_key, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};

    fn fast_settings() -> LockSettings {
        LockSettings {
            ttl: Duration::from_secs(60),
            default_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_file_stem_sanitizes_and_disambiguates() {
        let mgr = LockManager::new("/tmp/locks", Arc::new(SystemClock));
        let a = mgr.lock_path("proj/a");
        let b = mgr.lock_path("proj:a");
        assert_ne!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("proj_a-"));
        assert!(name.ends_with(".lock"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_contended_guard_does_not_stall_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let holder = LockManager::with_settings(dir.path(), Arc::new(SystemClock), fast_settings());
        let _held = holder.acquire("k", "edit", None).await.unwrap();
        let guard = holder.guard("k").unwrap();

        let waiter = LockManager::with_settings(dir.path(), Arc::new(SystemClock), fast_settings());
        let attempt = tokio::spawn(async move {
            waiter
                .acquire("k", "sync-pull", Some(Duration::from_millis(50)))
                .await
        });

        // The waiter is stuck on the guard; this task must still get to run.
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(guard);

        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_expires_at_is_acquired_plus_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LockManager::with_settings(dir.path(), Arc::new(SystemClock), fast_settings());
        let handle = mgr.acquire("p", "edit", None).await.unwrap();
        let r = handle.record();
        assert_eq!(r.expires_at - r.acquired_at, chrono::Duration::seconds(60));
        assert_eq!(r.holder_pid, std::process::id());
        handle.release().unwrap();
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = LockManager::with_settings(dir.path(), Arc::new(SystemClock), fast_settings());
        mgr.release("never-held").unwrap();
        let _handle = mgr.acquire("p", "edit", None).await.unwrap();
        mgr.release("p").unwrap();
        mgr.release("p").unwrap();
        assert!(mgr.holder("p").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let first = LockManager::with_settings(dir.path(), clock.clone(), fast_settings());
        let second = LockManager::with_settings(dir.path(), clock.clone(), fast_settings());

        let stale = first.acquire("p", "edit", None).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        let fresh = second.acquire("p", "edit", None).await.unwrap();
        assert_ne!(fresh.record().token, stale.record().token);

        // The old holder's release must not remove the new record.
        stale.release().unwrap();
        let holder = second.holder("p").unwrap().unwrap();
        assert_eq!(holder.token, fresh.record().token);
    }
}
