//! On-disk lock record.
//!
//! One JSON file per resource key. The file's existence is the lock; its
//! content says who holds it and until when.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub resource_key: String,
    pub holder_pid: u32,
    pub holder_host: String,
    pub operation: String,
    pub acquired_at: DateTime<Utc>,
    /// Always `acquired_at` plus the manager's lock lifetime.
    pub expires_at: DateTime<Utc>,
    /// Distinguishes this acquisition from any later one for the same key.
    pub token: String,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Read a record, mapping malformed content to `InvalidData`.
    pub fn read(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Publish this record at `path` only if no record exists there.
    ///
    /// The content is written to a private temp file first and then hard
    /// linked into place, so other processes never observe a half-written
    /// record. Fails with `AlreadyExists` if the lock is taken.
    pub fn create_exclusive(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension(format!("{}.tmp", self.token));
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        let linked = fs::hard_link(&tmp, path);
        let _ = fs::remove_file(&tmp);
        linked
    }

    /// Remove the record file. Missing files are fine.
    pub fn remove(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(token: &str) -> LockRecord {
        let now = Utc::now();
        LockRecord {
            resource_key: "project-1".to_string(),
            holder_pid: std::process::id(),
            holder_host: "host".to_string(),
            operation: "edit".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(30),
            token: token.to_string(),
        }
    }

    #[test]
    fn test_create_exclusive_refuses_second_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.lock");
        record("a").create_exclusive(&path).unwrap();
        let err = record("b").create_exclusive(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(LockRecord::read(&path).unwrap().token, "a");

        // No temp files are left behind either way.
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.lock");
        record("a").create_exclusive(&path).unwrap();
        LockRecord::remove(&path).unwrap();
        LockRecord::remove(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_expiry() {
        let r = record("a");
        assert!(!r.is_expired(r.acquired_at));
        assert!(r.is_expired(r.expires_at));
    }

    #[test]
    fn test_malformed_record_is_invalid_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.lock");
        fs::write(&path, "not json").unwrap();
        let err = LockRecord::read(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
