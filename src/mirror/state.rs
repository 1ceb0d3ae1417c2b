//! Persisted record of the last successful sync.
//!
//! Stored as JSON in the mirror directory. Its absence means the mirror has
//! never been synced with the remote set (a bootstrap sync).

use crate::hash::ContentHash;
use crate::remote::FileType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::Path;

pub const STATE_FILE_NAME: &str = ".mirrorsync-state.json";
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileState {
    pub hash: ContentHash,
    pub file_type: FileType,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStateFile {
    pub version: u32,
    pub resource_set_id: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: BTreeMap<String, FileState>,
}

impl SyncStateFile {
    pub fn new(resource_set_id: impl Into<String>) -> Self {
        Self {
            version: STATE_VERSION,
            resource_set_id: resource_set_id.into(),
            last_synced_at: None,
            files: BTreeMap::new(),
        }
    }

    /// Record the hash a file had when it was last in sync.
    pub fn update_file(&mut self, name: &str, file_type: FileType, hash: ContentHash, now: DateTime<Utc>) {
        self.files.insert(
            name.to_string(),
            FileState {
                hash,
                file_type,
                synced_at: now,
            },
        );
    }

    pub fn remove_file(&mut self, name: &str) {
        self.files.remove(name);
    }

    pub fn mark_synced(&mut self, now: DateTime<Utc>) {
        self.last_synced_at = Some(now);
    }

    pub fn hash_of(&self, name: &str) -> Option<&ContentHash> {
        self.files.get(name).map(|f| &f.hash)
    }

    /// Load the state file, or `None` if it does not exist.
    pub async fn load(path: &Path) -> io::Result<Option<Self>> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let state: Self = serde_json::from_str(&content)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if state.version != STATE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported state file version {}", state.version),
            ));
        }
        Ok(Some(state))
    }

    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        assert!(SyncStateFile::load(&path).await.unwrap().is_none());

        let now = Utc::now();
        let mut state = SyncStateFile::new("proj");
        state.update_file("Code", FileType::Code, ContentHash::of_str("x"), now);
        state.mark_synced(now);
        state.save(&path).await.unwrap();

        let loaded = SyncStateFile::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.hash_of("Code"), Some(&ContentHash::of_str("x")));
    }

    #[tokio::test]
    async fn test_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"{"version": 9, "resource_set_id": "p", "last_synced_at": null}"#,
        )
        .await
        .unwrap();
        let err = SyncStateFile::load(&path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
