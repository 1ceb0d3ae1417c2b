//! The authoritative remote file store, seen through a narrow trait.
//!
//! The store offers no versioning, locking or multi-file transactions; every
//! consistency guarantee is built on top of these three calls.

mod dir;
mod memory;

pub use dir::DirStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hash::ContentHash;

/// Kind of content a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Code,
    Markup,
    Data,
}

impl FileType {
    /// Extension used for this type in the local mirror.
    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Code => "js",
            FileType::Markup => "html",
            FileType::Data => "json",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "js" | "gs" | "ts" => Some(FileType::Code),
            "html" | "htm" => Some(FileType::Markup),
            "json" => Some(FileType::Data),
            _ => None,
        }
    }
}

/// One remote file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub file_type: FileType,
    pub content: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Resource {
    pub fn new(name: impl Into<String>, file_type: FileType, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type,
            content: content.into(),
            updated_at: None,
        }
    }

    pub fn hash(&self) -> ContentHash {
        ContentHash::of_str(&self.content)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    #[error("resource set '{0}' not found")]
    SetNotFound(String),
    #[error("remote read failed: {0}")]
    Read(String),
    #[error("remote write of '{file}' failed: {message}")]
    Write { file: String, message: String },
    #[error("validation failed: {0}")]
    Validation(String),
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All files of a resource set, in store order.
    async fn read_all(&self, resource_set_id: &str) -> Result<Vec<Resource>, RemoteError>;

    /// Persist one file, creating it if needed.
    async fn write(
        &self,
        resource_set_id: &str,
        name: &str,
        content: &str,
        file_type: FileType,
    ) -> Result<Resource, RemoteError>;

    /// Replace the whole ordered file set in one call.
    async fn write_all(
        &self,
        resource_set_id: &str,
        files: Vec<Resource>,
    ) -> Result<Vec<Resource>, RemoteError>;
}

/// File name to final content, passed between compute and apply.
pub type ChangeSet = BTreeMap<String, String>;

/// Hook run between the compute and apply phases (formatters, linters).
/// It may rewrite content; it must not drop or add files.
#[async_trait]
pub trait ContentValidator: Send + Sync {
    async fn validate(&self, changes: ChangeSet) -> Result<ChangeSet, RemoteError>;
}

/// Identity validator.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThrough;

#[async_trait]
impl ContentValidator for PassThrough {
    async fn validate(&self, changes: ChangeSet) -> Result<ChangeSet, RemoteError> {
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_extensions() {
        for t in [FileType::Code, FileType::Markup, FileType::Data] {
            assert_eq!(FileType::from_extension(t.extension()), Some(t));
        }
        assert_eq!(FileType::from_extension("GS"), Some(FileType::Code));
        assert_eq!(FileType::from_extension("txt"), None);
    }

    #[tokio::test]
    async fn test_pass_through_is_identity() {
        let mut changes = ChangeSet::new();
        changes.insert("Code".to_string(), "x".to_string());
        let out = PassThrough.validate(changes.clone()).await.unwrap();
        assert_eq!(out, changes);
    }
}
