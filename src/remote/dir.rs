use super::{FileType, RemoteError, RemoteStore, Resource};
use crate::hash::path_stem;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Remote store backed by a directory: one JSON manifest per resource set,
/// holding the ordered file list. Manifests are replaced atomically by
/// writing a temp file and renaming it over the old one.
pub struct DirStore {
    root: PathBuf,
    /// Serializes read-modify-write of manifests within this process.
    write_lock: Mutex<()>,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn manifest_path(&self, resource_set_id: &str) -> PathBuf {
        self.root.join(format!("{}.json", path_stem(resource_set_id)))
    }

    /// Create an empty resource set if it does not exist yet.
    pub async fn create_set(&self, resource_set_id: &str) -> Result<(), RemoteError> {
        let _guard = self.write_lock.lock().await;
        let path = self.manifest_path(resource_set_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        self.store(resource_set_id, &[]).await
    }

    async fn load(&self, resource_set_id: &str) -> Result<Vec<Resource>, RemoteError> {
        let path = self.manifest_path(resource_set_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RemoteError::SetNotFound(resource_set_id.to_string()));
            }
            Err(e) => return Err(RemoteError::Read(format!("{}: {}", path.display(), e))),
        };
        serde_json::from_str(&content)
            .map_err(|e| RemoteError::Read(format!("{}: {}", path.display(), e)))
    }

    async fn store(&self, resource_set_id: &str, files: &[Resource]) -> Result<(), RemoteError> {
        let path = self.manifest_path(resource_set_id);
        let write_err = |message: String| RemoteError::Write {
            file: resource_set_id.to_string(),
            message,
        };
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        let json = serde_json::to_vec_pretty(files).map_err(|e| write_err(e.to_string()))?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| write_err(e.to_string()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(write_err(e.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for DirStore {
    async fn read_all(&self, resource_set_id: &str) -> Result<Vec<Resource>, RemoteError> {
        self.load(resource_set_id).await
    }

    async fn write(
        &self,
        resource_set_id: &str,
        name: &str,
        content: &str,
        file_type: FileType,
    ) -> Result<Resource, RemoteError> {
        let _guard = self.write_lock.lock().await;
        let mut files = self.load(resource_set_id).await?;
        let mut resource = Resource::new(name, file_type, content);
        resource.updated_at = Some(Utc::now());
        match files.iter_mut().find(|r| r.name == name) {
            Some(existing) => *existing = resource.clone(),
            None => files.push(resource.clone()),
        }
        self.store(resource_set_id, &files).await?;
        Ok(resource)
    }

    async fn write_all(
        &self,
        resource_set_id: &str,
        files: Vec<Resource>,
    ) -> Result<Vec<Resource>, RemoteError> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let files: Vec<Resource> = files
            .into_iter()
            .map(|mut r| {
                r.updated_at = Some(now);
                r
            })
            .collect();
        self.store(resource_set_id, &files).await?;
        Ok(files)
    }
}
