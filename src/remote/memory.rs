use super::{FileType, RemoteError, RemoteStore, Resource};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-process remote store keyed by resource set id.
#[derive(Clone, Default)]
pub struct MemoryStore {
    sets: Arc<RwLock<HashMap<String, Vec<Resource>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a resource set.
    pub async fn insert_set(&self, resource_set_id: &str, files: Vec<Resource>) {
        let mut sets = self.sets.write().await;
        sets.insert(resource_set_id.to_string(), files);
    }

    pub async fn get_file(&self, resource_set_id: &str, name: &str) -> Option<Resource> {
        let sets = self.sets.read().await;
        sets.get(resource_set_id)?
            .iter()
            .find(|r| r.name == name)
            .cloned()
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read_all(&self, resource_set_id: &str) -> Result<Vec<Resource>, RemoteError> {
        let sets = self.sets.read().await;
        sets.get(resource_set_id)
            .cloned()
            .ok_or_else(|| RemoteError::SetNotFound(resource_set_id.to_string()))
    }

    async fn write(
        &self,
        resource_set_id: &str,
        name: &str,
        content: &str,
        file_type: FileType,
    ) -> Result<Resource, RemoteError> {
        let mut sets = self.sets.write().await;
        let files = sets
            .get_mut(resource_set_id)
            .ok_or_else(|| RemoteError::SetNotFound(resource_set_id.to_string()))?;

        let mut resource = Resource::new(name, file_type, content);
        resource.updated_at = Some(Utc::now());
        match files.iter_mut().find(|r| r.name == name) {
            Some(existing) => *existing = resource.clone(),
            None => files.push(resource.clone()),
        }
        Ok(resource)
    }

    async fn write_all(
        &self,
        resource_set_id: &str,
        files: Vec<Resource>,
    ) -> Result<Vec<Resource>, RemoteError> {
        let now = Utc::now();
        let files: Vec<Resource> = files
            .into_iter()
            .map(|mut r| {
                r.updated_at = Some(now);
                r
            })
            .collect();
        let mut sets = self.sets.write().await;
        sets.insert(resource_set_id.to_string(), files.clone());
        Ok(files)
    }
}
