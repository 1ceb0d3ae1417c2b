use super::{ensure_unchanged, find_file, restore_set, OperationStrategy};
use crate::conflict::{ConflictDetector, ExpectedHash, WriteCheck};
use crate::error::{CoreError, RollbackOutcome};
use crate::hash::ContentHash;
use crate::remote::{ChangeSet, RemoteStore, Resource};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Removes one file by resubmitting the rest of the set with `write_all`.
pub struct DeleteStrategy {
    store: Arc<dyn RemoteStore>,
    detector: ConflictDetector,
    resource_set_id: String,
    file_name: String,
    expected: Option<ExpectedHash>,
    /// Earlier copy of the file, used for the diff on conflict.
    base_content: Option<String>,
    force: bool,

    original: Option<Vec<Resource>>,
    write_attempted: bool,
}

impl DeleteStrategy {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        resource_set_id: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            detector: ConflictDetector::default(),
            resource_set_id: resource_set_id.into(),
            file_name: file_name.into(),
            expected: None,
            base_content: None,
            force: false,
            original: None,
            write_attempted: false,
        }
    }

    pub fn expected_hash(mut self, expected: Option<ExpectedHash>) -> Self {
        self.expected = expected;
        self
    }

    pub fn base_content(mut self, content: Option<String>) -> Self {
        self.base_content = content;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }
}

#[async_trait]
impl OperationStrategy for DeleteStrategy {
    /// Hash of the removed content.
    type Output = ContentHash;

    fn label(&self) -> &str {
        "delete"
    }

    fn resource_key(&self) -> String {
        self.resource_set_id.clone()
    }

    async fn compute_changes(&mut self) -> Result<ChangeSet, CoreError> {
        let files = self.store.read_all(&self.resource_set_id).await?;
        let target = find_file(&files, &self.file_name)
            .ok_or_else(|| CoreError::file_not_found(&self.resource_set_id, &self.file_name))?;
        self.detector.verify(WriteCheck {
            file_name: &self.file_name,
            expected: self.expected.as_ref(),
            current_content: &target.content,
            expected_content: self.base_content.as_deref(),
            force: self.force,
        })?;

        let remaining: ChangeSet = files
            .iter()
            .filter(|r| r.name != self.file_name)
            .map(|r| (r.name.clone(), r.content.clone()))
            .collect();
        self.original = Some(files);
        Ok(remaining)
    }

    async fn apply_changes(&mut self, validated: ChangeSet) -> Result<ContentHash, CoreError> {
        let original = self
            .original
            .clone()
            .ok_or_else(|| CoreError::invalid("apply called before compute"))?;
        let current = self.store.read_all(&self.resource_set_id).await?;
        ensure_unchanged(&self.detector, &self.resource_set_id, &original, &current)?;

        let removed = find_file(&original, &self.file_name)
            .map(Resource::hash)
            .ok_or_else(|| CoreError::file_not_found(&self.resource_set_id, &self.file_name))?;
        let desired: Vec<Resource> = original
            .iter()
            .filter(|r| r.name != self.file_name)
            .map(|r| {
                let content = validated.get(&r.name).cloned().unwrap_or_else(|| r.content.clone());
                Resource::new(r.name.clone(), r.file_type, content)
            })
            .collect();

        self.write_attempted = true;
        self.store.write_all(&self.resource_set_id, desired).await?;
        info!("[op] deleted '{}' from '{}'", self.file_name, self.resource_set_id);
        Ok(removed)
    }

    async fn rollback(&mut self) -> RollbackOutcome {
        restore_set(
            self.store.as_ref(),
            &self.resource_set_id,
            self.original.clone(),
            self.write_attempted,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{FileType, MemoryStore};

    #[tokio::test]
    async fn test_delete_keeps_order_of_the_rest() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_set(
                "p",
                vec![
                    Resource::new("a", FileType::Code, "1"),
                    Resource::new("b", FileType::Code, "2"),
                    Resource::new("c", FileType::Markup, "3"),
                ],
            )
            .await;
        let mut s = DeleteStrategy::new(store.clone(), "p", "b");
        let changes = s.compute_changes().await.unwrap();
        let removed = s.apply_changes(changes).await.unwrap();
        assert_eq!(removed, ContentHash::of_str("2"));

        let names: Vec<String> = store
            .read_all("p")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_delete_checks_expected_hash() {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_set("p", vec![Resource::new("a", FileType::Code, "1")])
            .await;
        let mut s = DeleteStrategy::new(store.clone(), "p", "a")
            .expected_hash(Some(ExpectedHash::caller(ContentHash::of_str("0").as_str())));
        assert!(matches!(s.compute_changes().await, Err(CoreError::Conflict(_))));
        assert!(store.get_file("p", "a").await.is_some());
    }
}
