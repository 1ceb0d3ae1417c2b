use super::{ensure_unchanged, find_file, restore_set, OperationStrategy};
use crate::conflict::{ConflictDetector, ExpectedHash, WriteCheck};
use crate::error::{CoreError, RollbackOutcome};
use crate::remote::{ChangeSet, RemoteStore, Resource};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Renames a file and optionally moves it to a new position in the set,
/// as a single `write_all`.
pub struct MoveStrategy {
    store: Arc<dyn RemoteStore>,
    detector: ConflictDetector,
    resource_set_id: String,
    from: String,
    to: String,
    position: Option<usize>,
    expected: Option<ExpectedHash>,
    force: bool,

    original: Option<Vec<Resource>>,
    order: Vec<Resource>,
    write_attempted: bool,
}

impl MoveStrategy {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        resource_set_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        Self {
            store,
            detector: ConflictDetector::default(),
            resource_set_id: resource_set_id.into(),
            from: from.into(),
            to: to.into(),
            position: None,
            expected: None,
            force: false,
            original: None,
            order: Vec::new(),
            write_attempted: false,
        }
    }

    /// Zero-based target index; clamped to the end of the set.
    pub fn position(mut self, position: Option<usize>) -> Self {
        self.position = position;
        self
    }

    pub fn expected_hash(mut self, expected: Option<ExpectedHash>) -> Self {
        self.expected = expected;
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
impl OperationStrategy for MoveStrategy {
    /// File names in their new order.
    type Output = Vec<String>;

    fn label(&self) -> &str {
        "move"
    }

    fn resource_key(&self) -> String {
        self.resource_set_id.clone()
    }

    async fn compute_changes(&mut self) -> Result<ChangeSet, CoreError> {
        if self.to.trim().is_empty() {
            return Err(CoreError::invalid("destination name is empty"));
        }
        let files = self.store.read_all(&self.resource_set_id).await?;
        let index = files
            .iter()
            .position(|r| r.name == self.from)
            .ok_or_else(|| CoreError::file_not_found(&self.resource_set_id, &self.from))?;
        if self.to != self.from && find_file(&files, &self.to).is_some() {
            return Err(CoreError::invalid(format!(
                "'{}' already exists in '{}'",
                self.to, self.resource_set_id
            )));
        }
        self.detector.verify(WriteCheck {
            file_name: &self.from,
            expected: self.expected.as_ref(),
            current_content: &files[index].content,
            expected_content: None,
            force: self.force,
        })?;

        let mut order = files.clone();
        let mut moved = order.remove(index);
        moved.name = self.to.clone();
        let at = self.position.unwrap_or(index).min(order.len());
        order.insert(at, moved);

        let changes = order
            .iter()
            .map(|r| (r.name.clone(), r.content.clone()))
            .collect();
        self.order = order;
        self.original = Some(files);
        Ok(changes)
    }

    async fn apply_changes(&mut self, validated: ChangeSet) -> Result<Vec<String>, CoreError> {
        let original = self
            .original
            .clone()
            .ok_or_else(|| CoreError::invalid("apply called before compute"))?;
        let current = self.store.read_all(&self.resource_set_id).await?;
        ensure_unchanged(&self.detector, &self.resource_set_id, &original, &current)?;

        let desired: Vec<Resource> = self
            .order
            .iter()
            .map(|r| {
                let content = validated.get(&r.name).cloned().unwrap_or_else(|| r.content.clone());
                Resource::new(r.name.clone(), r.file_type, content)
            })
            .collect();
        let names = desired.iter().map(|r| r.name.clone()).collect();

        self.write_attempted = true;
        self.store.write_all(&self.resource_set_id, desired).await?;
        info!(
            "[op] moved '{}' to '{}' in '{}'",
            self.from, self.to, self.resource_set_id
        );
        Ok(names)
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

    async fn three() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_set(
                "p",
                vec![
                    Resource::new("a", FileType::Code, "1"),
                    Resource::new("b", FileType::Code, "2"),
                    Resource::new("c", FileType::Code, "3"),
                ],
            )
            .await;
        store
    }

    #[tokio::test]
    async fn test_rename_and_reorder() {
        let store = three().await;
        let mut s = MoveStrategy::new(store.clone(), "p", "c", "z").position(Some(0));
        let changes = s.compute_changes().await.unwrap();
        let names = s.apply_changes(changes).await.unwrap();
        assert_eq!(names, vec!["z", "a", "b"]);
        assert_eq!(store.get_file("p", "z").await.unwrap().content, "3");
        assert!(store.get_file("p", "c").await.is_none());
    }

    #[tokio::test]
    async fn test_refuses_to_overwrite_existing_name() {
        let store = three().await;
        let mut s = MoveStrategy::new(store, "p", "a", "b");
        assert!(matches!(s.compute_changes().await, Err(CoreError::InvalidInput(_))));
    }
}
