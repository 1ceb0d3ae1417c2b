use super::{find_file, OperationStrategy};
use crate::conflict::{ConflictDetector, ExpectedHash, HashSource, Verdict, WriteCheck};
use crate::error::{CoreError, RollbackOutcome};
use crate::fuzzy::{apply_edits, EditOperation, FuzzyMatcher};
use crate::hash::ContentHash;
use crate::remote::{ChangeSet, RemoteError, RemoteStore, Resource};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EditOutcome {
    pub success: bool,
    pub edits_applied: usize,
    pub final_content: String,
    pub hash: ContentHash,
    /// True when a hash mismatch was overridden with `force`.
    pub forced: bool,
}

/// Search/replace edits against one remote file.
pub struct EditStrategy {
    store: Arc<dyn RemoteStore>,
    matcher: Arc<FuzzyMatcher>,
    detector: ConflictDetector,
    resource_set_id: String,
    file_name: String,
    edits: Vec<EditOperation>,
    expected: Option<ExpectedHash>,
    /// Earlier copy of the file, used for the diff on conflict.
    base_content: Option<String>,
    force: bool,
    default_similarity: f64,
    max_edits: usize,

    original: Option<Resource>,
    edits_applied: usize,
    forced: bool,
    write_attempted: bool,
}

impl EditStrategy {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        matcher: Arc<FuzzyMatcher>,
        resource_set_id: impl Into<String>,
        file_name: impl Into<String>,
        edits: Vec<EditOperation>,
    ) -> Self {
        Self {
            store,
            matcher,
            detector: ConflictDetector::default(),
            resource_set_id: resource_set_id.into(),
            file_name: file_name.into(),
            edits,
            expected: None,
            base_content: None,
            force: false,
            default_similarity: 0.8,
            max_edits: 20,
            original: None,
            edits_applied: 0,
            forced: false,
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

    pub fn limits(mut self, default_similarity: f64, max_edits: usize) -> Self {
        self.default_similarity = default_similarity;
        self.max_edits = max_edits;
        self
    }
}

#[async_trait]
impl OperationStrategy for EditStrategy {
    type Output = EditOutcome;

    fn label(&self) -> &str {
        "edit"
    }

    fn resource_key(&self) -> String {
        self.resource_set_id.clone()
    }

    async fn compute_changes(&mut self) -> Result<ChangeSet, CoreError> {
        if self.edits.is_empty() {
            return Err(CoreError::invalid("at least one edit is required"));
        }
        if self.edits.len() > self.max_edits {
            return Err(CoreError::invalid(format!(
                "{} edits requested; at most {} per call",
                self.edits.len(),
                self.max_edits
            )));
        }

        let files = self.store.read_all(&self.resource_set_id).await?;
        let current = find_file(&files, &self.file_name)
            .cloned()
            .ok_or_else(|| CoreError::file_not_found(&self.resource_set_id, &self.file_name))?;

        let verdict = self.detector.verify(WriteCheck {
            file_name: &self.file_name,
            expected: self.expected.as_ref(),
            current_content: &current.content,
            expected_content: self.base_content.as_deref(),
            force: self.force,
        })?;
        self.forced = verdict == Verdict::Forced;

        let planned =
            self.matcher
                .find_all_matches(&current.content, &self.edits, self.default_similarity)?;
        let proposed = apply_edits(&current.content, &planned);
        debug!(
            "[op] edit '{}': {} edit(s) located, {} -> {} bytes",
            self.file_name,
            planned.len(),
            current.content.len(),
            proposed.len()
        );

        self.edits_applied = planned.len();
        self.original = Some(current);
        Ok(ChangeSet::from([(self.file_name.clone(), proposed)]))
    }

    async fn apply_changes(&mut self, mut validated: ChangeSet) -> Result<EditOutcome, CoreError> {
        let original = self
            .original
            .clone()
            .ok_or_else(|| CoreError::invalid("apply called before compute"))?;
        let content = validated
            .remove(&self.file_name)
            .ok_or_else(|| CoreError::invalid("validated changes lost the edited file"))?;

        // Writers that bypass the lock are only visible through the hash.
        let files = self.store.read_all(&self.resource_set_id).await?;
        let live = find_file(&files, &self.file_name)
            .ok_or_else(|| CoreError::file_not_found(&self.resource_set_id, &self.file_name))?;
        self.detector.check_precondition(
            &self.file_name,
            Some(&ExpectedHash::new(original.hash(), HashSource::Computed)),
            &live.hash(),
        )?;

        self.write_attempted = true;
        let written = self
            .store
            .write(&self.resource_set_id, &self.file_name, &content, original.file_type)
            .await?;

        let hash = written.hash();
        info!(
            "[op] edited '{}' in '{}' ({} edit(s), {} -> {})",
            self.file_name,
            self.resource_set_id,
            self.edits_applied,
            original.hash().short(),
            hash.short()
        );
        Ok(EditOutcome {
            success: true,
            edits_applied: self.edits_applied,
            final_content: written.content,
            hash,
            forced: self.forced,
        })
    }

    async fn rollback(&mut self) -> RollbackOutcome {
        let Some(original) = self.original.as_ref() else {
            return RollbackOutcome::NothingToUndo;
        };
        if !self.write_attempted {
            return RollbackOutcome::NothingToUndo;
        }

        match self.store.read_all(&self.resource_set_id).await {
            Ok(files) if find_file(&files, &self.file_name).is_none() => {
                return RollbackOutcome::Skipped(format!(
                    "'{}' no longer exists",
                    self.file_name
                ));
            }
            Ok(files) => {
                if find_file(&files, &self.file_name).map(Resource::hash) == Some(original.hash()) {
                    return RollbackOutcome::RolledBack;
                }
            }
            Err(RemoteError::SetNotFound(id)) => {
                return RollbackOutcome::Skipped(format!("resource set '{}' no longer exists", id));
            }
            Err(e) => warn!("[op] rollback of '{}' could not re-read: {}", self.file_name, e),
        }

        match self
            .store
            .write(
                &self.resource_set_id,
                &self.file_name,
                &original.content,
                original.file_type,
            )
            .await
        {
            Ok(_) => RollbackOutcome::RolledBack,
            Err(e) => RollbackOutcome::Failed(e.to_string()),
        }
    }
}
