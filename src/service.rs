//! Service layer.
//!
//! `MirrorSync` owns the long-lived managers (locks, plans, matcher) and
//! exposes the caller-facing operations. Construct one per process and pass
//! it down; nothing here is global.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::conflict::{ConflictDetector, ExpectedHash, HashSource};
use crate::error::CoreError;
use crate::fuzzy::{EditOperation, FuzzyMatcher};
use crate::hash::ContentHash;
use crate::lock::{LockManager, LockRecord};
use crate::mirror::{LocalMirror, SyncStateFile};
use crate::operation::{DeleteStrategy, EditOutcome, EditStrategy, MoveStrategy, OperationManager};
use crate::plan::{PlanStore, SyncDirection, SyncPlan};
use crate::remote::{ContentValidator, FileType, RemoteStore};
use crate::sync::{classify, PullStrategy, PushStrategy, SyncResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequest {
    pub resource_set_id: String,
    pub file_name: String,
    pub edits: Vec<EditOperation>,
    /// Hash the caller last saw; the edit is refused if the file changed.
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub resource_set_id: String,
    pub file_name: String,
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub resource_set_id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub position: Option<usize>,
    #[serde(default)]
    pub expected_hash: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileContent {
    pub name: String,
    pub file_type: FileType,
    pub content: String,
    pub hash: ContentHash,
}

type CacheKey = (String, String);

/// Files larger than this are cached by hash only.
const MAX_CACHED_CONTENT: usize = 1 << 20;

/// A file as last seen through this instance.
#[derive(Debug, Clone)]
struct CachedRead {
    hash: ContentHash,
    /// Kept so a later conflict can show what changed since the read.
    content: Option<Arc<str>>,
}

impl CachedRead {
    fn new(hash: ContentHash, content: &str) -> Self {
        let content = (content.len() <= MAX_CACHED_CONTENT).then(|| Arc::from(content));
        Self { hash, content }
    }
}

pub struct MirrorSync {
    config: CoreConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn RemoteStore>,
    mirror: LocalMirror,
    manager: OperationManager,
    plans: Arc<PlanStore>,
    matcher: Arc<FuzzyMatcher>,
    detector: ConflictDetector,
    /// Each file as last read or written through this instance.
    read_cache: RwLock<HashMap<CacheKey, CachedRead>>,
}

impl MirrorSync {
    pub fn new(config: CoreConfig, store: Arc<dyn RemoteStore>, mirror: LocalMirror) -> Self {
        Self::with_clock(config, Arc::new(SystemClock), store, mirror)
    }

    pub fn with_clock(
        config: CoreConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn RemoteStore>,
        mirror: LocalMirror,
    ) -> Self {
        let locks = LockManager::with_settings(config.lock_dir.clone(), clock.clone(), config.lock_settings());
        let manager = OperationManager::new(locks);
        let plans = Arc::new(PlanStore::new(clock.clone(), config.plan_ttl()));
        let matcher = Arc::new(FuzzyMatcher::new(config.search_timeout()));
        let detector = ConflictDetector::new(config.diff_limit_bytes);
        Self {
            config,
            clock,
            store,
            mirror,
            manager,
            plans,
            matcher,
            detector,
            read_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Run a content validator between compute and apply of every operation.
    pub fn with_validator(mut self, validator: Arc<dyn ContentValidator>) -> Self {
        self.manager = self.manager.with_validator(validator);
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn plans(&self) -> &Arc<PlanStore> {
        &self.plans
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    pub fn locks(&self) -> &LockManager {
        self.manager.locks()
    }

    /// Start the background sweep of expired plans.
    pub fn spawn_plan_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.plans.spawn_sweeper(self.config.sweep_interval())
    }

    pub async fn read_file(&self, resource_set_id: &str, file_name: &str) -> Result<FileContent, CoreError> {
        let files = self.store.read_all(resource_set_id).await?;
        let resource = files
            .into_iter()
            .find(|r| r.name == file_name)
            .ok_or_else(|| CoreError::file_not_found(resource_set_id, file_name))?;
        let hash = resource.hash();
        self.remember(resource_set_id, file_name, CachedRead::new(hash.clone(), &resource.content))
            .await;
        Ok(FileContent {
            name: resource.name,
            file_type: resource.file_type,
            content: resource.content,
            hash,
        })
    }

    pub async fn perform_edit(&self, request: EditRequest) -> Result<EditOutcome, CoreError> {
        let expected = self
            .expected_hash(&request.resource_set_id, &request.file_name, request.expected_hash.as_deref())
            .await?;
        let base = self
            .base_content(&request.resource_set_id, &request.file_name, expected.as_ref())
            .await;

        let mut strategy = EditStrategy::new(
            self.store.clone(),
            self.matcher.clone(),
            request.resource_set_id.clone(),
            request.file_name.clone(),
            request.edits,
        )
        .expected_hash(expected)
        .base_content(base)
        .force(request.force)
        .detector(self.detector.clone())
        .limits(self.config.default_similarity, self.config.max_edits_per_call);

        let outcome = self.manager.execute(&mut strategy).await?;
        self.remember(
            &request.resource_set_id,
            &request.file_name,
            CachedRead::new(outcome.hash.clone(), &outcome.final_content),
        )
        .await;
        Ok(outcome)
    }

    /// Delete a file. Returns the hash of the removed content.
    pub async fn delete_file(&self, request: DeleteRequest) -> Result<ContentHash, CoreError> {
        let expected = self
            .expected_hash(&request.resource_set_id, &request.file_name, request.expected_hash.as_deref())
            .await?;
        let base = self
            .base_content(&request.resource_set_id, &request.file_name, expected.as_ref())
            .await;
        let mut strategy = DeleteStrategy::new(
            self.store.clone(),
            request.resource_set_id.clone(),
            request.file_name.clone(),
        )
        .expected_hash(expected)
        .base_content(base)
        .force(request.force)
        .detector(self.detector.clone());

        let removed = self.manager.execute(&mut strategy).await?;
        self.forget(&request.resource_set_id, &request.file_name).await;
        Ok(removed)
    }

    /// Rename and optionally reposition a file. Returns the new file order.
    pub async fn move_file(&self, request: MoveRequest) -> Result<Vec<String>, CoreError> {
        let expected = self
            .expected_hash(&request.resource_set_id, &request.from, request.expected_hash.as_deref())
            .await?;
        let mut strategy = MoveStrategy::new(
            self.store.clone(),
            request.resource_set_id.clone(),
            request.from.clone(),
            request.to.clone(),
        )
        .position(request.position)
        .expected_hash(expected)
        .force(request.force)
        .detector(self.detector.clone());

        let order = self.manager.execute(&mut strategy).await?;
        if let Some(seen) = self.forget(&request.resource_set_id, &request.from).await {
            self.remember(&request.resource_set_id, &request.to, seen).await;
        }
        Ok(order)
    }

    /// Compare the remote set with the mirror and store a plan for it.
    pub async fn plan_sync(
        &self,
        direction: SyncDirection,
        resource_set_id: &str,
    ) -> Result<SyncPlan, CoreError> {
        let remote = self.store.read_all(resource_set_id).await?;
        let local = self.mirror.list(resource_set_id).await?;
        let is_bootstrap = self.mirror.load_state(resource_set_id).await?.is_none();
        let operations = classify(direction, &remote, &local, is_bootstrap);

        let mut metadata = BTreeMap::new();
        metadata.insert("remote_files".to_string(), remote.len().into());
        metadata.insert("local_files".to_string(), local.len().into());
        Ok(self
            .plans
            .create(direction, resource_set_id, operations, is_bootstrap, metadata))
    }

    /// Run a stored plan. A plan that deletes files needs its deletion token;
    /// a wrong token or a lock timeout leaves the plan usable. Any other
    /// attempt consumes it.
    pub async fn execute_sync(
        &self,
        plan_id: &str,
        deletion_token: Option<&str>,
    ) -> Result<SyncResult, CoreError> {
        let plan = self.plans.get(plan_id)?;
        if !self.plans.validate_deletion_token(&plan, deletion_token) {
            warn!("[sync] rejected deletion token for plan {}", plan_id);
            return Err(CoreError::InvalidDeletionToken {
                plan_id: plan_id.to_string(),
            });
        }
        let resource_set_id = plan.resource_set_id.clone();

        // The strategy claims the plan once the lock is held, so a lock
        // timeout leaves it in place for a retry.
        let result = match plan.direction {
            SyncDirection::Push => {
                let mut strategy = PushStrategy::new(self.store.clone(), self.mirror.clone(), plan)
                    .claim_from(self.plans.clone())
                    .detector(self.detector.clone());
                self.manager.execute(&mut strategy).await?
            }
            SyncDirection::Pull => {
                let mut strategy = PullStrategy::new(self.store.clone(), self.mirror.clone(), plan)
                    .claim_from(self.plans.clone())
                    .detector(self.detector.clone());
                self.manager.execute(&mut strategy).await?
            }
        };

        if let Err(e) = self.record_sync_state(&resource_set_id).await {
            warn!("[sync] applied plan {} but could not save sync state: {}", plan_id, e);
        }
        Ok(result)
    }

    /// Scoped lock: `body` runs while `resource_key` is held.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource_key: &str,
        operation: &str,
        timeout: Option<Duration>,
        body: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.locks().with_lock(resource_key, operation, timeout, body).await
    }

    pub fn lock_holder(&self, resource_key: &str) -> Result<Option<LockRecord>, CoreError> {
        Ok(self.locks().holder(resource_key)?)
    }

    /// Record every file whose content now matches on both sides.
    async fn record_sync_state(&self, resource_set_id: &str) -> Result<(), CoreError> {
        let remote = self.store.read_all(resource_set_id).await?;
        let local = self.mirror.list(resource_set_id).await?;
        let now = self.clock.now();

        let mut state = SyncStateFile::new(resource_set_id);
        for r in &remote {
            let hash = r.hash();
            if local.iter().any(|f| f.name == r.name && f.hash() == hash) {
                state.update_file(&r.name, r.file_type, hash.clone(), now);
            }
            self.remember(resource_set_id, &r.name, CachedRead::new(hash, &r.content))
                .await;
        }
        state.mark_synced(now);
        self.mirror.save_state(&state).await?;
        debug!(
            "[sync] saved state for '{}' ({} file(s) in sync)",
            resource_set_id,
            state.files.len()
        );
        Ok(())
    }

    /// Caller's hash first; with implicit preconditions, fall back to the
    /// last read through this instance, then to the last sync.
    async fn expected_hash(
        &self,
        resource_set_id: &str,
        file_name: &str,
        caller: Option<&str>,
    ) -> Result<Option<ExpectedHash>, CoreError> {
        if let Some(hex) = caller {
            if hex.trim().is_empty() {
                return Err(CoreError::invalid("expected hash is empty"));
            }
            return Ok(Some(ExpectedHash::caller(hex)));
        }
        if !self.config.implicit_preconditions {
            return Ok(None);
        }
        let key = (resource_set_id.to_string(), file_name.to_string());
        if let Some(seen) = self.read_cache.read().await.get(&key) {
            return Ok(Some(ExpectedHash::new(seen.hash.clone(), HashSource::Cached)));
        }
        let state = self.mirror.load_state(resource_set_id).await?;
        Ok(state
            .and_then(|s| s.hash_of(file_name).cloned())
            .map(|hash| ExpectedHash::new(hash, HashSource::Cached)))
    }

    /// Content the expected hash describes: the cached read when it matches,
    /// else the mirrored copy.
    async fn base_content(
        &self,
        resource_set_id: &str,
        file_name: &str,
        expected: Option<&ExpectedHash>,
    ) -> Option<String> {
        let expected = expected?;
        let key = (resource_set_id.to_string(), file_name.to_string());
        let cached = self
            .read_cache
            .read()
            .await
            .get(&key)
            .filter(|seen| seen.hash == expected.hash)
            .and_then(|seen| seen.content.as_deref().map(str::to_string));
        match cached {
            Some(content) => Some(content),
            None => self.mirror_copy(resource_set_id, file_name).await,
        }
    }

    /// The mirrored copy of a file, whatever its type.
    async fn mirror_copy(&self, resource_set_id: &str, file_name: &str) -> Option<String> {
        for file_type in [FileType::Code, FileType::Markup, FileType::Data] {
            match self.mirror.read(resource_set_id, file_name, file_type).await {
                Ok(Some(file)) => return Some(file.content),
                Ok(None) => {}
                Err(e) => {
                    debug!("[op] no mirror copy of '{}': {}", file_name, e);
                    return None;
                }
            }
        }
        None
    }

    async fn remember(&self, resource_set_id: &str, file_name: &str, seen: CachedRead) {
        let key = (resource_set_id.to_string(), file_name.to_string());
        self.read_cache.write().await.insert(key, seen);
    }

    async fn forget(&self, resource_set_id: &str, file_name: &str) -> Option<CachedRead> {
        let key = (resource_set_id.to_string(), file_name.to_string());
        self.read_cache.write().await.remove(&key)
    }
}

impl std::fmt::Debug for MirrorSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorSync")
            .field("lock_dir", &self.config.lock_dir)
            .field("mirror", &self.mirror.root())
            .field("plans", &self.plans.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryStore, Resource};

    async fn service(implicit: bool) -> (MirrorSync, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        store
            .insert_set("p", vec![Resource::new("Code", FileType::Code, "let a = 1;\n")])
            .await;
        let config = CoreConfig {
            lock_dir: dir.path().join("locks"),
            implicit_preconditions: implicit,
            ..CoreConfig::default()
        };
        let svc = MirrorSync::new(config, store.clone(), LocalMirror::new(dir.path().join("mirror")));
        (svc, store, dir)
    }

    fn edit(expected: Option<String>) -> EditRequest {
        EditRequest {
            resource_set_id: "p".into(),
            file_name: "Code".into(),
            edits: vec![EditOperation::new("a = 1", "a = 2")],
            expected_hash: expected,
            force: false,
        }
    }

    #[tokio::test]
    async fn test_read_then_edit_with_implicit_precondition() {
        let (svc, store, _dir) = service(true).await;
        svc.read_file("p", "Code").await.unwrap();
        store
            .write("p", "Code", "let a = 1; // touched\n", FileType::Code)
            .await
            .unwrap();
        let err = svc.perform_edit(edit(None)).await.unwrap_err();
        match err {
            CoreError::Conflict(c) => assert_eq!(c.source, HashSource::Cached),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_edit_without_precondition_when_not_implicit() {
        let (svc, _store, _dir) = service(false).await;
        svc.read_file("p", "Code").await.unwrap();
        let outcome = svc.perform_edit(edit(None)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.final_content, "let a = 2;\n");
        assert_eq!(outcome.hash, ContentHash::of_str("let a = 2;\n"));
    }

    #[tokio::test]
    async fn test_empty_expected_hash_is_invalid() {
        let (svc, _store, _dir) = service(false).await;
        let err = svc.perform_edit(edit(Some(" ".into()))).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_with_lock_releases() {
        let (svc, _store, _dir) = service(false).await;
        let value = svc
            .with_lock("p", "inspect", None, || async {
                Ok::<_, CoreError>(7)
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(svc.lock_holder("p").unwrap().is_none());
    }
}
