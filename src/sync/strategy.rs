use super::{check_drift, local_entries, remote_entries, SyncResult};
use crate::conflict::ConflictDetector;
use crate::error::{CoreError, RollbackOutcome};
use crate::hash::ContentHash;
use crate::mirror::LocalMirror;
use crate::operation::{ensure_unchanged, restore_set, OperationStrategy};
use crate::plan::{PlanStore, PlannedFile, SyncPlan};
use crate::remote::{ChangeSet, RemoteStore, Resource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Remove the plan from `plans` (if still unclaimed) so it runs at most once.
/// Called from `compute_changes`, after the resource lock is held.
fn claim(plans: &mut Option<Arc<PlanStore>>, plan: &mut SyncPlan) -> Result<(), CoreError> {
    if let Some(store) = plans.take() {
        *plan = store.take(&plan.plan_id)?;
    }
    Ok(())
}

fn result_for(plan: &SyncPlan) -> SyncResult {
    let names = |files: &[PlannedFile]| files.iter().map(|f| f.name.clone()).collect();
    SyncResult {
        plan_id: plan.plan_id.clone(),
        direction: plan.direction,
        resource_set_id: plan.resource_set_id.clone(),
        added: names(&plan.operations.add),
        updated: names(&plan.operations.update),
        deleted: names(&plan.operations.delete),
        hashes: BTreeMap::new(),
    }
}

/// Mirror to remote: one `write_all` with the complete desired set.
pub struct PushStrategy {
    store: Arc<dyn RemoteStore>,
    mirror: LocalMirror,
    detector: ConflictDetector,
    plan: SyncPlan,
    plans: Option<Arc<PlanStore>>,

    original: Option<Vec<Resource>>,
    desired: Vec<Resource>,
    write_attempted: bool,
}

impl PushStrategy {
    pub fn new(store: Arc<dyn RemoteStore>, mirror: LocalMirror, plan: SyncPlan) -> Self {
        Self {
            store,
            mirror,
            detector: ConflictDetector::default(),
            plan,
            plans: None,
            original: None,
            desired: Vec::new(),
            write_attempted: false,
        }
    }

    /// Consume the plan from `plans` when the operation starts.
    pub fn claim_from(mut self, plans: Arc<PlanStore>) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }
}

#[async_trait]
impl OperationStrategy for PushStrategy {
    type Output = SyncResult;

    fn label(&self) -> &str {
        "sync-push"
    }

    fn resource_key(&self) -> String {
        self.plan.resource_set_id.clone()
    }

    async fn compute_changes(&mut self) -> Result<ChangeSet, CoreError> {
        claim(&mut self.plans, &mut self.plan)?;
        let set = self.plan.resource_set_id.clone();
        let remote = self.store.read_all(&set).await?;
        let local = self.mirror.list(&set).await?;
        let ops = &self.plan.operations;
        check_drift(&self.detector, &set, &self.plan.plan_id, ops, &remote_entries(&remote), |f| {
            f.remote_hash.as_ref()
        })?;
        check_drift(&self.detector, &set, &self.plan.plan_id, ops, &local_entries(&local), |f| {
            f.local_hash.as_ref()
        })?;

        let content_of = |name: &str| {
            local
                .iter()
                .find(|f| f.name == name)
                .map(|f| f.content.clone())
                .ok_or_else(|| CoreError::file_not_found(&set, name))
        };

        // Keep the remote order; new files go at the end in plan order.
        let mut desired = Vec::with_capacity(remote.len() + ops.add.len());
        for r in &remote {
            if ops.delete.iter().any(|f| f.name == r.name) {
                continue;
            }
            if let Some(planned) = ops.update.iter().find(|f| f.name == r.name) {
                let content = content_of(&planned.name)?;
                desired.push(Resource::new(r.name.clone(), planned.file_type, content));
            } else {
                desired.push(Resource::new(r.name.clone(), r.file_type, r.content.clone()));
            }
        }
        for planned in &ops.add {
            let content = content_of(&planned.name)?;
            desired.push(Resource::new(planned.name.clone(), planned.file_type, content));
        }

        let changes = desired
            .iter()
            .map(|r| (r.name.clone(), r.content.clone()))
            .collect();
        debug!(
            "[sync] push '{}': {} file(s) in desired set",
            set,
            desired.len()
        );
        self.desired = desired;
        self.original = Some(remote);
        Ok(changes)
    }

    async fn apply_changes(&mut self, validated: ChangeSet) -> Result<SyncResult, CoreError> {
        let set = self.plan.resource_set_id.clone();
        let original = self
            .original
            .clone()
            .ok_or_else(|| CoreError::invalid("apply called before compute"))?;
        let current = self.store.read_all(&set).await?;
        ensure_unchanged(&self.detector, &set, &original, &current)?;

        let desired: Vec<Resource> = self
            .desired
            .iter()
            .map(|r| {
                let content = validated.get(&r.name).cloned().unwrap_or_else(|| r.content.clone());
                Resource::new(r.name.clone(), r.file_type, content)
            })
            .collect();

        self.write_attempted = true;
        let written = self.store.write_all(&set, desired).await?;

        let mut result = result_for(&self.plan);
        for r in &written {
            if result.added.contains(&r.name) || result.updated.contains(&r.name) {
                result.hashes.insert(r.name.clone(), r.hash());
            }
        }
        info!(
            "[sync] pushed plan {} to '{}': {} added, {} updated, {} deleted",
            self.plan.plan_id,
            set,
            result.added.len(),
            result.updated.len(),
            result.deleted.len()
        );
        Ok(result)
    }

    async fn rollback(&mut self) -> RollbackOutcome {
        restore_set(
            self.store.as_ref(),
            &self.plan.resource_set_id,
            self.original.clone(),
            self.write_attempted,
        )
        .await
    }
}

/// Remote to mirror: writes and removes local files, remembering what each
/// one held so a failure can put them back.
pub struct PullStrategy {
    store: Arc<dyn RemoteStore>,
    mirror: LocalMirror,
    detector: ConflictDetector,
    plan: SyncPlan,
    plans: Option<Arc<PlanStore>>,

    /// Mirror content before each change; `None` for files that did not exist.
    touched: Vec<(PlannedFile, Option<String>)>,
}

impl PullStrategy {
    pub fn new(store: Arc<dyn RemoteStore>, mirror: LocalMirror, plan: SyncPlan) -> Self {
        Self {
            store,
            mirror,
            detector: ConflictDetector::default(),
            plan,
            plans: None,
            touched: Vec::new(),
        }
    }

    /// Consume the plan from `plans` when the operation starts.
    pub fn claim_from(mut self, plans: Arc<PlanStore>) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn detector(mut self, detector: ConflictDetector) -> Self {
        self.detector = detector;
        self
    }

    async fn restore(&self) -> Result<usize, String> {
        let set = &self.plan.resource_set_id;
        let mut restored = 0;
        for (file, before) in self.touched.iter().rev() {
            let outcome = match before {
                Some(content) => self.mirror.write(set, &file.name, file.file_type, content).await,
                None => self.mirror.remove(set, &file.name, file.file_type).await,
            };
            outcome.map_err(|e| e.to_string())?;
            restored += 1;
        }
        Ok(restored)
    }
}

#[async_trait]
impl OperationStrategy for PullStrategy {
    type Output = SyncResult;

    fn label(&self) -> &str {
        "sync-pull"
    }

    fn resource_key(&self) -> String {
        self.plan.resource_set_id.clone()
    }

    async fn compute_changes(&mut self) -> Result<ChangeSet, CoreError> {
        claim(&mut self.plans, &mut self.plan)?;
        let set = self.plan.resource_set_id.clone();
        let remote = self.store.read_all(&set).await?;
        let local = self.mirror.list(&set).await?;
        let ops = &self.plan.operations;
        check_drift(&self.detector, &set, &self.plan.plan_id, ops, &remote_entries(&remote), |f| {
            f.remote_hash.as_ref()
        })?;
        check_drift(&self.detector, &set, &self.plan.plan_id, ops, &local_entries(&local), |f| {
            f.local_hash.as_ref()
        })?;

        let mut changes = ChangeSet::new();
        for planned in ops.add.iter().chain(ops.update.iter()) {
            let r = remote
                .iter()
                .find(|r| r.name == planned.name)
                .ok_or_else(|| CoreError::file_not_found(&set, &planned.name))?;
            changes.insert(planned.name.clone(), r.content.clone());
        }
        Ok(changes)
    }

    async fn apply_changes(&mut self, validated: ChangeSet) -> Result<SyncResult, CoreError> {
        let set = self.plan.resource_set_id.clone();
        let ops = self.plan.operations.clone();
        let mut result = result_for(&self.plan);

        for planned in ops.add.iter().chain(ops.update.iter()) {
            let content = validated
                .get(&planned.name)
                .ok_or_else(|| CoreError::invalid(format!("no content for '{}'", planned.name)))?;
            let before = self
                .mirror
                .read(&set, &planned.name, planned.file_type)
                .await?
                .map(|f| f.content);
            self.touched.push((planned.clone(), before));
            self.mirror
                .write(&set, &planned.name, planned.file_type, content)
                .await?;
            result
                .hashes
                .insert(planned.name.clone(), ContentHash::of_str(content));
        }
        for planned in &ops.delete {
            let Some(before) = self.mirror.read(&set, &planned.name, planned.file_type).await? else {
                continue;
            };
            self.touched.push((planned.clone(), Some(before.content)));
            self.mirror.remove(&set, &planned.name, planned.file_type).await?;
        }

        info!(
            "[sync] pulled plan {} from '{}': {} added, {} updated, {} deleted",
            self.plan.plan_id,
            set,
            result.added.len(),
            result.updated.len(),
            result.deleted.len()
        );
        Ok(result)
    }

    async fn rollback(&mut self) -> RollbackOutcome {
        if self.touched.is_empty() {
            return RollbackOutcome::NothingToUndo;
        }
        match self.restore().await {
            Ok(n) => {
                debug!("[sync] restored {} mirror file(s)", n);
                RollbackOutcome::RolledBack
            }
            Err(e) => {
                warn!("[sync] mirror restore failed: {}", e);
                RollbackOutcome::Failed(e)
            }
        }
    }
}
