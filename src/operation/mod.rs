//! Two-phase mutations with rollback.
//!
//! Every remote mutation is an [`OperationStrategy`]: `compute_changes`
//! reads and decides without writing, an injected [`ContentValidator`] may
//! rewrite the proposed content, and `apply_changes` performs the writes.
//! [`OperationManager`] drives the sequence under the resource lock and
//! undoes partial work when anything after compute fails.

mod delete;
mod edit;
mod move_file;

pub use delete::DeleteStrategy;
pub use edit::{EditOutcome, EditStrategy};
pub use move_file::MoveStrategy;

use crate::error::{CoreError, RollbackOutcome};
use crate::lock::LockManager;
use crate::remote::{ChangeSet, ContentValidator, PassThrough, RemoteStore, Resource};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    Computing,
    Computed,
    Applying,
    Applied,
    RollingBack,
    RolledBack,
}

impl OperationState {
    pub fn can_transition_to(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (Idle, Computing)
                | (Computing, Computed)
                | (Computed, Applying)
                | (Applying, Applied)
                | (Computing, RollingBack)
                | (Computed, RollingBack)
                | (Applying, RollingBack)
                | (RollingBack, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Applied | OperationState::RolledBack)
    }
}

/// A mutation split into a side-effect-free compute phase and a writing
/// apply phase.
#[async_trait]
pub trait OperationStrategy: Send {
    type Output: Send;

    /// Short name for logs and lock records.
    fn label(&self) -> &str;

    /// Key the operation locks.
    fn resource_key(&self) -> String;

    /// Read the current remote state and produce the proposed content.
    /// Must not write anything remotely.
    async fn compute_changes(&mut self) -> Result<ChangeSet, CoreError>;

    /// Write validated content. The only phase with remote effects.
    async fn apply_changes(&mut self, validated: ChangeSet) -> Result<Self::Output, CoreError>;

    /// Restore the content captured by `compute_changes`. Must not fail
    /// when the resource no longer exists.
    async fn rollback(&mut self) -> RollbackOutcome;
}

/// Runs strategies: lock, compute, validate, apply, roll back on failure,
/// release on every path.
#[derive(Clone)]
pub struct OperationManager {
    locks: LockManager,
    validator: Arc<dyn ContentValidator>,
    lock_wait: Option<Duration>,
}

struct Tracker<'a> {
    label: &'a str,
    key: &'a str,
    state: OperationState,
}

impl Tracker<'_> {
    fn to(&mut self, next: OperationState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!("[op] {} '{}': {:?} -> {:?}", self.label, self.key, self.state, next);
        self.state = next;
    }
}

impl OperationManager {
    pub fn new(locks: LockManager) -> Self {
        Self {
            locks,
            validator: Arc::new(PassThrough),
            lock_wait: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ContentValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = Some(wait);
        self
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub async fn execute<S: OperationStrategy>(&self, strategy: &mut S) -> Result<S::Output, CoreError> {
        let key = strategy.resource_key();
        let label = strategy.label().to_string();
        let handle = self.locks.acquire(&key, &label, self.lock_wait).await?;

        let result = self.run(strategy, &label, &key).await;

        if let Err(e) = handle.release() {
            warn!("[op] failed to release lock '{}' after {}: {}", key, label, e);
        }
        result
    }

    async fn run<S: OperationStrategy>(
        &self,
        strategy: &mut S,
        label: &str,
        key: &str,
    ) -> Result<S::Output, CoreError> {
        let mut tracker = Tracker {
            label,
            key,
            state: OperationState::Idle,
        };

        tracker.to(OperationState::Computing);
        let proposed = match strategy.compute_changes().await {
            Ok(changes) => changes,
            Err(e) => {
                // Nothing was written, so the error goes back unchanged.
                tracker.to(OperationState::RollingBack);
                let outcome = strategy.rollback().await;
                tracker.to(OperationState::RolledBack);
                if outcome != RollbackOutcome::NothingToUndo {
                    warn!("[op] {} '{}': unexpected rollback after compute: {:?}", label, key, outcome);
                }
                return Err(e);
            }
        };
        tracker.to(OperationState::Computed);

        let validated = match self.validate(proposed).await {
            Ok(changes) => changes,
            Err(e) => {
                tracker.to(OperationState::RollingBack);
                strategy.rollback().await;
                tracker.to(OperationState::RolledBack);
                return Err(e);
            }
        };

        tracker.to(OperationState::Applying);
        match strategy.apply_changes(validated).await {
            Ok(output) => {
                tracker.to(OperationState::Applied);
                info!("[op] {} '{}' applied", label, key);
                Ok(output)
            }
            Err(e) => {
                tracker.to(OperationState::RollingBack);
                let rollback = strategy.rollback().await;
                tracker.to(OperationState::RolledBack);
                match &rollback {
                    RollbackOutcome::Failed(reason) => error!(
                        "[op] {} '{}' failed ({}) and rollback failed: {}; remote may have diverged",
                        label, key, e, reason
                    ),
                    RollbackOutcome::Skipped(reason) => {
                        warn!("[op] {} '{}' failed ({}); rollback skipped: {}", label, key, e, reason)
                    }
                    _ => warn!("[op] {} '{}' failed ({}); {:?}", label, key, e, rollback),
                }
                // Conflicts found at apply time happen before any write.
                if rollback == RollbackOutcome::NothingToUndo {
                    return Err(e);
                }
                Err(CoreError::ApplyFailed {
                    source: Box::new(e),
                    rollback,
                })
            }
        }
    }

    async fn validate(&self, proposed: ChangeSet) -> Result<ChangeSet, CoreError> {
        let names: Vec<String> = proposed.keys().cloned().collect();
        let validated = self.validator.validate(proposed).await?;
        if validated.len() != names.len() || names.iter().any(|n| !validated.contains_key(n)) {
            return Err(CoreError::invalid(
                "content validator must not add or drop files",
            ));
        }
        Ok(validated)
    }
}

/// Helpers shared by strategies that replace the whole file set.
pub(crate) fn find_file<'a>(files: &'a [Resource], name: &str) -> Option<&'a Resource> {
    files.iter().find(|r| r.name == name)
}

/// Fail with a `Computed` conflict if any file differs from the snapshot
/// taken at compute time.
pub(crate) fn ensure_unchanged(
    detector: &crate::conflict::ConflictDetector,
    resource_set_id: &str,
    snapshot: &[Resource],
    current: &[Resource],
) -> Result<(), CoreError> {
    use crate::conflict::{ExpectedHash, HashSource};

    for before in snapshot {
        let now = find_file(current, &before.name)
            .map(Resource::hash)
            .ok_or_else(|| CoreError::file_not_found(resource_set_id, &before.name))?;
        detector.check_precondition(
            &before.name,
            Some(&ExpectedHash::new(before.hash(), HashSource::Computed)),
            &now,
        )?;
    }
    for after in current {
        if find_file(snapshot, &after.name).is_none() {
            return Err(CoreError::invalid(format!(
                "file '{}' appeared while the operation was running",
                after.name
            )));
        }
    }
    Ok(())
}

/// Restore a whole file set with one `write_all`.
pub(crate) async fn restore_set(
    store: &dyn RemoteStore,
    resource_set_id: &str,
    original: Option<Vec<Resource>>,
    write_attempted: bool,
) -> RollbackOutcome {
    let Some(original) = original else {
        return RollbackOutcome::NothingToUndo;
    };
    if !write_attempted {
        return RollbackOutcome::NothingToUndo;
    }
    match store.write_all(resource_set_id, original).await {
        Ok(_) => RollbackOutcome::RolledBack,
        Err(crate::remote::RemoteError::SetNotFound(id)) => {
            RollbackOutcome::Skipped(format!("resource set '{}' no longer exists", id))
        }
        Err(e) => RollbackOutcome::Failed(e.to_string()),
    }
}
