//! Time-boxed sync plans.
//!
//! A plan is computed once, stored here under a fresh id, and can be
//! executed at most once before it expires. Plans that delete files carry a
//! signed deletion token the caller must echo back. The signing secret lives
//! only as long as the store, so tokens do not survive a restart.

mod token;

pub use token::TokenSigner;

use crate::clock::{millis, Clock};
use crate::hash::ContentHash;
use crate::remote::FileType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_PLAN_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Remote to local mirror.
    Pull,
    /// Local mirror to remote.
    Push,
}

impl std::fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncDirection::Pull => f.write_str("pull"),
            SyncDirection::Push => f.write_str("push"),
        }
    }
}

/// A file the plan touches, with both sides' hashes at planning time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub name: String,
    pub file_type: FileType,
    pub local_hash: Option<ContentHash>,
    pub remote_hash: Option<ContentHash>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanOperations {
    pub add: Vec<PlannedFile>,
    pub update: Vec<PlannedFile>,
    pub delete: Vec<PlannedFile>,
}

impl PlanOperations {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.update.len() + self.delete.len()
    }

    pub fn deletion_names(&self) -> Vec<String> {
        self.delete.iter().map(|f| f.name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub plan_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub direction: SyncDirection,
    pub resource_set_id: String,
    pub operations: PlanOperations,
    /// Present only when the plan deletes files and is not a bootstrap.
    pub deletion_token: Option<String>,
    pub is_bootstrap: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SyncPlan {
    pub fn requires_token(&self) -> bool {
        !self.operations.delete.is_empty() && !self.is_bootstrap
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    #[error("plan {0} not found")]
    NotFound(String),
    #[error("plan {plan_id} expired at {expired_at}")]
    Expired {
        plan_id: String,
        expired_at: DateTime<Utc>,
    },
}

struct StoredPlan {
    plan: SyncPlan,
    nonce: Option<[u8; token::NONCE_LEN]>,
}

/// In-memory plan registry. Share it as `Arc<PlanStore>`.
pub struct PlanStore {
    plans: RwLock<HashMap<String, StoredPlan>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    signer: TokenSigner,
}

impl PlanStore {
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            plans: RwLock::new(HashMap::new()),
            clock,
            ttl,
            signer: TokenSigner::generate(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn plans_read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, StoredPlan>> {
        self.plans.read().unwrap_or_else(|e| e.into_inner())
    }

    fn plans_write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, StoredPlan>> {
        self.plans.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a new plan. Times come from the store's clock.
    pub fn create(
        &self,
        direction: SyncDirection,
        resource_set_id: &str,
        operations: PlanOperations,
        is_bootstrap: bool,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> SyncPlan {
        let plan_id = uuid::Uuid::new_v4().to_string();
        let created_at = self.clock.now();
        let expires_at = created_at + millis(self.ttl.as_millis() as u64);

        let mut plan = SyncPlan {
            plan_id: plan_id.clone(),
            created_at,
            expires_at,
            direction,
            resource_set_id: resource_set_id.to_string(),
            operations,
            deletion_token: None,
            is_bootstrap,
            metadata,
        };

        let nonce = if plan.requires_token() {
            let nonce = TokenSigner::new_nonce();
            plan.deletion_token = Some(self.signer.sign(
                &plan.operations.deletion_names(),
                created_at,
                &plan_id,
                &nonce,
            ));
            Some(nonce)
        } else {
            None
        };

        info!(
            "[plan] created {} ({} {}: {} add, {} update, {} delete, bootstrap={})",
            plan_id,
            direction,
            resource_set_id,
            plan.operations.add.len(),
            plan.operations.update.len(),
            plan.operations.delete.len(),
            is_bootstrap
        );

        self.plans_write().insert(
            plan_id,
            StoredPlan {
                plan: plan.clone(),
                nonce,
            },
        );
        plan
    }

    /// Fetch a plan. An expired plan is evicted and reported as expired.
    pub fn get(&self, plan_id: &str) -> Result<SyncPlan, PlanError> {
        let now = self.clock.now();
        {
            let plans = self.plans_read();
            match plans.get(plan_id) {
                None => return Err(PlanError::NotFound(plan_id.to_string())),
                Some(stored) if now < stored.plan.expires_at => return Ok(stored.plan.clone()),
                Some(_) => {}
            }
        }
        let mut plans = self.plans_write();
        match plans.remove(plan_id) {
            Some(stored) if now >= stored.plan.expires_at => {
                debug!("[plan] evicted expired plan {} on read", plan_id);
                Err(PlanError::Expired {
                    plan_id: plan_id.to_string(),
                    expired_at: stored.plan.expires_at,
                })
            }
            // Raced with a replacement between the two locks; put it back.
            Some(stored) => {
                let plan = stored.plan.clone();
                plans.insert(plan_id.to_string(), stored);
                Ok(plan)
            }
            None => Err(PlanError::NotFound(plan_id.to_string())),
        }
    }

    /// Fetch and remove a plan so it cannot run twice.
    pub fn take(&self, plan_id: &str) -> Result<SyncPlan, PlanError> {
        let now = self.clock.now();
        let stored = self
            .plans_write()
            .remove(plan_id)
            .ok_or_else(|| PlanError::NotFound(plan_id.to_string()))?;
        if now >= stored.plan.expires_at {
            return Err(PlanError::Expired {
                plan_id: plan_id.to_string(),
                expired_at: stored.plan.expires_at,
            });
        }
        Ok(stored.plan)
    }

    /// Check a caller's deletion token against the stored plan. Plans that
    /// need no token accept anything.
    pub fn validate_deletion_token(&self, plan: &SyncPlan, provided: Option<&str>) -> bool {
        let plans = self.plans_read();
        let Some(stored) = plans.get(&plan.plan_id) else {
            return false;
        };
        // Decide from the stored plan, never the caller's copy.
        let original = &stored.plan;
        if !original.requires_token() {
            return true;
        }
        let Some(provided) = provided else {
            return false;
        };
        let Some(nonce) = stored.nonce else {
            return false;
        };
        self.signer.verify(
            provided,
            &original.operations.deletion_names(),
            original.created_at,
            &original.plan_id,
            &nonce,
        )
    }

    /// Remove every expired plan. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut plans = self.plans_write();
        let before = plans.len();
        plans.retain(|_, stored| now < stored.plan.expires_at);
        let removed = before - plans.len();
        if removed > 0 {
            debug!("[plan] swept {} expired plan(s)", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.plans_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep periodically until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.sweep_expired();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn planned(name: &str) -> PlannedFile {
        PlannedFile {
            name: name.to_string(),
            file_type: FileType::Code,
            local_hash: None,
            remote_hash: Some(ContentHash::of_str(name)),
        }
    }

    fn store(clock: Arc<ManualClock>) -> PlanStore {
        PlanStore::new(clock, Duration::from_secs(60))
    }

    fn with_delete() -> PlanOperations {
        PlanOperations {
            add: vec![planned("new")],
            update: vec![],
            delete: vec![planned("old"), planned("older")],
        }
    }

    #[test]
    fn test_create_sets_times_from_clock() {
        let clock = Arc::new(ManualClock::default());
        let s = store(clock.clone());
        let plan = s.create(SyncDirection::Push, "p", PlanOperations::default(), false, BTreeMap::new());
        assert_eq!(plan.created_at, clock.now());
        assert_eq!(plan.expires_at - plan.created_at, chrono::Duration::seconds(60));
        assert!(plan.deletion_token.is_none());
    }

    #[test]
    fn test_token_only_for_non_bootstrap_deletes() {
        let clock = Arc::new(ManualClock::default());
        let s = store(clock);
        let plan = s.create(SyncDirection::Push, "p", with_delete(), false, BTreeMap::new());
        assert!(plan.deletion_token.is_some());
        let boot = s.create(SyncDirection::Push, "p", with_delete(), true, BTreeMap::new());
        assert!(boot.deletion_token.is_none());
        assert!(s.validate_deletion_token(&boot, None));
    }

    #[test]
    fn test_validate_deletion_token() {
        let clock = Arc::new(ManualClock::default());
        let s = store(clock);
        let plan = s.create(SyncDirection::Push, "p", with_delete(), false, BTreeMap::new());
        let token = plan.deletion_token.clone().unwrap();
        assert!(s.validate_deletion_token(&plan, Some(&token)));
        assert!(!s.validate_deletion_token(&plan, None));
        assert!(!s.validate_deletion_token(&plan, Some("00")));

        // Tampering with the caller's copy does not change what is verified.
        let mut tampered = plan.clone();
        tampered.operations.delete.push(planned("everything"));
        assert!(s.validate_deletion_token(&tampered, Some(&token)));
        let other = s.create(SyncDirection::Push, "p", with_delete(), false, BTreeMap::new());
        assert!(!s.validate_deletion_token(&other, Some(&token)));
    }

    #[test]
    fn test_caller_copy_cannot_waive_the_token() {
        let clock = Arc::new(ManualClock::default());
        let s = store(clock);
        let plan = s.create(SyncDirection::Push, "p", with_delete(), false, BTreeMap::new());

        let mut as_bootstrap = plan.clone();
        as_bootstrap.is_bootstrap = true;
        assert!(!s.validate_deletion_token(&as_bootstrap, None));

        let mut no_deletes = plan.clone();
        no_deletes.operations.delete.clear();
        assert!(!s.validate_deletion_token(&no_deletes, None));
    }

    #[test]
    fn test_expired_plan_is_never_returned() {
        let clock = Arc::new(ManualClock::default());
        let s = store(clock.clone());
        let plan = s.create(SyncDirection::Pull, "p", PlanOperations::default(), false, BTreeMap::new());
        assert!(s.get(&plan.plan_id).is_ok());

        clock.advance(chrono::Duration::seconds(60));
        assert!(matches!(s.get(&plan.plan_id), Err(PlanError::Expired { .. })));
        // Evicted on read.
        assert!(matches!(s.get(&plan.plan_id), Err(PlanError::NotFound(_))));
        assert!(s.is_empty());
    }

    #[test]
    fn test_take_consumes_once() {
        let clock = Arc::new(ManualClock::default());
        let s = store(clock);
        let plan = s.create(SyncDirection::Pull, "p", PlanOperations::default(), false, BTreeMap::new());
        assert_eq!(s.take(&plan.plan_id).unwrap(), plan);
        assert!(matches!(s.take(&plan.plan_id), Err(PlanError::NotFound(_))));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let clock = Arc::new(ManualClock::default());
        let s = store(clock.clone());
        s.create(SyncDirection::Pull, "p", PlanOperations::default(), false, BTreeMap::new());
        clock.advance(chrono::Duration::seconds(30));
        let young = s.create(SyncDirection::Pull, "p", PlanOperations::default(), false, BTreeMap::new());
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(s.sweep_expired(), 1);
        assert_eq!(s.len(), 1);
        assert!(s.get(&young.plan_id).is_ok());
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let clock = Arc::new(ManualClock::default());
        let s = Arc::new(store(clock.clone()));
        s.create(SyncDirection::Pull, "p", PlanOperations::default(), false, BTreeMap::new());
        clock.advance(chrono::Duration::seconds(120));
        let handle = s.spawn_sweeper(Duration::from_millis(10));
        for _ in 0..100 {
            if s.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(s.is_empty());
        drop(s);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
