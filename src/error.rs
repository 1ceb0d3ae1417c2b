//! Caller-facing error taxonomy.
//!
//! Each feature area has its own error enum; they all fold into
//! [`CoreError`], whose variants tell an automated caller whether to retry,
//! refetch, force or replan. [`CoreError::details`] renders the structured
//! payload as JSON.

use crate::conflict::Conflict;
use crate::fuzzy::FuzzyError;
use crate::lock::{LockError, LockRecord};
use crate::mirror::MirrorError;
use crate::plan::PlanError;
use crate::remote::RemoteError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// What could not be found.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Missing {
    ResourceSet {
        resource_set_id: String,
    },
    File {
        resource_set_id: String,
        file_name: String,
    },
    Text {
        edit_index: Option<usize>,
        required_similarity: f64,
        best_similarity: Option<f64>,
    },
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Missing::ResourceSet { resource_set_id } => {
                write!(f, "resource set '{}'", resource_set_id)
            }
            Missing::File {
                resource_set_id,
                file_name,
            } => write!(f, "file '{}' in '{}'", file_name, resource_set_id),
            Missing::Text {
                edit_index: Some(i),
                required_similarity,
                ..
            } => write!(
                f,
                "search text of edit {} (similarity >= {:.2})",
                i, required_similarity
            ),
            Missing::Text {
                required_similarity,
                ..
            } => write!(f, "search text (similarity >= {:.2})", required_similarity),
        }
    }
}

/// What happened when a failed operation tried to undo its writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// No remote write had been attempted.
    NothingToUndo,
    RolledBack,
    /// The resource was gone by the time rollback ran.
    Skipped(String),
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("timed out after {waited_ms} ms waiting for lock on '{resource_key}'")]
    LockTimeout {
        resource_key: String,
        holder: Option<LockRecord>,
        waited_ms: u64,
    },
    #[error("'{}' changed: expected {} but found {}", .0.file_name, .0.expected_hash.short(), .0.current_hash.short())]
    Conflict(Box<Conflict>),
    #[error("{0} not found")]
    NotFound(Missing),
    #[error("search text matches {} locations; pass an occurrence index", positions.len())]
    Ambiguous {
        edit_index: Option<usize>,
        positions: Vec<usize>,
    },
    #[error("plan {plan_id} not found")]
    PlanNotFound { plan_id: String },
    #[error("plan {plan_id} expired at {expired_at}")]
    PlanExpired {
        plan_id: String,
        expired_at: DateTime<Utc>,
    },
    #[error("search exceeded its {budget_ms} ms budget")]
    SearchTimeout {
        edit_index: Option<usize>,
        elapsed_ms: u64,
        budget_ms: u64,
    },
    #[error("deletion token is missing or invalid for plan {plan_id}")]
    InvalidDeletionToken { plan_id: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Remote(RemoteError),
    #[error(transparent)]
    Mirror(#[from] MirrorError),
    #[error("{source} (rollback: {rollback:?})")]
    ApplyFailed {
        #[source]
        source: Box<CoreError>,
        rollback: RollbackOutcome,
    },
    #[error(transparent)]
    Lock(LockError),
}

impl CoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        CoreError::InvalidInput(message.into())
    }

    pub fn file_not_found(resource_set_id: &str, file_name: &str) -> Self {
        CoreError::NotFound(Missing::File {
            resource_set_id: resource_set_id.to_string(),
            file_name: file_name.to_string(),
        })
    }

    /// Stable machine-readable name of the variant.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::LockTimeout { .. } => "lock_timeout",
            CoreError::Conflict(_) => "conflict",
            CoreError::NotFound(_) => "not_found",
            CoreError::Ambiguous { .. } => "ambiguous",
            CoreError::PlanNotFound { .. } => "plan_not_found",
            CoreError::PlanExpired { .. } => "plan_expired",
            CoreError::SearchTimeout { .. } => "search_timeout",
            CoreError::InvalidDeletionToken { .. } => "invalid_deletion_token",
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::Remote(_) => "remote",
            CoreError::Mirror(_) => "mirror",
            CoreError::ApplyFailed { .. } => "apply_failed",
            CoreError::Lock(_) => "lock",
        }
    }

    /// Whether the same call may succeed later without caller changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::LockTimeout { .. } => true,
            CoreError::ApplyFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The error as JSON: `code`, `message`, and the variant's data.
    pub fn details(&self) -> Value {
        let data = match self {
            CoreError::LockTimeout {
                resource_key,
                holder,
                waited_ms,
            } => json!({
                "resource_key": resource_key,
                "holder": holder,
                "waited_ms": waited_ms,
            }),
            CoreError::Conflict(conflict) => json!(conflict),
            CoreError::NotFound(missing) => json!(missing),
            CoreError::Ambiguous {
                edit_index,
                positions,
            } => json!({ "edit_index": edit_index, "positions": positions }),
            CoreError::PlanNotFound { plan_id } | CoreError::InvalidDeletionToken { plan_id } => {
                json!({ "plan_id": plan_id })
            }
            CoreError::PlanExpired {
                plan_id,
                expired_at,
            } => json!({ "plan_id": plan_id, "expired_at": expired_at }),
            CoreError::SearchTimeout {
                edit_index,
                elapsed_ms,
                budget_ms,
            } => json!({
                "edit_index": edit_index,
                "elapsed_ms": elapsed_ms,
                "budget_ms": budget_ms,
            }),
            CoreError::ApplyFailed { source, rollback } => json!({
                "cause": source.details(),
                "rollback": rollback,
            }),
            CoreError::InvalidInput(_)
            | CoreError::Remote(_)
            | CoreError::Mirror(_)
            | CoreError::Lock(_) => Value::Null,
        };
        json!({
            "code": self.code(),
            "message": self.to_string(),
            "data": data,
        })
    }

    fn from_fuzzy(err: FuzzyError, edit_index: Option<usize>) -> Self {
        match err {
            FuzzyError::Edit { index, source } => CoreError::from_fuzzy(*source, Some(index)),
            FuzzyError::NotFound {
                required,
                best_similarity,
            } => CoreError::NotFound(Missing::Text {
                edit_index,
                required_similarity: required,
                best_similarity,
            }),
            FuzzyError::Ambiguous { positions } => CoreError::Ambiguous {
                edit_index,
                positions,
            },
            FuzzyError::SearchTimeout {
                elapsed_ms,
                budget_ms,
            } => CoreError::SearchTimeout {
                edit_index,
                elapsed_ms,
                budget_ms,
            },
            other => match edit_index {
                Some(i) => CoreError::InvalidInput(format!("edit {}: {}", i, other)),
                None => CoreError::InvalidInput(other.to_string()),
            },
        }
    }
}

impl From<FuzzyError> for CoreError {
    fn from(err: FuzzyError) -> Self {
        CoreError::from_fuzzy(err, None)
    }
}

impl From<Conflict> for CoreError {
    fn from(conflict: Conflict) -> Self {
        CoreError::Conflict(Box::new(conflict))
    }
}

impl From<LockError> for CoreError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout {
                resource_key,
                holder,
                waited_ms,
            } => CoreError::LockTimeout {
                resource_key,
                holder,
                waited_ms,
            },
            other => CoreError::Lock(other),
        }
    }
}

impl From<PlanError> for CoreError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::NotFound(plan_id) => CoreError::PlanNotFound { plan_id },
            PlanError::Expired {
                plan_id,
                expired_at,
            } => CoreError::PlanExpired {
                plan_id,
                expired_at,
            },
        }
    }
}

impl From<RemoteError> for CoreError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::SetNotFound(resource_set_id) => {
                CoreError::NotFound(Missing::ResourceSet { resource_set_id })
            }
            other => CoreError::Remote(other),
        }
    }
}
