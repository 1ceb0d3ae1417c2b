//! Consistency core for mirroring a remote file store.
//!
//! The remote store offers plain reads and writes with no versioning or
//! locking. This crate layers on top of it: content hashes for change
//! detection, fuzzy text location for edits, cross-process locks, two-phase
//! mutations with rollback, optimistic conflict checks and time-boxed sync
//! plans guarded by signed deletion tokens.

pub mod cli;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fuzzy;
pub mod hash;
pub mod lock;
pub mod mirror;
pub mod operation;
pub mod plan;
pub mod remote;
pub mod service;
pub mod sync;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CoreConfig;
pub use conflict::{Conflict, ConflictDetector, ExpectedHash, HashSource};
pub use error::{CoreError, Missing, RollbackOutcome};
pub use fuzzy::{EditOperation, FuzzyMatcher, Match, MatchKind};
pub use hash::ContentHash;
pub use lock::{LockHandle, LockManager, LockRecord, LockSettings};
pub use mirror::{LocalMirror, SyncStateFile};
pub use operation::{EditOutcome, OperationManager, OperationState, OperationStrategy};
pub use plan::{PlanStore, SyncDirection, SyncPlan};
pub use remote::{ContentValidator, DirStore, FileType, MemoryStore, RemoteStore, Resource};
pub use service::{DeleteRequest, EditRequest, FileContent, MirrorSync, MoveRequest};
pub use sync::SyncResult;
