//! Reconciling a resource set with its local mirror.
//!
//! Planning compares both sides by content hash and records what a run
//! would add, update and delete, together with the hashes each side had at
//! planning time. Execution replays exactly that plan and refuses to run if
//! either side has moved since.

mod strategy;

pub use strategy::{PullStrategy, PushStrategy};

use crate::conflict::{ConflictDetector, ExpectedHash, HashSource};
use crate::error::CoreError;
use crate::hash::ContentHash;
use crate::mirror::LocalFile;
use crate::plan::{PlanOperations, PlannedFile, SyncDirection};
use crate::remote::{FileType, Resource};
use serde::Serialize;
use std::collections::BTreeMap;

/// Result of an executed plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncResult {
    pub plan_id: String,
    pub direction: SyncDirection,
    pub resource_set_id: String,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    /// Hash of every file written, by name.
    pub hashes: BTreeMap<String, ContentHash>,
}

impl SyncResult {
    pub fn changed(&self) -> usize {
        self.added.len() + self.updated.len() + self.deleted.len()
    }
}

/// One side of a sync, reduced to what planning needs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Entry {
    pub file_type: FileType,
    pub hash: ContentHash,
}

pub(crate) fn remote_entries(files: &[Resource]) -> BTreeMap<String, Entry> {
    files
        .iter()
        .map(|r| {
            (
                r.name.clone(),
                Entry {
                    file_type: r.file_type,
                    hash: r.hash(),
                },
            )
        })
        .collect()
}

pub(crate) fn local_entries(files: &[LocalFile]) -> BTreeMap<String, Entry> {
    files
        .iter()
        .map(|f| {
            (
                f.name.clone(),
                Entry {
                    file_type: f.file_type,
                    hash: f.hash(),
                },
            )
        })
        .collect()
}

/// Work out what a sync in `direction` has to do. Bootstrap runs never
/// delete.
pub fn classify(
    direction: SyncDirection,
    remote: &[Resource],
    local: &[LocalFile],
    is_bootstrap: bool,
) -> PlanOperations {
    let remote = remote_entries(remote);
    let local = local_entries(local);
    let (source, dest) = match direction {
        SyncDirection::Pull => (&remote, &local),
        SyncDirection::Push => (&local, &remote),
    };

    let planned = |name: &str, file_type: FileType| PlannedFile {
        name: name.to_string(),
        file_type,
        local_hash: local.get(name).map(|e| e.hash.clone()),
        remote_hash: remote.get(name).map(|e| e.hash.clone()),
    };

    let mut ops = PlanOperations::default();
    for (name, entry) in source {
        match dest.get(name) {
            None => ops.add.push(planned(name, entry.file_type)),
            Some(existing) if existing.hash != entry.hash => {
                ops.update.push(planned(name, entry.file_type))
            }
            Some(_) => {}
        }
    }
    if !is_bootstrap {
        for (name, entry) in dest {
            if !source.contains_key(name) {
                ops.delete.push(planned(name, entry.file_type));
            }
        }
    }
    ops
}

/// Every file the plan touches, in add, update, delete order.
pub(crate) fn touched(ops: &PlanOperations) -> impl Iterator<Item = &PlannedFile> {
    ops.add.iter().chain(ops.update.iter()).chain(ops.delete.iter())
}

/// Compare one side against its planning-time hashes.
pub(crate) fn check_drift(
    detector: &ConflictDetector,
    resource_set_id: &str,
    plan_id: &str,
    ops: &PlanOperations,
    side: &BTreeMap<String, Entry>,
    plan_hash: impl Fn(&PlannedFile) -> Option<&ContentHash>,
) -> Result<(), CoreError> {
    for file in touched(ops) {
        match (plan_hash(file), side.get(&file.name)) {
            (Some(expected), Some(now)) => detector.check_precondition(
                &file.name,
                Some(&ExpectedHash::new(expected.clone(), HashSource::Computed)),
                &now.hash,
            )?,
            (Some(_), None) => return Err(CoreError::file_not_found(resource_set_id, &file.name)),
            (None, Some(_)) => {
                return Err(CoreError::invalid(format!(
                    "'{}' appeared after plan {} was made; plan again",
                    file.name, plan_id
                )))
            }
            (None, None) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(files: &[(&str, &str)]) -> Vec<Resource> {
        files
            .iter()
            .map(|(n, c)| Resource::new(*n, FileType::Code, *c))
            .collect()
    }

    fn local(files: &[(&str, &str)]) -> Vec<LocalFile> {
        files
            .iter()
            .map(|(n, c)| LocalFile {
                name: n.to_string(),
                file_type: FileType::Code,
                content: c.to_string(),
            })
            .collect()
    }

    fn names(files: &[PlannedFile]) -> Vec<&str> {
        files.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_classify_pull() {
        let ops = classify(
            SyncDirection::Pull,
            &remote(&[("a", "1"), ("b", "2"), ("c", "3")]),
            &local(&[("b", "2"), ("c", "changed"), ("d", "4")]),
            false,
        );
        assert_eq!(names(&ops.add), vec!["a"]);
        assert_eq!(names(&ops.update), vec!["c"]);
        assert_eq!(names(&ops.delete), vec!["d"]);
        assert_eq!(ops.update[0].remote_hash, Some(ContentHash::of_str("3")));
        assert_eq!(ops.update[0].local_hash, Some(ContentHash::of_str("changed")));
    }

    #[test]
    fn test_classify_push_is_mirror_image() {
        let ops = classify(
            SyncDirection::Push,
            &remote(&[("a", "1"), ("b", "2")]),
            &local(&[("b", "2"), ("d", "4")]),
            false,
        );
        assert_eq!(names(&ops.add), vec!["d"]);
        assert!(ops.update.is_empty());
        assert_eq!(names(&ops.delete), vec!["a"]);
    }

    #[test]
    fn test_bootstrap_never_deletes() {
        let ops = classify(
            SyncDirection::Pull,
            &remote(&[("a", "1")]),
            &local(&[("x", "9")]),
            true,
        );
        assert_eq!(names(&ops.add), vec!["a"]);
        assert!(ops.delete.is_empty());
    }

    #[test]
    fn test_drift_is_a_computed_conflict() {
        let ops = classify(SyncDirection::Pull, &remote(&[("a", "1")]), &local(&[("a", "0")]), false);
        let now = remote_entries(&remote(&[("a", "2")]));
        let err = check_drift(&ConflictDetector::default(), "p", "plan", &ops, &now, |f| {
            f.remote_hash.as_ref()
        })
        .unwrap_err();
        match err {
            CoreError::Conflict(c) => assert_eq!(c.source, HashSource::Computed),
            other => panic!("unexpected {other:?}"),
        }
    }
}
