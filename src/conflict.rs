//! Optimistic-concurrency checks before a write.
//!
//! The remote store cannot refuse a stale write, so every write that names
//! an expected hash is checked here against the live hash first. The hash is
//! authoritative even while the resource lock is held: writers that bypass
//! the lock (other tools, the store's own editor) are only caught this way.

use crate::hash::ContentHash;
use serde::Serialize;
use similar::TextDiff;
use tracing::warn;

/// Default ceiling for the diff carried by a conflict.
pub const DEFAULT_DIFF_LIMIT: usize = 16 * 1024;

/// Where an expected hash came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HashSource {
    /// Passed in by the caller.
    Caller,
    /// Recorded from an earlier read or sync.
    Cached,
    /// Computed by this process earlier in the same operation or plan.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedHash {
    pub hash: ContentHash,
    pub source: HashSource,
}

impl ExpectedHash {
    pub fn new(hash: ContentHash, source: HashSource) -> Self {
        Self { hash, source }
    }

    pub fn caller(hash: impl AsRef<str>) -> Self {
        Self::new(ContentHash::from_hex(hash), HashSource::Caller)
    }
}

/// A refused write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conflict {
    pub file_name: String,
    pub expected_hash: ContentHash,
    pub current_hash: ContentHash,
    pub source: HashSource,
    /// Unified diff from the expected version to the current one, when the
    /// expected content is known.
    pub diff: Option<String>,
    pub diff_truncated: bool,
}

/// Outcome of a passed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No expected hash was given.
    Unchecked,
    Matched,
    /// The hashes differed and the caller forced the write.
    Forced,
}

/// Inputs for a write-time check.
#[derive(Debug, Clone, Copy)]
pub struct WriteCheck<'a> {
    pub file_name: &'a str,
    pub expected: Option<&'a ExpectedHash>,
    pub current_content: &'a str,
    /// Content the expected hash describes, if available, for the diff.
    pub expected_content: Option<&'a str>,
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct ConflictDetector {
    diff_limit: usize,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DIFF_LIMIT)
    }
}

impl ConflictDetector {
    pub fn new(diff_limit: usize) -> Self {
        Self { diff_limit }
    }

    /// Pure hash comparison: a conflict iff an expected hash is present and
    /// differs from the current one.
    pub fn check_precondition(
        &self,
        file_name: &str,
        expected: Option<&ExpectedHash>,
        current: &ContentHash,
    ) -> Result<(), Conflict> {
        match expected {
            Some(e) if &e.hash != current => Err(Conflict {
                file_name: file_name.to_string(),
                expected_hash: e.hash.clone(),
                current_hash: current.clone(),
                source: e.source,
                diff: None,
                diff_truncated: false,
            }),
            _ => Ok(()),
        }
    }

    /// Full write-time check: hash comparison, diff on conflict, and the
    /// explicit `force` bypass.
    pub fn verify(&self, check: WriteCheck<'_>) -> Result<Verdict, Conflict> {
        let Some(expected) = check.expected else {
            return Ok(Verdict::Unchecked);
        };
        let current = ContentHash::of_str(check.current_content);
        match self.check_precondition(check.file_name, Some(expected), &current) {
            Ok(()) => Ok(Verdict::Matched),
            Err(conflict) if check.force => {
                warn!(
                    "[conflict] forcing write to '{}': expected {} ({:?}) but found {}",
                    check.file_name,
                    conflict.expected_hash.short(),
                    conflict.source,
                    conflict.current_hash.short()
                );
                Ok(Verdict::Forced)
            }
            Err(mut conflict) => {
                if let Some(base) = check.expected_content {
                    if ContentHash::of_str(base) == expected.hash {
                        let (diff, truncated) =
                            self.unified_diff(check.file_name, base, check.current_content);
                        conflict.diff = Some(diff);
                        conflict.diff_truncated = truncated;
                    }
                }
                Err(conflict)
            }
        }
    }

    /// Unified diff of `old` to `new`, cut at the size ceiling on a char
    /// boundary with an explicit marker.
    pub fn unified_diff(&self, file_name: &str, old: &str, new: &str) -> (String, bool) {
        let diff = TextDiff::from_lines(old, new)
            .unified_diff()
            .context_radius(3)
            .header(&format!("a/{}", file_name), &format!("b/{}", file_name))
            .to_string();
        if diff.len() <= self.diff_limit {
            return (diff, false);
        }
        let mut cut = self.diff_limit;
        while !diff.is_char_boundary(cut) {
            cut -= 1;
        }
        let omitted = diff.len() - cut;
        let mut out = diff[..cut].to_string();
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&format!("... [diff truncated: {} more bytes]\n", omitted));
        (out, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> ConflictDetector {
        ConflictDetector::default()
    }

    #[test]
    fn test_conflict_iff_expected_present_and_different() {
        let h1 = ContentHash::of_str("one");
        let h2 = ContentHash::of_str("two");
        let d = detector();
        assert!(d.check_precondition("f", None, &h1).is_ok());
        assert!(d
            .check_precondition("f", Some(&ExpectedHash::new(h1.clone(), HashSource::Caller)), &h1)
            .is_ok());
        let conflict = d
            .check_precondition("f", Some(&ExpectedHash::new(h1.clone(), HashSource::Cached)), &h2)
            .unwrap_err();
        assert_eq!(conflict.expected_hash, h1);
        assert_eq!(conflict.current_hash, h2);
        assert_eq!(conflict.source, HashSource::Cached);
    }

    #[test]
    fn test_verify_attaches_diff() {
        let base = "line one\nline two\n";
        let current = "line one\nline 2\n";
        let expected = ExpectedHash::new(ContentHash::of_str(base), HashSource::Caller);
        let conflict = detector()
            .verify(WriteCheck {
                file_name: "Code",
                expected: Some(&expected),
                current_content: current,
                expected_content: Some(base),
                force: false,
            })
            .unwrap_err();
        let diff = conflict.diff.unwrap();
        assert!(diff.contains("-line two"));
        assert!(diff.contains("+line 2"));
        assert!(!conflict.diff_truncated);
    }

    #[test]
    fn test_verify_skips_diff_when_base_does_not_match_hash() {
        let expected = ExpectedHash::caller(ContentHash::of_str("elsewhere").as_str());
        let conflict = detector()
            .verify(WriteCheck {
                file_name: "Code",
                expected: Some(&expected),
                current_content: "now",
                expected_content: Some("stale mirror copy"),
                force: false,
            })
            .unwrap_err();
        assert!(conflict.diff.is_none());
    }

    #[test]
    fn test_force_bypasses_and_is_distinct() {
        let expected = ExpectedHash::caller("deadbeef");
        let verdict = detector()
            .verify(WriteCheck {
                file_name: "Code",
                expected: Some(&expected),
                current_content: "anything",
                expected_content: None,
                force: true,
            })
            .unwrap();
        assert_eq!(verdict, Verdict::Forced);

        let verdict = detector()
            .verify(WriteCheck {
                file_name: "Code",
                expected: None,
                current_content: "anything",
                expected_content: None,
                force: false,
            })
            .unwrap();
        assert_eq!(verdict, Verdict::Unchecked);
    }

    #[test]
    fn test_diff_truncation_marker() {
        let old: String = (0..500).map(|i| format!("old line {}\n", i)).collect();
        let new: String = (0..500).map(|i| format!("new line {}\n", i)).collect();
        let (diff, truncated) = ConflictDetector::new(256).unified_diff("big", &old, &new);
        assert!(truncated);
        assert!(diff.ends_with("more bytes]\n"));
        assert!(diff.len() < 400);
    }
}
