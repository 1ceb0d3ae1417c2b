//! The ordered matcher phases.
//!
//! Each strategy either settles the search (`Outcome::Found`) or hands it to
//! the next one (`Outcome::Defer`). Strategies are tried cheapest first.

use super::distance::{prefix_distances, similarity};
use super::filter::{default_filters, Candidate, Signature, TargetProfile, WindowFilter};
use super::normalize::{normalize, NormalizedText};
use super::{FuzzyError, Match, MatchKind};
use std::cell::OnceCell;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tracing::debug;

/// How much DP work (in cells) the approximate scan does between clock reads.
const DEADLINE_CHECK_CELLS: usize = 1 << 16;

/// Inputs shared by every phase of one search.
pub struct SearchContext<'a> {
    pub document: &'a str,
    pub target: &'a str,
    pub min_similarity: f64,
    started: Instant,
    budget: Duration,
    normalized_document: OnceCell<NormalizedText>,
    normalized_target: OnceCell<NormalizedText>,
}

impl<'a> SearchContext<'a> {
    pub fn new(document: &'a str, target: &'a str, min_similarity: f64, budget: Duration) -> Self {
        Self {
            document,
            target,
            min_similarity,
            started: Instant::now(),
            budget,
            normalized_document: OnceCell::new(),
            normalized_target: OnceCell::new(),
        }
    }

    pub fn normalized_document(&self) -> &NormalizedText {
        self.normalized_document.get_or_init(|| normalize(self.document))
    }

    pub fn normalized_target(&self) -> &NormalizedText {
        self.normalized_target.get_or_init(|| normalize(self.target))
    }

    fn check_deadline(&self) -> Result<(), FuzzyError> {
        let elapsed = self.started.elapsed();
        if elapsed > self.budget {
            return Err(FuzzyError::SearchTimeout {
                elapsed_ms: elapsed.as_millis() as u64,
                budget_ms: self.budget.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// Build a match from a byte range of the original document.
    fn slice(&self, start: usize, end: usize, similarity: f64, kind: MatchKind) -> Match {
        Match {
            position: start,
            end_position: end,
            matched_text: self.document[start..end].to_string(),
            similarity,
            kind,
        }
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// All matches this phase found, in document order. Never empty.
    Found(Vec<Match>),
    /// Nothing definitive; the best similarity seen, if the phase scores.
    Defer { best_similarity: Option<f64> },
}

impl Outcome {
    fn defer() -> Self {
        Outcome::Defer {
            best_similarity: None,
        }
    }
}

pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn search(&self, cx: &SearchContext<'_>) -> Result<Outcome, FuzzyError>;
}

/// Verbatim substring search.
#[derive(Debug, Default)]
pub struct ExactStrategy;

impl MatchStrategy for ExactStrategy {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn search(&self, cx: &SearchContext<'_>) -> Result<Outcome, FuzzyError> {
        let found: Vec<Match> = cx
            .document
            .match_indices(cx.target)
            .map(|(pos, _)| cx.slice(pos, pos + cx.target.len(), 1.0, MatchKind::Exact))
            .collect();
        if found.is_empty() {
            Ok(Outcome::defer())
        } else {
            Ok(Outcome::Found(found))
        }
    }
}

/// Substring search after whitespace normalization of both sides.
#[derive(Debug, Default)]
pub struct NormalizedStrategy;

impl MatchStrategy for NormalizedStrategy {
    fn name(&self) -> &'static str {
        "whitespace"
    }

    fn search(&self, cx: &SearchContext<'_>) -> Result<Outcome, FuzzyError> {
        let target = &cx.normalized_target().text;
        if target.is_empty() {
            return Ok(Outcome::defer());
        }
        let doc = cx.normalized_document();
        let found: Vec<Match> = doc
            .text
            .match_indices(target.as_str())
            .filter_map(|(pos, _)| doc.source_range(pos, pos + target.len()))
            .map(|(start, end)| cx.slice(start, end, 1.0, MatchKind::Normalized))
            .collect();
        if found.is_empty() {
            Ok(Outcome::defer())
        } else {
            Ok(Outcome::Found(found))
        }
    }
}

/// Sliding-window edit-distance search over the normalized document.
pub struct ApproximateStrategy {
    filters: Vec<Box<dyn WindowFilter>>,
}

impl Default for ApproximateStrategy {
    fn default() -> Self {
        Self {
            filters: default_filters(),
        }
    }
}

impl ApproximateStrategy {
    pub fn with_filters(filters: Vec<Box<dyn WindowFilter>>) -> Self {
        Self { filters }
    }
}

struct Best {
    score: f64,
    start: usize,
    len: usize,
}

impl MatchStrategy for ApproximateStrategy {
    fn name(&self) -> &'static str {
        "approximate"
    }

    fn search(&self, cx: &SearchContext<'_>) -> Result<Outcome, FuzzyError> {
        let min = cx.min_similarity;
        // At 1.0 only identical windows qualify, and the earlier phases already
        // looked for those.
        if min >= 1.0 {
            return Ok(Outcome::defer());
        }

        let target: Vec<char> = cx.normalized_target().text.chars().collect();
        let m = target.len();
        if m == 0 {
            return Ok(Outcome::defer());
        }
        let doc = cx.normalized_document();
        let positions: Vec<(usize, char)> = doc.text.char_indices().collect();
        let chars: Vec<char> = positions.iter().map(|&(_, c)| c).collect();
        let n = chars.len();

        // A window of length L scores at most min(L, m) / max(L, m).
        let min_len = ((m as f64 * min).ceil() as usize).max(1);
        let max_len = ((m as f64 / min).floor() as usize).max(m);
        let profile = TargetProfile {
            len: m,
            signature: Signature::of(&target),
            max_distance: ((1.0 - min) * max_len as f64).floor() as usize,
            length_slack: (max_len - m).max(m - min_len.min(m)),
        };
        if n < min_len {
            return Ok(Outcome::defer());
        }

        let mut best: Option<Best> = None;
        let mut best_seen: Option<f64> = None;
        let mut rejected = 0usize;
        let mut signature = Signature::of(&chars[..m.min(n)]);
        // Work since the last clock read; starts count as one cell each.
        let mut cells = DEADLINE_CHECK_CELLS;
        let mut timed_out = None;

        for start in 0..=(n - min_len) {
            cells += 1;
            if cells >= DEADLINE_CHECK_CELLS {
                cells = 0;
                cx.check_deadline()?;
            }
            if start > 0 {
                signature.remove(chars[start - 1]);
                if start + m - 1 < n {
                    signature.add(chars[start + m - 1]);
                }
            }

            let candidate = Candidate {
                len: (n - start).min(m),
                signature: &signature,
            };
            if self
                .filters
                .iter()
                .any(|f| f.reject(&profile, &candidate))
            {
                rejected += 1;
                continue;
            }

            let window = &chars[start..(start + max_len).min(n)];
            prefix_distances(&target, window, profile.max_distance, |len, distance| {
                cells += m;
                if cells >= DEADLINE_CHECK_CELLS {
                    cells = 0;
                    if let Err(e) = cx.check_deadline() {
                        timed_out = Some(e);
                        return ControlFlow::Break(());
                    }
                }
                if len < min_len {
                    return ControlFlow::Continue(());
                }
                let score = similarity(distance, len, m);
                if best_seen.map_or(true, |b| score > b) {
                    best_seen = Some(score);
                }
                if score < min {
                    return ControlFlow::Continue(());
                }
                let better = match &best {
                    None => true,
                    Some(b) if score > b.score + f64::EPSILON => true,
                    Some(b) => {
                        (score - b.score).abs() <= f64::EPSILON
                            && b.start == start
                            && len.abs_diff(m) < b.len.abs_diff(m)
                    }
                };
                if better {
                    best = Some(Best { score, start, len });
                }
                ControlFlow::Continue(())
            });
            if let Some(e) = timed_out.take() {
                return Err(e);
            }

            // Nothing later can beat a perfect score at an earlier position.
            if best.as_ref().is_some_and(|b| b.score >= 1.0) {
                break;
            }
        }

        debug!(
            "[fuzzy] approximate scan: {} starts, {} rejected by filters, best {:?}",
            n - min_len + 1,
            rejected,
            best_seen
        );

        let Some(best) = best else {
            return Ok(Outcome::Defer {
                best_similarity: best_seen,
            });
        };

        let norm_start = positions[best.start].0;
        let last = positions[best.start + best.len - 1];
        let norm_end = last.0 + last.1.len_utf8();
        let Some((start, end)) = doc.source_range(norm_start, norm_end) else {
            return Ok(Outcome::defer());
        };
        Ok(Outcome::Found(vec![cx.slice(
            start,
            end,
            best.score,
            MatchKind::Approximate,
        )]))
    }
}

/// The standard chain: exact, then whitespace-normalized, then approximate.
pub fn default_chain() -> Vec<Box<dyn MatchStrategy>> {
    vec![
        Box::new(ExactStrategy),
        Box::new(NormalizedStrategy),
        Box::new(ApproximateStrategy::default()),
    ]
}
