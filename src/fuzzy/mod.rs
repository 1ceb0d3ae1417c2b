//! Locating text spans when the caller's copy is only approximately right.
//!
//! Search runs as a chain of strategies (see [`strategy`]): verbatim
//! substring, whitespace-normalized substring, then a time-boxed approximate
//! scan. All positions are byte offsets into the original document, and a
//! returned match's `matched_text` is always exactly
//! `document[position..end_position]`.

pub mod distance;
mod edits;
pub mod filter;
pub mod normalize;
pub mod strategy;

pub use edits::{apply_edits, EditOperation, PlannedEdit};
pub use strategy::{
    default_chain, ApproximateStrategy, ExactStrategy, MatchStrategy, NormalizedStrategy,
    Outcome, SearchContext,
};

use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Default wall-clock budget for one search.
pub const DEFAULT_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Which phase produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Normalized,
    Approximate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub position: usize,
    pub end_position: usize,
    pub matched_text: String,
    pub similarity: f64,
    pub kind: MatchKind,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum FuzzyError {
    #[error("search text is empty")]
    EmptySearch,
    #[error("similarity threshold {0} is outside (0, 1]")]
    InvalidThreshold(f64),
    #[error("search text not found (required similarity {required:.2})")]
    NotFound {
        required: f64,
        best_similarity: Option<f64>,
    },
    #[error("search text matches {} locations; an occurrence index is required", positions.len())]
    Ambiguous { positions: Vec<usize> },
    #[error("occurrence {index} requested but only {count} found")]
    OccurrenceOutOfRange { index: usize, count: usize },
    #[error("approximate search exceeded its {budget_ms} ms budget")]
    SearchTimeout { elapsed_ms: u64, budget_ms: u64 },
    #[error("edits {first} and {second} target overlapping text")]
    Overlap {
        first: usize,
        second: usize,
        first_span: (usize, usize),
        second_span: (usize, usize),
    },
    #[error("edit {index}: {source}")]
    Edit {
        index: usize,
        #[source]
        source: Box<FuzzyError>,
    },
}

/// Runs the strategy chain.
pub struct FuzzyMatcher {
    strategies: Vec<Box<dyn MatchStrategy>>,
    search_timeout: Duration,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_TIMEOUT)
    }
}

impl FuzzyMatcher {
    pub fn new(search_timeout: Duration) -> Self {
        Self::with_strategies(default_chain(), search_timeout)
    }

    pub fn with_strategies(strategies: Vec<Box<dyn MatchStrategy>>, search_timeout: Duration) -> Self {
        Self {
            strategies,
            search_timeout,
        }
    }

    /// All matches from the first phase that finds any, in document order.
    pub fn find_occurrences(
        &self,
        document: &str,
        target: &str,
        min_similarity: f64,
    ) -> Result<Vec<Match>, FuzzyError> {
        if target.is_empty() {
            return Err(FuzzyError::EmptySearch);
        }
        if !(min_similarity > 0.0 && min_similarity <= 1.0) {
            return Err(FuzzyError::InvalidThreshold(min_similarity));
        }

        let cx = SearchContext::new(document, target, min_similarity, self.search_timeout);
        let mut best_similarity = None;
        for strategy in &self.strategies {
            match strategy.search(&cx)? {
                Outcome::Found(matches) => {
                    debug!(
                        "[fuzzy] {} phase found {} match(es)",
                        strategy.name(),
                        matches.len()
                    );
                    return Ok(matches);
                }
                Outcome::Defer {
                    best_similarity: seen,
                } => {
                    if seen.is_some() {
                        best_similarity = seen;
                    }
                }
            }
        }
        Err(FuzzyError::NotFound {
            required: min_similarity,
            best_similarity,
        })
    }

    /// The earliest match.
    pub fn find_match(
        &self,
        document: &str,
        target: &str,
        min_similarity: f64,
    ) -> Result<Match, FuzzyError> {
        let mut matches = self.find_occurrences(document, target, min_similarity)?;
        Ok(matches.swap_remove(0))
    }

    /// A single match, disambiguated by a zero-based occurrence index when the
    /// target appears more than once.
    pub fn find_unique(
        &self,
        document: &str,
        target: &str,
        min_similarity: f64,
        occurrence: Option<usize>,
    ) -> Result<Match, FuzzyError> {
        let mut matches = self.find_occurrences(document, target, min_similarity)?;
        match occurrence {
            Some(index) if index < matches.len() => Ok(matches.swap_remove(index)),
            Some(index) => Err(FuzzyError::OccurrenceOutOfRange {
                index,
                count: matches.len(),
            }),
            None if matches.len() > 1 => Err(FuzzyError::Ambiguous {
                positions: matches.iter().map(|m| m.position).collect(),
            }),
            None => Ok(matches.swap_remove(0)),
        }
    }
}
