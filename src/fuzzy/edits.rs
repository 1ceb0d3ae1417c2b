//! Batches of search/replace edits against one document.

use super::{FuzzyError, FuzzyMatcher, Match};
use serde::{Deserialize, Serialize};

/// One requested replacement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditOperation {
    pub search_text: String,
    pub replace_text: String,
    /// Zero-based index among the matches, required when there are several.
    #[serde(default)]
    pub occurrence_index: Option<usize>,
    /// Overrides the caller's default similarity threshold.
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
}

impl EditOperation {
    pub fn new(search_text: impl Into<String>, replace_text: impl Into<String>) -> Self {
        Self {
            search_text: search_text.into(),
            replace_text: replace_text.into(),
            occurrence_index: None,
            similarity_threshold: None,
        }
    }

    pub fn occurrence(mut self, index: usize) -> Self {
        self.occurrence_index = Some(index);
        self
    }

    pub fn threshold(mut self, similarity: f64) -> Self {
        self.similarity_threshold = Some(similarity);
        self
    }
}

/// An edit whose target span has been located.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedEdit {
    /// Position of the edit in the caller's list.
    pub edit_index: usize,
    pub found: Match,
    pub replacement: String,
}

impl FuzzyMatcher {
    /// Locate every edit against the same, unmodified document.
    ///
    /// Fails before anything is replaced if any edit cannot be located or
    /// if two located spans overlap. The result is sorted by position.
    pub fn find_all_matches(
        &self,
        document: &str,
        edits: &[EditOperation],
        default_similarity: f64,
    ) -> Result<Vec<PlannedEdit>, FuzzyError> {
        let mut planned = Vec::with_capacity(edits.len());
        for (index, edit) in edits.iter().enumerate() {
            let threshold = edit.similarity_threshold.unwrap_or(default_similarity);
            let found = self
                .find_unique(document, &edit.search_text, threshold, edit.occurrence_index)
                .map_err(|e| FuzzyError::Edit {
                    index,
                    source: Box::new(e),
                })?;
            planned.push(PlannedEdit {
                edit_index: index,
                found,
                replacement: edit.replace_text.clone(),
            });
        }

        planned.sort_by_key(|p| (p.found.position, p.found.end_position));
        for pair in planned.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if b.found.position < a.found.end_position {
                return Err(FuzzyError::Overlap {
                    first: a.edit_index,
                    second: b.edit_index,
                    first_span: (a.found.position, a.found.end_position),
                    second_span: (b.found.position, b.found.end_position),
                });
            }
        }
        Ok(planned)
    }
}

/// Apply located edits, last position first, so earlier offsets stay valid.
pub fn apply_edits(document: &str, planned: &[PlannedEdit]) -> String {
    let mut order: Vec<&PlannedEdit> = planned.iter().collect();
    order.sort_by(|a, b| b.found.position.cmp(&a.found.position));

    let mut out = document.to_string();
    for edit in order {
        out.replace_range(edit.found.position..edit.found.end_position, &edit.replacement);
    }
    out
}
