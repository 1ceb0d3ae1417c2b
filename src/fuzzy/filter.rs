//! Cheap rejection tests run before the edit-distance scan.
//!
//! Each filter derives a lower bound on the edit distance between a window
//! and the target, so a rejected window can never score above the threshold.

/// Coarse character classes used for the signature histogram.
const CLASSES: usize = 8;

fn class_of(c: char) -> usize {
    match c {
        c if c.is_alphabetic() => 0,
        c if c.is_numeric() => 1,
        c if c.is_whitespace() => 2,
        '(' | '[' | '{' | '<' => 3,
        ')' | ']' | '}' | '>' => 4,
        '"' | '\'' | '`' => 5,
        '+' | '-' | '*' | '/' | '%' | '=' | '!' | '&' | '|' | '^' | '~' | '?' | ':' => 6,
        _ => 7,
    }
}

/// Histogram of character classes over a run of text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    counts: [i64; CLASSES],
}

impl Signature {
    pub fn of(chars: &[char]) -> Self {
        let mut sig = Self::default();
        for &c in chars {
            sig.add(c);
        }
        sig
    }

    pub fn add(&mut self, c: char) {
        self.counts[class_of(c)] += 1;
    }

    pub fn remove(&mut self, c: char) {
        self.counts[class_of(c)] -= 1;
    }

    /// Minimum number of edits needed to turn one histogram into the other.
    ///
    /// A substitution moves one unit between classes, an insertion or
    /// deletion changes one class by one, so the larger of the surplus and
    /// deficit totals is a lower bound on edit distance.
    pub fn distance_bound(&self, other: &Signature) -> usize {
        let (mut surplus, mut deficit) = (0i64, 0i64);
        for (a, b) in self.counts.iter().zip(other.counts.iter()) {
            let d = a - b;
            if d > 0 {
                surplus += d;
            } else {
                deficit -= d;
            }
        }
        surplus.max(deficit) as usize
    }
}

/// What the filters know about the search target.
#[derive(Debug, Clone)]
pub struct TargetProfile {
    pub len: usize,
    pub signature: Signature,
    /// Largest edit distance any accepted window may have.
    pub max_distance: usize,
    /// Largest difference between a scored window's length and `len`.
    pub length_slack: usize,
}

/// A window anchored at one start position, `len` chars long (at most the
/// target length; shorter only near the end of the document).
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub len: usize,
    pub signature: &'a Signature,
}

pub trait WindowFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn reject(&self, target: &TargetProfile, window: &Candidate<'_>) -> bool;
}

/// Rejects starts where even the rest of the document is too short.
#[derive(Debug, Default)]
pub struct LengthFilter;

impl WindowFilter for LengthFilter {
    fn name(&self) -> &'static str {
        "length"
    }

    fn reject(&self, target: &TargetProfile, window: &Candidate<'_>) -> bool {
        window.len < target.len && target.len - window.len > target.max_distance
    }
}

/// Rejects windows whose character-class mix is too far from the target.
#[derive(Debug, Default)]
pub struct CharClassFilter;

impl WindowFilter for CharClassFilter {
    fn name(&self) -> &'static str {
        "char-class"
    }

    fn reject(&self, target: &TargetProfile, window: &Candidate<'_>) -> bool {
        // Only full-length windows have a comparable histogram.
        if window.len < target.len {
            return false;
        }
        // Growing or shrinking the window by k chars moves the bound by at most k.
        let bound = window.signature.distance_bound(&target.signature);
        bound.saturating_sub(target.length_slack) > target.max_distance
    }
}

pub fn default_filters() -> Vec<Box<dyn WindowFilter>> {
    vec![Box::new(LengthFilter), Box::new(CharClassFilter)]
}
