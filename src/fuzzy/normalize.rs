//! Whitespace normalization that remembers where every output byte came from.
//!
//! Rules, applied in one pass:
//! - CRLF becomes LF
//! - a run of spaces and tabs inside a line becomes one space
//! - spaces and tabs at the start or end of a line are dropped
//!
//! Every byte of the normalized text maps to a half-open byte range of the
//! input, so a match found in normalized space can be sliced back out of the
//! original document exactly.

/// Normalized text plus the byte span in the source for each output byte.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    pub text: String,
    spans: Vec<(usize, usize)>,
}

impl NormalizedText {
    /// Map a normalized byte range back to a byte range of the source.
    ///
    /// `start..end` must be a non-empty range on char boundaries of `text`.
    pub fn source_range(&self, start: usize, end: usize) -> Option<(usize, usize)> {
        if start >= end || end > self.spans.len() {
            return None;
        }
        Some((self.spans[start].0, self.spans[end - 1].1))
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

fn is_blank(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

fn line_ends_at(bytes: &[u8], i: usize) -> bool {
    i == bytes.len() || bytes[i] == b'\n' || (bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n'))
}

pub fn normalize(input: &str) -> NormalizedText {
    let bytes = input.as_bytes();
    let mut text = String::with_capacity(input.len());
    let mut spans = Vec::with_capacity(input.len());
    let mut line_start = true;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if is_blank(b) {
            let start = i;
            while i < bytes.len() && is_blank(bytes[i]) {
                i += 1;
            }
            if !line_start && !line_ends_at(bytes, i) {
                text.push(' ');
                spans.push((start, i));
            }
            line_start = false;
        } else if b == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
            text.push('\n');
            spans.push((i, i + 2));
            i += 2;
            line_start = true;
        } else if b == b'\n' {
            text.push('\n');
            spans.push((i, i + 1));
            i += 1;
            line_start = true;
        } else {
            let width = input[i..].chars().next().map_or(1, char::len_utf8);
            text.push_str(&input[i..i + width]);
            spans.extend((i..i + width).map(|k| (k, k + 1)));
            i += width;
            line_start = false;
        }
    }

    NormalizedText { text, spans }
}
