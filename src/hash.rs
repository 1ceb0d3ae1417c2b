//! Content hashing compatible with git blob object ids.
//!
//! A hash is the SHA-1 of `"blob " + <byte length> + NUL + content`, so the
//! value matches `git hash-object` for the same bytes. It is used purely for
//! change detection.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// Hex-encoded blob hash of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of_bytes(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(format!("blob {}\0", content.len()).as_bytes());
        hasher.update(content);
        Self(hex::encode(hasher.finalize()))
    }

    /// Hash UTF-8 text. The length in the header is the byte length.
    pub fn of_str(content: &str) -> Self {
        Self::of_bytes(content.as_bytes())
    }

    /// Wrap a hash received from a caller. Case is normalized so that
    /// comparisons are not defeated by upper-case hex.
    pub fn from_hex(hex: impl AsRef<str>) -> Self {
        Self(hex.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

/// File-system-safe name for an arbitrary key: the key with unsafe chars
/// replaced, plus a digest of the original so distinct keys never collide.
pub fn path_stem(key: &str) -> String {
    let safe: String = key
        .chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = hex::encode(sha2::Sha256::digest(key.as_bytes()));
    format!("{}-{}", safe, &digest[..12])
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_git_hash_object() {
        // `printf '' | git hash-object --stdin`
        assert_eq!(
            ContentHash::of_str("").as_str(),
            "e69de29bb2d1d6434b8b29ae775ad8c2e48c5391"
        );
        // `printf 'hello world\n' | git hash-object --stdin`
        assert_eq!(
            ContentHash::of_str("hello world\n").as_str(),
            "3b18e512dba79e4c8300dd08aeb37f8e728b8dad"
        );
    }

    #[test]
    fn test_deterministic_and_distinct() {
        let a = ContentHash::of_str("function f() {}");
        let b = ContentHash::of_str("function f() {}");
        let c = ContentHash::of_str("function g() {}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_length_header_uses_bytes() {
        // Same char count, different byte count.
        assert_ne!(ContentHash::of_str("é"), ContentHash::of_str("e"));
        assert_eq!(ContentHash::of_str("é"), ContentHash::of_bytes("é".as_bytes()));
    }

    #[test]
    fn test_path_stem_keeps_similar_keys_apart() {
        assert_ne!(path_stem("proj.1"), path_stem("proj_1"));
        assert!(path_stem("proj.1").starts_with("proj_1-"));
        assert_eq!(path_stem("a/b"), path_stem("a/b"));
    }

    #[test]
    fn test_from_hex_normalizes_case() {
        let h = ContentHash::of_str("x");
        let upper = ContentHash::from_hex(h.as_str().to_ascii_uppercase());
        assert_eq!(h, upper);
        assert_eq!(h.short().len(), 12);
    }
}
