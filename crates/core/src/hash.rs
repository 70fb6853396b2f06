//! Content hashing for the file tracker and doc-id derivation.
//!
//! New hashes are blake3 (fast, ≥64-bit, already the corpus's default
//! choice for this kind of content-addressing). Legacy SHA-256 digests are
//! accepted transparently on comparison so a tracker populated by an older
//! build keeps working without a migration pass (spec.md §4.2).

use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Hash content with blake3, returned as a lowercase hex string prefixed so
/// the algorithm is self-describing in the tracker snapshot.
pub fn hash_content(content: &str) -> String {
    format!("b3:{}", blake3::hash(content.as_bytes()).to_hex())
}

/// Compare a freshly computed blake3 hash of `content` against a stored
/// hash that may be either blake3 (`b3:...`) or legacy SHA-256 (`sha256:...`
/// or a bare 64-char hex string, which older trackers wrote without a
/// prefix).
pub fn matches(content: &str, stored: &str) -> bool {
    if let Some(hex) = stored.strip_prefix("b3:") {
        return blake3::hash(content.as_bytes()).to_hex().as_str() == hex;
    }
    let sha_hex = stored.strip_prefix("sha256:").unwrap_or(stored);
    if sha_hex.len() == 64 && sha_hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest {
            let _ = write!(out, "{byte:02x}");
        }
        return out == sha_hex;
    }
    false
}

/// Stable hash combining path, chunk index, and content hash, used to
/// derive `doc_id` (spec.md §4.1): `stable_hash(path + ":" + chunk_index +
/// ":" + content_hash)`.
pub fn stable_doc_id(path: &str, chunk_index: usize, content: &str) -> String {
    let content_hash = blake3::hash(content.as_bytes()).to_hex();
    let joined = format!("{path}:{chunk_index}:{content_hash}");
    blake3::hash(joined.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_roundtrips() {
        let h = hash_content("hello world");
        assert!(matches("hello world", &h));
        assert!(!matches("hello worlds", &h));
    }

    #[test]
    fn legacy_sha256_accepted() {
        let mut hasher = Sha256::new();
        hasher.update(b"hello world");
        let digest = hasher.finalize();
        let mut hex = String::new();
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        assert!(matches("hello world", &hex));
        assert!(matches("hello world", &format!("sha256:{hex}")));
    }

    #[test]
    fn doc_id_is_deterministic() {
        let a = stable_doc_id("src/a.rs", 0, "fn f() {}");
        let b = stable_doc_id("src/a.rs", 0, "fn f() {}");
        let c = stable_doc_id("src/a.rs", 1, "fn f() {}");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
