//! Content fingerprint hashing.

use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of a byte slice, returning a lowercase hex string.
pub fn compute_content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Validate a client-declared SHA-256 and normalize it to lowercase.
///
/// Returns `None` unless the input is exactly 64 hex digits.
pub fn normalize_content_hash(declared: &str) -> Option<String> {
    let trimmed = declared.trim();
    if trimmed.len() == 64 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(trimmed.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_content_hash() {
        let hash = compute_content_hash(b"hello world");
        // SHA-256 of "hello world"
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_normalize_content_hash() {
        let upper = "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9";
        assert_eq!(
            normalize_content_hash(upper).as_deref(),
            Some("b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9")
        );
        assert!(normalize_content_hash("abc").is_none());
        assert!(normalize_content_hash(&"g".repeat(64)).is_none());
        assert!(normalize_content_hash(&format!("{}0", "a".repeat(64))).is_none());
    }
}
