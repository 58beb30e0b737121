//! Content fingerprints used to detect exact-content duplicates

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the SHA-256 digest
pub const FINGERPRINT_LEN: usize = 16;

/// Full hex-encoded SHA-256 of the concatenated parts
pub fn sha256_hex<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Truncated SHA-256 over the concatenation of `parts`.
///
/// Parts are joined without a separator, so callers must feed fields in a fixed
/// order and canonical textual form for the result to be stable.
pub fn fingerprint<S: AsRef<str>>(parts: &[S]) -> String {
    let mut digest = sha256_hex(parts);
    digest.truncate(FINGERPRINT_LEN);
    digest
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(&["hello", " ", "world"]),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_fingerprint_is_truncated_prefix() {
        let fp = fingerprint(&["hello world"]);
        assert_eq!(fp.len(), FINGERPRINT_LEN);
        assert_eq!(fp, "b94d27b9934d3e08");
    }

    proptest! {
        #[test]
        fn prop_fingerprint_deterministic(parts in proptest::collection::vec(".*", 0..6)) {
            prop_assert_eq!(fingerprint(&parts), fingerprint(&parts));
            prop_assert_eq!(fingerprint(&parts).len(), FINGERPRINT_LEN);
        }
    }
}
