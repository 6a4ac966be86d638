//! SHA-256 hashing used for block hashes, transaction ids and proof targets.

use sha2::{Digest, Sha256};

/// Number of leading hex digits read by [`hash_prefix`].
pub const HASH_PREFIX_DIGITS: usize = 16;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Numeric value of the first 16 hex digits of a hex hash.
///
/// Proof-of-work and proof-of-stake compare this value against their targets.
/// Returns `None` when the string is too short or not hex.
pub fn hash_prefix(hash_hex: &str) -> Option<u64> {
    let prefix = hash_hex.get(..HASH_PREFIX_DIGITS)?;
    u64::from_str_radix(prefix, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256() {
        let data = b"hello world";
        let hash = sha256(data);
        assert_eq!(hash.len(), 32);
        assert_eq!(
            sha256_hex(data),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_prefix() {
        let hash = "00000000000000ff0000000000000000000000000000000000000000000000aa";
        assert_eq!(hash_prefix(hash), Some(0xff));
        assert_eq!(hash_prefix("ffffffffffffffff"), Some(u64::MAX));
    }

    #[test]
    fn test_hash_prefix_rejects_garbage() {
        assert_eq!(hash_prefix("abc"), None);
        assert_eq!(hash_prefix("zzzzzzzzzzzzzzzzzzzz"), None);
    }
}
