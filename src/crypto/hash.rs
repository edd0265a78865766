//! Cryptographic hashing utilities for the blockchain
//!
//! Provides SHA-256 based hashing functions used for block hashes,
//! transaction IDs, merkle roots, and the proof-of-work target test.

use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for block ids, transaction ids and message checksums
pub fn double_sha256(data: &[u8]) -> Vec<u8> {
    sha256(&sha256(data))
}

/// Computes SHA-256 hash and returns it as a hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Computes double SHA-256 hash and returns it as a hex string
pub fn double_sha256_hex(data: &[u8]) -> String {
    hex::encode(double_sha256(data))
}

/// Target for `bits` as a 256-bit big-endian integer: `2^(255 - bits)`
pub fn target_from_bits(bits: u8) -> [u8; 32] {
    let mut target = [0u8; 32];
    let bit_index = bits as usize;
    target[bit_index / 8] = 0x80 >> (bit_index % 8);
    target
}

/// Checks if a hash is strictly below the target.
///
/// Both are read as big-endian 256-bit integers, so the comparison runs from
/// the most significant byte down and the first differing byte decides.
pub fn hash_meets_target(hash: &[u8], target: &[u8; 32]) -> bool {
    if hash.len() != target.len() {
        return false;
    }
    for (h, t) in hash.iter().zip(target.iter()) {
        if h != t {
            return h < t;
        }
    }
    false
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
    fn test_double_sha256() {
        let data = b"hello world";
        assert_eq!(double_sha256(data), sha256(&sha256(data)));
        assert_eq!(double_sha256_hex(data).len(), 64);
    }

    #[test]
    fn test_target_from_bits() {
        let target = target_from_bits(0);
        assert_eq!(target[0], 0x80);

        let target = target_from_bits(24);
        assert_eq!(&target[..3], &[0, 0, 0]);
        assert_eq!(target[3], 0x80);

        let target = target_from_bits(255);
        assert_eq!(target[31], 0x01);
        assert!(target[..31].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_hash_meets_target() {
        let target = target_from_bits(16); // 0x0000_80..
        let mut hash = [0u8; 32];
        hash[2] = 0x7F;
        hash[31] = 0xFF;
        assert!(hash_meets_target(&hash, &target));

        // Equal to target is not below it
        assert!(!hash_meets_target(&target, &target));

        // Most significant byte decides even if lower bytes are smaller
        let mut high = [0u8; 32];
        high[1] = 0x01;
        assert!(!hash_meets_target(&high, &target));

        assert!(!hash_meets_target(&[0u8; 31], &target));
    }
}
