//! Cache of already-verified signatures
//!
//! Blocks usually carry transactions that were verified when they entered the
//! mempool. Remembering successful verifications lets block validation skip
//! the ECDSA work for those inputs.

use std::collections::HashSet;

use parking_lot::Mutex;

use super::hash::sha256_hex;

/// Entry ceiling; the cache is cleared wholesale when it is reached
pub const SIG_CACHE_MAX_ENTRIES: usize = 50_000;

#[derive(Debug, Default)]
pub struct SigCache {
    entries: Mutex<HashSet<String>>,
}

impl SigCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_key(sig: &[u8], msg: &[u8], pub_key: &[u8]) -> String {
        let mut preimage = Vec::with_capacity(sig.len() + msg.len() + pub_key.len());
        preimage.extend_from_slice(sig);
        preimage.extend_from_slice(msg);
        preimage.extend_from_slice(pub_key);
        sha256_hex(&preimage)
    }

    pub fn contains(&self, sig: &[u8], msg: &[u8], pub_key: &[u8]) -> bool {
        let key = Self::make_key(sig, msg, pub_key);
        self.entries.lock().contains(&key)
    }

    /// Record a successful verification
    pub fn add(&self, sig: &[u8], msg: &[u8], pub_key: &[u8]) {
        let key = Self::make_key(sig, msg, pub_key);
        let mut entries = self.entries.lock();
        if entries.len() >= SIG_CACHE_MAX_ENTRIES {
            entries.clear();
        }
        entries.insert(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_contains() {
        let cache = SigCache::new();
        assert!(!cache.contains(b"sig", b"msg", b"pk"));
        cache.add(b"sig", b"msg", b"pk");
        assert!(cache.contains(b"sig", b"msg", b"pk"));
        assert!(!cache.contains(b"sig", b"msg", b"other"));
    }

    #[test]
    fn test_cleared_when_full() {
        let cache = SigCache::new();
        for i in 0..SIG_CACHE_MAX_ENTRIES {
            cache.add(&i.to_le_bytes(), b"m", b"p");
        }
        assert_eq!(cache.len(), SIG_CACHE_MAX_ENTRIES);

        cache.add(b"one more", b"m", b"p");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(b"one more", b"m", b"p"));
    }
}
