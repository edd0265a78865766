//! Nonce search backends
//!
//! The PoW engine hands a backend the serialized header without its nonce and
//! the 32-byte big-endian target; the backend appends candidate nonces and
//! looks for a double-SHA-256 below the target.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use crate::crypto::{double_sha256, hash_meets_target};

/// Hashes between two checks of the interrupt and found flags
pub const POLL_INTERVAL_HASHES: u64 = 4096;

/// Outcome of one nonce search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MineResult {
    pub found: bool,
    pub nonce: u64,
    /// Number of hashes computed
    pub hash_count: u64,
}

/// A nonce search implementation (CPU threads, GPU, ...)
pub trait MiningBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Search the nonce space until a hash meets `target`, the space is
    /// exhausted or `interrupt` is raised
    fn mine(&self, header_prefix: &[u8], target: &[u8; 32], interrupt: &AtomicBool) -> MineResult;
}

/// Splits the nonce space evenly across OS threads
#[derive(Debug, Clone)]
pub struct CpuMiningBackend {
    threads: usize,
}

impl CpuMiningBackend {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    /// Hardware threads minus three (for networking and the rest of the node),
    /// but at least one
    pub fn default_thread_count() -> usize {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .saturating_sub(3)
            .max(1)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl Default for CpuMiningBackend {
    fn default() -> Self {
        Self::new(Self::default_thread_count())
    }
}

impl MiningBackend for CpuMiningBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn mine(&self, header_prefix: &[u8], target: &[u8; 32], interrupt: &AtomicBool) -> MineResult {
        let found = AtomicBool::new(false);
        let found_nonce = AtomicU64::new(0);
        let hash_count = AtomicU64::new(0);

        let threads = self.threads as u64;
        let chunk_size = u64::MAX / threads;

        thread::scope(|scope| {
            for i in 0..threads {
                let start = chunk_size * i;
                let len = if i + 1 == threads {
                    u64::MAX - start
                } else {
                    chunk_size
                };
                let search = ChunkSearch {
                    header_prefix,
                    target,
                    interrupt,
                    found: &found,
                    found_nonce: &found_nonce,
                    hash_count: &hash_count,
                };
                scope.spawn(move || search.run(start, len));
            }
        });

        MineResult {
            found: found.load(Ordering::SeqCst),
            nonce: found_nonce.load(Ordering::SeqCst),
            hash_count: hash_count.load(Ordering::SeqCst),
        }
    }
}

/// Shared state of one search, borrowed by every worker thread
#[derive(Clone, Copy)]
struct ChunkSearch<'a> {
    header_prefix: &'a [u8],
    target: &'a [u8; 32],
    interrupt: &'a AtomicBool,
    found: &'a AtomicBool,
    found_nonce: &'a AtomicU64,
    hash_count: &'a AtomicU64,
}

impl ChunkSearch<'_> {
    fn run(&self, start: u64, len: u64) {
        let nonce_offset = self.header_prefix.len();
        let mut header = Vec::with_capacity(nonce_offset + 8);
        header.extend_from_slice(self.header_prefix);
        header.extend_from_slice(&[0u8; 8]);

        let mut local_count = 0u64;
        let mut i = 0u64;
        while i <= len {
            let nonce = start.wrapping_add(i);
            header[nonce_offset..].copy_from_slice(&nonce.to_le_bytes());
            local_count += 1;

            if hash_meets_target(&double_sha256(&header), self.target) {
                // Only the first winner publishes its nonce
                if self
                    .found
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    self.found_nonce.store(nonce, Ordering::SeqCst);
                }
                break;
            }

            i += 1;
            if i % POLL_INTERVAL_HASHES == 0 {
                self.hash_count.fetch_add(local_count, Ordering::Relaxed);
                local_count = 0;
                if self.found.load(Ordering::Relaxed) || self.interrupt.load(Ordering::Relaxed) {
                    return;
                }
            }
            if i == u64::MAX {
                break;
            }
        }
        self.hash_count.fetch_add(local_count, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::target_from_bits;

    #[test]
    fn test_finds_easy_target() {
        let backend = CpuMiningBackend::new(2);
        let prefix = b"header-prefix".to_vec();
        let target = target_from_bits(8);
        let interrupt = AtomicBool::new(false);

        let result = backend.mine(&prefix, &target, &interrupt);
        assert!(result.found);
        assert!(result.hash_count > 0);

        let mut header = prefix.clone();
        header.extend_from_slice(&result.nonce.to_le_bytes());
        assert!(hash_meets_target(&double_sha256(&header), &target));
    }

    #[test]
    fn test_interrupt_stops_search() {
        let backend = CpuMiningBackend::new(1);
        // No hash is below an all-zero target
        let target = [0u8; 32];
        let interrupt = AtomicBool::new(true);

        let result = backend.mine(b"prefix", &target, &interrupt);
        assert!(!result.found);
        assert_eq!(result.hash_count, POLL_INTERVAL_HASHES);
    }

    #[test]
    fn test_thread_count_is_positive() {
        assert!(CpuMiningBackend::default_thread_count() >= 1);
        assert_eq!(CpuMiningBackend::new(0).threads(), 1);
        assert_eq!(CpuMiningBackend::default().name(), "cpu");
    }
}
