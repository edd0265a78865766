//! Orphan blocks and block connection outcomes
//!
//! Blocks whose parent is unknown wait in the [`OrphanPool`] until the parent
//! connects, at which point the chain manager takes them back out by parent
//! hash and connects them in turn.

use std::collections::HashMap;

use super::block::Block;
use super::params::{MAX_ORPHAN_BLOCKS, ORPHAN_BLOCK_EXPIRE_SECS};

/// An orphan block waiting for its parent
#[derive(Debug, Clone)]
pub struct OrphanBlock {
    pub block: Block,
    /// Hash of the parent block we're waiting for
    pub parent_hash: String,
    /// Unix time when this orphan was received
    pub received_at: i64,
}

impl OrphanBlock {
    pub fn new(block: Block, received_at: i64) -> Self {
        let parent_hash = block.prev_block_hash().to_string();
        Self {
            block,
            parent_hash,
            received_at,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.received_at > ORPHAN_BLOCK_EXPIRE_SECS
    }
}

/// Orphan blocks indexed by id and by the parent they wait for
#[derive(Debug, Clone, Default)]
pub struct OrphanPool {
    orphans: HashMap<String, OrphanBlock>,
    by_parent: HashMap<String, Vec<String>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an orphan, evicting expired entries and then the oldest one when
    /// the pool is full. Returns false for a block that is already pooled.
    pub fn add(&mut self, block: Block, now: i64) -> bool {
        let block_id = block.id().to_string();
        if self.orphans.contains_key(&block_id) {
            return false;
        }

        self.prune(now);
        while self.orphans.len() >= MAX_ORPHAN_BLOCKS {
            let Some(oldest) = self
                .orphans
                .values()
                .min_by_key(|orphan| orphan.received_at)
                .map(|orphan| orphan.block.id().to_string())
            else {
                break;
            };
            log::debug!("Orphan pool full, evicting {}", oldest);
            self.remove(&oldest);
        }

        let orphan = OrphanBlock::new(block, now);
        self.by_parent
            .entry(orphan.parent_hash.clone())
            .or_default()
            .push(block_id.clone());
        self.orphans.insert(block_id, orphan);
        true
    }

    /// Remove and return every orphan waiting on `parent_hash`
    pub fn take_children(&mut self, parent_hash: &str) -> Vec<Block> {
        let Some(ids) = self.by_parent.remove(parent_hash) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.orphans.remove(id))
            .map(|orphan| orphan.block)
            .collect()
    }

    pub fn remove(&mut self, block_id: &str) -> Option<Block> {
        let orphan = self.orphans.remove(block_id)?;
        if let Some(siblings) = self.by_parent.get_mut(&orphan.parent_hash) {
            siblings.retain(|id| id != block_id);
            if siblings.is_empty() {
                self.by_parent.remove(&orphan.parent_hash);
            }
        }
        Some(orphan.block)
    }

    /// Drop orphans older than the expiry window
    pub fn prune(&mut self, now: i64) {
        let expired: Vec<String> = self
            .orphans
            .iter()
            .filter(|(_, orphan)| orphan.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            self.remove(&id);
        }
    }

    pub fn contains(&self, block_id: &str) -> bool {
        self.orphans.contains_key(block_id)
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn clear(&mut self) {
        self.orphans.clear();
        self.by_parent.clear();
    }
}

/// Result of handing a block to the chain manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    /// Appended to chain `chain_idx` (0 = active chain, 1.. = side branch)
    Connected { chain_idx: usize },
    /// Already present in some chain
    AlreadySeen,
    /// Parent unknown; parked in the orphan pool
    Orphaned,
    /// Failed validation
    Rejected(String),
}

impl BlockStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, BlockStatus::Connected { chain_idx: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_with_parent(parent: &str, nonce: u64) -> Block {
        Block::new(0, parent.to_string(), String::new(), 0, 0, nonce, vec![])
    }

    #[test]
    fn test_add_and_take_children() {
        let mut pool = OrphanPool::new();
        assert!(pool.add(block_with_parent("p", 1), 100));
        assert!(pool.add(block_with_parent("p", 2), 100));
        assert!(pool.add(block_with_parent("q", 3), 100));

        let children = pool.take_children("p");
        assert_eq!(children.len(), 2);
        assert_eq!(pool.len(), 1);
        assert!(pool.take_children("p").is_empty());
    }

    #[test]
    fn test_duplicate_is_ignored() {
        let mut pool = OrphanPool::new();
        assert!(pool.add(block_with_parent("p", 1), 100));
        assert!(!pool.add(block_with_parent("p", 1), 100));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut pool = OrphanPool::new();
        let first = block_with_parent("p", 0);
        let first_id = first.id().to_string();
        pool.add(first, 10);
        for nonce in 1..MAX_ORPHAN_BLOCKS as u64 + 5 {
            pool.add(block_with_parent("p", nonce), 10 + nonce as i64);
        }
        assert_eq!(pool.len(), MAX_ORPHAN_BLOCKS);
        assert!(!pool.contains(&first_id));
    }

    #[test]
    fn test_expiry() {
        let mut pool = OrphanPool::new();
        pool.add(block_with_parent("p", 1), 0);
        pool.prune(ORPHAN_BLOCK_EXPIRE_SECS);
        assert_eq!(pool.len(), 1);
        pool.prune(ORPHAN_BLOCK_EXPIRE_SECS + 1);
        assert!(pool.is_empty());
        assert!(pool.take_children("p").is_empty());
    }

    #[test]
    fn test_block_status() {
        assert!(BlockStatus::Connected { chain_idx: 0 }.is_active());
        assert!(!BlockStatus::Connected { chain_idx: 1 }.is_active());
        assert!(!BlockStatus::Orphaned.is_active());
    }
}
