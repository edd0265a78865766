//! Chain storage: the active chain, side branches and orphan blocks
//!
//! [`Chain`] only stores blocks and answers read-only queries about them.
//! Connecting, disconnecting and reorganizing live in `NodeState`, which
//! also owns the UTXO set and mempool that those operations update.
//!
//! Side branches are kept self-contained: the parent of a branch's first
//! block is always a block of the active chain at the time the branch was
//! created. Heights are absolute (genesis is height 0) on every branch.

use std::collections::HashMap;

use super::block::Block;
use super::chain_state::OrphanPool;
use super::params::ChainParams;
use super::transaction::OutPoint;
use super::utxo::UnspentTxOut;

/// Chain index of the active chain; side branches are numbered from 1
pub const ACTIVE_CHAIN_IDX: usize = 0;

/// Where a block sits among all known chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    /// 0 for the active chain, `n` for `side_branches[n - 1]`
    pub chain_idx: usize,
    /// Index inside that chain's block vector
    pub position: usize,
    /// Absolute height
    pub height: usize,
}

#[derive(Debug, Clone)]
pub struct Chain {
    genesis: Block,
    initial_bits: u8,
    active: Vec<Block>,
    side_branches: Vec<Vec<Block>>,
    /// Block id -> height, for the active chain only
    active_index: HashMap<String, usize>,
    pub orphans: OrphanPool,
    /// Active-chain height (excluding genesis) already written to disk
    pub last_saved_height: usize,
}

impl Chain {
    pub fn new(params: &ChainParams) -> Self {
        let mut chain = Self {
            genesis: params.genesis.clone(),
            initial_bits: params.initial_difficulty_bits,
            active: Vec::new(),
            side_branches: Vec::new(),
            active_index: HashMap::new(),
            orphans: OrphanPool::new(),
            last_saved_height: 0,
        };
        chain.reset();
        chain
    }

    /// Back to genesis only
    pub fn reset(&mut self) {
        self.active.clear();
        self.active_index.clear();
        self.side_branches.clear();
        self.orphans.clear();
        self.last_saved_height = 0;
        self.push_active(self.genesis.clone());
    }

    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    pub fn initial_bits(&self) -> u8 {
        self.initial_bits
    }

    pub fn active_chain(&self) -> &[Block] {
        &self.active
    }

    pub fn side_branches(&self) -> &[Vec<Block>] {
        &self.side_branches
    }

    pub fn tip(&self) -> &Block {
        // The active chain always holds at least genesis
        &self.active[self.active.len() - 1]
    }

    /// Number of blocks on the active chain, genesis included
    pub fn current_height(&self) -> usize {
        self.active.len()
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn locate_block_in_active_chain(&self, block_id: &str) -> Option<(&Block, usize)> {
        let height = *self.active_index.get(block_id)?;
        self.active.get(height).map(|block| (block, height))
    }

    /// Search the active chain, then every side branch
    pub fn locate_block_in_all_chains(&self, block_id: &str) -> Option<(&Block, BlockLocation)> {
        if let Some((block, height)) = self.locate_block_in_active_chain(block_id) {
            let location = BlockLocation {
                chain_idx: ACTIVE_CHAIN_IDX,
                position: height,
                height,
            };
            return Some((block, location));
        }

        for (i, branch) in self.side_branches.iter().enumerate() {
            let Some(position) = branch.iter().position(|block| block.id() == block_id) else {
                continue;
            };
            let fork_height = self.fork_height(i + 1).unwrap_or(0);
            let location = BlockLocation {
                chain_idx: i + 1,
                position,
                height: fork_height + 1 + position,
            };
            return Some((&branch[position], location));
        }

        None
    }

    pub fn contains_block(&self, block_id: &str) -> bool {
        self.locate_block_in_all_chains(block_id).is_some()
    }

    /// Active-chain height of the block a side branch forks from
    pub fn fork_height(&self, chain_idx: usize) -> Option<usize> {
        let branch = self.side_branches.get(chain_idx.checked_sub(1)?)?;
        let first = branch.first()?;
        self.locate_block_in_active_chain(first.prev_block_hash())
            .map(|(_, height)| height)
    }

    /// The ancestor at `height` of the block at `location`
    pub fn ancestor_at(&self, location: &BlockLocation, height: usize) -> Option<&Block> {
        if height > location.height {
            return None;
        }
        if location.chain_idx == ACTIVE_CHAIN_IDX {
            return self.active.get(height);
        }
        let fork_height = self.fork_height(location.chain_idx)?;
        if height <= fork_height {
            return self.active.get(height);
        }
        self.side_branches
            .get(location.chain_idx - 1)?
            .get(height - fork_height - 1)
    }

    /// Whether the block at `location` is the last block of its chain
    pub fn is_chain_tip(&self, location: &BlockLocation) -> bool {
        match location.chain_idx {
            ACTIVE_CHAIN_IDX => location.position + 1 == self.active.len(),
            idx => self
                .side_branches
                .get(idx - 1)
                .map(|branch| location.position + 1 == branch.len())
                .unwrap_or(false),
        }
    }

    // =========================================================================
    // Median time past
    // =========================================================================

    /// Median timestamp of the last `num_last_blocks` active blocks, or 0 if
    /// the chain is shorter than that
    pub fn median_time_past(&self, num_last_blocks: usize) -> i64 {
        if num_last_blocks == 0 || num_last_blocks > self.active.len() {
            return 0;
        }
        let first = self.active.len() - num_last_blocks;
        median(self.active[first..].iter().map(Block::timestamp).collect())
    }

    /// Median timestamp of the up to `num_blocks` active blocks ending at `height`
    pub fn median_time_past_at(&self, height: usize, num_blocks: usize) -> i64 {
        let location = BlockLocation {
            chain_idx: ACTIVE_CHAIN_IDX,
            position: height,
            height,
        };
        if height >= self.active.len() {
            return 0;
        }
        self.median_time_past_of(&location, num_blocks)
    }

    /// Median timestamp of the up to `num_blocks` ancestors ending at `location`
    pub fn median_time_past_of(&self, location: &BlockLocation, num_blocks: usize) -> i64 {
        if num_blocks == 0 {
            return 0;
        }
        let first = (location.height + 1).saturating_sub(num_blocks);
        let timestamps: Vec<i64> = (first..=location.height)
            .filter_map(|height| self.ancestor_at(location, height))
            .map(Block::timestamp)
            .collect();
        if timestamps.is_empty() {
            return 0;
        }
        median(timestamps)
    }

    // =========================================================================
    // Outputs
    // =========================================================================

    /// Rebuild the UTXO entry for an outpoint from the active chain, whether
    /// or not it is currently spent. Height follows the connect convention
    /// (block height + 1).
    pub fn find_tx_out_in_active_chain(&self, outpoint: &OutPoint) -> Option<UnspentTxOut> {
        let index = usize::try_from(outpoint.index).ok()?;
        for (height, block) in self.active.iter().enumerate() {
            if let Some(tx) = block.txs().iter().find(|tx| tx.id() == outpoint.tx_id) {
                let tx_out = tx.outputs().get(index)?;
                return Some(UnspentTxOut::new(
                    tx_out.clone(),
                    outpoint.clone(),
                    tx.is_coinbase(),
                    height as i64 + 1,
                ));
            }
        }
        None
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    pub(crate) fn push_active(&mut self, block: Block) {
        self.active_index
            .insert(block.id().to_string(), self.active.len());
        self.active.push(block);
    }

    pub(crate) fn pop_active(&mut self) -> Option<Block> {
        if self.active.len() <= 1 {
            return None;
        }
        let block = self.active.pop()?;
        self.active_index.remove(block.id());
        Some(block)
    }

    pub(crate) fn push_side(&mut self, chain_idx: usize, block: Block) -> bool {
        match chain_idx
            .checked_sub(1)
            .and_then(|i| self.side_branches.get_mut(i))
        {
            Some(branch) => {
                branch.push(block);
                true
            }
            None => false,
        }
    }

    /// Start a new side branch; returns its chain index
    pub(crate) fn add_side_branch(&mut self, blocks: Vec<Block>) -> usize {
        self.side_branches.push(blocks);
        self.side_branches.len()
    }

    pub(crate) fn remove_side_branch(&mut self, chain_idx: usize) -> Option<Vec<Block>> {
        let i = chain_idx.checked_sub(1)?;
        if i >= self.side_branches.len() {
            return None;
        }
        Some(self.side_branches.remove(i))
    }

    /// The blocks of side branch `chain_idx` up to and including `position`
    pub(crate) fn side_branch_prefix(&self, chain_idx: usize, position: usize) -> Vec<Block> {
        chain_idx
            .checked_sub(1)
            .and_then(|i| self.side_branches.get(i))
            .map(|branch| branch.iter().take(position + 1).cloned().collect())
            .unwrap_or_default()
    }
}

fn median(mut timestamps: Vec<i64>) -> i64 {
    timestamps.sort_unstable();
    timestamps[timestamps.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Transaction;

    fn child_of(parent: &Block, timestamp: i64, tag: u64) -> Block {
        Block::new(
            0,
            parent.id().to_string(),
            String::new(),
            timestamp,
            parent.bits(),
            tag,
            vec![Transaction::create_coinbase("m", 1, tag as i64)],
        )
    }

    fn chain_with_timestamps(timestamps: &[i64]) -> Chain {
        let mut params = ChainParams::regtest();
        params.genesis.set_timestamp(timestamps[0]);
        let mut chain = Chain::new(&params);
        for (i, ts) in timestamps.iter().enumerate().skip(1) {
            let block = child_of(chain.tip(), *ts, i as u64);
            chain.push_active(block);
        }
        chain
    }

    #[test]
    fn test_median_time_past() {
        let chain = chain_with_timestamps(&[1, 30, 60, 90, 400]);
        assert_eq!(chain.median_time_past(3), 90);
        assert_eq!(chain.median_time_past(5), 60);
        assert_eq!(chain.median_time_past(1), 400);
        assert_eq!(chain.median_time_past(6), 0);
        assert_eq!(chain.median_time_past(0), 0);
    }

    #[test]
    fn test_median_time_past_at() {
        let chain = chain_with_timestamps(&[1, 30, 60, 90, 400]);
        assert_eq!(chain.median_time_past_at(0, 11), 1);
        assert_eq!(chain.median_time_past_at(2, 11), 30);
        assert_eq!(chain.median_time_past_at(4, 3), 90);
        assert_eq!(chain.median_time_past_at(10, 11), 0);
    }

    #[test]
    fn test_locate_and_index() {
        let mut chain = chain_with_timestamps(&[0, 600, 1200]);
        let tip_id = chain.tip().id().to_string();
        let (_, height) = chain.locate_block_in_active_chain(&tip_id).unwrap();
        assert_eq!(height, 2);
        assert_eq!(chain.current_height(), 3);

        chain.pop_active();
        assert!(chain.locate_block_in_active_chain(&tip_id).is_none());
        chain.pop_active();
        // Genesis is never popped
        assert!(chain.pop_active().is_none());
        assert_eq!(chain.current_height(), 1);
    }

    #[test]
    fn test_side_branch_location_and_ancestry() {
        let mut chain = chain_with_timestamps(&[0, 600, 1200]);
        let fork = chain.active_chain()[1].clone();
        let side1 = child_of(&fork, 1300, 100);
        let side2 = child_of(&side1, 1400, 101);
        let idx = chain.add_side_branch(vec![side1.clone()]);
        assert!(chain.push_side(idx, side2.clone()));

        assert_eq!(chain.fork_height(idx), Some(1));
        let (_, location) = chain.locate_block_in_all_chains(side2.id()).unwrap();
        assert_eq!(location.chain_idx, idx);
        assert_eq!(location.height, 3);
        assert!(chain.is_chain_tip(&location));

        assert_eq!(chain.ancestor_at(&location, 1).unwrap().id(), fork.id());
        assert_eq!(chain.ancestor_at(&location, 2).unwrap().id(), side1.id());
        assert!(chain.ancestor_at(&location, 4).is_none());

        // Up to three timestamps ending at side2: 600, 1300, 1400
        assert_eq!(chain.median_time_past_of(&location, 3), 1300);
    }

    #[test]
    fn test_find_tx_out_in_active_chain() {
        let chain = chain_with_timestamps(&[0, 600]);
        let tx = &chain.active_chain()[1].txs()[0];
        let utxo = chain
            .find_tx_out_in_active_chain(&OutPoint::new(tx.id(), 0))
            .unwrap();
        assert_eq!(utxo.height, 2);
        assert!(utxo.is_coinbase);
        assert!(chain
            .find_tx_out_in_active_chain(&OutPoint::new(tx.id(), 5))
            .is_none());
    }

    #[test]
    fn test_reset() {
        let mut chain = chain_with_timestamps(&[0, 600, 1200]);
        chain.add_side_branch(vec![]);
        chain.last_saved_height = 2;
        chain.reset();
        assert_eq!(chain.current_height(), 1);
        assert!(chain.side_branches().is_empty());
        assert_eq!(chain.last_saved_height, 0);
        assert_eq!(chain.tip().id(), chain.genesis().id());
    }
}
