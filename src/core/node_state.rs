//! Node state: the chain, the UTXO set and the mempool under one roof
//!
//! [`NodeState`] is constructed once at startup and shared through an `Arc`
//! by the network handlers, the miner loop and the wallet. Every operation
//! that touches more than one structure takes the locks in the order
//! chain → UTXO set → mempool → fee estimator.
//!
//! Connecting and disconnecting blocks runs inside a [`ChainUpdate`], which
//! borrows all guarded structures mutably for the whole operation. Relaying
//! and orphan-transaction retries happen after the locks are released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::block::Block;
use super::chain::{Chain, ACTIVE_CHAIN_IDX};
use super::chain_state::BlockStatus;
use super::params::ChainParams;
use super::transaction::Transaction;
use super::utxo::UtxoSet;
use super::validation::{validate_block, BlockValidationError, ChainView};
use crate::crypto::SigCache;
use crate::mining::fee_estimator::{FeeEstimates, FeeEstimator};
use crate::mining::pow::{calculate_fees, calculate_fees_in_block, chain_work, ChainWork};
use crate::mining::{Mempool, MempoolError};
use crate::network::{Message, PeerSender};
use crate::storage::{ChainStore, StorageError};

/// Current Unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Errors from chain mutation
#[derive(Error, Debug)]
pub enum ChainError {
    /// The in-memory state no longer matches what the operation assumed
    #[error("Chain invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// =============================================================================
// Chain update
// =============================================================================

/// Exclusive access to every structure a block connection touches
struct ChainUpdate<'a> {
    chain: &'a mut Chain,
    utxo: &'a mut UtxoSet,
    mempool: &'a mut Mempool,
    fee_estimator: &'a mut FeeEstimator,
    sig_cache: &'a SigCache,
    now: i64,
    /// Blocks accepted outside a reorg, in connection order
    accepted: Vec<Block>,
    /// At least one block landed on the active chain
    extended_active: bool,
    interrupt_miner: bool,
}

impl<'a> ChainUpdate<'a> {
    fn connect_block(&mut self, block: Block, doing_reorg: bool) -> Result<BlockStatus, ChainError> {
        let block_id = block.id().to_string();

        let seen = if doing_reorg {
            self.chain.locate_block_in_active_chain(&block_id).is_some()
        } else {
            self.chain.contains_block(&block_id)
        };
        if seen {
            log::debug!("Ignore already seen block {}", block_id);
            return Ok(BlockStatus::AlreadySeen);
        }

        if !doing_reorg {
            self.chain.orphans.prune(self.now);
        }

        let chain_idx = match validate_block(&block, self.chain, self.utxo, Some(self.sig_cache), self.now) {
            Ok(chain_idx) => chain_idx,
            Err(BlockValidationError::OrphanCandidate(orphan)) => {
                log::info!("Saw orphan block {}", block_id);
                self.chain.orphans.add(*orphan, self.now);
                return Ok(BlockStatus::Orphaned);
            }
            Err(e) => {
                log::warn!("Block {} failed validation: {}", block_id, e);
                return Ok(BlockStatus::Rejected(e.to_string()));
            }
        };

        if chain_idx == ACTIVE_CHAIN_IDX {
            self.apply_to_active(block.clone());
        } else if chain_idx <= self.chain.side_branches().len() {
            self.chain.push_side(chain_idx, block.clone());
        } else {
            let mut branch = match self.chain.locate_block_in_all_chains(block.prev_block_hash()) {
                Some((_, prev)) if prev.chain_idx != ACTIVE_CHAIN_IDX => {
                    self.chain.side_branch_prefix(prev.chain_idx, prev.position)
                }
                _ => Vec::new(),
            };
            branch.push(block.clone());
            self.chain.add_side_branch(branch);
        }
        log::info!("Block accepted: id={} chain_idx={}", block_id, chain_idx);

        if (!doing_reorg && self.reorg_if_necessary()?) || chain_idx == ACTIVE_CHAIN_IDX {
            self.interrupt_miner = true;
        }

        if !doing_reorg {
            self.accepted.push(block);
            for child in self.chain.orphans.take_children(&block_id) {
                log::info!("Connecting orphan {} to its parent {}", child.id(), block_id);
                self.connect_block(child, false)?;
            }
        }

        Ok(BlockStatus::Connected { chain_idx })
    }

    /// Push onto the active chain and update the UTXO set, mempool and fee history
    fn apply_to_active(&mut self, block: Block) {
        let tx_fees: Vec<(u64, usize)> = block
            .txs()
            .iter()
            .skip(1)
            .map(|tx| (calculate_fees_in_block(tx, block.txs(), self.utxo), tx.serialized_size()))
            .collect();

        self.chain.push_active(block.clone());
        let height = self.chain.current_height() as i64;

        for tx in block.txs() {
            if !tx.is_coinbase() {
                for outpoint in tx.inputs().iter().filter_map(|tx_in| tx_in.to_spend.as_ref()) {
                    self.utxo.remove(&outpoint.tx_id, outpoint.index);
                }
            }
            self.utxo.add_tx_outputs(tx, height);
        }

        self.mempool.remove_for_block(&block);
        self.fee_estimator.record_block(block.id(), &tx_fees);
        self.extended_active = true;
    }

    /// Roll back the active tip, which must be `block_id`
    fn disconnect_block(&mut self, block_id: &str) -> Result<Block, ChainError> {
        if self.chain.tip().id() != block_id {
            log::error!("Refusing to disconnect {}: not the active tip", block_id);
            return Err(ChainError::InvariantViolation(format!(
                "Block {} is not the active tip",
                block_id
            )));
        }
        let block = self
            .chain
            .pop_active()
            .ok_or_else(|| ChainError::InvariantViolation("Cannot disconnect genesis".into()))?;

        for tx in block.txs().iter().rev() {
            for index in 0..tx.outputs().len() {
                self.utxo.remove(tx.id(), index as i64);
            }
            if tx.is_coinbase() {
                continue;
            }
            for outpoint in tx.inputs().iter().filter_map(|tx_in| tx_in.to_spend.as_ref()) {
                // Outputs created earlier in the same block are gone with it
                if let Some(utxo) = self.chain.find_tx_out_in_active_chain(outpoint) {
                    self.utxo.add(
                        utxo.tx_out,
                        &utxo.outpoint.tx_id,
                        utxo.outpoint.index,
                        utxo.is_coinbase,
                        utxo.height,
                    );
                }
            }
        }

        for tx in block.txs().iter().filter(|tx| !tx.is_coinbase()) {
            let fee = calculate_fees(tx, self.utxo, Some(&*self.mempool));
            self.mempool.readd(tx.clone(), fee, self.now);
        }

        // The file now holds blocks that are no longer active
        self.chain.last_saved_height = 0;
        self.fee_estimator.unrecord_block(block.id());
        log::info!("Disconnected block {}", block.id());
        Ok(block)
    }

    /// Disconnect until `fork_id` is the tip; returns the removed blocks oldest first
    fn disconnect_to_fork(&mut self, fork_id: &str) -> Result<Vec<Block>, ChainError> {
        let mut disconnected = Vec::new();
        while self.chain.tip().id() != fork_id {
            if self.chain.current_height() <= 1 {
                return Err(ChainError::InvariantViolation(format!(
                    "Fork block {} is not on the active chain",
                    fork_id
                )));
            }
            let tip_id = self.chain.tip().id().to_string();
            disconnected.push(self.disconnect_block(&tip_id)?);
        }
        disconnected.reverse();
        Ok(disconnected)
    }

    /// Switch to the first side branch that is strictly longer than the active chain
    fn reorg_if_necessary(&mut self) -> Result<bool, ChainError> {
        let active_tip_height = self.chain.current_height() - 1;

        for chain_idx in 1..=self.chain.side_branches().len() {
            let Some(fork_height) = self.chain.fork_height(chain_idx) else {
                continue;
            };
            let branch_len = self.chain.side_branches()[chain_idx - 1].len();
            if fork_height + branch_len > active_tip_height {
                log::info!(
                    "Attempting reorg of side branch {} (height {} vs active {})",
                    chain_idx,
                    fork_height + branch_len,
                    active_tip_height
                );
                if self.try_reorg(chain_idx, fork_height)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn try_reorg(&mut self, chain_idx: usize, fork_height: usize) -> Result<bool, ChainError> {
        let branch = self.chain.side_branches()[chain_idx - 1].clone();
        let fork_id = self.chain.active_chain()[fork_height].id().to_string();

        let old_active = self.disconnect_to_fork(&fork_id)?;

        for block in branch {
            let block_id = block.id().to_string();
            let status = self.connect_block(block, true)?;
            if !status.is_active() {
                log::warn!(
                    "Reorg of branch {} failed at block {} ({:?}), rolling back",
                    chain_idx,
                    block_id,
                    status
                );
                self.rollback_reorg(&fork_id, old_active)?;
                return Ok(false);
            }
        }

        self.chain.remove_side_branch(chain_idx);
        if !old_active.is_empty() {
            self.chain.add_side_branch(old_active);
        }
        log::info!(
            "Chain reorganization complete, new tip {} at height {} (chain work {})",
            self.chain.tip().id(),
            self.chain.current_height() - 1,
            chain_work(self.chain.active_chain())
        );
        Ok(true)
    }

    fn rollback_reorg(&mut self, fork_id: &str, old_active: Vec<Block>) -> Result<(), ChainError> {
        self.disconnect_to_fork(fork_id)?;
        for block in old_active {
            let block_id = block.id().to_string();
            if !self.connect_block(block, true)?.is_active() {
                log::error!("Failed to restore block {} after an aborted reorg", block_id);
                return Err(ChainError::InvariantViolation(format!(
                    "Block {} could not be restored after an aborted reorg",
                    block_id
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Node state
// =============================================================================

/// Everything a node knows about the chain, shared between threads
pub struct NodeState {
    params: ChainParams,
    chain: RwLock<Chain>,
    utxo_set: RwLock<UtxoSet>,
    mempool: Mutex<Mempool>,
    fee_estimator: Mutex<FeeEstimator>,
    sig_cache: SigCache,
    /// Raised whenever the active tip changes; the miner abandons its search
    mine_interrupt: AtomicBool,
    ibd_complete: AtomicBool,
    peers: Arc<dyn PeerSender>,
    store: Option<ChainStore>,
}

impl NodeState {
    pub fn new(params: ChainParams, peers: Arc<dyn PeerSender>, store: Option<ChainStore>) -> Self {
        let chain = Chain::new(&params);
        let mut utxo_set = UtxoSet::new();
        for tx in chain.genesis().txs() {
            utxo_set.add_tx_outputs(tx, 1);
        }
        Self {
            params,
            chain: RwLock::new(chain),
            utxo_set: RwLock::new(utxo_set),
            mempool: Mutex::new(Mempool::new()),
            fee_estimator: Mutex::new(FeeEstimator::new()),
            sig_cache: SigCache::new(),
            mine_interrupt: AtomicBool::new(false),
            ibd_complete: AtomicBool::new(false),
            peers,
            store,
        }
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn chain(&self) -> &RwLock<Chain> {
        &self.chain
    }

    pub fn utxo_set(&self) -> &RwLock<UtxoSet> {
        &self.utxo_set
    }

    pub fn mempool(&self) -> &Mutex<Mempool> {
        &self.mempool
    }

    pub fn sig_cache(&self) -> &SigCache {
        &self.sig_cache
    }

    pub fn peers(&self) -> &Arc<dyn PeerSender> {
        &self.peers
    }

    pub fn mine_interrupt(&self) -> &AtomicBool {
        &self.mine_interrupt
    }

    pub fn is_ibd_complete(&self) -> bool {
        self.ibd_complete.load(Ordering::SeqCst)
    }

    pub fn set_ibd_complete(&self, complete: bool) {
        self.ibd_complete.store(complete, Ordering::SeqCst);
    }

    /// Active-chain length, genesis included
    pub fn current_height(&self) -> usize {
        self.chain.read().current_height()
    }

    pub fn tip_id(&self) -> String {
        self.chain.read().tip().id().to_string()
    }

    /// Cumulative work of the active chain, genesis included
    pub fn chain_work(&self) -> ChainWork {
        chain_work(self.chain.read().active_chain())
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    /// Validate and connect a block, then relay everything that got accepted
    pub fn connect_block(&self, block: Block) -> BlockStatus {
        self.connect_block_with_relay(block, true)
    }

    fn connect_block_with_relay(&self, block: Block, relay: bool) -> BlockStatus {
        let block_id = block.id().to_string();
        let (status, accepted, extended_active, interrupt_miner) = {
            let mut chain = self.chain.write();
            let mut utxo = self.utxo_set.write();
            let mut mempool = self.mempool.lock();
            let mut fee_estimator = self.fee_estimator.lock();
            let mut update = ChainUpdate {
                chain: &mut chain,
                utxo: &mut utxo,
                mempool: &mut mempool,
                fee_estimator: &mut fee_estimator,
                sig_cache: &self.sig_cache,
                now: unix_now(),
                accepted: Vec::new(),
                extended_active: false,
                interrupt_miner: false,
            };
            let status = update.connect_block(block, false).unwrap_or_else(|e| {
                log::error!("Connecting block {} aborted: {}", block_id, e);
                BlockStatus::Rejected(e.to_string())
            });
            (status, update.accepted, update.extended_active, update.interrupt_miner)
        };

        if interrupt_miner {
            self.mine_interrupt.store(true, Ordering::SeqCst);
        }
        if extended_active {
            self.retry_orphan_txs();
        }
        if relay {
            for block in accepted {
                self.peers.broadcast(Message::BlockInfo(block));
            }
        }
        status
    }

    /// Roll back the active tip; its transactions return to the mempool
    pub fn disconnect_tip(&self) -> Result<Block, ChainError> {
        let mut chain = self.chain.write();
        let mut utxo = self.utxo_set.write();
        let mut mempool = self.mempool.lock();
        let mut fee_estimator = self.fee_estimator.lock();
        let tip_id = chain.tip().id().to_string();
        let mut update = ChainUpdate {
            chain: &mut chain,
            utxo: &mut utxo,
            mempool: &mut mempool,
            fee_estimator: &mut fee_estimator,
            sig_cache: &self.sig_cache,
            now: unix_now(),
            accepted: Vec::new(),
            extended_active: false,
            interrupt_miner: false,
        };
        let block = update.disconnect_block(&tip_id)?;
        self.mine_interrupt.store(true, Ordering::SeqCst);
        Ok(block)
    }

    /// Back to a genesis-only chain with an empty mempool
    pub fn reset(&self) {
        let mut chain = self.chain.write();
        let mut utxo = self.utxo_set.write();
        let mut mempool = self.mempool.lock();
        let mut fee_estimator = self.fee_estimator.lock();

        chain.reset();
        utxo.clear();
        for tx in chain.genesis().txs() {
            utxo.add_tx_outputs(tx, 1);
        }
        mempool.clear();
        fee_estimator.reset();
        log::info!("Chain reset to genesis");
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Validate a transaction against the active tip and pool it, relaying on
    /// success. Orphans waiting on it are retried afterwards.
    pub fn add_tx_to_mempool(&self, tx: Transaction) -> Result<(), MempoolError> {
        let tx_id = tx.id().to_string();
        let result = {
            let chain = self.chain.read();
            let utxo = self.utxo_set.read();
            let mut mempool = self.mempool.lock();
            let view = ChainView::for_next_block(&chain, &utxo, Some(&self.sig_cache));
            mempool.add_tx(tx.clone(), &view, unix_now())
        };

        match result {
            Ok(replaced) => {
                if !replaced.is_empty() {
                    log::info!("Transaction {} replaced {} pooled transactions", tx_id, replaced.len());
                }
                log::info!("Transaction {} added to mempool", tx_id);
                self.peers.broadcast(Message::TxInfo(tx));

                let orphans = self.mempool.lock().take_orphans_spending(&tx_id);
                for orphan in orphans {
                    let orphan_id = orphan.id().to_string();
                    if let Err(e) = self.add_tx_to_mempool(orphan) {
                        log::debug!("Orphan transaction {} still rejected: {}", orphan_id, e);
                    }
                }
                Ok(())
            }
            Err(MempoolError::AlreadySeen(id)) => {
                log::trace!("Transaction {} already in mempool", id);
                Err(MempoolError::AlreadySeen(id))
            }
            Err(e) => {
                log::info!("Transaction {} rejected: {}", tx_id, e);
                Err(e)
            }
        }
    }

    fn retry_orphan_txs(&self) {
        let orphans = self.mempool.lock().take_orphans();
        for orphan in orphans {
            let orphan_id = orphan.id().to_string();
            if let Err(e) = self.add_tx_to_mempool(orphan) {
                log::trace!("Orphan transaction {} not accepted yet: {}", orphan_id, e);
            }
        }
    }

    /// Fill `template` with pooled transactions, ancestors first
    pub fn select_from_mempool(&self, template: Block) -> Block {
        let utxo = self.utxo_set.read();
        let mempool = self.mempool.lock();
        mempool.select_from_mempool(template, &utxo)
    }

    /// Drop expired pooled transactions
    pub fn expire_mempool(&self) -> usize {
        self.mempool.lock().expire_old_transactions(unix_now())
    }

    pub fn estimate_fee_rate(&self, target_blocks: u32) -> u64 {
        let rates = self.mempool.lock().fee_rates();
        let mut fee_estimator = self.fee_estimator.lock();
        fee_estimator.update_mempool(rates);
        fee_estimator.estimate_fee_rate(target_blocks)
    }

    pub fn fee_estimates(&self) -> FeeEstimates {
        let rates = self.mempool.lock().fee_rates();
        let mut fee_estimator = self.fee_estimator.lock();
        fee_estimator.update_mempool(rates);
        fee_estimator.get_all_estimates()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the active chain; a no-op for nodes without a store
    pub fn save_to_disk(&self) -> Result<(), ChainError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut chain = self.chain.write();
        let written = store.save(chain.active_chain(), chain.last_saved_height)?;
        chain.last_saved_height = chain.current_height() - 1;
        log::debug!("Saved chain to disk ({} new blocks)", written);
        Ok(())
    }

    /// Replay the chain file. Any block that fails to extend the active chain
    /// resets the node to genesis. Returns whether a chain was loaded.
    pub fn load_from_disk(&self) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let blocks = match store.load_blocks() {
            Ok(blocks) => blocks,
            Err(e) => {
                log::warn!("Failed to read chain file: {}", e);
                return false;
            }
        };
        if blocks.is_empty() {
            return false;
        }

        let count = blocks.len();
        for block in blocks {
            let block_id = block.id().to_string();
            let status = self.connect_block_with_relay(block, false);
            if !status.is_active() {
                log::error!(
                    "Block {} from disk did not extend the active chain ({:?}), resetting",
                    block_id,
                    status
                );
                self.reset();
                return false;
            }
        }

        let mut chain = self.chain.write();
        chain.last_saved_height = chain.current_height() - 1;
        log::info!("Loaded {} blocks from disk", count);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{COIN, SEQUENCE_FINAL};
    use crate::core::transaction::{OutPoint, TxIn, TxOut};
    use crate::core::validation::build_spend_msg;
    use crate::crypto::{merkle_root_of_txs, KeyPair};
    use crate::mining::pow::next_work_required;
    use crate::network::NoPeers;
    use crate::storage::StorageConfig;

    struct Fixture {
        key: KeyPair,
        node: NodeState,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_store(None)
        }

        fn with_store(store: Option<ChainStore>) -> Self {
            let key = KeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
            let params = ChainParams::with_bits(1, 1_600_000_000, &key.address());
            let node = NodeState::new(params, Arc::new(NoPeers), store);
            Self { key, node }
        }

        /// A solved block on `parent` at `height`, coinbase paying `tag`
        fn block_on(&self, parent: &Block, height: usize, tag: &str, txs: Vec<Transaction>) -> Block {
            let bits = next_work_required(&self.node.chain().read(), parent.id()).unwrap();
            let mut all = vec![Transaction::create_coinbase(tag, COIN, height as i64)];
            all.extend(txs);
            let merkle = merkle_root_of_txs(&all);
            let mut block = Block::new(
                0,
                parent.id().to_string(),
                merkle,
                parent.timestamp() + 600,
                bits,
                0,
                all,
            );
            block.solve();
            block
        }

        /// Extend the active tip by one block
        fn mine_next(&self, tag: &str, txs: Vec<Transaction>) -> Block {
            let (tip, height) = {
                let chain = self.node.chain().read();
                (chain.tip().clone(), chain.current_height())
            };
            let block = self.block_on(&tip, height, tag, txs);
            assert!(self.node.connect_block(block.clone()).is_active());
            block
        }

        fn spend_genesis(&self, value: u64) -> Transaction {
            let genesis_tx = self.node.chain().read().genesis().txs()[0].clone();
            let outpoint = OutPoint::new(genesis_tx.id(), 0);
            let outputs = vec![TxOut::new(value, "recipient")];
            let msg = build_spend_msg(&outpoint, &self.key.public_key_bytes(), SEQUENCE_FINAL, &outputs);
            let tx_in = TxIn::new(
                Some(outpoint),
                self.key.sign(&msg).unwrap(),
                self.key.public_key_bytes(),
                SEQUENCE_FINAL,
            );
            Transaction::new(vec![tx_in], outputs, 0)
        }

        fn assert_linked(&self) {
            let chain = self.node.chain().read();
            for pair in chain.active_chain().windows(2) {
                assert_eq!(pair[1].prev_block_hash(), pair[0].id());
            }
        }
    }

    #[test]
    fn test_new_state_holds_genesis_outputs() {
        let fixture = Fixture::new();
        assert_eq!(fixture.node.current_height(), 1);
        let utxo = fixture.node.utxo_set().read();
        assert_eq!(utxo.len(), 1);
        assert_eq!(utxo.for_address(&fixture.key.address()).len(), 1);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let fixture = Fixture::new();
        let block = fixture.mine_next("miner", vec![]);
        assert!(fixture.node.mine_interrupt().load(Ordering::SeqCst));
        assert_eq!(fixture.node.connect_block(block), BlockStatus::AlreadySeen);
        assert_eq!(fixture.node.current_height(), 2);
        assert_eq!(fixture.node.utxo_set().read().len(), 2);
    }

    #[test]
    fn test_rejects_bad_pow() {
        let fixture = Fixture::new();
        let genesis = fixture.node.chain().read().genesis().clone();
        let mut block = fixture.block_on(&genesis, 1, "miner", vec![]);
        // Find a nonce whose hash misses the one-bit target
        let mut nonce = block.nonce();
        while block.has_valid_pow() {
            nonce += 1;
            block.set_nonce(nonce);
        }
        assert!(matches!(fixture.node.connect_block(block), BlockStatus::Rejected(_)));
        assert_eq!(fixture.node.current_height(), 1);
    }

    #[test]
    fn test_orphan_connects_when_parent_arrives() {
        let fixture = Fixture::new();
        let genesis = fixture.node.chain().read().genesis().clone();
        let b1 = fixture.block_on(&genesis, 1, "miner", vec![]);
        let b2 = fixture.block_on(&b1, 2, "miner", vec![]);

        assert_eq!(fixture.node.connect_block(b2.clone()), BlockStatus::Orphaned);
        assert_eq!(fixture.node.current_height(), 1);

        assert!(fixture.node.connect_block(b1).is_active());
        assert_eq!(fixture.node.current_height(), 3);
        assert_eq!(fixture.node.tip_id(), b2.id());
        assert!(fixture.node.chain().read().orphans.is_empty());
    }

    #[test]
    fn test_reorg_to_longer_branch() {
        let fixture = Fixture::new();
        let genesis = fixture.node.chain().read().genesis().clone();

        let a1 = fixture.mine_next("alice", vec![]);
        let a2 = fixture.mine_next("alice", vec![]);

        let tx = fixture.spend_genesis(49 * COIN);
        fixture.node.add_tx_to_mempool(tx.clone()).unwrap();
        assert!(fixture.node.mempool().lock().contains(tx.id()));

        let a3 = fixture.mine_next("alice", vec![]);

        let b1 = fixture.block_on(&genesis, 1, "bob", vec![]);
        let b2 = fixture.block_on(&b1, 2, "bob", vec![]);
        let b3 = fixture.block_on(&b2, 3, "bob", vec![tx.clone()]);
        let b4 = fixture.block_on(&b3, 4, "bob", vec![]);
        let b5 = fixture.block_on(&b4, 5, "bob", vec![]);

        // Deliver out of order: b3 waits as an orphan until b2 shows up
        assert_eq!(fixture.node.connect_block(b1.clone()), BlockStatus::Connected { chain_idx: 1 });
        assert_eq!(fixture.node.connect_block(b3.clone()), BlockStatus::Orphaned);
        assert_eq!(fixture.node.connect_block(b2.clone()), BlockStatus::Connected { chain_idx: 1 });
        assert_eq!(fixture.node.tip_id(), a3.id());

        assert!(matches!(fixture.node.connect_block(b5.clone()), BlockStatus::Orphaned));
        fixture.node.connect_block(b4.clone());

        let chain = fixture.node.chain().read();
        let active_ids: Vec<&str> = chain.active_chain().iter().map(Block::id).collect();
        assert_eq!(
            active_ids,
            vec![genesis.id(), b1.id(), b2.id(), b3.id(), b4.id(), b5.id()]
        );
        assert_eq!(chain.side_branches().len(), 1);
        let side_ids: Vec<&str> = chain.side_branches()[0].iter().map(Block::id).collect();
        assert_eq!(side_ids, vec![a1.id(), a2.id(), a3.id()]);
        drop(chain);
        fixture.assert_linked();

        let utxo = fixture.node.utxo_set().read();
        assert_eq!(utxo.for_address("bob").len(), 5);
        assert!(utxo.for_address("alice").is_empty());
        assert_eq!(utxo.for_address("recipient").len(), 1);
        assert!(utxo.for_address(&fixture.key.address()).is_empty());
        // Coinbases of b1..b5, the payment, nothing else
        assert_eq!(utxo.len(), 6);
        drop(utxo);

        assert!(!fixture.node.mempool().lock().contains(tx.id()));
    }

    #[test]
    fn test_equal_length_branch_does_not_reorg() {
        let fixture = Fixture::new();
        let genesis = fixture.node.chain().read().genesis().clone();
        let a1 = fixture.mine_next("alice", vec![]);
        let b1 = fixture.block_on(&genesis, 1, "bob", vec![]);
        assert_eq!(fixture.node.connect_block(b1), BlockStatus::Connected { chain_idx: 1 });
        assert_eq!(fixture.node.tip_id(), a1.id());
    }

    #[test]
    fn test_failed_reorg_rolls_back() {
        let fixture = Fixture::new();
        let genesis = fixture.node.chain().read().genesis().clone();
        let a1 = fixture.mine_next("alice", vec![]);
        let utxo_before: Vec<_> = {
            let utxo = fixture.node.utxo_set().read();
            let mut entries: Vec<_> = utxo.iter().map(|(outpoint, _)| outpoint.clone()).collect();
            entries.sort();
            entries
        };

        // Invalid against the active UTXO set, which side-branch validation
        // does not look at
        let bad_tx = fixture.spend_genesis(51 * COIN);
        let c1 = fixture.block_on(&genesis, 1, "carol", vec![]);
        let c2 = fixture.block_on(&c1, 2, "carol", vec![bad_tx]);

        assert_eq!(fixture.node.connect_block(c1), BlockStatus::Connected { chain_idx: 1 });
        assert_eq!(fixture.node.connect_block(c2), BlockStatus::Connected { chain_idx: 1 });

        assert_eq!(fixture.node.tip_id(), a1.id());
        assert_eq!(fixture.node.current_height(), 2);
        let chain = fixture.node.chain().read();
        assert_eq!(chain.side_branches().len(), 1);
        assert_eq!(chain.side_branches()[0].len(), 2);
        drop(chain);

        let utxo_after: Vec<_> = {
            let utxo = fixture.node.utxo_set().read();
            let mut entries: Vec<_> = utxo.iter().map(|(outpoint, _)| outpoint.clone()).collect();
            entries.sort();
            entries
        };
        assert_eq!(utxo_before, utxo_after);
    }

    #[test]
    fn test_disconnect_returns_txs_to_mempool() {
        let fixture = Fixture::new();
        fixture.mine_next("miner", vec![]);
        fixture.mine_next("miner", vec![]);
        let tx = fixture.spend_genesis(49 * COIN);
        fixture.mine_next("miner", vec![tx.clone()]);
        assert!(fixture
            .node
            .utxo_set()
            .read()
            .for_address(&fixture.key.address())
            .is_empty());

        let block = fixture.node.disconnect_tip().unwrap();
        assert!(block.txs().iter().any(|t| t.id() == tx.id()));
        assert_eq!(fixture.node.current_height(), 3);

        let utxo = fixture.node.utxo_set().read();
        assert_eq!(utxo.for_address(&fixture.key.address()).len(), 1);
        assert!(utxo.for_address("recipient").is_empty());
        drop(utxo);

        let mempool = fixture.node.mempool().lock();
        assert_eq!(mempool.get_entry(tx.id()).map(|entry| entry.fee), Some(COIN));
    }

    #[test]
    fn test_disconnect_genesis_is_an_invariant_violation() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.node.disconnect_tip(),
            Err(ChainError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_reset() {
        let fixture = Fixture::new();
        fixture.mine_next("miner", vec![]);
        fixture.node.reset();
        assert_eq!(fixture.node.current_height(), 1);
        assert_eq!(fixture.node.utxo_set().read().len(), 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };

        let fixture = Fixture::with_store(Some(ChainStore::new(config.clone()).unwrap()));
        fixture.mine_next("miner", vec![]);
        fixture.mine_next("miner", vec![]);
        fixture.node.save_to_disk().unwrap();
        fixture.mine_next("miner", vec![]);
        fixture.node.save_to_disk().unwrap();
        let tip = fixture.node.tip_id();

        let reloaded = Fixture::with_store(Some(ChainStore::new(config).unwrap()));
        assert!(reloaded.node.load_from_disk());
        assert_eq!(reloaded.node.current_height(), 4);
        assert_eq!(reloaded.node.tip_id(), tip);
        assert_eq!(reloaded.node.chain().read().last_saved_height, 3);
        assert_eq!(reloaded.node.utxo_set().read().len(), 4);
    }

    #[test]
    fn test_load_resets_on_broken_chain_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap();

        let fixture = Fixture::new();
        fixture.mine_next("miner", vec![]);
        let b2 = fixture.mine_next("miner", vec![]);
        let genesis = fixture.node.chain().read().genesis().clone();
        // b2 without its parent can not extend the active chain
        store.save(&[genesis, b2], 0).unwrap();

        let reloaded = Fixture::with_store(Some(store));
        assert!(!reloaded.node.load_from_disk());
        assert_eq!(reloaded.node.current_height(), 1);
        assert!(reloaded.node.chain().read().orphans.is_empty());
    }
}
