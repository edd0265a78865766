//! Proof-of-work engine
//!
//! Difficulty retargeting, block subsidy and fee arithmetic, plus the
//! [`PowEngine`] that assembles candidate blocks on the active tip and hands
//! their header to a [`MiningBackend`].

use std::cmp;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::info;
use thiserror::Error;

use crate::core::chain::Chain;
use crate::core::node_state::{unix_now, NodeState};
use crate::core::params::{
    COIN, DIFFICULTY_PERIOD_IN_BLOCKS, DIFFICULTY_PERIOD_IN_SECS_TARGET,
    HALVE_SUBSIDY_AFTER_BLOCKS_NUM, MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES, MTP_BLOCK_COUNT,
};
use crate::core::{Block, Transaction, UtxoSet};
use crate::crypto::{merkle_root_of_txs, target_from_bits};
use crate::mining::backend::MiningBackend;
use crate::mining::Mempool;
use crate::network::Message;

/// Initial block download gives up on a peer after this long without progress
pub const IBD_STALL_TIMEOUT: Duration = Duration::from_secs(30);

pub const IBD_MAX_RETRIES: u32 = 3;

/// Wait before retrying when no peer is connected
pub const IBD_NO_PEER_WAIT: Duration = Duration::from_secs(5);

const IBD_POLL_INTERVAL: Duration = Duration::from_millis(100);
const IBD_PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowError {
    #[error("Block too large: {size} bytes (max {max})")]
    BlockTooLarge { size: usize, max: usize },
    #[error("Unknown parent block {0}")]
    UnknownParent(String),
}

// =============================================================================
// Difficulty
// =============================================================================

/// Difficulty bits for the child of `prev_block_hash`, which may sit on any
/// chain. `None` when the parent is unknown.
pub fn next_work_required(chain: &Chain, prev_block_hash: &str) -> Option<u8> {
    if prev_block_hash.is_empty() {
        return Some(chain.initial_bits());
    }

    let (prev, location) = chain.locate_block_in_all_chains(prev_block_hash)?;
    if (location.height + 1) % DIFFICULTY_PERIOD_IN_BLOCKS != 0 {
        return Some(prev.bits());
    }

    let start_height = location.height.saturating_sub(DIFFICULTY_PERIOD_IN_BLOCKS - 1);
    let period_start = chain.ancestor_at(&location, start_height)?;
    let actual = prev.timestamp() - period_start.timestamp();
    let bits = retarget_bits(prev.bits(), actual);

    log::debug!(
        "Retarget at height {}: period took {}s, bits {} -> {}",
        location.height + 1,
        actual,
        prev.bits(),
        bits
    );
    Some(bits)
}

/// Scale the target `2^(255 - bits)` by `actual / target period`, clamped to
/// a factor of four either way, and keep the most significant bit
pub fn retarget_bits(prev_bits: u8, actual_timespan: i64) -> u8 {
    let target = DIFFICULTY_PERIOD_IN_SECS_TARGET;
    let actual = actual_timespan.clamp(target / 4, target * 4);

    // floor(log2(actual / target)), which the clamp bounds to -2..=2
    let exponent = (-2i32..=2)
        .rev()
        .find(|e| {
            if *e >= 0 {
                actual >= target << e
            } else {
                actual << -e >= target
            }
        })
        .unwrap_or(-2);

    let msb = 255 - prev_bits as i32 + exponent;
    if msb < 0 {
        255
    } else {
        (255 - msb.min(255)) as u8
    }
}

/// Amount of proof of work as a 256-bit unsigned integer (little-endian
/// 64-bit limbs)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChainWork([u64; 4]);

impl ChainWork {
    pub const ZERO: Self = Self([0; 4]);
    pub const MAX: Self = Self([u64::MAX; 4]);

    pub fn from_u128(value: u128) -> Self {
        Self([value as u64, (value >> 64) as u64, 0, 0])
    }

    /// The value, if it fits in a `u128`
    pub fn to_u128(&self) -> Option<u128> {
        (self.0[2] == 0 && self.0[3] == 0).then(|| u128::from(self.0[0]) | (u128::from(self.0[1]) << 64))
    }

    fn set_bit(&mut self, bit: u32) {
        self.0[(bit / 64) as usize] |= 1 << (bit % 64);
    }

    pub fn saturating_add(self, other: Self) -> Self {
        let mut limbs = [0u64; 4];
        let mut carry = false;
        for (i, limb) in limbs.iter_mut().enumerate() {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(u64::from(carry));
            *limb = sum;
            carry = c1 || c2;
        }
        if carry {
            Self::MAX
        } else {
            Self(limbs)
        }
    }
}

impl Ord for ChainWork {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.0.iter().rev().cmp(other.0.iter().rev())
    }
}

impl PartialOrd for ChainWork {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChainWork {
    /// Hex without leading zeros
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut limbs = self.0.iter().rev().skip_while(|limb| **limb == 0);
        match limbs.next() {
            Some(top) => write!(f, "0x{:x}", top)?,
            None => return write!(f, "0x0"),
        }
        for limb in limbs {
            write!(f, "{:016x}", limb)?;
        }
        Ok(())
    }
}

/// Expected number of hashes to meet the target of `bits`:
/// `floor(2^256 / (target + 1))` with `target = 2^(255 - bits)`
pub fn block_work(bits: u8) -> ChainWork {
    if bits <= 127 {
        // Exactly 2^(bits + 1) - 1 while the target is at least 2^128
        return ChainWork::from_u128(u128::MAX >> (127 - bits));
    }

    // Long division of 2^256 by the divisor, one quotient bit at a time.
    // The remainder stays below the divisor, so doubling it is done as
    // `r - (d - r)` once it would cross the divisor.
    let divisor = (1u128 << (255 - bits)) + 1;
    let mut work = ChainWork::ZERO;
    let mut remainder = 1u128;
    for bit in (0..256).rev() {
        if remainder >= divisor - remainder {
            remainder -= divisor - remainder;
            work.set_bit(bit);
        } else {
            remainder *= 2;
        }
    }
    work
}

/// Total work of a run of blocks
pub fn chain_work<'a>(blocks: impl IntoIterator<Item = &'a Block>) -> ChainWork {
    blocks
        .into_iter()
        .fold(ChainWork::ZERO, |total, block| total.saturating_add(block_work(block.bits())))
}

/// Coinbase subsidy for the next block of an active chain of `active_len` blocks
pub fn block_subsidy(active_len: usize) -> u64 {
    let halvings = active_len / HALVE_SUBSIDY_AFTER_BLOCKS_NUM;
    if halvings >= 64 {
        return 0;
    }
    (50 * COIN) >> halvings
}

// =============================================================================
// Fees
// =============================================================================

/// Inputs minus outputs. Inputs resolve through the UTXO set, then the
/// mempool; unresolvable inputs count as zero and a negative result is 0.
pub fn calculate_fees(tx: &Transaction, utxo_set: &UtxoSet, mempool: Option<&Mempool>) -> u64 {
    let spent: u64 = tx
        .inputs()
        .iter()
        .filter_map(|tx_in| tx_in.to_spend.as_ref())
        .filter_map(|outpoint| {
            utxo_set
                .find(outpoint)
                .map(|utxo| utxo.value())
                .or_else(|| mempool.and_then(|m| m.find_utxo_in_mempool(outpoint)).map(|utxo| utxo.value()))
        })
        .fold(0u64, u64::saturating_add);
    spent.saturating_sub(tx.total_output().unwrap_or(u64::MAX))
}

/// Fee of `tx` when inputs may also come from earlier transactions of its block
pub fn calculate_fees_in_block(tx: &Transaction, block_txs: &[Transaction], utxo_set: &UtxoSet) -> u64 {
    if tx.is_coinbase() {
        return 0;
    }
    let spent: u64 = tx
        .inputs()
        .iter()
        .filter_map(|tx_in| {
            let outpoint = tx_in.to_spend.as_ref()?;
            utxo_set
                .find(outpoint)
                .cloned()
                .or_else(|| UtxoSet::find_in_list(tx_in, block_txs))
        })
        .map(|utxo| utxo.value())
        .fold(0u64, u64::saturating_add);
    spent.saturating_sub(tx.total_output().unwrap_or(u64::MAX))
}

/// Total fees of the non-coinbase transactions of a block
pub fn calculate_block_fees(block: &Block, utxo_set: &UtxoSet) -> u64 {
    block
        .txs()
        .iter()
        .map(|tx| calculate_fees_in_block(tx, block.txs(), utxo_set))
        .fold(0u64, u64::saturating_add)
}

// =============================================================================
// Engine
// =============================================================================

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

/// Builds blocks on the active tip and searches their nonce
pub struct PowEngine {
    node: Arc<NodeState>,
    backend: Arc<dyn MiningBackend>,
}

impl PowEngine {
    pub fn new(node: Arc<NodeState>, backend: Arc<dyn MiningBackend>) -> Self {
        Self { node, backend }
    }

    pub fn node(&self) -> &Arc<NodeState> {
        &self.node
    }

    /// Build an unsolved block on the active tip paying `pay_to`. Without
    /// explicit `txs` the block is filled from the mempool.
    ///
    /// Clears a pending interrupt first: any tip change after this point
    /// aborts the search for this block.
    pub fn assemble_block(&self, pay_to: &str, txs: Option<Vec<Transaction>>) -> Result<Block, PowError> {
        let _ = self
            .node
            .mine_interrupt()
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst);

        let (prev_id, height, bits, mtp) = {
            let chain = self.node.chain().read();
            let tip = chain.tip();
            let bits = next_work_required(&chain, tip.id())
                .ok_or_else(|| PowError::UnknownParent(tip.id().to_string()))?;
            (
                tip.id().to_string(),
                chain.current_height(),
                bits,
                chain.median_time_past(MTP_BLOCK_COUNT),
            )
        };

        let timestamp = unix_now().max(mtp + 1);
        let template = Block::new(0, prev_id, String::new(), timestamp, bits, 0, Vec::new());
        let mut block = match txs {
            Some(txs) => {
                let mut block = template;
                block.txs_mut().extend(txs);
                block
            }
            None => self.node.select_from_mempool(template),
        };

        let fees = calculate_block_fees(&block, &self.node.utxo_set().read());
        let reward = block_subsidy(height).saturating_add(fees);
        let coinbase = Transaction::create_coinbase(pay_to, reward, height as i64);
        block.txs_mut().insert(0, coinbase);
        block.set_merkle_hash(merkle_root_of_txs(block.txs()));

        let size = block.serialized_size();
        if size > MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES {
            return Err(PowError::BlockTooLarge {
                size,
                max: MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES,
            });
        }

        info!(
            "Assembled block at height {} with {} transactions ({} fees, bits {})",
            height,
            block.txs().len(),
            fees,
            bits
        );
        Ok(block)
    }

    /// Search for a nonce. `None` when a new tip interrupted the search or
    /// the nonce space ran out.
    pub fn mine(&self, mut block: Block) -> Option<(Block, MiningStats)> {
        let start = Instant::now();
        let interrupt = self.node.mine_interrupt();
        let result = self
            .backend
            .mine(&block.header_prefix(), &target_from_bits(block.bits()), interrupt);

        if interrupt
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Mining interrupted by a new block");
            return None;
        }
        if !result.found {
            log::error!("Nonce space exhausted without finding a solution");
            return None;
        }

        let elapsed = start.elapsed().as_millis();
        let hash_rate = if elapsed > 0 {
            (result.hash_count as f64) / (elapsed as f64 / 1000.0)
        } else {
            result.hash_count as f64
        };
        block.set_nonce(result.nonce);

        info!(
            "Block {} mined in {}ms ({} attempts, {:.2} kH/s, backend {})",
            block.id(),
            elapsed,
            result.hash_count,
            hash_rate / 1000.0,
            self.backend.name()
        );

        Some((
            block,
            MiningStats {
                hash_attempts: result.hash_count,
                time_ms: elapsed,
                hash_rate,
            },
        ))
    }

    pub fn assemble_and_solve_block(
        &self,
        pay_to: &str,
        txs: Option<Vec<Transaction>>,
    ) -> Result<Option<Block>, PowError> {
        let block = self.assemble_block(pay_to, txs)?;
        Ok(self.mine(block).map(|(block, _)| block))
    }

    /// Ask random peers for the blocks after our tip until an `Inv` brings
    /// nothing new. Gives up after repeated stalls, resetting to genesis.
    pub fn initial_block_download(&self) -> bool {
        let node = &self.node;
        node.set_ibd_complete(false);

        let mut retry = 0;
        while retry < IBD_MAX_RETRIES && !node.is_ibd_complete() {
            let tip_id = node.tip_id();
            if !node.peers().send_to_random(Message::GetBlock { from_block_id: tip_id }) {
                log::warn!(
                    "No peers available for initial block sync, retrying ({}/{})",
                    retry + 1,
                    IBD_MAX_RETRIES
                );
                thread::sleep(IBD_NO_PEER_WAIT);
                retry += 1;
                continue;
            }

            info!("Starting initial block sync (attempt {}/{})", retry + 1, IBD_MAX_RETRIES);
            let mut last_height = node.current_height();
            let mut last_progress = Instant::now();
            let mut last_log = Instant::now();

            while !node.is_ibd_complete() {
                thread::sleep(IBD_POLL_INTERVAL);

                let height = node.current_height();
                if height > last_height {
                    last_height = height;
                    last_progress = Instant::now();
                }
                if last_log.elapsed() >= IBD_PROGRESS_LOG_INTERVAL {
                    info!("Sync in progress, current chain height: {}", height);
                    last_log = Instant::now();
                }
                if last_progress.elapsed() >= IBD_STALL_TIMEOUT {
                    log::warn!(
                        "Sync stalled at height {} for {} seconds",
                        height,
                        IBD_STALL_TIMEOUT.as_secs()
                    );
                    break;
                }
            }

            if !node.is_ibd_complete() {
                retry += 1;
            }
        }

        if node.is_ibd_complete() {
            return true;
        }
        log::error!("Initial block sync failed after {} retries, resetting chain", IBD_MAX_RETRIES);
        node.reset();
        node.set_ibd_complete(true);
        false
    }

    /// Load the chain, sync, then mine on the tip until the process exits
    pub fn mine_forever(&self, pay_to: &str) -> ! {
        self.node.load_from_disk();
        self.initial_block_download();

        loop {
            let expired = self.node.expire_mempool();
            if expired > 0 {
                info!("Expired {} mempool transactions", expired);
            }

            match self.assemble_and_solve_block(pay_to, None) {
                Ok(Some(block)) => {
                    self.node.connect_block(block);
                    if let Err(e) = self.node.save_to_disk() {
                        log::error!("Failed to save chain: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("Failed to assemble block: {}", e);
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{ChainParams, SEQUENCE_FINAL};
    use crate::core::transaction::{OutPoint, TxIn, TxOut};
    use crate::core::validation::build_spend_msg;
    use crate::crypto::KeyPair;
    use crate::mining::backend::CpuMiningBackend;
    use crate::network::NoPeers;

    fn engine() -> (KeyPair, PowEngine) {
        let key = KeyPair::from_secret_bytes(&[9u8; 32]).unwrap();
        let params = ChainParams::with_bits(1, 1_600_000_000, &key.address());
        let node = Arc::new(NodeState::new(params, Arc::new(NoPeers), None));
        (key, PowEngine::new(node, Arc::new(CpuMiningBackend::new(1))))
    }

    #[test]
    fn test_retarget_bits() {
        let t = DIFFICULTY_PERIOD_IN_SECS_TARGET;
        assert_eq!(retarget_bits(24, t), 24);
        // Twice as fast: half the target, one more bit
        assert_eq!(retarget_bits(24, t / 2), 25);
        assert_eq!(retarget_bits(24, t * 2), 23);
        // Clamped to a factor of four
        assert_eq!(retarget_bits(24, 1), 26);
        assert_eq!(retarget_bits(24, t * 100), 22);
        // Saturates at both ends
        assert_eq!(retarget_bits(0, t * 4), 0);
        assert_eq!(retarget_bits(255, 1), 255);
    }

    #[test]
    fn test_block_subsidy_halving() {
        assert_eq!(block_subsidy(0), 50 * COIN);
        assert_eq!(block_subsidy(HALVE_SUBSIDY_AFTER_BLOCKS_NUM - 1), 50 * COIN);
        assert_eq!(block_subsidy(HALVE_SUBSIDY_AFTER_BLOCKS_NUM), 25 * COIN);
        assert_eq!(block_subsidy(HALVE_SUBSIDY_AFTER_BLOCKS_NUM * 64), 0);
    }

    #[test]
    fn test_block_work() {
        assert_eq!(block_work(0), ChainWork::from_u128(1));
        assert_eq!(block_work(1), ChainWork::from_u128(3));
        assert_eq!(block_work(127), ChainWork::from_u128(u128::MAX));

        // 2^256 / (2^127 + 1) = 2^129 - 4, remainder 4
        assert_eq!(block_work(128).to_u128(), None);
        assert_eq!(block_work(128).to_string(), format!("0x1{}c", "f".repeat(31)));
        assert_eq!(block_work(255).to_string(), format!("0x8{}", "0".repeat(63)));

        for bits in 0..255u8 {
            assert!(block_work(bits + 1) > block_work(bits), "bits {}", bits);
        }
    }

    #[test]
    fn test_chain_work_sums_without_wrapping() {
        let carry = ChainWork::from_u128(u128::MAX).saturating_add(ChainWork::from_u128(1));
        assert_eq!(carry.to_string(), format!("0x1{}", "0".repeat(32)));
        assert!(carry > ChainWork::from_u128(u128::MAX));
        assert_eq!(ChainWork::MAX.saturating_add(block_work(0)), ChainWork::MAX);
        assert_eq!(ChainWork::ZERO.to_string(), "0x0");

        let params = ChainParams::regtest();
        let chain = Chain::new(&params);
        let genesis_work = block_work(chain.genesis().bits());
        assert_eq!(chain_work(chain.active_chain()), genesis_work);
        assert_eq!(
            chain_work([chain.genesis(), chain.genesis()]),
            genesis_work.saturating_add(genesis_work)
        );
    }

    #[test]
    fn test_next_work_required_without_parent() {
        let chain = Chain::new(&ChainParams::regtest());
        assert_eq!(next_work_required(&chain, ""), Some(1));
        assert_eq!(next_work_required(&chain, chain.genesis().id()), Some(1));
        assert_eq!(next_work_required(&chain, "unknown"), None);
    }

    #[test]
    fn test_next_work_required_at_period_boundary() {
        let params = ChainParams::with_bits(8, 1_000_000, "miner");
        let mut chain = Chain::new(&params);
        // Blocks every 310 s
        for i in 1..DIFFICULTY_PERIOD_IN_BLOCKS {
            let parent = chain.tip().clone();
            let block = Block::new(
                0,
                parent.id().to_string(),
                String::new(),
                parent.timestamp() + 310,
                8,
                i as u64,
                Vec::new(),
            );
            chain.push_active(block);
        }
        let tip_id = chain.tip().id().to_string();
        assert_eq!(chain.current_height(), DIFFICULTY_PERIOD_IN_BLOCKS);
        // 143 intervals of 310 s take just over half a day
        assert_eq!(next_work_required(&chain, &tip_id), Some(9));

        let prev_id = chain.active_chain()[DIFFICULTY_PERIOD_IN_BLOCKS - 2].id().to_string();
        assert_eq!(next_work_required(&chain, &prev_id), Some(8));
    }

    #[test]
    fn test_assemble_and_solve_connects() {
        let (_, engine) = engine();
        let block = engine.assemble_and_solve_block("miner", None).unwrap().unwrap();
        assert!(block.has_valid_pow());
        assert_eq!(block.txs()[0].outputs()[0].value, block_subsidy(1));
        assert!(engine.node().connect_block(block).is_active());
        assert_eq!(engine.node().current_height(), 2);
    }

    #[test]
    fn test_coinbase_collects_fees() {
        let (key, engine) = engine();
        for _ in 0..2 {
            let block = engine.assemble_and_solve_block("miner", None).unwrap().unwrap();
            engine.node().connect_block(block);
        }

        let genesis_tx = engine.node().chain().read().genesis().txs()[0].clone();
        let outpoint = OutPoint::new(genesis_tx.id(), 0);
        let outputs = vec![TxOut::new(50 * COIN - 5_000, "recipient")];
        let msg = build_spend_msg(&outpoint, &key.public_key_bytes(), SEQUENCE_FINAL, &outputs);
        let tx = Transaction::new(
            vec![TxIn::new(
                Some(outpoint),
                key.sign(&msg).unwrap(),
                key.public_key_bytes(),
                SEQUENCE_FINAL,
            )],
            outputs,
            0,
        );
        engine.node().add_tx_to_mempool(tx.clone()).unwrap();

        let block = engine.assemble_block("miner", None).unwrap();
        assert_eq!(block.txs().len(), 2);
        assert_eq!(block.txs()[1].id(), tx.id());
        assert_eq!(block.txs()[0].outputs()[0].value, block_subsidy(3) + 5_000);
        assert_eq!(calculate_block_fees(&block, &engine.node().utxo_set().read()), 5_000);
    }

    #[test]
    fn test_interrupt_abandons_search() {
        let (_, engine) = engine();
        let mut block = engine.assemble_block("miner", Some(Vec::new())).unwrap();
        // An unreachable target keeps the backend searching until interrupted
        block.set_bits(255);
        engine.node().mine_interrupt().store(true, Ordering::SeqCst);
        assert!(engine.mine(block).is_none());
        assert!(!engine.node().mine_interrupt().load(Ordering::SeqCst));
    }

    #[test]
    fn test_assemble_clears_stale_interrupt() {
        let (_, engine) = engine();
        engine.node().mine_interrupt().store(true, Ordering::SeqCst);
        engine.assemble_block("miner", None).unwrap();
        assert!(!engine.node().mine_interrupt().load(Ordering::SeqCst));
    }

    #[test]
    fn test_oversized_block_is_rejected() {
        let (_, engine) = engine();
        let big = Transaction::new(
            Vec::new(),
            vec![TxOut::new(1, "x".repeat(MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES))],
            0,
        );
        assert!(matches!(
            engine.assemble_block("miner", Some(vec![big])),
            Err(PowError::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn test_ibd_without_peers_resets() {
        let (_, engine) = engine();
        let block = engine.assemble_and_solve_block("miner", None).unwrap().unwrap();
        engine.node().connect_block(block);
        // Sleeps through every retry; kept short by the small retry count
        assert!(!engine.initial_block_download());
        assert!(engine.node().is_ibd_complete());
        assert_eq!(engine.node().current_height(), 1);
    }
}
