//! Consensus and policy parameters
//!
//! Consensus constants are fixed for every network. [`ChainParams`] carries
//! what differs between networks: the genesis block and its difficulty.

use super::block::Block;
use super::transaction::{Transaction, TxIn, TxOut};
use crate::crypto::merkle_root_of_txs;

// =============================================================================
// Consensus Constants
// =============================================================================

/// Smallest-unit multiplier for one coin
pub const COIN: u64 = 100_000_000;

/// Total supply cap in smallest units
pub const MAX_MONEY: u64 = 21_000_000 * COIN;

pub const TIME_BETWEEN_BLOCKS_IN_SECS_TARGET: i64 = 60 * 10;

/// Wall-clock span a difficulty period should take
pub const DIFFICULTY_PERIOD_IN_SECS_TARGET: i64 = 60 * 60 * 24;

/// Blocks per difficulty period (144)
pub const DIFFICULTY_PERIOD_IN_BLOCKS: usize =
    (DIFFICULTY_PERIOD_IN_SECS_TARGET / TIME_BETWEEN_BLOCKS_IN_SECS_TARGET) as usize;

pub const INITIAL_DIFFICULTY_BITS: u8 = 24;

pub const HALVE_SUBSIDY_AFTER_BLOCKS_NUM: usize = 210_000;

pub const MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES: usize = 1_000_000;

/// Blocks that must pass before a coinbase output can be spent
pub const COINBASE_MATURITY: i64 = 2;

/// How far ahead of local time a block timestamp may be
pub const MAX_FUTURE_BLOCK_TIME: i64 = 60 * 60 * 2;

/// Lock times below this are block heights, at or above are Unix times
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;

/// Number of blocks used for median-time-past
pub const MTP_BLOCK_COUNT: usize = 11;

// =============================================================================
// Policy Constants
// =============================================================================

/// Outputs below this value make a transaction non-standard
pub const DUST_THRESHOLD: u64 = 546;

/// Extra fee (per 1000 bytes) a replacement must pay on top of what it evicts
pub const INCREMENTAL_RELAY_FEE: u64 = 1000;

pub const MAX_ANCESTOR_COUNT: usize = 25;
pub const MAX_DESCENDANT_COUNT: usize = 25;

pub const MAX_MEMPOOL_SIZE_BYTES: usize = 300 * 1024 * 1024;

pub const MEMPOOL_TX_EXPIRE_SECS: i64 = 60 * 60 * 24 * 14;

pub const MAX_ORPHAN_BLOCKS: usize = 50;
pub const ORPHAN_BLOCK_EXPIRE_SECS: i64 = 60 * 60;

pub const MAX_ORPHAN_TXS: usize = 100;

// =============================================================================
// Sequence Numbers
// =============================================================================

/// Input sequence that disables lock time and relative locks
pub const SEQUENCE_FINAL: i32 = -1;

/// Default sequence for wallet-built inputs: opts in to replacement
pub const SEQUENCE_RBF: i32 = 0xFFFF_FFFDu32 as i32;

/// Set: the sequence carries no relative lock
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// Set: the relative lock counts 512-second units instead of blocks
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_FFFF;

/// Time-based relative locks are in units of 2^9 seconds
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Sequence value for a relative lock of `blocks` confirmations
pub fn encode_relative_blocks(blocks: u16) -> i32 {
    blocks as i32
}

/// Sequence value for a relative lock of `units` * 512 seconds
pub fn encode_relative_time(units: u16) -> i32 {
    (SEQUENCE_LOCKTIME_TYPE_FLAG | units as u32) as i32
}

// =============================================================================
// Chain Parameters
// =============================================================================

/// Per-network parameters
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub genesis: Block,
    /// Bits of the first block after genesis
    pub initial_difficulty_bits: u8,
}

impl ChainParams {
    /// The main network
    pub fn main() -> Self {
        let genesis_tx = Transaction::new(
            vec![TxIn::new(None, Vec::new(), Vec::new(), SEQUENCE_FINAL)],
            vec![TxOut::new(50 * COIN, "143UVyz7ooiAv1pMqbwPPpnH4BV9ifJGFF")],
            0,
        );
        let genesis = Block::new(
            0,
            String::new(),
            "c45c6454c360034ee25d25b0610736cd6ccd10a501c666b3da360c23dffe8535".to_string(),
            1_501_821_412,
            INITIAL_DIFFICULTY_BITS,
            2_049_638_230_412_955_202,
            vec![genesis_tx],
        );
        Self {
            genesis,
            initial_difficulty_bits: INITIAL_DIFFICULTY_BITS,
        }
    }

    /// A network where every block needs a single leading zero bit.
    ///
    /// Blocks solve in a couple of hashes, which keeps chain tests fast.
    pub fn regtest() -> Self {
        Self::with_bits(1, 1_600_000_000, "143UVyz7ooiAv1pMqbwPPpnH4BV9ifJGFF")
    }

    /// Build a network whose genesis pays 50 coins to `pay_to`
    pub fn with_bits(bits: u8, genesis_timestamp: i64, pay_to: &str) -> Self {
        let genesis_tx = Transaction::new(
            vec![TxIn::new(None, Vec::new(), Vec::new(), SEQUENCE_FINAL)],
            vec![TxOut::new(50 * COIN, pay_to)],
            0,
        );
        let merkle = merkle_root_of_txs(std::slice::from_ref(&genesis_tx));
        let genesis = Block::new(0, String::new(), merkle, genesis_timestamp, bits, 0, vec![genesis_tx]);
        Self {
            genesis,
            initial_difficulty_bits: bits,
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::main()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difficulty_period() {
        assert_eq!(DIFFICULTY_PERIOD_IN_BLOCKS, 144);
        assert_eq!(MAX_MONEY, 2_100_000_000_000_000);
    }

    #[test]
    fn test_sequence_encoding() {
        assert_eq!(SEQUENCE_FINAL as u32, 0xFFFF_FFFF);
        assert_eq!(encode_relative_blocks(3), 3);
        let time = encode_relative_time(5) as u32;
        assert_ne!(time & SEQUENCE_LOCKTIME_TYPE_FLAG, 0);
        assert_eq!(time & SEQUENCE_LOCKTIME_MASK, 5);
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = ChainParams::main();
        let b = ChainParams::main();
        assert_eq!(a.genesis.id(), b.genesis.id());
        assert_eq!(a.genesis.txs().len(), 1);
        assert!(a.genesis.txs()[0].is_coinbase());
        assert_eq!(a.genesis.txs()[0].outputs()[0].value, 50 * COIN);
    }

    #[test]
    fn test_regtest_genesis_merkle_matches() {
        let params = ChainParams::regtest();
        assert_eq!(
            params.genesis.merkle_hash(),
            merkle_root_of_txs(params.genesis.txs())
        );
    }
}
