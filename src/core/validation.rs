//! Transaction and block validation
//!
//! Validation never mutates state. Callers pass an explicit [`ChainView`]
//! (chain, UTXO set and the height/median-time-past of the block being
//! validated for) so that one consistent snapshot is used for the whole check.

use std::collections::HashSet;

use thiserror::Error;

use super::block::Block;
use super::chain::{Chain, ACTIVE_CHAIN_IDX};
use super::codec::BinaryBuffer;
use super::params::{
    COINBASE_MATURITY, LOCKTIME_THRESHOLD, MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES,
    MAX_FUTURE_BLOCK_TIME, MAX_MONEY, MTP_BLOCK_COUNT, SEQUENCE_LOCKTIME_GRANULARITY,
};
use super::transaction::{OutPoint, Transaction, TxIn, TxOut};
use super::utxo::{UnspentTxOut, UtxoSet};
use crate::crypto::{
    double_sha256, merkle_root_of_txs, public_key_to_address, verify_signature, SigCache,
};
use crate::mining::pow::{block_subsidy, next_work_required};
use crate::mining::Mempool;

// =============================================================================
// Error Types
// =============================================================================

/// Why a transaction was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxValidationError {
    #[error("Basic validation failed: {0}")]
    Basic(String),
    /// At least one input could not be resolved; carries the transaction so
    /// the caller can park it until the parent shows up
    #[error("Transaction {} spends an unknown output", .0.id())]
    OrphanCandidate(Box<Transaction>),
    #[error("Lock time {lock_time} not reached (height {height}, median time past {mtp})")]
    LockTimeNotReached { lock_time: i64, height: i64, mtp: i64 },
    #[error("Input {input} relative lock not satisfied (required {required}, current {current})")]
    SequenceLockNotSatisfied {
        input: usize,
        required: i64,
        current: i64,
    },
    #[error("Coinbase output {0} not ready for spending")]
    ImmatureCoinbase(OutPoint),
    #[error("Input {input} is not a valid spend: {reason}")]
    SignatureInvalid { input: usize, reason: String },
    #[error("Insufficient funds: outputs {spent} exceed inputs {available}")]
    InsufficientFunds { available: u64, spent: u64 },
}

/// Why a block was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockValidationError {
    #[error("Transactions empty")]
    Empty,
    #[error("Block timestamp {0} too far in future")]
    TooFarInFuture(i64),
    #[error("Block header does not satisfy bits")]
    InsufficientWork,
    #[error("Bad coinbase: {0}")]
    BadCoinbase(String),
    #[error("Transaction {tx_id} invalid: {source}")]
    InvalidTx {
        tx_id: String,
        source: TxValidationError,
    },
    #[error("Duplicate transaction {0} in block")]
    DuplicateTx(String),
    #[error("Output {0} spent twice in block")]
    DoubleSpend(OutPoint),
    #[error("Merkle hash invalid")]
    BadMerkleRoot,
    #[error("Timestamp {timestamp} not after median time past {mtp}")]
    TimestampTooOld { timestamp: i64, mtp: i64 },
    /// Parent unknown; carries the block so the caller can park it
    #[error("Previous block {} not found in any chain", .0.prev_block_hash())]
    OrphanCandidate(Box<Block>),
    #[error("Bits incorrect: expected {expected}, got {got}")]
    BadDifficulty { expected: u8, got: u8 },
    #[error("Block is stale: {0}")]
    Stale(String),
}

// =============================================================================
// Requests
// =============================================================================

/// How a transaction is being validated
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidateRequest<'a> {
    pub as_coinbase: bool,
    /// Earlier transactions of the same block, searched after the UTXO set
    pub siblings_in_block: &'a [Transaction],
    /// Searched last when present (mempool admission)
    pub mempool: Option<&'a Mempool>,
    pub skip_signature_check: bool,
}

/// Read-only state a validation runs against
#[derive(Debug, Clone, Copy)]
pub struct ChainView<'a> {
    pub chain: &'a Chain,
    pub utxo: &'a UtxoSet,
    pub sig_cache: Option<&'a SigCache>,
    /// Height the transaction would be mined at
    pub height: i64,
    pub median_time_past: i64,
}

impl<'a> ChainView<'a> {
    /// View for a block built on the current active tip
    pub fn for_next_block(chain: &'a Chain, utxo: &'a UtxoSet, sig_cache: Option<&'a SigCache>) -> Self {
        Self {
            chain,
            utxo,
            sig_cache,
            height: chain.current_height() as i64,
            median_time_past: chain.median_time_past(MTP_BLOCK_COUNT),
        }
    }
}

// =============================================================================
// Transaction checks
// =============================================================================

/// Context-free rules
pub fn validate_basics(tx: &Transaction, as_coinbase: bool) -> Result<(), TxValidationError> {
    if tx.outputs().is_empty() || (tx.inputs().is_empty() && !as_coinbase) {
        return Err(TxValidationError::Basic("Missing outputs or inputs".into()));
    }

    if tx.serialized_size() > MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES {
        return Err(TxValidationError::Basic("Too large".into()));
    }

    if !as_coinbase {
        let mut seen = HashSet::with_capacity(tx.inputs().len());
        for tx_in in tx.inputs() {
            let Some(outpoint) = &tx_in.to_spend else {
                return Err(TxValidationError::Basic("Input without outpoint".into()));
            };
            if !seen.insert(outpoint) {
                return Err(TxValidationError::Basic(format!("Duplicate input {outpoint}")));
            }
        }
    }

    let mut total: u64 = 0;
    for tx_out in tx.outputs() {
        if tx_out.value > MAX_MONEY {
            return Err(TxValidationError::Basic("Single output value too high".into()));
        }
        total = total
            .checked_add(tx_out.value)
            .ok_or_else(|| TxValidationError::Basic("Output total overflow".into()))?;
    }
    if total > MAX_MONEY {
        return Err(TxValidationError::Basic("Spent value too high".into()));
    }

    Ok(())
}

/// Absolute lock time against the height/median-time-past of the next block
pub fn check_lock_time(tx: &Transaction, height: i64, mtp: i64) -> Result<(), TxValidationError> {
    if tx.is_final() {
        return Ok(());
    }
    let current = if tx.lock_time() < LOCKTIME_THRESHOLD {
        height
    } else {
        mtp
    };
    if tx.lock_time() > current {
        return Err(TxValidationError::LockTimeNotReached {
            lock_time: tx.lock_time(),
            height,
            mtp,
        });
    }
    Ok(())
}

/// Relative (per-input) locks. Inputs whose output is not confirmed yet are
/// skipped; they cannot have aged.
pub fn check_sequence_locks(
    tx: &Transaction,
    chain: &Chain,
    utxo_set: &UtxoSet,
    height: i64,
    mtp: i64,
) -> Result<(), TxValidationError> {
    if tx.is_coinbase() {
        return Ok(());
    }

    for (i, tx_in) in tx.inputs().iter().enumerate() {
        if !tx_in.has_relative_locktime() {
            continue;
        }
        let Some(utxo) = tx_in.to_spend.as_ref().and_then(|op| utxo_set.find(op)) else {
            continue;
        };

        if tx_in.is_time_based_locktime() {
            // Median time past of the block before the one that confirmed the output
            let start_mtp = if utxo.height > 1 {
                chain.median_time_past_at((utxo.height - 2) as usize, MTP_BLOCK_COUNT)
            } else {
                0
            };
            let required = start_mtp + (tx_in.relative_locktime_value() << SEQUENCE_LOCKTIME_GRANULARITY);
            if required > mtp {
                return Err(TxValidationError::SequenceLockNotSatisfied {
                    input: i,
                    required,
                    current: mtp,
                });
            }
        } else {
            let required = utxo.height + tx_in.relative_locktime_value();
            if required > height {
                return Err(TxValidationError::SequenceLockNotSatisfied {
                    input: i,
                    required,
                    current: height,
                });
            }
        }
    }

    Ok(())
}

/// The digest an input signs:
/// `sha256d(outpoint ‖ sequence ‖ pub_key ‖ tx_out*)`
pub fn build_spend_msg(to_spend: &OutPoint, pub_key: &[u8], sequence: i32, outputs: &[TxOut]) -> Vec<u8> {
    let mut buf = BinaryBuffer::new();
    buf.write(to_spend);
    buf.write(&sequence);
    buf.write_bytes(pub_key);
    for tx_out in outputs {
        buf.write(tx_out);
    }
    double_sha256(buf.as_bytes())
}

/// Check that `tx_in` is authorized to spend `utxo`
pub fn validate_signature_for_spend(
    tx_in: &TxIn,
    utxo: &UnspentTxOut,
    outputs: &[TxOut],
    sig_cache: Option<&SigCache>,
) -> Result<(), String> {
    if public_key_to_address(&tx_in.unlock_pub_key) != utxo.tx_out.to_address {
        return Err("Public key does not match".into());
    }

    let spend_msg = build_spend_msg(&utxo.outpoint, &tx_in.unlock_pub_key, tx_in.sequence, outputs);

    if let Some(cache) = sig_cache {
        if cache.contains(&tx_in.unlock_sig, &spend_msg, &tx_in.unlock_pub_key) {
            return Ok(());
        }
    }

    match verify_signature(&tx_in.unlock_pub_key, &spend_msg, &tx_in.unlock_sig) {
        Ok(true) => {
            if let Some(cache) = sig_cache {
                cache.add(&tx_in.unlock_sig, &spend_msg, &tx_in.unlock_pub_key);
            }
            Ok(())
        }
        Ok(false) => Err("Signature does not match".into()),
        Err(e) => Err(e.to_string()),
    }
}

/// Resolve the output an input spends: UTXO set, then block siblings, then mempool
pub fn find_utxo(tx_in: &TxIn, view: &ChainView<'_>, req: &ValidateRequest<'_>) -> Option<UnspentTxOut> {
    let outpoint = tx_in.to_spend.as_ref()?;
    if let Some(utxo) = view.utxo.find(outpoint) {
        return Some(utxo.clone());
    }
    if let Some(utxo) = UtxoSet::find_in_list(tx_in, req.siblings_in_block) {
        return Some(utxo);
    }
    req.mempool.and_then(|mempool| mempool.find_utxo_in_mempool(outpoint))
}

/// Full contextual validation of a transaction
pub fn validate_tx(
    tx: &Transaction,
    view: &ChainView<'_>,
    req: &ValidateRequest<'_>,
) -> Result<(), TxValidationError> {
    validate_basics(tx, req.as_coinbase)?;

    if req.as_coinbase {
        return Ok(());
    }

    check_lock_time(tx, view.height, view.median_time_past)?;
    check_sequence_locks(tx, view.chain, view.utxo, view.height, view.median_time_past)?;

    let mut available: u64 = 0;
    for (i, tx_in) in tx.inputs().iter().enumerate() {
        let Some(utxo) = find_utxo(tx_in, view, req) else {
            log::debug!("Unable to find any UTXO for input {} of {}", i, tx.id());
            return Err(TxValidationError::OrphanCandidate(Box::new(tx.clone())));
        };

        if utxo.is_coinbase && view.height - utxo.height < COINBASE_MATURITY {
            return Err(TxValidationError::ImmatureCoinbase(utxo.outpoint));
        }

        if !req.skip_signature_check {
            validate_signature_for_spend(tx_in, &utxo, tx.outputs(), view.sig_cache)
                .map_err(|reason| TxValidationError::SignatureInvalid { input: i, reason })?;
        }

        available = available
            .checked_add(utxo.value())
            .ok_or_else(|| TxValidationError::Basic("Input total overflow".into()))?;
    }

    let spent = tx
        .total_output()
        .ok_or_else(|| TxValidationError::Basic("Output total overflow".into()))?;

    if available < spent {
        return Err(TxValidationError::InsufficientFunds { available, spent });
    }

    Ok(())
}

// =============================================================================
// Block checks
// =============================================================================

/// Validate a block against the chain and return the chain index it extends:
/// 0 for the active chain, `1..=N` for an existing side branch whose tip is
/// the parent, `N + 1` for a new side branch.
///
/// Transactions of side-branch blocks only get context-free checks here; they
/// are fully validated if a reorg ever moves the branch onto the active chain.
pub fn validate_block(
    block: &Block,
    chain: &Chain,
    utxo: &UtxoSet,
    sig_cache: Option<&SigCache>,
    now: i64,
) -> Result<usize, BlockValidationError> {
    let txs = block.txs();

    if txs.is_empty() {
        return Err(BlockValidationError::Empty);
    }

    if block.timestamp() > now.saturating_add(MAX_FUTURE_BLOCK_TIME) {
        return Err(BlockValidationError::TooFarInFuture(block.timestamp()));
    }

    if !block.has_valid_pow() {
        return Err(BlockValidationError::InsufficientWork);
    }

    if !txs[0].is_coinbase() {
        return Err(BlockValidationError::BadCoinbase(
            "First transaction must be coinbase".into(),
        ));
    }
    if txs[1..].iter().any(Transaction::is_coinbase) {
        return Err(BlockValidationError::BadCoinbase(
            "No more than one coinbase allowed".into(),
        ));
    }

    let mut ids = HashSet::with_capacity(txs.len());
    let mut spent = HashSet::new();
    for (i, tx) in txs.iter().enumerate() {
        validate_basics(tx, i == 0).map_err(|source| BlockValidationError::InvalidTx {
            tx_id: tx.id().to_string(),
            source,
        })?;
        if !ids.insert(tx.id()) {
            return Err(BlockValidationError::DuplicateTx(tx.id().to_string()));
        }
        if i > 0 {
            for outpoint in tx.inputs().iter().filter_map(|tx_in| tx_in.to_spend.as_ref()) {
                if !spent.insert(outpoint) {
                    return Err(BlockValidationError::DoubleSpend(outpoint.clone()));
                }
            }
        }
    }

    if merkle_root_of_txs(txs) != block.merkle_hash() {
        return Err(BlockValidationError::BadMerkleRoot);
    }

    if block.prev_block_hash().is_empty() {
        return Err(BlockValidationError::Stale("Block has no parent".into()));
    }
    let Some((prev, prev_location)) = chain.locate_block_in_all_chains(block.prev_block_hash())
    else {
        return Err(BlockValidationError::OrphanCandidate(Box::new(block.clone())));
    };

    if prev_location.chain_idx != ACTIVE_CHAIN_IDX && chain.fork_height(prev_location.chain_idx).is_none() {
        return Err(BlockValidationError::Stale(format!(
            "Branch of {} no longer forks from the active chain",
            prev.id()
        )));
    }

    let mtp = chain.median_time_past_of(&prev_location, MTP_BLOCK_COUNT);
    if block.timestamp() <= mtp {
        return Err(BlockValidationError::TimestampTooOld {
            timestamp: block.timestamp(),
            mtp,
        });
    }

    let chain_idx = if chain.is_chain_tip(&prev_location) {
        prev_location.chain_idx
    } else {
        chain.side_branches().len() + 1
    };

    let expected = next_work_required(chain, block.prev_block_hash());
    if expected != Some(block.bits()) {
        return Err(BlockValidationError::BadDifficulty {
            expected: expected.unwrap_or(chain.initial_bits()),
            got: block.bits(),
        });
    }

    if chain_idx != ACTIVE_CHAIN_IDX {
        return Ok(chain_idx);
    }

    let view = ChainView::for_next_block(chain, utxo, sig_cache);

    let mut fees: u64 = 0;
    for i in 1..txs.len() {
        let tx = &txs[i];
        let req = ValidateRequest {
            siblings_in_block: &txs[1..i],
            ..Default::default()
        };
        validate_tx(tx, &view, &req).map_err(|source| {
            log::warn!("Transaction {} in block {} failed validation: {}", tx.id(), block.id(), source);
            BlockValidationError::InvalidTx {
                tx_id: tx.id().to_string(),
                source,
            }
        })?;

        let input_total: u64 = tx
            .inputs()
            .iter()
            .filter_map(|tx_in| find_utxo(tx_in, &view, &req))
            .map(|utxo| utxo.value())
            .sum();
        // validate_tx has already checked both totals
        let fee = input_total - tx.total_output().unwrap_or(input_total);
        fees = fees.saturating_add(fee);
    }

    let max_coinbase = block_subsidy(chain.current_height()).saturating_add(fees);
    let coinbase_value = txs[0].total_output().unwrap_or(u64::MAX);
    if coinbase_value > max_coinbase {
        return Err(BlockValidationError::BadCoinbase(format!(
            "Coinbase pays {coinbase_value}, allowed {max_coinbase}"
        )));
    }

    Ok(ACTIVE_CHAIN_IDX)
}
