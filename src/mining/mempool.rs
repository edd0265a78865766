//! Transaction pool (mempool) for pending transactions
//!
//! Manages unconfirmed transactions waiting to be included in blocks:
//! - Admission through full validation with mempool lookups enabled
//! - Orphan transactions parked until their parents show up
//! - Replace-By-Fee (RBF) for opted-in conflicts
//! - Ancestor/descendant limits (Bitcoin-style)
//! - Package-aware block assembly (a parent always precedes its child)
//! - Size cap and expiry
//!
//! The pool itself is not synchronized; `NodeState` keeps it behind a mutex.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::core::block::Block;
use crate::core::params::{
    DUST_THRESHOLD, INCREMENTAL_RELAY_FEE, MAX_ANCESTOR_COUNT, MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES,
    MAX_DESCENDANT_COUNT, MAX_MEMPOOL_SIZE_BYTES, MAX_ORPHAN_TXS, MEMPOOL_TX_EXPIRE_SECS,
};
use crate::core::transaction::{OutPoint, Transaction};
use crate::core::utxo::{UnspentTxOut, UtxoSet};
use crate::core::validation::{validate_tx, ChainView, TxValidationError, ValidateRequest};
use crate::mining::pow::calculate_fees;

// =============================================================================
// Error Types
// =============================================================================

/// Mempool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("Transaction {0} already seen")]
    AlreadySeen(String),
    #[error("Transaction {0} contains dust output(s) below threshold {DUST_THRESHOLD}")]
    Dust(String),
    #[error("Transaction {0} submitted as orphan")]
    Orphaned(String),
    #[error("Transaction validation error: {0}")]
    Validation(#[from] TxValidationError),
    #[error("Too many ancestors: {0} (max: {1})")]
    TooManyAncestors(usize, usize),
    #[error("Too many descendants: {0} (max: {1})")]
    TooManyDescendants(usize, usize),
    #[error("RBF not allowed: conflicting transaction {0} doesn't signal RBF")]
    RbfNotSignaled(String),
    #[error("Insufficient fee for RBF: need {0}, got {1}")]
    InsufficientRbfFee(u64, u64),
    #[error("Replacement fee rate {0} does not exceed conflicting fee rate {1}")]
    RbfFeeRateTooLow(u64, u64),
    #[error("Replacement spends new unconfirmed output {0}")]
    RbfNewUnconfirmedInput(OutPoint),
}

// =============================================================================
// Mempool Entry
// =============================================================================

/// Entry in the mempool with metadata
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub serialized_size: usize,
    pub fee: u64,
    /// Fee per serialized byte
    pub fee_rate: u64,
    /// Unix time when the transaction entered the pool
    pub added_at: i64,
}

impl MempoolEntry {
    pub fn new(tx: Transaction, fee: u64, added_at: i64) -> Self {
        let serialized_size = tx.serialized_size();
        let fee_rate = if serialized_size > 0 {
            fee / serialized_size as u64
        } else {
            0
        };
        Self {
            tx,
            serialized_size,
            fee,
            fee_rate,
            added_at,
        }
    }
}

/// Mempool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub orphan_count: usize,
    pub total_fees: u64,
    pub total_size: usize,
    pub max_fee_rate: u64,
    pub min_fee_rate: u64,
}

/// Running state of one block assembly
#[derive(Debug, Default)]
struct BlockAssembly {
    added: HashSet<String>,
    spent: HashSet<OutPoint>,
    txs: Vec<Transaction>,
    size: usize,
}

// =============================================================================
// Mempool
// =============================================================================

#[derive(Debug)]
pub struct Mempool {
    /// Transactions indexed by ID
    entries: HashMap<String, MempoolEntry>,
    /// Transactions waiting for a parent, oldest first
    orphaned_txs: Vec<Transaction>,
    total_size_bytes: usize,
    max_size_bytes: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_max_size(MAX_MEMPOOL_SIZE_BYTES)
    }
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mempool with a custom byte cap
    pub fn with_max_size(max_size_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            orphaned_txs: Vec::new(),
            total_size_bytes: 0,
            max_size_bytes,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Output `outpoint` of a pooled transaction, as an unconfirmed UTXO
    pub fn find_utxo_in_mempool(&self, outpoint: &OutPoint) -> Option<UnspentTxOut> {
        let entry = self.entries.get(&outpoint.tx_id)?;
        let tx_out = usize::try_from(outpoint.index)
            .ok()
            .and_then(|index| entry.tx.outputs().get(index));
        match tx_out {
            Some(tx_out) => Some(UnspentTxOut::new(tx_out.clone(), outpoint.clone(), false, -1)),
            None => {
                log::error!("Unable to find UTXO in mempool for {}", outpoint);
                None
            }
        }
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.entries.contains_key(tx_id)
    }

    pub fn get_entry(&self, tx_id: &str) -> Option<&MempoolEntry> {
        self.entries.get(tx_id)
    }

    pub fn get_transaction(&self, tx_id: &str) -> Option<&Transaction> {
        self.entries.get(tx_id).map(|entry| &entry.tx)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_size_bytes(&self) -> usize {
        self.total_size_bytes
    }

    /// Sorted ids of every pooled transaction
    pub fn transaction_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entries(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.entries.values()
    }

    pub fn fee_rates(&self) -> Vec<u64> {
        self.entries
            .values()
            .filter(|entry| entry.serialized_size > 0)
            .map(|entry| entry.fee_rate)
            .collect()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphaned_txs.len()
    }

    /// Get mempool statistics
    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            tx_count: self.entries.len(),
            orphan_count: self.orphaned_txs.len(),
            total_fees: self.entries.values().map(|e| e.fee).sum(),
            total_size: self.total_size_bytes,
            max_fee_rate: self.entries.values().map(|e| e.fee_rate).max().unwrap_or(0),
            min_fee_rate: self.entries.values().map(|e| e.fee_rate).min().unwrap_or(0),
        }
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Validate and insert a transaction, replacing opted-in conflicts.
    /// Returns the ids of the transactions it replaced.
    pub fn add_tx(
        &mut self,
        tx: Transaction,
        view: &ChainView<'_>,
        now: i64,
    ) -> Result<Vec<String>, MempoolError> {
        let tx_id = tx.id().to_string();
        if self.entries.contains_key(&tx_id) {
            return Err(MempoolError::AlreadySeen(tx_id));
        }

        if has_dust_outputs(&tx) {
            return Err(MempoolError::Dust(tx_id));
        }

        let req = ValidateRequest {
            mempool: Some(&*self),
            ..Default::default()
        };
        match validate_tx(&tx, view, &req) {
            Ok(()) => {}
            Err(TxValidationError::OrphanCandidate(orphan)) => {
                log::info!("Transaction {} submitted as orphan", tx_id);
                self.add_orphan(*orphan);
                return Err(MempoolError::Orphaned(tx_id));
            }
            Err(e) => return Err(e.into()),
        }

        self.check_chain_limits(&tx)?;

        if !self.find_conflicting_txs(&tx).is_empty() {
            return self.try_replace_by_fee(tx, view.utxo, now);
        }

        let fee = calculate_fees(&tx, view.utxo, Some(&*self));
        self.insert_entry(MempoolEntry::new(tx, fee, now));
        log::trace!(
            "Transaction {} added to mempool (size now {} bytes)",
            tx_id,
            self.total_size_bytes
        );
        self.enforce_size_cap();
        Ok(Vec::new())
    }

    /// Replace every conflicting transaction (and its descendants) with `tx`
    pub fn try_replace_by_fee(
        &mut self,
        tx: Transaction,
        utxo_set: &UtxoSet,
        now: i64,
    ) -> Result<Vec<String>, MempoolError> {
        let tx_id = tx.id().to_string();
        let conflicting = self.find_conflicting_txs(&tx);

        for existing_id in &conflicting {
            let signals = self
                .entries
                .get(existing_id)
                .map(|entry| entry.tx.signals_rbf())
                .unwrap_or(false);
            if !signals {
                return Err(MempoolError::RbfNotSignaled(existing_id.clone()));
            }
        }

        let mut to_remove: Vec<String> = Vec::new();
        let mut conflicting_fees: u64 = 0;
        let mut replaced_inputs: HashSet<OutPoint> = HashSet::new();
        let mut max_conflict_rate: u64 = 0;
        for existing_id in &conflicting {
            if let Some(entry) = self.entries.get(existing_id) {
                max_conflict_rate = max_conflict_rate.max(entry.fee_rate);
                replaced_inputs.extend(entry.tx.inputs().iter().filter_map(|i| i.to_spend.clone()));
            }
            let mut ids = vec![existing_id.clone()];
            ids.extend(self.find_descendant_tx_ids(existing_id));
            for id in ids {
                if to_remove.contains(&id) {
                    continue;
                }
                if let Some(entry) = self.entries.get(&id) {
                    conflicting_fees = conflicting_fees.saturating_add(entry.fee);
                }
                to_remove.push(id);
            }
        }

        for outpoint in tx.inputs().iter().filter_map(|tx_in| tx_in.to_spend.as_ref()) {
            if !utxo_set.contains(outpoint) && !replaced_inputs.contains(outpoint) {
                return Err(MempoolError::RbfNewUnconfirmedInput(outpoint.clone()));
            }
        }

        let new_fee = calculate_fees(&tx, utxo_set, Some(&*self));
        if new_fee <= conflicting_fees {
            return Err(MempoolError::InsufficientRbfFee(
                conflicting_fees.saturating_add(1),
                new_fee,
            ));
        }

        let tx_size = tx.serialized_size() as u64;
        let min_increment = (tx_size * INCREMENTAL_RELAY_FEE).div_ceil(1000);
        let required = conflicting_fees.saturating_add(min_increment);
        if new_fee < required {
            return Err(MempoolError::InsufficientRbfFee(required, new_fee));
        }

        let entry = MempoolEntry::new(tx, new_fee, now);
        if entry.fee_rate <= max_conflict_rate {
            return Err(MempoolError::RbfFeeRateTooLow(entry.fee_rate, max_conflict_rate));
        }

        for id in &to_remove {
            log::trace!("RBF: removing conflicting transaction {}", id);
            self.remove_entry(id);
        }
        self.insert_entry(entry);

        log::info!(
            "RBF: transaction {} replaced {} conflicting transaction(s) (fee {} > {})",
            tx_id,
            to_remove.len(),
            new_fee,
            conflicting_fees
        );

        self.enforce_size_cap();
        Ok(to_remove)
    }

    /// Put back a transaction from a disconnected block without validation
    pub(crate) fn readd(&mut self, tx: Transaction, fee: u64, now: i64) {
        if self.entries.contains_key(tx.id()) {
            return;
        }
        self.insert_entry(MempoolEntry::new(tx, fee, now));
    }

    fn insert_entry(&mut self, entry: MempoolEntry) {
        self.total_size_bytes += entry.serialized_size;
        self.entries.insert(entry.tx.id().to_string(), entry);
    }

    // =========================================================================
    // Removal
    // =========================================================================

    pub fn remove_entry(&mut self, tx_id: &str) -> Option<MempoolEntry> {
        let entry = self.entries.remove(tx_id)?;
        self.total_size_bytes = self.total_size_bytes.saturating_sub(entry.serialized_size);
        Some(entry)
    }

    /// Remove a transaction together with everything that spends it
    pub fn remove_with_descendants(&mut self, tx_id: &str) -> Vec<String> {
        let mut ids = self.find_descendant_tx_ids(tx_id);
        ids.push(tx_id.to_string());
        ids.retain(|id| self.remove_entry(id).is_some());
        ids
    }

    /// Drop the transactions of a newly connected block, and every pooled
    /// transaction that now double-spends one of its inputs
    pub fn remove_for_block(&mut self, block: &Block) {
        let mut spent: HashSet<&OutPoint> = HashSet::new();
        for tx in block.txs() {
            self.remove_entry(tx.id());
            spent.extend(tx.inputs().iter().filter_map(|tx_in| tx_in.to_spend.as_ref()));
        }

        let conflicts: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .tx
                    .inputs()
                    .iter()
                    .filter_map(|tx_in| tx_in.to_spend.as_ref())
                    .any(|outpoint| spent.contains(outpoint))
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in conflicts {
            for removed in self.remove_with_descendants(&id) {
                log::debug!("Removing {} from mempool: conflicts with block {}", removed, block.id());
            }
        }
    }

    /// Drop entries (and their descendants) older than the expiry window
    pub fn expire_old_transactions(&mut self, now: i64) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.added_at >= MEMPOOL_TX_EXPIRE_SECS)
            .map(|(id, _)| id.clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            log::info!(
                "Expiring transaction {} from mempool (exceeded TTL of {} seconds)",
                id,
                MEMPOOL_TX_EXPIRE_SECS
            );
            removed += self.remove_with_descendants(&id).len();
        }
        removed
    }

    /// Evict the lowest fee-rate entries (with descendants) until under the cap
    fn enforce_size_cap(&mut self) {
        while self.total_size_bytes > self.max_size_bytes && !self.entries.is_empty() {
            let Some(worst_id) = self
                .entries
                .values()
                .min_by(|a, b| a.fee_rate.cmp(&b.fee_rate).then_with(|| a.tx.id().cmp(b.tx.id())))
                .map(|entry| entry.tx.id().to_string())
            else {
                break;
            };
            for id in self.remove_with_descendants(&worst_id) {
                log::trace!("Evicting transaction {} to enforce mempool size cap", id);
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.orphaned_txs.clear();
        self.total_size_bytes = 0;
    }

    // =========================================================================
    // Orphans
    // =========================================================================

    fn add_orphan(&mut self, tx: Transaction) {
        if self.orphaned_txs.iter().any(|orphan| orphan.id() == tx.id()) {
            return;
        }
        if self.orphaned_txs.len() >= MAX_ORPHAN_TXS {
            self.orphaned_txs.remove(0);
        }
        self.orphaned_txs.push(tx);
    }

    /// Remove and return every orphan that spends an output of `parent_id`
    pub fn take_orphans_spending(&mut self, parent_id: &str) -> Vec<Transaction> {
        let (children, rest): (Vec<_>, Vec<_>) = self.orphaned_txs.drain(..).partition(|orphan| {
            orphan
                .inputs()
                .iter()
                .filter_map(|tx_in| tx_in.to_spend.as_ref())
                .any(|outpoint| outpoint.tx_id == parent_id)
        });
        self.orphaned_txs = rest;
        children
    }

    /// Remove and return every orphan
    pub fn take_orphans(&mut self) -> Vec<Transaction> {
        std::mem::take(&mut self.orphaned_txs)
    }

    // =========================================================================
    // Dependency graph
    // =========================================================================

    /// Pooled transactions sharing an input with `tx`
    pub fn find_conflicting_txs(&self, tx: &Transaction) -> Vec<String> {
        let inputs: HashSet<&OutPoint> = tx
            .inputs()
            .iter()
            .filter_map(|tx_in| tx_in.to_spend.as_ref())
            .collect();

        let mut conflicts: Vec<String> = self
            .entries
            .iter()
            .filter(|(id, _)| id.as_str() != tx.id())
            .filter(|(_, entry)| {
                entry
                    .tx
                    .inputs()
                    .iter()
                    .filter_map(|tx_in| tx_in.to_spend.as_ref())
                    .any(|outpoint| inputs.contains(outpoint))
            })
            .map(|(id, _)| id.clone())
            .collect();
        conflicts.sort();
        conflicts
    }

    /// Every pooled transaction that directly or indirectly spends `tx_id`
    pub fn find_descendant_tx_ids(&self, tx_id: &str) -> Vec<String> {
        let mut descendants = HashSet::new();
        self.collect_descendants_recursive(tx_id, &mut descendants);
        let mut ids: Vec<String> = descendants.into_iter().collect();
        ids.sort();
        ids
    }

    fn collect_descendants_recursive(&self, tx_id: &str, descendants: &mut HashSet<String>) {
        for (entry_id, entry) in &self.entries {
            let depends_on_tx = entry
                .tx
                .inputs()
                .iter()
                .filter_map(|tx_in| tx_in.to_spend.as_ref())
                .any(|outpoint| outpoint.tx_id == tx_id);
            if depends_on_tx && descendants.insert(entry_id.clone()) {
                self.collect_descendants_recursive(entry_id, descendants);
            }
        }
    }

    /// Every pooled transaction `tx` directly or indirectly spends from
    pub fn find_ancestor_tx_ids(&self, tx: &Transaction) -> Vec<String> {
        let mut ancestors = HashSet::new();
        self.collect_ancestors_recursive(tx, &mut ancestors);
        let mut ids: Vec<String> = ancestors.into_iter().collect();
        ids.sort();
        ids
    }

    fn collect_ancestors_recursive(&self, tx: &Transaction, ancestors: &mut HashSet<String>) {
        for outpoint in tx.inputs().iter().filter_map(|tx_in| tx_in.to_spend.as_ref()) {
            if let Some(parent) = self.entries.get(&outpoint.tx_id) {
                if ancestors.insert(outpoint.tx_id.clone()) {
                    self.collect_ancestors_recursive(&parent.tx, ancestors);
                }
            }
        }
    }

    /// Reject a transaction that would make an in-mempool chain too long
    /// or give one of its ancestors too many descendants
    pub fn check_chain_limits(&self, tx: &Transaction) -> Result<(), MempoolError> {
        let ancestors = self.find_ancestor_tx_ids(tx);
        if ancestors.len() >= MAX_ANCESTOR_COUNT {
            return Err(MempoolError::TooManyAncestors(
                ancestors.len() + 1,
                MAX_ANCESTOR_COUNT,
            ));
        }

        for ancestor_id in &ancestors {
            let descendants = self.find_descendant_tx_ids(ancestor_id).len() + 1;
            if descendants >= MAX_DESCENDANT_COUNT {
                return Err(MempoolError::TooManyDescendants(
                    descendants + 1,
                    MAX_DESCENDANT_COUNT,
                ));
            }
        }

        Ok(())
    }

    // =========================================================================
    // Block assembly
    // =========================================================================

    /// Fill `block` with pooled transactions, highest absolute fee first.
    ///
    /// A transaction whose input is not confirmed pulls the producing pooled
    /// transaction in first, so every in-mempool ancestor precedes its
    /// descendants. Transactions whose ancestry cannot be resolved, or that
    /// no longer fit, are skipped.
    pub fn select_from_mempool(&self, mut block: Block, utxo_set: &UtxoSet) -> Block {
        let mut candidates: Vec<&MempoolEntry> = self.entries.values().collect();
        candidates.sort_by(|a, b| b.fee.cmp(&a.fee).then_with(|| a.tx.id().cmp(b.tx.id())));

        let mut assembly = BlockAssembly {
            size: block.serialized_size(),
            ..Default::default()
        };
        for entry in candidates {
            self.try_add_to_block(entry.tx.id(), utxo_set, &mut assembly);
        }

        log::debug!("Selected {} transactions from mempool", assembly.txs.len());
        block.txs_mut().extend(assembly.txs);
        block
    }

    fn try_add_to_block(&self, tx_id: &str, utxo_set: &UtxoSet, assembly: &mut BlockAssembly) -> bool {
        if assembly.added.contains(tx_id) {
            return true;
        }
        let Some(entry) = self.entries.get(tx_id) else {
            return false;
        };

        for tx_in in entry.tx.inputs() {
            let Some(outpoint) = &tx_in.to_spend else {
                return false;
            };
            if utxo_set.contains(outpoint) {
                continue;
            }
            if self.find_utxo_in_mempool(outpoint).is_none() {
                log::debug!("Unable to find UTXO for {}", outpoint);
                return false;
            }
            if !self.try_add_to_block(&outpoint.tx_id, utxo_set, assembly) {
                log::debug!("Unable to add parent {} of {}", outpoint.tx_id, tx_id);
                return false;
            }
        }

        if entry
            .tx
            .inputs()
            .iter()
            .filter_map(|tx_in| tx_in.to_spend.as_ref())
            .any(|outpoint| assembly.spent.contains(outpoint))
        {
            return false;
        }

        if assembly.size + entry.serialized_size >= MAX_BLOCK_SERIALIZED_SIZE_IN_BYTES {
            return false;
        }

        assembly.size += entry.serialized_size;
        assembly
            .spent
            .extend(entry.tx.inputs().iter().filter_map(|tx_in| tx_in.to_spend.clone()));
        assembly.added.insert(tx_id.to_string());
        assembly.txs.push(entry.tx.clone());
        log::trace!("Added transaction {} to block", tx_id);
        true
    }
}

fn has_dust_outputs(tx: &Transaction) -> bool {
    !tx.is_coinbase()
        && tx
            .outputs()
            .iter()
            .any(|tx_out| tx_out.value < DUST_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::Chain;
    use crate::core::params::{ChainParams, SEQUENCE_FINAL, SEQUENCE_RBF};
    use crate::core::transaction::{TxIn, TxOut};
    use crate::core::validation::build_spend_msg;
    use crate::crypto::KeyPair;

    struct Fixture {
        key: KeyPair,
        chain: Chain,
        utxo: UtxoSet,
    }

    impl Fixture {
        fn new() -> Self {
            let key = KeyPair::generate();
            let chain = Chain::new(&ChainParams::regtest());
            let mut utxo = UtxoSet::new();
            for name in ["a", "b", "c"] {
                utxo.add(TxOut::new(100_000, key.address()), name, 0, false, 1);
            }
            Self { key, chain, utxo }
        }

        fn view(&self) -> ChainView<'_> {
            ChainView::for_next_block(&self.chain, &self.utxo, None)
        }

        fn spend(&self, outpoint: OutPoint, sequence: i32, values: &[u64]) -> Transaction {
            let outputs: Vec<TxOut> = values
                .iter()
                .map(|value| TxOut::new(*value, self.key.address()))
                .collect();
            let msg = build_spend_msg(&outpoint, &self.key.public_key_bytes(), sequence, &outputs);
            let tx_in = TxIn::new(
                Some(outpoint),
                self.key.sign(&msg).unwrap(),
                self.key.public_key_bytes(),
                sequence,
            );
            Transaction::new(vec![tx_in], outputs, 0)
        }
    }

    #[test]
    fn test_add_duplicate_and_dust() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let tx = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[90_000]);
        assert!(mempool.add_tx(tx.clone(), &fx.view(), 0).unwrap().is_empty());
        assert_eq!(mempool.get_entry(tx.id()).unwrap().fee, 10_000);
        assert_eq!(
            mempool.add_tx(tx.clone(), &fx.view(), 0),
            Err(MempoolError::AlreadySeen(tx.id().to_string()))
        );

        let dust = fx.spend(OutPoint::new("b", 0), SEQUENCE_RBF, &[90_000, DUST_THRESHOLD - 1]);
        assert!(matches!(mempool.add_tx(dust, &fx.view(), 0), Err(MempoolError::Dust(_))));
        assert_eq!(mempool.len(), 1);
        assert_eq!(mempool.total_size_bytes(), tx.serialized_size());
    }

    #[test]
    fn test_orphan_and_unconfirmed_parent() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let parent = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[90_000]);
        let child = fx.spend(OutPoint::new(parent.id(), 0), SEQUENCE_RBF, &[80_000]);

        assert!(matches!(
            mempool.add_tx(child.clone(), &fx.view(), 0),
            Err(MempoolError::Orphaned(_))
        ));
        assert_eq!(mempool.orphan_count(), 1);

        mempool.add_tx(parent.clone(), &fx.view(), 0).unwrap();
        let utxo = mempool.find_utxo_in_mempool(&OutPoint::new(parent.id(), 0)).unwrap();
        assert_eq!(utxo.height, -1);
        assert!(!utxo.is_coinbase);

        let retried = mempool.take_orphans_spending(parent.id());
        assert_eq!(retried.len(), 1);
        assert_eq!(mempool.orphan_count(), 0);
        mempool.add_tx(retried[0].clone(), &fx.view(), 0).unwrap();
        assert!(mempool.contains(child.id()));
        assert_eq!(mempool.find_ancestor_tx_ids(&child), vec![parent.id().to_string()]);
        assert_eq!(mempool.find_descendant_tx_ids(parent.id()), vec![child.id().to_string()]);
    }

    #[test]
    fn test_cpfp_parent_precedes_child() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let parent = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[99_000]);
        let child = fx.spend(OutPoint::new(parent.id(), 0), SEQUENCE_RBF, &[90_000]);
        let unrelated = fx.spend(OutPoint::new("b", 0), SEQUENCE_RBF, &[95_000]);
        for tx in [&parent, &child, &unrelated] {
            mempool.add_tx(tx.clone(), &fx.view(), 0).unwrap();
        }

        let template = Block::new(0, fx.chain.tip().id().to_string(), String::new(), 0, 1, 0, vec![]);
        let block = mempool.select_from_mempool(template, &fx.utxo);
        let ids: Vec<&str> = block.txs().iter().map(Transaction::id).collect();
        assert_eq!(ids, vec![parent.id(), child.id(), unrelated.id()]);
    }

    #[test]
    fn test_cheap_parent_is_pulled_in_by_rich_child() {
        let mut fx = Fixture::new();
        fx.utxo.add(TxOut::new(200_000, fx.key.address()), "big", 0, false, 1);
        let mut mempool = Mempool::new();

        let parent = fx.spend(OutPoint::new("big", 0), SEQUENCE_RBF, &[199_900]);
        let child = fx.spend(OutPoint::new(parent.id(), 0), SEQUENCE_RBF, &[100_100]);
        let unrelated = fx.spend(OutPoint::new("b", 0), SEQUENCE_RBF, &[90_000]);
        for tx in [&parent, &child, &unrelated] {
            mempool.add_tx(tx.clone(), &fx.view(), 0).unwrap();
        }
        assert_eq!(mempool.get_entry(parent.id()).unwrap().fee, 100);
        assert_eq!(mempool.get_entry(child.id()).unwrap().fee, 99_800);
        assert_eq!(mempool.get_entry(unrelated.id()).unwrap().fee, 10_000);

        let template = Block::new(0, fx.chain.tip().id().to_string(), String::new(), 0, 1, 0, vec![]);
        let block = mempool.select_from_mempool(template, &fx.utxo);
        let ids: Vec<&str> = block.txs().iter().map(Transaction::id).collect();
        assert_eq!(ids, vec![parent.id(), child.id(), unrelated.id()]);
    }

    #[test]
    fn test_select_skips_unresolvable() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let tx = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[99_000]);
        mempool.add_tx(tx.clone(), &fx.view(), 0).unwrap();

        // The input got spent by a block the pool has not seen yet
        let mut utxo = fx.utxo.clone();
        utxo.remove("a", 0);
        let template = Block::new(0, String::new(), String::new(), 0, 1, 0, vec![]);
        assert!(mempool.select_from_mempool(template, &utxo).txs().is_empty());
    }

    #[test]
    fn test_replace_by_fee() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let original = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[99_000]);
        let child = fx.spend(OutPoint::new(original.id(), 0), SEQUENCE_RBF, &[98_000]);
        mempool.add_tx(original.clone(), &fx.view(), 0).unwrap();
        mempool.add_tx(child.clone(), &fx.view(), 0).unwrap();

        // Conflicts pay 2_000 in total
        let too_cheap = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[98_000]);
        assert!(matches!(
            mempool.add_tx(too_cheap, &fx.view(), 0),
            Err(MempoolError::InsufficientRbfFee(_, 2_000))
        ));

        let replacement = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[90_000]);
        let replaced = mempool.add_tx(replacement.clone(), &fx.view(), 0).unwrap();
        assert_eq!(replaced.len(), 2);
        assert!(!mempool.contains(original.id()));
        assert!(!mempool.contains(child.id()));
        assert!(mempool.contains(replacement.id()));
        assert_eq!(mempool.total_size_bytes(), replacement.serialized_size());
    }

    #[test]
    fn test_rbf_requires_signal() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let original = fx.spend(OutPoint::new("a", 0), SEQUENCE_FINAL, &[99_000]);
        mempool.add_tx(original.clone(), &fx.view(), 0).unwrap();

        let replacement = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[50_000]);
        assert_eq!(
            mempool.add_tx(replacement, &fx.view(), 0),
            Err(MempoolError::RbfNotSignaled(original.id().to_string()))
        );
    }

    #[test]
    fn test_rbf_rejects_new_unconfirmed_inputs() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let original = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[99_000]);
        let other = fx.spend(OutPoint::new("b", 0), SEQUENCE_RBF, &[99_000]);
        mempool.add_tx(original, &fx.view(), 0).unwrap();
        mempool.add_tx(other.clone(), &fx.view(), 0).unwrap();

        let outputs = vec![TxOut::new(100_000, fx.key.address())];
        let mut inputs = Vec::new();
        for outpoint in [OutPoint::new("a", 0), OutPoint::new(other.id(), 0)] {
            let msg = build_spend_msg(&outpoint, &fx.key.public_key_bytes(), SEQUENCE_RBF, &outputs);
            inputs.push(TxIn::new(
                Some(outpoint),
                fx.key.sign(&msg).unwrap(),
                fx.key.public_key_bytes(),
                SEQUENCE_RBF,
            ));
        }
        let replacement = Transaction::new(inputs, outputs, 0);
        assert!(matches!(
            mempool.add_tx(replacement, &fx.view(), 0),
            Err(MempoolError::RbfNewUnconfirmedInput(_))
        ));
    }

    #[test]
    fn test_size_cap_evicts_lowest_fee_rate() {
        let fx = Fixture::new();
        let cheap = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[99_000]);
        let rich = fx.spend(OutPoint::new("b", 0), SEQUENCE_RBF, &[50_000]);
        let mut mempool = Mempool::with_max_size(cheap.serialized_size() + rich.serialized_size() - 1);

        mempool.add_tx(cheap.clone(), &fx.view(), 0).unwrap();
        mempool.add_tx(rich.clone(), &fx.view(), 0).unwrap();
        assert!(!mempool.contains(cheap.id()));
        assert!(mempool.contains(rich.id()));
    }

    #[test]
    fn test_expiry_and_block_removal() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();

        let old = fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[99_000]);
        let young = fx.spend(OutPoint::new("b", 0), SEQUENCE_RBF, &[99_000]);
        let doomed = fx.spend(OutPoint::new("c", 0), SEQUENCE_RBF, &[99_000]);
        mempool.add_tx(old.clone(), &fx.view(), 0).unwrap();
        mempool.add_tx(young.clone(), &fx.view(), 100).unwrap();
        mempool.add_tx(doomed, &fx.view(), 100).unwrap();

        assert_eq!(mempool.expire_old_transactions(MEMPOOL_TX_EXPIRE_SECS), 1);
        assert!(!mempool.contains(old.id()));

        // A block mining `young` and a different spend of "c"
        let rival = fx.spend(OutPoint::new("c", 0), SEQUENCE_RBF, &[10_000]);
        let block = Block::new(0, String::new(), String::new(), 0, 1, 0, vec![young, rival]);
        mempool.remove_for_block(&block);
        assert!(mempool.is_empty());
        assert_eq!(mempool.total_size_bytes(), 0);
    }

    #[test]
    fn test_stats() {
        let fx = Fixture::new();
        let mut mempool = Mempool::new();
        mempool
            .add_tx(fx.spend(OutPoint::new("a", 0), SEQUENCE_RBF, &[90_000]), &fx.view(), 0)
            .unwrap();
        let stats = mempool.stats();
        assert_eq!(stats.tx_count, 1);
        assert_eq!(stats.total_fees, 10_000);
        assert_eq!(stats.max_fee_rate, stats.min_fee_rate);
        assert_eq!(mempool.fee_rates().len(), 1);
    }
}
