//! Unspent transaction output set
//!
//! Maps each outpoint of the active chain that has not been spent yet to its
//! output plus the metadata validation needs (coinbase flag and height). The
//! set itself is not synchronized; `NodeState` keeps it behind a `RwLock`.

use std::collections::HashMap;

use super::codec::{BinaryBuffer, CodecError, Decode, Encode};
use super::transaction::{OutPoint, Transaction, TxIn, TxOut};

// =============================================================================
// UTXO entry
// =============================================================================

/// An unspent output with its confirmation metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentTxOut {
    pub tx_out: TxOut,
    pub outpoint: OutPoint,
    pub is_coinbase: bool,
    /// Active-chain length right after the creating block was appended,
    /// or -1 for outputs that are not confirmed
    pub height: i64,
}

impl UnspentTxOut {
    pub fn new(tx_out: TxOut, outpoint: OutPoint, is_coinbase: bool, height: i64) -> Self {
        Self {
            tx_out,
            outpoint,
            is_coinbase,
            height,
        }
    }

    pub fn value(&self) -> u64 {
        self.tx_out.value
    }
}

impl Encode for UnspentTxOut {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write(&self.tx_out);
        buf.write(&self.outpoint);
        buf.write(&self.is_coinbase);
        buf.write(&self.height);
    }
}

impl Decode for UnspentTxOut {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            tx_out: buf.read()?,
            outpoint: buf.read()?,
            is_coinbase: buf.read()?,
            height: buf.read()?,
        })
    }
}

// =============================================================================
// UTXO set
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    map: HashMap<OutPoint, UnspentTxOut>,
}

impl UtxoSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or overwrite) the output `index` of `tx_id`
    pub fn add(&mut self, tx_out: TxOut, tx_id: &str, index: i64, is_coinbase: bool, height: i64) {
        let outpoint = OutPoint::new(tx_id, index);
        log::trace!("Adding {} to UTXO set", outpoint);
        self.map.insert(
            outpoint.clone(),
            UnspentTxOut::new(tx_out, outpoint, is_coinbase, height),
        );
    }

    /// Add every output of `tx` confirmed at `height`
    pub fn add_tx_outputs(&mut self, tx: &Transaction, height: i64) {
        let is_coinbase = tx.is_coinbase();
        for (index, tx_out) in tx.outputs().iter().enumerate() {
            self.add(tx_out.clone(), tx.id(), index as i64, is_coinbase, height);
        }
    }

    /// Remove an entry; no-op if absent
    pub fn remove(&mut self, tx_id: &str, index: i64) -> Option<UnspentTxOut> {
        self.map.remove(&OutPoint::new(tx_id, index))
    }

    pub fn find(&self, outpoint: &OutPoint) -> Option<&UnspentTxOut> {
        self.map.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.map.contains_key(outpoint)
    }

    /// Resolve `tx_in` against transactions that are not in the set yet,
    /// such as earlier transactions of the same block.
    ///
    /// The result is never a coinbase and carries height -1.
    pub fn find_in_list(tx_in: &TxIn, txs: &[Transaction]) -> Option<UnspentTxOut> {
        let to_spend = tx_in.to_spend.as_ref()?;
        let tx = txs.iter().find(|tx| tx.id() == to_spend.tx_id)?;
        let index = usize::try_from(to_spend.index).ok()?;
        let tx_out = tx.outputs().get(index)?;
        Some(UnspentTxOut::new(tx_out.clone(), to_spend.clone(), false, -1))
    }

    /// Every entry paying `address`
    pub fn for_address(&self, address: &str) -> Vec<UnspentTxOut> {
        self.map
            .values()
            .filter(|utxo| utxo.tx_out.is_owned_by(address))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &UnspentTxOut)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
