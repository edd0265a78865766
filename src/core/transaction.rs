//! Transactions in the UTXO model
//!
//! A transaction spends earlier outputs ([`TxIn`] pointing at an [`OutPoint`])
//! and creates new ones ([`TxOut`]). Its identity is the hex double-SHA-256 of
//! the binary serialization, computed once and cached until the next mutation.
//!
//! Wire layout:
//! - Transaction: `count(inputs) ‖ input* ‖ count(outputs) ‖ output* ‖ lock_time:i64`
//! - TxIn: `has_outpoint:bool ‖ [outpoint] ‖ unlock_sig:bytes ‖ unlock_pub_key:bytes ‖ sequence:i32`
//! - TxOut: `value:u64 ‖ to_address:string`
//! - OutPoint: `tx_id:string ‖ index:i64`

use std::fmt;
use std::sync::OnceLock;

use super::codec::{encode_to_vec, BinaryBuffer, CodecError, Decode, Encode};
use super::params::{
    SEQUENCE_FINAL, SEQUENCE_LOCKTIME_DISABLE_FLAG, SEQUENCE_LOCKTIME_MASK,
    SEQUENCE_LOCKTIME_TYPE_FLAG, SEQUENCE_RBF,
};
use crate::crypto::double_sha256_hex;

// =============================================================================
// OutPoint
// =============================================================================

/// Reference to one output of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub tx_id: String,
    pub index: i64,
}

impl OutPoint {
    pub fn new(tx_id: impl Into<String>, index: i64) -> Self {
        Self {
            tx_id: tx_id.into(),
            index,
        }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_id, self.index)
    }
}

impl Encode for OutPoint {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write(&self.tx_id);
        buf.write(&self.index);
    }
}

impl Decode for OutPoint {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            tx_id: buf.read()?,
            index: buf.read()?,
        })
    }
}

// =============================================================================
// Transaction Output
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxOut {
    pub value: u64,
    pub to_address: String,
}

impl TxOut {
    pub fn new(value: u64, to_address: impl Into<String>) -> Self {
        Self {
            value,
            to_address: to_address.into(),
        }
    }

    /// Check if this output pays the given address
    pub fn is_owned_by(&self, address: &str) -> bool {
        self.to_address == address
    }
}

impl Encode for TxOut {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write(&self.value);
        buf.write(&self.to_address);
    }
}

impl Decode for TxOut {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            value: buf.read()?,
            to_address: buf.read()?,
        })
    }
}

// =============================================================================
// Transaction Input
// =============================================================================

/// Transaction input. `to_spend == None` marks the coinbase input.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxIn {
    pub to_spend: Option<OutPoint>,
    pub unlock_sig: Vec<u8>,
    pub unlock_pub_key: Vec<u8>,
    /// Lock and replacement flags:
    /// - `SEQUENCE_FINAL` (-1): no lock time, no relative lock, no RBF
    /// - bit 31 set: relative lock disabled
    /// - bit 22 set: relative lock counts 512 s units, otherwise blocks
    pub sequence: i32,
}

impl TxIn {
    pub fn new(
        to_spend: Option<OutPoint>,
        unlock_sig: Vec<u8>,
        unlock_pub_key: Vec<u8>,
        sequence: i32,
    ) -> Self {
        Self {
            to_spend,
            unlock_sig,
            unlock_pub_key,
            sequence,
        }
    }

    /// Unsigned input spending `outpoint`, replaceable by default
    pub fn spending(outpoint: OutPoint) -> Self {
        Self::new(Some(outpoint), Vec::new(), Vec::new(), SEQUENCE_RBF)
    }

    pub fn is_final(&self) -> bool {
        self.sequence == SEQUENCE_FINAL
    }

    /// Whether the sequence encodes a relative lock
    pub fn has_relative_locktime(&self) -> bool {
        (self.sequence as u32) & SEQUENCE_LOCKTIME_DISABLE_FLAG == 0
    }

    pub fn is_time_based_locktime(&self) -> bool {
        (self.sequence as u32) & SEQUENCE_LOCKTIME_TYPE_FLAG != 0
    }

    /// Blocks, or 512-second units for time-based locks
    pub fn relative_locktime_value(&self) -> i64 {
        ((self.sequence as u32) & SEQUENCE_LOCKTIME_MASK) as i64
    }
}

impl Encode for TxIn {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write(&self.to_spend.is_some());
        if let Some(outpoint) = &self.to_spend {
            buf.write(outpoint);
        }
        buf.write_bytes(&self.unlock_sig);
        buf.write_bytes(&self.unlock_pub_key);
        buf.write(&self.sequence);
    }
}

impl Decode for TxIn {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        let has_outpoint: bool = buf.read()?;
        let to_spend = if has_outpoint {
            Some(buf.read()?)
        } else {
            None
        };
        Ok(Self {
            to_spend,
            unlock_sig: buf.read_bytes()?,
            unlock_pub_key: buf.read_bytes()?,
            sequence: buf.read()?,
        })
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// A transaction. Fields are private so that every mutation drops the cached id.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
    /// - 0: no lock
    /// - below `LOCKTIME_THRESHOLD`: block height
    /// - otherwise: Unix timestamp compared with median-time-past
    lock_time: i64,
    cached_id: OnceLock<String>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>, lock_time: i64) -> Self {
        Self {
            inputs,
            outputs,
            lock_time,
            cached_id: OnceLock::new(),
        }
    }

    /// Create the coinbase for a block at `height`.
    ///
    /// The height goes into the unlock signature so that coinbases paying the
    /// same address the same amount still get distinct ids.
    pub fn create_coinbase(pay_to: &str, value: u64, height: i64) -> Self {
        let tx_in = TxIn::new(None, encode_to_vec(&height), Vec::new(), SEQUENCE_FINAL);
        Self::new(vec![tx_in], vec![TxOut::new(value, pay_to)], 0)
    }

    /// Hex double-SHA-256 of the serialization
    pub fn id(&self) -> &str {
        self.cached_id
            .get_or_init(|| double_sha256_hex(&self.serialize()))
    }

    pub fn inputs(&self) -> &[TxIn] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    pub fn lock_time(&self) -> i64 {
        self.lock_time
    }

    pub fn inputs_mut(&mut self) -> &mut Vec<TxIn> {
        self.cached_id = OnceLock::new();
        &mut self.inputs
    }

    pub fn outputs_mut(&mut self) -> &mut Vec<TxOut> {
        self.cached_id = OnceLock::new();
        &mut self.outputs
    }

    pub fn set_lock_time(&mut self, lock_time: i64) {
        self.cached_id = OnceLock::new();
        self.lock_time = lock_time;
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].to_spend.is_none()
    }

    /// Any input with a non-final sequence opts in to replacement
    pub fn signals_rbf(&self) -> bool {
        self.inputs.iter().any(|tx_in| !tx_in.is_final())
    }

    /// A zero lock time, or all-final sequences, disables the lock time check
    pub fn is_final(&self) -> bool {
        self.lock_time == 0 || self.inputs.iter().all(TxIn::is_final)
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, tx_out| acc.checked_add(tx_out.value))
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode_to_vec(self)
    }

    pub fn serialized_size(&self) -> usize {
        self.serialize().len()
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.lock_time == other.lock_time
    }
}

impl Eq for Transaction {}

impl Encode for Transaction {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write(&self.inputs);
        buf.write(&self.outputs);
        buf.write(&self.lock_time);
    }
}

impl Decode for Transaction {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self::new(buf.read()?, buf.read()?, buf.read()?))
    }
}

// =============================================================================
// Transaction Builder
// =============================================================================

/// Builder for unsigned transactions
#[derive(Debug, Default)]
pub struct TransactionBuilder {
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
    lock_time: i64,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend an outpoint with the replaceable default sequence
    pub fn add_input(mut self, outpoint: OutPoint) -> Self {
        self.inputs.push(TxIn::spending(outpoint));
        self
    }

    pub fn add_input_with_sequence(mut self, outpoint: OutPoint, sequence: i32) -> Self {
        self.inputs
            .push(TxIn::new(Some(outpoint), Vec::new(), Vec::new(), sequence));
        self
    }

    pub fn add_output(mut self, to_address: &str, value: u64) -> Self {
        self.outputs.push(TxOut::new(value, to_address));
        self
    }

    pub fn lock_time(mut self, lock_time: i64) -> Self {
        self.lock_time = lock_time;
        self
    }

    pub fn build(self) -> Transaction {
        Transaction::new(self.inputs, self.outputs, self.lock_time)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::decode_exact;
    use crate::core::params::encode_relative_time;

    fn sample_tx() -> Transaction {
        TransactionBuilder::new()
            .add_input(OutPoint::new("ab".repeat(32), 1))
            .add_output("addr1", 500)
            .add_output("addr2", 700)
            .lock_time(10)
            .build()
    }

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::create_coinbase("miner", 50, 7);
        assert!(tx.is_coinbase());
        assert_eq!(tx.total_output(), Some(50));
        assert_eq!(decode_exact::<i64>(&tx.inputs()[0].unlock_sig).unwrap(), 7);
    }

    #[test]
    fn test_coinbase_ids_differ_by_height() {
        let a = Transaction::create_coinbase("miner", 50, 1);
        let b = Transaction::create_coinbase("miner", 50, 2);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_id_is_reset_on_mutation() {
        let mut tx = sample_tx();
        let before = tx.id().to_string();
        tx.outputs_mut()[0].value += 1;
        assert_ne!(tx.id(), before);

        tx.outputs_mut()[0].value -= 1;
        assert_eq!(tx.id(), before);

        tx.set_lock_time(11);
        assert_ne!(tx.id(), before);
    }

    #[test]
    fn test_equality_ignores_cached_id() {
        let a = sample_tx();
        let b = sample_tx();
        let _ = a.id();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wire_layout() {
        let tx = Transaction::new(
            vec![TxIn::new(None, vec![9], Vec::new(), -1)],
            vec![TxOut::new(5, "a")],
            0,
        );
        let bytes = tx.serialize();
        let parts: [&[u8]; 11] = [
            &1u32.to_le_bytes(), // input count
            &[0],                    // no outpoint
            &1u32.to_le_bytes(),
            &[9],
            &0u32.to_le_bytes(),
            &(-1i32).to_le_bytes(),
            &1u32.to_le_bytes(), // output count
            &5u64.to_le_bytes(),
            &1u32.to_le_bytes(),
            b"a",
            &0i64.to_le_bytes(),
        ];
        assert_eq!(bytes, parts.concat());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let tx = sample_tx();
        let decoded: Transaction = decode_exact(&tx.serialize()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.id(), tx.id());
    }

    #[test]
    fn test_truncated_transaction_fails() {
        let bytes = sample_tx().serialize();
        assert!(decode_exact::<Transaction>(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_rbf_signaling() {
        let final_tx = TransactionBuilder::new()
            .add_input_with_sequence(OutPoint::new("aa", 0), SEQUENCE_FINAL)
            .add_output("x", 1)
            .build();
        assert!(!final_tx.signals_rbf());
        assert!(sample_tx().signals_rbf());
    }

    #[test]
    fn test_is_final() {
        let mut tx = sample_tx();
        assert!(!tx.is_final());
        tx.set_lock_time(0);
        assert!(tx.is_final());

        tx.set_lock_time(100);
        tx.inputs_mut()[0].sequence = SEQUENCE_FINAL;
        assert!(tx.is_final());
    }

    #[test]
    fn test_relative_lock_flags() {
        let tx_in = TxIn::new(None, vec![], vec![], encode_relative_time(5));
        assert!(tx_in.has_relative_locktime());
        assert!(tx_in.is_time_based_locktime());
        assert_eq!(tx_in.relative_locktime_value(), 5);

        let final_in = TxIn::new(None, vec![], vec![], SEQUENCE_FINAL);
        assert!(!final_in.has_relative_locktime());
    }

    #[test]
    fn test_total_output_overflow() {
        let tx = TransactionBuilder::new()
            .add_output("a", u64::MAX)
            .add_output("b", 1)
            .build();
        assert_eq!(tx.total_output(), None);
    }
}
