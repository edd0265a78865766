//! Block implementation for the blockchain
//!
//! A block is a header plus a list of transactions. The id is the hex
//! double-SHA-256 of the header only:
//! `version:u64 ‖ prev_block_hash:string ‖ merkle_hash:string ‖ timestamp:i64 ‖ bits:u8 ‖ nonce:u64`.
//! The full block appends `count(txs) ‖ tx*`.

use std::sync::OnceLock;

use super::codec::{encode_to_vec, BinaryBuffer, CodecError, Decode, Encode};
use super::transaction::Transaction;
use crate::crypto::{double_sha256, double_sha256_hex, hash_meets_target, target_from_bits};

/// A block. Header fields are private so that every change drops the cached id.
#[derive(Debug, Clone, Default)]
pub struct Block {
    version: u64,
    prev_block_hash: String,
    merkle_hash: String,
    timestamp: i64,
    /// Target is `2^(255 - bits)`
    bits: u8,
    nonce: u64,
    txs: Vec<Transaction>,
    cached_id: OnceLock<String>,
}

impl Block {
    pub fn new(
        version: u64,
        prev_block_hash: String,
        merkle_hash: String,
        timestamp: i64,
        bits: u8,
        nonce: u64,
        txs: Vec<Transaction>,
    ) -> Self {
        Self {
            version,
            prev_block_hash,
            merkle_hash,
            timestamp,
            bits,
            nonce,
            txs,
            cached_id: OnceLock::new(),
        }
    }

    /// Hex double-SHA-256 of the header
    pub fn id(&self) -> &str {
        self.cached_id
            .get_or_init(|| double_sha256_hex(&self.header()))
    }

    /// Header bytes without the nonce; the mining backend appends nonces to this
    pub fn header_prefix(&self) -> Vec<u8> {
        let mut buf = BinaryBuffer::with_capacity(128);
        buf.write(&self.version);
        buf.write(&self.prev_block_hash);
        buf.write(&self.merkle_hash);
        buf.write(&self.timestamp);
        buf.write(&self.bits);
        buf.into_bytes()
    }

    pub fn header(&self) -> Vec<u8> {
        let mut header = self.header_prefix();
        header.extend_from_slice(&self.nonce.to_le_bytes());
        header
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn prev_block_hash(&self) -> &str {
        &self.prev_block_hash
    }

    pub fn merkle_hash(&self) -> &str {
        &self.merkle_hash
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.txs
    }

    /// Transactions are not part of the header, so the id is kept
    pub fn txs_mut(&mut self) -> &mut Vec<Transaction> {
        &mut self.txs
    }

    pub fn set_prev_block_hash(&mut self, prev_block_hash: String) {
        self.cached_id = OnceLock::new();
        self.prev_block_hash = prev_block_hash;
    }

    pub fn set_merkle_hash(&mut self, merkle_hash: String) {
        self.cached_id = OnceLock::new();
        self.merkle_hash = merkle_hash;
    }

    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.cached_id = OnceLock::new();
        self.timestamp = timestamp;
    }

    pub fn set_bits(&mut self, bits: u8) {
        self.cached_id = OnceLock::new();
        self.bits = bits;
    }

    pub fn set_nonce(&mut self, nonce: u64) {
        self.cached_id = OnceLock::new();
        self.nonce = nonce;
    }

    /// The first transaction, if it is a coinbase
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.txs.first().filter(|tx| tx.is_coinbase())
    }

    /// Check the header hash against the target encoded in `bits`
    pub fn has_valid_pow(&self) -> bool {
        let hash = double_sha256(&self.header());
        hash_meets_target(&hash, &target_from_bits(self.bits))
    }

    /// Find a nonce sequentially on the calling thread. Only practical at low
    /// difficulty; the miner uses a [`crate::mining::MiningBackend`] instead.
    pub fn solve(&mut self) -> u64 {
        let target = target_from_bits(self.bits);
        let prefix = self.header_prefix();
        let mut header = prefix.clone();
        let mut attempts = 0u64;
        for nonce in 0..=u64::MAX {
            attempts += 1;
            header.truncate(prefix.len());
            header.extend_from_slice(&nonce.to_le_bytes());
            if hash_meets_target(&double_sha256(&header), &target) {
                self.set_nonce(nonce);
                break;
            }
        }
        attempts
    }

    pub fn serialize(&self) -> Vec<u8> {
        encode_to_vec(self)
    }

    pub fn serialized_size(&self) -> usize {
        self.serialize().len()
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.prev_block_hash == other.prev_block_hash
            && self.merkle_hash == other.merkle_hash
            && self.timestamp == other.timestamp
            && self.bits == other.bits
            && self.nonce == other.nonce
            && self.txs == other.txs
    }
}

impl Eq for Block {}

impl Encode for Block {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_raw(&self.header());
        buf.write(&self.txs);
    }
}

impl Decode for Block {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self::new(
            buf.read()?,
            buf.read()?,
            buf.read()?,
            buf.read()?,
            buf.read()?,
            buf.read()?,
            buf.read()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::decode_exact;
    use crate::crypto::merkle_root_of_txs;

    fn test_block(bits: u8) -> Block {
        let txs = vec![Transaction::create_coinbase("miner", 50, 1)];
        let merkle = merkle_root_of_txs(&txs);
        Block::new(0, "00".repeat(32), merkle, 1_600_000_000, bits, 0, txs)
    }

    #[test]
    fn test_block_mining() {
        let mut block = test_block(8);
        block.solve();
        assert!(block.has_valid_pow());
        assert!(block.id().starts_with("00"));
    }

    #[test]
    fn test_tampered_nonce_fails_pow() {
        let mut block = test_block(12);
        block.solve();
        assert!(block.has_valid_pow());

        // Find a nonce after the solution that does not meet the target
        let solved = block.nonce();
        let mut nonce = solved.wrapping_add(1);
        loop {
            block.set_nonce(nonce);
            if !block.has_valid_pow() {
                break;
            }
            nonce = nonce.wrapping_add(1);
        }
        assert_ne!(block.nonce(), solved);
        assert!(!block.has_valid_pow());
    }

    #[test]
    fn test_id_changes_with_header() {
        let mut block = test_block(1);
        let id = block.id().to_string();
        block.set_timestamp(block.timestamp() + 1);
        assert_ne!(block.id(), id);

        // Transactions are not hashed into the id
        let mut block = test_block(1);
        let id = block.id().to_string();
        block.txs_mut().clear();
        assert_eq!(block.id(), id);
    }

    #[test]
    fn test_header_is_prefix_plus_nonce() {
        let mut block = test_block(1);
        block.set_nonce(0x0102);
        let header = block.header();
        let prefix = block.header_prefix();
        assert_eq!(&header[..prefix.len()], &prefix[..]);
        assert_eq!(&header[prefix.len()..], &0x0102u64.to_le_bytes());
    }

    #[test]
    fn test_block_roundtrip() {
        let mut block = test_block(4);
        block.solve();
        let decoded: Block = decode_exact(&block.serialize()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.id(), block.id());
    }

    #[test]
    fn test_coinbase_accessor() {
        let block = test_block(1);
        assert!(block.coinbase().is_some());
        assert!(Block::default().coinbase().is_none());
    }
}
