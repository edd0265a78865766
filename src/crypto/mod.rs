//! Cryptographic utilities for the blockchain
//!
//! This module provides:
//! - SHA-256 hashing and the proof-of-work target test
//! - ECDSA key management (secp256k1) and addresses
//! - Merkle roots over transaction ids
//! - A cache of verified signatures

pub mod hash;
pub mod keys;
pub mod merkle;
pub mod sig_cache;

pub use hash::{
    double_sha256, double_sha256_hex, hash_meets_target, sha256, sha256_hex, target_from_bits,
};
pub use keys::{public_key_to_address, sign_message, verify_signature, KeyError, KeyPair};
pub use merkle::{calculate_merkle_root, merkle_root_of_txs};
pub use sig_cache::{SigCache, SIG_CACHE_MAX_ENTRIES};
