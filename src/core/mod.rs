//! Core chain components
//!
//! This module contains the fundamental building blocks:
//! - Binary codec shared by disk and wire formats
//! - Transactions (UTXO model with locktime, relative locks and RBF)
//! - Blocks and network parameters
//! - The block tree (active chain, side branches, orphans)
//! - Validation rules for transactions and blocks
//! - Node state: connecting blocks, reorgs, persistence

pub mod block;
pub mod chain;
pub mod chain_state;
pub mod codec;
pub mod node_state;
pub mod params;
pub mod transaction;
pub mod utxo;
pub mod validation;

pub use block::Block;
pub use chain::{BlockLocation, Chain};
pub use chain_state::{BlockStatus, OrphanBlock, OrphanPool};
pub use codec::{BinaryBuffer, CodecError, Decode, Encode};
pub use node_state::{unix_now, ChainError, NodeState};
pub use params::{ChainParams, COIN};
pub use transaction::{OutPoint, Transaction, TransactionBuilder, TxIn, TxOut};
pub use utxo::{UnspentTxOut, UtxoSet};
pub use validation::{BlockValidationError, TxValidationError};
