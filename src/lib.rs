//! tinycoin: a minimal proof-of-work cryptocurrency node
//!
//! This crate provides:
//! - UTXO transactions signed with secp256k1 ECDSA, with absolute and
//!   relative lock times and opt-in replace-by-fee
//! - Block validation, side branches and reorganisation to the longest chain
//! - Difficulty retargeting and a pluggable proof-of-work backend
//! - A mempool with ancestor/descendant limits and CPFP-aware block assembly
//! - Fee estimation from recent blocks and the mempool
//! - A binary chain file and a framed TCP peer protocol
//! - A single-key wallet with branch-and-bound coin selection
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tinycoin::core::{ChainParams, NodeState};
//! use tinycoin::mining::{CpuMiningBackend, PowEngine};
//! use tinycoin::network::NoPeers;
//! use tinycoin::wallet::{LocalBackend, Wallet};
//!
//! let wallet = Wallet::load_or_create("wallet.dat".as_ref()).unwrap();
//! let node = Arc::new(NodeState::new(ChainParams::regtest(), Arc::new(NoPeers), None));
//! let engine = PowEngine::new(node.clone(), Arc::new(CpuMiningBackend::default()));
//!
//! if let Ok(Some(block)) = engine.assemble_and_solve_block(&wallet.address(), None) {
//!     node.connect_block(block);
//! }
//! let balance = wallet.balance(&LocalBackend::new(node)).unwrap();
//! println!("Balance: {}", balance);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;
pub mod storage;
pub mod wallet;

// Re-export commonly used types
pub use config::{ConfigError, NodeConfig};
pub use core::{Block, Chain, ChainParams, NodeState, Transaction, COIN};
pub use crypto::KeyPair;
pub use mining::{Mempool, PowEngine};
pub use network::{Node, PeerManager};
pub use storage::ChainStore;
pub use wallet::Wallet;
