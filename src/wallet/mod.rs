//! Wallet module for key and transaction management

pub mod hd;
pub mod wallet;

pub use hd::{AddressChain, HdError, HdKeyChain};
pub use wallet::{
    branch_and_bound_select, LocalBackend, RemoteBackend, TxStatus, Wallet, WalletBackend, WalletError,
};
