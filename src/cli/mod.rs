//! Command-line interface

pub mod commands;

pub use commands::{cmd_fee, cmd_local_balance, cmd_node, cmd_wallet, run_wallet_action, CliResult, WalletAction};
