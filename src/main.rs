//! tinycoin node and wallet CLI

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tinycoin::cli::{self, CliResult, WalletAction};
use tinycoin::config::NodeConfig;

#[derive(Parser)]
#[command(name = "tinycoin")]
#[command(version = "0.1.0")]
#[command(about = "A minimal proof-of-work cryptocurrency node", long_about = None)]
struct Cli {
    /// JSON configuration file; flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for the chain and wallet files
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use a hierarchical deterministic wallet file
    #[arg(long, global = true)]
    hd: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node: network listener, chain sync and the miner loop
    Node {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bootstrap peers (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Mining threads (0 = auto)
        #[arg(long)]
        threads: Option<usize>,
    },

    /// Wallet operations against a miner peer
    Wallet {
        /// Miner to talk to (host:port); defaults to the bootstrap peers
        #[arg(long, global = true)]
        peer: Option<String>,

        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Print fee rate estimates from the local chain
    Fee {
        /// Confirmation target in blocks
        #[arg(short, long)]
        target: Option<u32>,
    },
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Show the wallet address
    Address,

    /// Derive the next receiving address of an HD wallet
    NewAddress,

    /// Show the wallet balance
    Balance {
        /// Read the local chain file instead of asking a peer
        #[arg(long)]
        local: bool,
    },

    /// Send coins
    Send {
        /// Recipient address
        #[arg(short, long)]
        to: String,

        /// Amount in base units
        #[arg(short, long)]
        amount: u64,

        /// Fee in base units per byte
        #[arg(short, long, default_value = "1")]
        fee: u64,

        /// Absolute lock time (height, or unix time if large)
        #[arg(long, default_value = "0")]
        lock_time: i64,
    },

    /// Show where a transaction is
    Status {
        /// Transaction id
        tx_id: String,
    },

    /// Bump the fee of an unconfirmed transaction
    Rbf {
        /// Transaction id
        tx_id: String,

        /// New fee in base units per byte
        #[arg(short, long)]
        fee: u64,
    },
}

fn load_config(cli: &Cli) -> CliResult<NodeConfig> {
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if cli.hd {
        config.hd_wallet = true;
    }
    Ok(config)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("❌ Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Node {
            port,
            peers,
            threads,
        } => {
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(peers) = peers {
                config.bootstrap_peers = peers
                    .split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
            }
            if let Some(threads) = threads {
                config.mining_threads = threads;
            }
            cli::cmd_node(config)
        }

        Commands::Wallet { peer, action } => {
            let action = match action {
                WalletCommands::Address => WalletAction::Address,
                WalletCommands::NewAddress => WalletAction::NewAddress,
                WalletCommands::Balance { local: true } => return cli::cmd_local_balance(config),
                WalletCommands::Balance { local: false } => WalletAction::Balance,
                WalletCommands::Send {
                    to,
                    amount,
                    fee,
                    lock_time,
                } => WalletAction::Send {
                    to,
                    amount,
                    fee_per_byte: fee,
                    lock_time,
                },
                WalletCommands::Status { tx_id } => WalletAction::Status { tx_id },
                WalletCommands::Rbf { tx_id, fee } => WalletAction::Rbf {
                    tx_id,
                    fee_per_byte: fee,
                },
            };
            cli::cmd_wallet(config, peer, action)
        }

        Commands::Fee { target } => cli::cmd_fee(config, target),
    }
}
