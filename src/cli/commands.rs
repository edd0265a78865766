//! CLI commands for the node
//!
//! Implements the command handlers for the CLI interface.

use crate::config::NodeConfig;
use crate::core::{Block, ChainParams, NodeState, Transaction, UnspentTxOut, COIN};
use crate::mining::{CpuMiningBackend, PowEngine};
use crate::network::{NoPeers, Node, NodeType, PeerManager, PeerSender};
use crate::storage::ChainStore;
use crate::wallet::{LocalBackend, RemoteBackend, TxStatus, Wallet, WalletBackend, WalletError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// How long a wallet waits for a miner to say hello
pub const MINER_WAIT: Duration = Duration::from_secs(10);

/// Wallet subcommands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletAction {
    Address,
    NewAddress,
    Balance,
    Send {
        to: String,
        amount: u64,
        fee_per_byte: u64,
        lock_time: i64,
    },
    Status {
        tx_id: String,
    },
    Rbf {
        tx_id: String,
        fee_per_byte: u64,
    },
}

/// Backend for actions that never touch the chain
struct NoBackend;

impl WalletBackend for NoBackend {
    fn utxos(&self) -> Option<Vec<UnspentTxOut>> {
        None
    }

    fn mempool_tx_ids(&self) -> Option<Vec<String>> {
        None
    }

    fn active_chain(&self) -> Option<Vec<Block>> {
        None
    }

    fn submit(&self, _tx: Transaction) -> Result<(), WalletError> {
        Err(WalletError::NoConnection)
    }
}

fn format_coins(value: u64) -> String {
    format!("{}.{:08}", value / COIN, value % COIN)
}

/// Open the configured wallet file, creating it on first use
pub fn open_wallet(config: &NodeConfig) -> Result<Wallet, WalletError> {
    if config.hd_wallet {
        Wallet::load_or_create_hd(&config.wallet_path())
    } else {
        Wallet::load_or_create(&config.wallet_path())
    }
}

/// Run a full miner node until Ctrl+C
pub fn cmd_node(config: NodeConfig) -> CliResult<()> {
    let wallet = open_wallet(&config)?;
    let store = ChainStore::new(config.storage_config())?;

    let peer_manager = Arc::new(PeerManager::new(config.port));
    let state = Arc::new(NodeState::new(
        ChainParams::main(),
        peer_manager.clone(),
        Some(store),
    ));
    let node = Node::new(state.clone(), peer_manager, NodeType::from(config.node_type));

    println!("🌐 Starting node on port {}...", config.port);
    println!("   📍 Mining to {}", wallet.address());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let port = node.listen(config.port).await?;
        node.connect_bootstrap(&config.bootstrap_peers, port).await;

        if node.node_type().contains(NodeType::MINER) {
            let engine = PowEngine::new(
                state.clone(),
                Arc::new(CpuMiningBackend::new(config.mining_threads())),
            );
            let address = wallet.address();
            thread::Builder::new()
                .name("miner".to_string())
                .spawn(move || engine.mine_forever(&address))?;
        }

        tokio::select! {
            _ = node.run() => {}
            _ = tokio::signal::ctrl_c() => println!("\n📴 Shutting down node..."),
        }

        Ok::<(), Box<dyn std::error::Error>>(())
    })?;

    state.save_to_disk()?;
    println!(
        "✅ Chain saved at height {} (chain work {})",
        state.current_height(),
        state.chain_work()
    );
    Ok(())
}

/// Run one wallet action against a miner peer (or the bootstrap peers)
pub fn cmd_wallet(config: NodeConfig, peer: Option<String>, action: WalletAction) -> CliResult<()> {
    let wallet = open_wallet(&config)?;
    if matches!(action, WalletAction::Address | WalletAction::NewAddress) {
        run_wallet_action(&wallet, &NoBackend, action)?;
        return Ok(());
    }

    let peers = match peer {
        Some(peer) => vec![peer],
        None => config.bootstrap_peers.clone(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let peer_manager = Arc::new(PeerManager::new(0));
        let state = Arc::new(NodeState::new(ChainParams::main(), peer_manager.clone(), None));
        let node = Arc::new(Node::new(state, peer_manager.clone(), NodeType::WALLET));

        let runner = node.clone();
        tokio::spawn(async move { runner.run().await });

        node.connect_bootstrap(&peers, 0).await;
        if !node.wait_for_miner(MINER_WAIT).await {
            return Err(Box::new(WalletError::NoConnection) as Box<dyn std::error::Error>);
        }

        let sender: Arc<dyn PeerSender> = peer_manager;
        let backend = RemoteBackend::new(node.msg_cache().clone(), sender);
        tokio::task::spawn_blocking(move || run_wallet_action(&wallet, &backend, action)).await??;

        // Let the writer tasks flush queued messages
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Execute a wallet action and print its outcome
pub fn run_wallet_action(
    wallet: &Wallet,
    backend: &dyn WalletBackend,
    action: WalletAction,
) -> Result<(), WalletError> {
    match action {
        WalletAction::Address => println!("📍 {}", wallet.address()),
        WalletAction::NewAddress => println!("📍 {}", wallet.new_address()?),
        WalletAction::Balance => {
            let utxos = wallet.utxos(backend)?;
            let balance = utxos.iter().map(|utxo| utxo.value()).sum::<u64>();
            println!("💰 Balance for {}", wallet.address());
            println!("   Total: {} coins", format_coins(balance));
            println!("   UTXOs: {}", utxos.len());
        }
        WalletAction::Send {
            to,
            amount,
            fee_per_byte,
            lock_time,
        } => {
            let tx = wallet.send(backend, amount, fee_per_byte, &to, lock_time)?;
            println!("📤 Sent {} coins to {}", format_coins(amount), to);
            println!("   Transaction: {}", tx.id());
        }
        WalletAction::Status { tx_id } => match wallet.tx_status(backend, &tx_id)? {
            TxStatus::Mempool => println!("⏳ {} is in the mempool", tx_id),
            TxStatus::Mined { block_id, height } => {
                println!("✅ {} mined in block {} at height {}", tx_id, block_id, height)
            }
            TxStatus::NotFound => println!("❓ {} not found", tx_id),
        },
        WalletAction::Rbf { tx_id, fee_per_byte } => {
            let replacement = wallet.rbf(backend, &tx_id, fee_per_byte)?;
            println!("🔁 Replaced {} at {} coins/byte", tx_id, fee_per_byte);
            println!("   Replacement: {}", replacement.id());
        }
    }
    Ok(())
}

/// Print fee estimates computed from the local chain file
pub fn cmd_fee(config: NodeConfig, target: Option<u32>) -> CliResult<()> {
    let store = ChainStore::new(config.storage_config())?;
    let state = NodeState::new(ChainParams::main(), Arc::new(NoPeers), Some(store));
    if !state.load_from_disk() {
        println!("⚠️  No chain found in {:?}, estimates use defaults", config.data_dir);
    }

    match target {
        Some(target) => {
            println!(
                "💸 Estimated fee rate for {} block(s): {} coins/byte",
                target,
                state.estimate_fee_rate(target)
            );
        }
        None => {
            let estimates = state.fee_estimates();
            println!("💸 Fee estimates (coins/byte) at height {}", state.current_height());
            println!("   ├─ High priority: {}", estimates.high_priority.0);
            println!("   ├─ Normal:        {}", estimates.normal.0);
            println!("   ├─ Low priority:  {}", estimates.low_priority.0);
            println!("   └─ Economy:       {}", estimates.economy.0);
        }
    }
    Ok(())
}

/// Balance of the node's own key, read from its local chain file
pub fn cmd_local_balance(config: NodeConfig) -> CliResult<()> {
    let wallet = open_wallet(&config)?;
    let store = ChainStore::new(config.storage_config())?;
    let state = Arc::new(NodeState::new(ChainParams::main(), Arc::new(NoPeers), Some(store)));
    state.load_from_disk();
    run_wallet_action(&wallet, &LocalBackend::new(state), WalletAction::Balance)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_coins() {
        assert_eq!(format_coins(50 * COIN), "50.00000000");
        assert_eq!(format_coins(COIN + 5), "1.00000005");
    }

    #[test]
    fn test_fee_without_chain() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        cmd_fee(config.clone(), Some(2)).unwrap();
        cmd_fee(config, None).unwrap();
    }

    #[test]
    fn test_address_needs_no_peer() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        cmd_wallet(config.clone(), None, WalletAction::Address).unwrap();
        assert!(config.wallet_path().exists());
    }

    #[test]
    fn test_hd_new_address_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().to_path_buf(),
            hd_wallet: true,
            ..Default::default()
        };
        cmd_wallet(config.clone(), None, WalletAction::NewAddress).unwrap();
        cmd_wallet(config.clone(), None, WalletAction::NewAddress).unwrap();

        let chain = crate::wallet::HdKeyChain::load(&config.wallet_path()).unwrap();
        assert_eq!(chain.next_external(), 2);
        assert!(open_wallet(&config).unwrap().is_hd());
    }
}
