//! P2P Node implementation
//!
//! Owns the listener, the peer connections and the dispatch loop that feeds
//! incoming messages to the chain core.

use crate::core::{Block, NodeState};
use crate::mining::ChainWork;
use crate::network::message::{Message, NodeType, CHUNK_SIZE};
use crate::network::msg_cache::MsgCache;
use crate::network::peer::{PeerError, PeerManager, PeerSender};
use crate::network::server::{connect_to_peer, handle_connection, Server};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Capacity of the channel between connection readers and the dispatcher
const MESSAGE_QUEUE_CAPACITY: usize = 1000;

/// Snapshot of the node for status output
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub height: usize,
    pub tip: String,
    pub chain_work: ChainWork,
    pub peers: usize,
    pub miners: usize,
    pub mempool_size: usize,
}

/// Applies incoming messages to the chain core.
///
/// Runs on the blocking thread pool: every handler takes the core's locks.
#[derive(Clone)]
pub struct MessageHandler {
    state: Arc<NodeState>,
    peer_manager: Arc<PeerManager>,
    msg_cache: Arc<MsgCache>,
}

impl MessageHandler {
    pub fn new(state: Arc<NodeState>, peer_manager: Arc<PeerManager>, msg_cache: Arc<MsgCache>) -> Self {
        Self {
            state,
            peer_manager,
            msg_cache,
        }
    }

    pub fn handle(&self, from: SocketAddr, msg: Message) {
        log::debug!("Received {} from {}", msg.type_name(), from);

        match msg {
            Message::BlockInfo(block) => {
                log::info!("Received block {} from peer {}", block.id(), from);
                self.state.connect_block(block);
                self.save();
            }

            Message::GetActiveChain => {
                let blocks = self.state.chain().read().active_chain().to_vec();
                self.peer_manager.send_to(&from, Message::SendActiveChain(blocks));
            }

            Message::GetBlock { from_block_id } => {
                let blocks = self.blocks_after(&from_block_id);
                log::trace!("Sending {} block(s) to {}", blocks.len(), from);
                self.peer_manager.send_to(&from, Message::Inv(blocks));
            }

            Message::GetMempool => {
                let tx_ids = self.state.mempool().lock().transaction_ids();
                self.peer_manager.send_to(&from, Message::SendMempool(tx_ids));
            }

            Message::GetUtxos => {
                let utxos = self
                    .state
                    .utxo_set()
                    .read()
                    .iter()
                    .map(|(_, utxo)| utxo.clone())
                    .collect();
                self.peer_manager.send_to(&from, Message::SendUtxos(utxos));
            }

            Message::Inv(blocks) => self.handle_inv(from, blocks),

            Message::PeerAdd { hostname, port } => {
                // Connecting needs the async runtime; the dispatcher does it
                log::debug!("Ignoring PeerAdd {}:{} outside the dispatcher", hostname, port);
            }

            Message::PeerHello { node_type } => {
                self.peer_manager.set_node_type(&from, node_type);
            }

            msg @ (Message::SendActiveChain(_) | Message::SendMempool(_) | Message::SendUtxos(_)) => {
                // Store can only fail for other message kinds
                let _ = self.msg_cache.store(msg);
            }

            Message::TxInfo(tx) => {
                let tx_id = tx.id().to_string();
                log::trace!("Received transaction {} from {}", tx_id, from);
                if let Err(e) = self.state.add_tx_to_mempool(tx) {
                    log::info!("Transaction {} from {} not added: {}", tx_id, from, e);
                }
            }
        }
    }

    /// Up to `CHUNK_SIZE` active-chain blocks after `from_block_id`, or from
    /// height 1 when that block is not on our active chain
    fn blocks_after(&self, from_block_id: &str) -> Vec<Block> {
        let chain = self.state.chain().read();
        let start = chain
            .locate_block_in_active_chain(from_block_id)
            .map(|(_, height)| height + 1)
            .unwrap_or(1);
        let active = chain.active_chain();
        let end = (start + CHUNK_SIZE).min(active.len());
        active.get(start..end).map(<[_]>::to_vec).unwrap_or_default()
    }

    fn handle_inv(&self, from: SocketAddr, blocks: Vec<Block>) {
        log::info!("Received {} block(s) for initial sync from {}", blocks.len(), from);

        let new_blocks: Vec<_> = {
            let chain = self.state.chain().read();
            blocks
                .into_iter()
                .filter(|block| !chain.contains_block(block.id()))
                .collect()
        };

        if new_blocks.is_empty() {
            log::info!("Initial block download complete");
            self.state.set_ibd_complete(true);
            self.save();
            return;
        }

        for block in new_blocks {
            self.state.connect_block(block);
        }

        let tip_id = self.state.tip_id();
        log::info!("Continuing initial sync from {}", tip_id);
        self.peer_manager.send_to(
            &from,
            Message::GetBlock {
                from_block_id: tip_id,
            },
        );
    }

    fn save(&self) {
        if let Err(e) = self.state.save_to_disk() {
            log::error!("Failed to save chain: {}", e);
        }
    }
}

/// The main P2P node
pub struct Node {
    handler: MessageHandler,
    node_type: NodeType,
    message_tx: mpsc::Sender<(SocketAddr, Message)>,
    message_rx: Mutex<Option<mpsc::Receiver<(SocketAddr, Message)>>>,
}

impl Node {
    /// Create a node around a chain core whose outgoing messages go through
    /// `peer_manager`
    pub fn new(state: Arc<NodeState>, peer_manager: Arc<PeerManager>, node_type: NodeType) -> Self {
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        Self {
            handler: MessageHandler::new(state, peer_manager, Arc::new(MsgCache::default())),
            node_type,
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
        }
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.handler.state
    }

    pub fn peer_manager(&self) -> &Arc<PeerManager> {
        &self.handler.peer_manager
    }

    pub fn msg_cache(&self) -> &Arc<MsgCache> {
        &self.handler.msg_cache
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn status(&self) -> NodeStatus {
        let state = self.state();
        NodeStatus {
            height: state.current_height(),
            tip: state.tip_id(),
            chain_work: state.chain_work(),
            peers: self.peer_manager().peer_count(),
            miners: self.peer_manager().miners().len(),
            mempool_size: state.mempool().lock().len(),
        }
    }

    /// Bind the listener and accept connections in the background. Returns
    /// the bound port.
    pub async fn listen(&self, port: u16) -> Result<u16, std::io::Error> {
        let server = Server::bind(port).await?;
        let bound = server.port();

        let peer_manager = self.peer_manager().clone();
        let message_tx = self.message_tx.clone();
        let node_type = self.node_type;
        tokio::spawn(async move {
            loop {
                match server.accept().await {
                    Ok((stream, addr)) => {
                        log::info!("Incoming connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            log::debug!("Failed to set nodelay for {}: {}", addr, e);
                        }
                        let pm = peer_manager.clone();
                        let tx = message_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, pm, node_type, tx, false).await {
                                log::warn!("Connection error with {}: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                    }
                }
            }
        });

        Ok(bound)
    }

    /// Connect to a peer
    pub async fn connect_to(&self, addr: &str) -> Result<SocketAddr, PeerError> {
        spawn_outbound(
            addr,
            self.peer_manager().clone(),
            self.node_type,
            self.message_tx.clone(),
        )
        .await
    }

    /// Try every bootstrap peer except ourselves; returns how many connected
    pub async fn connect_bootstrap(&self, peers: &[String], own_port: u16) -> usize {
        let own = format!("127.0.0.1:{}", own_port);
        let mut connected = 0;
        for peer in peers.iter().filter(|peer| **peer != own) {
            match self.connect_to(peer).await {
                Ok(_) => connected += 1,
                Err(e) => log::debug!("Bootstrap peer {} unavailable: {}", peer, e),
            }
        }
        log::info!("Connected to {} of {} bootstrap peers", connected, peers.len());
        connected
    }

    /// Wait until some peer has announced the miner role
    pub async fn wait_for_miner(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.peer_manager().miners().is_empty() {
            if start.elapsed() >= timeout {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(16)).await;
        }
        true
    }

    /// Dispatch incoming messages until every connection is gone and the
    /// node is dropped. Only the first call runs; later calls return at once.
    pub async fn run(&self) {
        let Some(mut message_rx) = self.message_rx.lock().take() else {
            log::error!("Message loop already running");
            return;
        };

        while let Some((from, msg)) = message_rx.recv().await {
            if let Message::PeerAdd { hostname, port } = msg {
                let addr = format!("{}:{}", hostname, port);
                let peer_manager = self.peer_manager().clone();
                let message_tx = self.message_tx.clone();
                let node_type = self.node_type;
                tokio::spawn(async move {
                    if let Err(e) = spawn_outbound(&addr, peer_manager, node_type, message_tx).await {
                        log::warn!("Failed to add peer {}: {}", addr, e);
                    }
                });
                continue;
            }

            let handler = self.handler.clone();
            tokio::task::spawn_blocking(move || handler.handle(from, msg));
        }
    }
}

/// Open an outbound connection and run it in the background
async fn spawn_outbound(
    addr: &str,
    peer_manager: Arc<PeerManager>,
    node_type: NodeType,
    message_tx: mpsc::Sender<(SocketAddr, Message)>,
) -> Result<SocketAddr, PeerError> {
    log::info!("Connecting to peer: {}", addr);
    let (stream, peer_addr) = connect_to_peer(addr).await?;
    if peer_manager.is_connected(&peer_addr) {
        return Ok(peer_addr);
    }

    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, peer_addr, peer_manager, node_type, message_tx, true).await {
            log::warn!("Connection error with {}: {}", peer_addr, e);
        }
    });
    Ok(peer_addr)
}
