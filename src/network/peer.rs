//! Peer management for P2P networking
//!
//! Tracks connected peers and routes outgoing messages to their writer
//! tasks. Sending never blocks: messages go through each connection's
//! bounded channel with `try_send`, so the synchronous chain code can relay
//! blocks and transactions while holding no async context.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::network::message::{Message, NodeType};

/// Maximum number of connected peers
pub const MAX_PEERS: usize = 16;

/// Capacity of each connection's outgoing queue
pub const PEER_QUEUE_CAPACITY: usize = 100;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Outgoing queue full")]
    QueueFull,
    #[error("Max peers reached")]
    MaxPeersReached,
}

/// Outward interface the chain core uses to reach the network.
/// Delivery is best effort: failures are logged, never returned as errors.
pub trait PeerSender: Send + Sync {
    /// Send to every miner peer
    fn broadcast(&self, msg: Message);

    /// Send to one random miner peer; false when there is none
    fn send_to_random(&self, msg: Message) -> bool;

    /// Send to a specific peer; false when it is gone
    fn send_to(&self, addr: &SocketAddr, msg: Message) -> bool;
}

/// A sender for nodes without networking (tests, offline tools)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeers;

impl PeerSender for NoPeers {
    fn broadcast(&self, _msg: Message) {}

    fn send_to_random(&self, _msg: Message) -> bool {
        false
    }

    fn send_to(&self, _addr: &SocketAddr, _msg: Message) -> bool {
        false
    }
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// Announced through `PeerHello`; `None` until the hello arrives
    pub node_type: Option<NodeType>,
    /// Whether this is an outbound connection
    pub outbound: bool,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, outbound: bool) -> Self {
        Self {
            addr,
            node_type: None,
            outbound,
        }
    }

    pub fn is_miner(&self) -> bool {
        self.node_type
            .map(|node_type| node_type.contains(NodeType::MINER))
            .unwrap_or(false)
    }
}

/// Handle for sending messages to a peer
#[derive(Clone, Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    pub fn try_send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PeerError::Disconnected,
        })
    }
}

/// Manages all peer connections
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
    handles: RwLock<HashMap<SocketAddr, PeerHandle>>,
    listen_port: u16,
}

impl PeerManager {
    pub fn new(listen_port: u16) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            handles: RwLock::new(HashMap::new()),
            listen_port,
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Add a new peer
    pub fn add_peer(&self, handle: PeerHandle, outbound: bool) -> Result<(), PeerError> {
        let addr = handle.addr;
        let mut peers = self.peers.write();
        if peers.len() >= MAX_PEERS {
            return Err(PeerError::MaxPeersReached);
        }
        peers.insert(addr, PeerInfo::new(addr, outbound));
        self.handles.write().insert(addr, handle);

        log::info!("Added peer: {} (outbound: {})", addr, outbound);
        Ok(())
    }

    /// Remove a peer
    pub fn remove_peer(&self, addr: &SocketAddr) {
        self.peers.write().remove(addr);
        self.handles.write().remove(addr);
        log::info!("Removed peer: {}", addr);
    }

    /// Record the role a peer announced in its hello
    pub fn set_node_type(&self, addr: &SocketAddr, node_type: NodeType) {
        if let Some(peer) = self.peers.write().get_mut(addr) {
            peer.node_type = Some(node_type);
            log::info!("Peer {} announced itself as {:?}", addr, node_type);
        }
    }

    pub fn is_connected(&self, addr: &SocketAddr) -> bool {
        self.peers.read().contains_key(addr)
    }

    /// Get all connected peer addresses
    pub fn get_peers(&self) -> Vec<SocketAddr> {
        self.peers.read().keys().cloned().collect()
    }

    pub fn get_peer_info(&self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.peers.read().get(addr).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// Peers that announced the miner role
    pub fn miners(&self) -> Vec<SocketAddr> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_miner())
            .map(|peer| peer.addr)
            .collect()
    }

    fn send_logged(&self, addr: &SocketAddr, msg: Message) -> bool {
        let handle = self.handles.read().get(addr).cloned();
        let Some(handle) = handle else {
            log::debug!("No connection to {} for {}", addr, msg.type_name());
            return false;
        };
        let type_name = msg.type_name();
        match handle.try_send(msg) {
            Ok(()) => {
                log::trace!("Queued {} for {}", type_name, addr);
                true
            }
            Err(e) => {
                log::warn!("Failed to send {} to {}: {}", type_name, addr, e);
                false
            }
        }
    }
}

impl PeerSender for PeerManager {
    fn broadcast(&self, msg: Message) {
        for addr in self.miners() {
            self.send_logged(&addr, msg.clone());
        }
    }

    fn send_to_random(&self, msg: Message) -> bool {
        let miners = self.miners();
        match miners.choose(&mut rand::thread_rng()) {
            Some(addr) => self.send_logged(addr, msg),
            None => false,
        }
    }

    fn send_to(&self, addr: &SocketAddr, msg: Message) -> bool {
        self.send_logged(addr, msg)
    }
}
