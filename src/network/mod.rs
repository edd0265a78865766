//! P2P Networking module
//!
//! Connects the chain core to other nodes.
//!
//! # Features
//! - TCP peer connections with checksummed message framing
//! - Block and transaction relay to miner peers
//! - Initial block download in fixed-size chunks
//! - Remote chain, mempool and UTXO queries for wallets

pub mod message;
pub mod msg_cache;
pub mod node;
pub mod peer;
pub mod server;

pub use message::{Message, MessageError, NodeType, Opcode, CHUNK_SIZE, MAGIC, MAX_MESSAGE_SIZE};
pub use msg_cache::{MsgCache, MAX_MSG_AWAIT_TIME_IN_SECS};
pub use node::{MessageHandler, Node, NodeStatus};
pub use peer::{NoPeers, PeerError, PeerHandle, PeerInfo, PeerManager, PeerSender, MAX_PEERS};
pub use server::{connect_to_peer, handle_connection, MessageCodec, Server};
