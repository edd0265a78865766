//! Network message types for P2P communication
//!
//! Every message is one of twelve opcodes. Payloads use the binary codec;
//! framing (magic, length, checksum) lives in the server's `MessageCodec`.

use bitflags::bitflags;
use thiserror::Error;

use crate::core::codec::{BinaryBuffer, CodecError};
use crate::core::{Block, OutPoint, Transaction, UnspentTxOut};

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0xF9, 0xBE, 0xB4, 0xD9];

/// Upper bound on a payload; an `Inv` of a full chunk of maximum-size blocks fits
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Number of blocks served per `GetBlock` request
pub const CHUNK_SIZE: usize = 50;

bitflags! {
    /// Roles a node announces in `PeerHello`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeType: u8 {
        const MINER = 1;
        const WALLET = 2;
    }
}

/// Message decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),
    #[error("Malformed payload: {0}")]
    Codec(#[from] CodecError),
}

/// Wire opcodes, in protocol order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    BlockInfo = 0,
    GetActiveChain = 1,
    GetBlock = 2,
    GetMempool = 3,
    GetUtxos = 4,
    Inv = 5,
    PeerAdd = 6,
    PeerHello = 7,
    SendActiveChain = 8,
    SendMempool = 9,
    SendUtxos = 10,
    TxInfo = 11,
}

impl TryFrom<u8> for Opcode {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Opcode::BlockInfo,
            1 => Opcode::GetActiveChain,
            2 => Opcode::GetBlock,
            3 => Opcode::GetMempool,
            4 => Opcode::GetUtxos,
            5 => Opcode::Inv,
            6 => Opcode::PeerAdd,
            7 => Opcode::PeerHello,
            8 => Opcode::SendActiveChain,
            9 => Opcode::SendMempool,
            10 => Opcode::SendUtxos,
            11 => Opcode::TxInfo,
            other => return Err(MessageError::UnknownOpcode(other)),
        })
    }
}

/// Network message types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Relay of a single block
    BlockInfo(Block),
    GetActiveChain,
    /// Ask for the blocks following `from_block_id`
    GetBlock { from_block_id: String },
    GetMempool,
    GetUtxos,
    /// Answer to `GetBlock`
    Inv(Vec<Block>),
    /// Ask the receiver to connect to another peer
    PeerAdd { hostname: String, port: u16 },
    PeerHello { node_type: NodeType },
    SendActiveChain(Vec<Block>),
    /// Ids of the pooled transactions
    SendMempool(Vec<String>),
    SendUtxos(Vec<UnspentTxOut>),
    /// Relay of a single transaction
    TxInfo(Transaction),
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::BlockInfo(_) => Opcode::BlockInfo,
            Message::GetActiveChain => Opcode::GetActiveChain,
            Message::GetBlock { .. } => Opcode::GetBlock,
            Message::GetMempool => Opcode::GetMempool,
            Message::GetUtxos => Opcode::GetUtxos,
            Message::Inv(_) => Opcode::Inv,
            Message::PeerAdd { .. } => Opcode::PeerAdd,
            Message::PeerHello { .. } => Opcode::PeerHello,
            Message::SendActiveChain(_) => Opcode::SendActiveChain,
            Message::SendMempool(_) => Opcode::SendMempool,
            Message::SendUtxos(_) => Opcode::SendUtxos,
            Message::TxInfo(_) => Opcode::TxInfo,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self.opcode() {
            Opcode::BlockInfo => "BlockInfo",
            Opcode::GetActiveChain => "GetActiveChain",
            Opcode::GetBlock => "GetBlock",
            Opcode::GetMempool => "GetMempool",
            Opcode::GetUtxos => "GetUTXOs",
            Opcode::Inv => "Inv",
            Opcode::PeerAdd => "PeerAdd",
            Opcode::PeerHello => "PeerHello",
            Opcode::SendActiveChain => "SendActiveChain",
            Opcode::SendMempool => "SendMempool",
            Opcode::SendUtxos => "SendUTXOs",
            Opcode::TxInfo => "TxInfo",
        }
    }

    /// Serialize the payload (without the envelope)
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = BinaryBuffer::new();
        match self {
            Message::BlockInfo(block) => buf.write(block),
            Message::GetBlock { from_block_id } => buf.write(from_block_id),
            Message::Inv(blocks) | Message::SendActiveChain(blocks) => buf.write(blocks),
            Message::PeerAdd { hostname, port } => {
                buf.write(hostname);
                buf.write(port);
            }
            Message::PeerHello { node_type } => buf.write(&node_type.bits()),
            Message::SendMempool(tx_ids) => buf.write(tx_ids),
            Message::SendUtxos(utxos) => {
                buf.write_size(utxos.len());
                for utxo in utxos {
                    buf.write(&utxo.outpoint);
                    buf.write(utxo);
                }
            }
            Message::TxInfo(tx) => buf.write(tx),
            Message::GetActiveChain | Message::GetMempool | Message::GetUtxos => {}
        }
        buf.into_bytes()
    }

    /// Parse a payload for `opcode`; trailing bytes are an error
    pub fn decode(opcode: u8, payload: &[u8]) -> Result<Self, MessageError> {
        let opcode = Opcode::try_from(opcode)?;
        let mut buf = BinaryBuffer::from_bytes(payload.to_vec());
        let msg = match opcode {
            Opcode::BlockInfo => Message::BlockInfo(buf.read()?),
            Opcode::GetActiveChain => Message::GetActiveChain,
            Opcode::GetBlock => Message::GetBlock {
                from_block_id: buf.read()?,
            },
            Opcode::GetMempool => Message::GetMempool,
            Opcode::GetUtxos => Message::GetUtxos,
            Opcode::Inv => Message::Inv(buf.read()?),
            Opcode::PeerAdd => Message::PeerAdd {
                hostname: buf.read()?,
                port: buf.read()?,
            },
            Opcode::PeerHello => {
                let bits: u8 = buf.read()?;
                Message::PeerHello {
                    node_type: NodeType::from_bits_truncate(bits),
                }
            }
            Opcode::SendActiveChain => Message::SendActiveChain(buf.read()?),
            Opcode::SendMempool => Message::SendMempool(buf.read()?),
            Opcode::SendUtxos => {
                let count = buf.read_size()?;
                let mut utxos = Vec::with_capacity(count);
                for _ in 0..count {
                    let _outpoint: OutPoint = buf.read()?;
                    utxos.push(buf.read()?);
                }
                Message::SendUtxos(utxos)
            }
            Opcode::TxInfo => Message::TxInfo(buf.read()?),
        };
        if buf.remaining() > 0 {
            return Err(CodecError::TrailingBytes(buf.remaining()).into());
        }
        Ok(msg)
    }
}
