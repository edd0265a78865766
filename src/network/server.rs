//! TCP server and connection handling
//!
//! Frames messages on the wire and runs one reader and one writer task per
//! peer connection.

use crate::crypto::double_sha256;
use crate::network::message::{Message, NodeType, Opcode, MAGIC, MAX_MESSAGE_SIZE};
use crate::network::peer::{PeerError, PeerHandle, PeerManager, PEER_QUEUE_CAPACITY};
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// magic (4) + payload length (4) + checksum (4) + opcode (1)
pub const HEADER_SIZE: usize = 13;

/// First four bytes of the double SHA-256 of `opcode ‖ payload`
pub fn checksum(opcode: u8, payload: &[u8]) -> [u8; 4] {
    let mut data = Vec::with_capacity(1 + payload.len());
    data.push(opcode);
    data.extend_from_slice(payload);
    let hash = double_sha256(&data);
    [hash[0], hash[1], hash[2], hash[3]]
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Message codec for the `magic ‖ len ‖ checksum ‖ opcode ‖ payload` envelope
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let opcode = item.opcode() as u8;
        let payload = item.encode_payload();
        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(invalid_data(format!(
                "{} payload too large: {} bytes",
                item.type_name(),
                payload.len()
            )));
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u32_le(payload.len() as u32);
        dst.put_slice(&checksum(opcode, &payload));
        dst.put_u8(opcode);
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            // Need at least header
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            if src[..4] != MAGIC {
                return Err(invalid_data("Invalid magic bytes"));
            }

            let len = u32::from_le_bytes([src[4], src[5], src[6], src[7]]) as usize;
            if len > MAX_MESSAGE_SIZE {
                return Err(invalid_data(format!("Message too large: {} bytes", len)));
            }

            let opcode = src[12];
            if Opcode::try_from(opcode).is_err() {
                return Err(invalid_data(format!("Unknown opcode {}", opcode)));
            }

            // Check if we have full message
            if src.len() < HEADER_SIZE + len {
                src.reserve(HEADER_SIZE + len - src.len());
                return Ok(None);
            }

            let expected = [src[8], src[9], src[10], src[11]];
            src.advance(HEADER_SIZE);
            let payload = src.split_to(len);

            if checksum(opcode, &payload) != expected {
                return Err(invalid_data("Checksum mismatch"));
            }

            match Message::decode(opcode, &payload) {
                Ok(msg) => return Ok(Some(msg)),
                // A well-framed message we cannot parse is skipped
                Err(e) => log::warn!("Dropping malformed message (opcode {}): {}", opcode, e),
            }
        }
    }
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    port: u16,
}

impl Server {
    /// Bind to a port and create the server
    pub async fn bind(port: u16) -> Result<Self, io::Error> {
        let addr = format!("0.0.0.0:{}", port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();
        log::info!("Server listening on 0.0.0.0:{}", port);

        Ok(Self { listener, port })
    }

    /// Get the listening port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept incoming connections
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), io::Error> {
        self.listener.accept().await
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    stream.set_nodelay(true)?;

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    Ok((stream, peer_addr))
}

/// Handle a peer connection (both inbound and outbound).
///
/// Registers the peer, sends our `PeerHello`, then forwards every decoded
/// message to `message_tx` until the connection drops.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    peer_manager: Arc<PeerManager>,
    our_node_type: NodeType,
    message_tx: mpsc::Sender<(SocketAddr, Message)>,
    outbound: bool,
) -> Result<(), PeerError> {
    let framed = Framed::new(stream, MessageCodec);
    let (mut writer, mut reader) = framed.split();

    // Create channel for sending to this peer
    let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_CAPACITY);
    let handle = PeerHandle { addr, tx };

    peer_manager.add_peer(handle, outbound)?;

    if let Err(e) = writer
        .send(Message::PeerHello {
            node_type: our_node_type,
        })
        .await
    {
        peer_manager.remove_peer(&addr);
        return Err(PeerError::IoError(e));
    }
    log::debug!("Sent hello to {}", addr);

    // Spawn writer task
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(msg).await {
                log::debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    // Read messages
    loop {
        match reader.next().await {
            Some(Ok(msg)) => {
                log::trace!("Received {} from {}", msg.type_name(), addr);
                if message_tx.send((addr, msg)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                log::warn!("Error reading from {}: {}", addr, e);
                break;
            }
            None => {
                log::info!("Peer {} disconnected", addr);
                break;
            }
        }
    }

    // Cleanup
    write_handle.abort();
    peer_manager.remove_peer(&addr);

    Ok(())
}
