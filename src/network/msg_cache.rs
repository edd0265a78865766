//! Responses to the wallet's remote queries
//!
//! A wallet asks a random miner for its active chain, mempool or UTXO set and
//! blocks until the matching `Send*` message lands here.

use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::{Block, UnspentTxOut};
use crate::network::message::Message;
use crate::network::peer::PeerSender;

pub const MAX_MSG_AWAIT_TIME_IN_SECS: u64 = 60;

const POLL_INTERVAL: Duration = Duration::from_millis(16);

/// Latest `SendActiveChain`, `SendMempool` and `SendUTXOs` payloads
#[derive(Debug)]
pub struct MsgCache {
    active_chain: Mutex<Option<Vec<Block>>>,
    mempool: Mutex<Option<Vec<String>>>,
    utxos: Mutex<Option<Vec<UnspentTxOut>>>,
    max_await: Duration,
}

impl Default for MsgCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(MAX_MSG_AWAIT_TIME_IN_SECS))
    }
}

impl MsgCache {
    pub fn new(max_await: Duration) -> Self {
        Self {
            active_chain: Mutex::new(None),
            mempool: Mutex::new(None),
            utxos: Mutex::new(None),
            max_await,
        }
    }

    /// Keep a response message; returns the message back if it is not one
    pub fn store(&self, msg: Message) -> Result<(), Message> {
        match msg {
            Message::SendActiveChain(blocks) => *self.active_chain.lock() = Some(blocks),
            Message::SendMempool(tx_ids) => *self.mempool.lock() = Some(tx_ids),
            Message::SendUtxos(utxos) => *self.utxos.lock() = Some(utxos),
            other => return Err(other),
        }
        Ok(())
    }

    pub fn request_active_chain(&self, peers: &dyn PeerSender) -> Option<Vec<Block>> {
        self.request(&self.active_chain, peers, Message::GetActiveChain)
    }

    pub fn request_mempool(&self, peers: &dyn PeerSender) -> Option<Vec<String>> {
        self.request(&self.mempool, peers, Message::GetMempool)
    }

    pub fn request_utxos(&self, peers: &dyn PeerSender) -> Option<Vec<UnspentTxOut>> {
        self.request(&self.utxos, peers, Message::GetUtxos)
    }

    /// Clear the slot, ask a random miner, then poll until the answer arrives
    /// or the wait times out
    fn request<T>(&self, slot: &Mutex<Option<T>>, peers: &dyn PeerSender, msg: Message) -> Option<T> {
        *slot.lock() = None;

        let type_name = msg.type_name();
        if !peers.send_to_random(msg) {
            log::error!("No connection to send {}", type_name);
            return None;
        }

        let start = Instant::now();
        loop {
            if let Some(value) = slot.lock().take() {
                return Some(value);
            }
            if start.elapsed() > self.max_await {
                log::error!("Timeout on {}", type_name);
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}
