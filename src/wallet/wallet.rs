//! Wallet implementation for the chain
//!
//! Provides key management, coin selection and transaction creation. A
//! wallet works either against the local node state (miners) or through
//! remote queries to a miner peer (wallet clients); [`WalletBackend`] hides
//! which one is in use. Keys come from a single key file or from an
//! [`HdKeyChain`].

use crate::core::codec::{decode_exact, encode_to_vec, CodecError};
use crate::core::params::{DUST_THRESHOLD, SEQUENCE_RBF};
use crate::core::validation::build_spend_msg;
use crate::core::{Block, NodeState, OutPoint, Transaction, TxIn, TxOut, UnspentTxOut};
use crate::crypto::{KeyError, KeyPair};
use crate::mining::MempoolError;
use crate::network::{Message, MsgCache, PeerSender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::hd::{HdError, HdKeyChain};

/// Size assumed for fee estimation before the transaction exists
pub const TX_SIZE_ESTIMATE: u64 = 300;

/// Size of a change output, used to price "no change" selections
pub const CHANGE_OUTPUT_SIZE: u64 = 34;

pub const BNB_MAX_TRIES: u32 = 100_000;

/// Wallet-related errors
#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("No coins found")]
    NoCoins,
    #[error("No answer from the network")]
    NoConnection,
    #[error("Transaction {0} not found")]
    NotFound(String),
    #[error("Transaction {0} does not signal RBF")]
    NotReplaceable(String),
    #[error("Cannot find UTXO for input {0}")]
    UnknownInput(OutPoint),
    #[error("Invalid key file {0}")]
    InvalidKeyFile(PathBuf),
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] MempoolError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Corrupt sent-transaction file: {0}")]
    Codec(#[from] CodecError),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] KeyError),
    #[error("HD wallet error: {0}")]
    Hd(#[from] HdError),
    #[error("No key for address {0}")]
    NoKeyFor(String),
}

/// Where a transaction currently is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Mempool,
    Mined { block_id: String, height: usize },
    NotFound,
}

/// The chain data a wallet needs.
///
/// `None` from a query means the answer could not be obtained.
pub trait WalletBackend {
    /// Every unspent output of the active chain
    fn utxos(&self) -> Option<Vec<UnspentTxOut>>;

    fn mempool_tx_ids(&self) -> Option<Vec<String>>;

    fn active_chain(&self) -> Option<Vec<Block>>;

    /// Output created by a pooled transaction, if the backend sees the pool
    fn mempool_utxo(&self, _outpoint: &OutPoint) -> Option<UnspentTxOut> {
        None
    }

    /// A pooled transaction, if the backend sees the pool
    fn pooled_transaction(&self, _tx_id: &str) -> Option<Transaction> {
        None
    }

    /// Hand a transaction to the network
    fn submit(&self, tx: Transaction) -> Result<(), WalletError>;
}

/// Backend for a miner's own wallet: reads the node state directly
pub struct LocalBackend {
    state: Arc<NodeState>,
}

impl LocalBackend {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }
}

impl WalletBackend for LocalBackend {
    fn utxos(&self) -> Option<Vec<UnspentTxOut>> {
        Some(
            self.state
                .utxo_set()
                .read()
                .iter()
                .map(|(_, utxo)| utxo.clone())
                .collect(),
        )
    }

    fn mempool_tx_ids(&self) -> Option<Vec<String>> {
        Some(self.state.mempool().lock().transaction_ids())
    }

    fn active_chain(&self) -> Option<Vec<Block>> {
        Some(self.state.chain().read().active_chain().to_vec())
    }

    fn mempool_utxo(&self, outpoint: &OutPoint) -> Option<UnspentTxOut> {
        self.state.mempool().lock().find_utxo_in_mempool(outpoint)
    }

    fn pooled_transaction(&self, tx_id: &str) -> Option<Transaction> {
        self.state.mempool().lock().get_transaction(tx_id).cloned()
    }

    fn submit(&self, tx: Transaction) -> Result<(), WalletError> {
        // Pooling relays the transaction to the miner peers
        self.state.add_tx_to_mempool(tx)?;
        Ok(())
    }
}

/// Backend for a wallet client: asks a random miner peer
pub struct RemoteBackend {
    cache: Arc<MsgCache>,
    peers: Arc<dyn PeerSender>,
}

impl RemoteBackend {
    pub fn new(cache: Arc<MsgCache>, peers: Arc<dyn PeerSender>) -> Self {
        Self { cache, peers }
    }
}

impl WalletBackend for RemoteBackend {
    fn utxos(&self) -> Option<Vec<UnspentTxOut>> {
        self.cache.request_utxos(self.peers.as_ref())
    }

    fn mempool_tx_ids(&self) -> Option<Vec<String>> {
        self.cache.request_mempool(self.peers.as_ref())
    }

    fn active_chain(&self) -> Option<Vec<Block>> {
        self.cache.request_active_chain(self.peers.as_ref())
    }

    fn submit(&self, tx: Transaction) -> Result<(), WalletError> {
        if self.peers.send_to_random(Message::TxInfo(tx)) {
            Ok(())
        } else {
            log::error!("No connection to send transaction");
            Err(WalletError::NoConnection)
        }
    }
}

/// Pick the subset of `utxos` whose total exceeds `target` by the least,
/// searching depth-first over the coins sorted by value. Returns nothing when
/// the best excess is above `cost_of_change` (a change output is cheaper).
pub fn branch_and_bound_select(utxos: &[UnspentTxOut], target: u64, cost_of_change: u64) -> Vec<UnspentTxOut> {
    let mut sorted = utxos.to_vec();
    sorted.sort_by(|a, b| b.value().cmp(&a.value()));
    let n = sorted.len();
    if n == 0 {
        return Vec::new();
    }

    // suffix[i] = total value of sorted[i..]
    let mut suffix = vec![0u64; n + 1];
    for i in (0..n).rev() {
        suffix[i] = suffix[i + 1].saturating_add(sorted[i].value());
    }
    let reachable = |depth: usize, current: u64| depth + 1 < n && current + suffix[depth + 1] >= target;

    let mut current = 0u64;
    let mut inclusion = vec![false; n];
    let mut best: Option<(u64, Vec<bool>)> = None;
    let mut depth = 0usize;
    let mut backtrack = false;

    for _ in 0..BNB_MAX_TRIES {
        if !backtrack {
            inclusion[depth] = true;
            current += sorted[depth].value();

            if current >= target {
                let waste = current - target;
                if best.as_ref().map_or(true, |(best_waste, _)| waste < *best_waste) {
                    best = Some((waste, inclusion.clone()));
                }
                if waste == 0 {
                    break;
                }
                backtrack = true;
            } else if reachable(depth, current) {
                depth += 1;
                continue;
            } else {
                backtrack = true;
            }
        }

        // Try the branch without the coin at `depth`
        if inclusion[depth] {
            current -= sorted[depth].value();
            inclusion[depth] = false;
        }
        if reachable(depth, current) {
            depth += 1;
            backtrack = false;
            continue;
        }

        // Walk up to the last included coin and exclude it instead
        while depth > 0 {
            depth -= 1;
            if inclusion[depth] {
                current -= sorted[depth].value();
                inclusion[depth] = false;
                if reachable(depth, current) {
                    depth += 1;
                    backtrack = false;
                    break;
                }
            }
        }
        if backtrack {
            break;
        }
    }

    match best {
        Some((waste, selection)) if waste <= cost_of_change => sorted
            .into_iter()
            .zip(selection)
            .filter_map(|(utxo, included)| included.then_some(utxo))
            .collect(),
        _ => Vec::new(),
    }
}

/// HD key chain plus the file it is saved to after each new address
struct HdKeys {
    chain: Mutex<HdKeyChain>,
    path: Option<PathBuf>,
}

/// Add a change output for `amount` unless it would be dust, in which case
/// the amount is left to the miner as fee
fn push_change(
    outputs: &mut Vec<TxOut>,
    amount: u64,
    address: impl FnOnce() -> Result<String, WalletError>,
) -> Result<(), WalletError> {
    if amount >= DUST_THRESHOLD {
        outputs.push(TxOut::new(amount, address()?));
    } else if amount > 0 {
        log::debug!("Folding {} coins of dust change into the fee", amount);
    }
    Ok(())
}

/// A wallet backed by one key or by an HD key chain
pub struct Wallet {
    /// Single key, or the HD chain's `m/44'/0'/0'/0/0`
    key_pair: KeyPair,
    hd: Option<HdKeys>,
    /// Transactions this wallet sent, kept for fee bumping
    sent_path: Option<PathBuf>,
}

fn sent_path_for(path: &Path) -> PathBuf {
    let mut sent = path.as_os_str().to_owned();
    sent.push(".sent");
    PathBuf::from(sent)
}

impl Wallet {
    /// Create a wallet around an existing key pair (not persisted)
    pub fn from_key_pair(key_pair: KeyPair) -> Self {
        Self {
            key_pair,
            hd: None,
            sent_path: None,
        }
    }

    /// Create a wallet around an HD key chain (not persisted)
    pub fn from_hd_chain(chain: HdKeyChain) -> Self {
        Self {
            key_pair: chain.primary().clone(),
            hd: Some(HdKeys {
                chain: Mutex::new(chain),
                path: None,
            }),
            sent_path: None,
        }
    }

    /// Load the HD wallet at `path`, generating and saving a fresh seed if
    /// the file does not exist
    pub fn load_or_create_hd(path: &Path) -> Result<Self, WalletError> {
        let chain = if path.exists() {
            HdKeyChain::load(path)?
        } else {
            log::info!("Generating new HD wallet {}", path.display());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let chain = HdKeyChain::generate()?;
            chain.save(path)?;
            chain
        };

        let mut wallet = Self::from_hd_chain(chain);
        if let Some(hd) = wallet.hd.as_mut() {
            hd.path = Some(path.to_path_buf());
        }
        wallet.sent_path = Some(sent_path_for(path));
        log::info!("HD wallet {} primary address {}", path.display(), wallet.address());
        Ok(wallet)
    }

    /// Load the raw 32-byte private key at `path`, generating and saving a
    /// fresh one if the file does not exist
    pub fn load_or_create(path: &Path) -> Result<Self, WalletError> {
        let key_pair = if path.exists() {
            let bytes = fs::read(path)?;
            if bytes.len() != 32 {
                return Err(WalletError::InvalidKeyFile(path.to_path_buf()));
            }
            KeyPair::from_secret_bytes(&bytes)?
        } else {
            log::info!("Generating new wallet {}", path.display());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let key_pair = KeyPair::generate();
            fs::write(path, key_pair.secret_bytes())?;
            key_pair
        };

        let wallet = Self {
            key_pair,
            hd: None,
            sent_path: Some(sent_path_for(path)),
        };
        log::info!("Wallet {} belongs to address {}", path.display(), wallet.address());
        Ok(wallet)
    }

    /// Get the wallet's primary address
    pub fn address(&self) -> String {
        self.key_pair.address()
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn is_hd(&self) -> bool {
        self.hd.is_some()
    }

    /// Advance one of the HD cursors and persist the new position
    fn next_hd_address(&self, change: bool) -> Result<Option<String>, WalletError> {
        let Some(hd) = &self.hd else {
            return Ok(None);
        };
        let mut chain = hd.chain.lock();
        let address = if change {
            chain.change_address()?
        } else {
            chain.new_address()?
        };
        if let Some(path) = &hd.path {
            chain.save(path)?;
        }
        Ok(Some(address))
    }

    /// A fresh receiving address (the primary one for single-key wallets)
    pub fn new_address(&self) -> Result<String, WalletError> {
        Ok(self.next_hd_address(false)?.unwrap_or_else(|| self.address()))
    }

    /// A fresh change address (the primary one for single-key wallets)
    pub fn change_address(&self) -> Result<String, WalletError> {
        Ok(self.next_hd_address(true)?.unwrap_or_else(|| self.address()))
    }

    /// Every address this wallet recognizes as its own
    pub fn addresses(&self) -> Vec<String> {
        match &self.hd {
            Some(hd) => hd.chain.lock().addresses(),
            None => vec![self.address()],
        }
    }

    pub fn owns(&self, address: &str) -> bool {
        match &self.hd {
            Some(hd) => hd.chain.lock().owns(address),
            None => self.key_pair.address() == address,
        }
    }

    /// Confirmed outputs paying this wallet
    pub fn utxos(&self, backend: &dyn WalletBackend) -> Result<Vec<UnspentTxOut>, WalletError> {
        let utxos = backend.utxos().ok_or(WalletError::NoConnection)?;
        let Some(hd) = &self.hd else {
            let address = self.address();
            return Ok(utxos
                .into_iter()
                .filter(|utxo| utxo.tx_out.is_owned_by(&address))
                .collect());
        };
        let chain = hd.chain.lock();
        Ok(utxos
            .into_iter()
            .filter(|utxo| chain.owns(&utxo.tx_out.to_address))
            .collect())
    }

    pub fn balance(&self, backend: &dyn WalletBackend) -> Result<u64, WalletError> {
        Ok(self
            .utxos(backend)?
            .iter()
            .map(UnspentTxOut::value)
            .fold(0u64, u64::saturating_add))
    }

    /// Key that unlocks outputs paying `address`. A single-key wallet
    /// always answers with its one key.
    fn signing_key(&self, address: &str) -> Result<KeyPair, WalletError> {
        match &self.hd {
            Some(hd) => hd
                .chain
                .lock()
                .key_for(address)
                .cloned()
                .ok_or_else(|| WalletError::NoKeyFor(address.to_string())),
            None => Ok(self.key_pair.clone()),
        }
    }

    fn sign_input(&self, utxo: &UnspentTxOut, outputs: &[TxOut]) -> Result<TxIn, WalletError> {
        let key = self.signing_key(&utxo.tx_out.to_address)?;
        let pub_key = key.public_key_bytes();
        let msg = build_spend_msg(&utxo.outpoint, &pub_key, SEQUENCE_RBF, outputs);
        let sig = key.sign(&msg)?;
        Ok(TxIn::new(Some(utxo.outpoint.clone()), sig, pub_key, SEQUENCE_RBF))
    }

    /// Build a payment of `value` to `to` from `utxos`, paying
    /// `fee_per_byte` on an estimated size. Inputs opt in to replacement.
    pub fn build_tx_from_utxos(
        &self,
        utxos: &[UnspentTxOut],
        value: u64,
        fee_per_byte: u64,
        to: &str,
        lock_time: i64,
    ) -> Result<Transaction, WalletError> {
        let fee_estimate = TX_SIZE_ESTIMATE * fee_per_byte;
        let target = value.saturating_add(fee_estimate);
        let cost_of_change = CHANGE_OUTPUT_SIZE * fee_per_byte;

        let mut selected = branch_and_bound_select(utxos, target, cost_of_change);
        let exact_match = !selected.is_empty();

        if !exact_match {
            let mut sorted = utxos.to_vec();
            sorted.sort_by(|a, b| b.value().cmp(&a.value()));
            let mut in_sum = 0u64;
            for utxo in sorted {
                in_sum = in_sum.saturating_add(utxo.value());
                selected.push(utxo);
                if in_sum > target {
                    break;
                }
            }
            if in_sum <= target {
                return Err(WalletError::InsufficientFunds {
                    have: in_sum,
                    need: target,
                });
            }
        }

        let in_sum = selected.iter().map(UnspentTxOut::value).fold(0u64, u64::saturating_add);
        let mut outputs = vec![TxOut::new(value, to)];
        if !exact_match {
            push_change(&mut outputs, in_sum - target, || self.change_address())?;
        }

        let inputs = selected
            .iter()
            .map(|utxo| self.sign_input(utxo, &outputs))
            .collect::<Result<Vec<_>, _>>()?;

        let tx = Transaction::new(inputs, outputs, lock_time);
        log::info!(
            "Built transaction {} with {} total fee ({} coins/byte)",
            tx.id(),
            tx.serialized_size() as u64 * fee_per_byte,
            fee_per_byte
        );
        Ok(tx)
    }

    pub fn build_tx(
        &self,
        backend: &dyn WalletBackend,
        value: u64,
        fee_per_byte: u64,
        to: &str,
        lock_time: i64,
    ) -> Result<Transaction, WalletError> {
        let coins = self.utxos(backend)?;
        if coins.is_empty() {
            return Err(WalletError::NoCoins);
        }
        self.build_tx_from_utxos(&coins, value, fee_per_byte, to, lock_time)
    }

    /// Build, submit and remember a payment
    pub fn send(
        &self,
        backend: &dyn WalletBackend,
        value: u64,
        fee_per_byte: u64,
        to: &str,
        lock_time: i64,
    ) -> Result<Transaction, WalletError> {
        let tx = self.build_tx(backend, value, fee_per_byte, to, lock_time)?;
        log::info!("Built transaction {}, submitting", tx.id());
        backend.submit(tx.clone())?;
        self.record_sent(&tx)?;
        Ok(tx)
    }

    /// Re-sign `original` at `new_fee_per_byte`: payment outputs stay, the
    /// change output (a trailing output back to this wallet) absorbs the fee
    /// difference
    pub fn build_rbf_replacement(
        &self,
        original: &Transaction,
        new_fee_per_byte: u64,
        backend: &dyn WalletBackend,
    ) -> Result<Transaction, WalletError> {
        let confirmed: HashMap<OutPoint, UnspentTxOut> = backend
            .utxos()
            .ok_or(WalletError::NoConnection)?
            .into_iter()
            .map(|utxo| (utxo.outpoint.clone(), utxo))
            .collect();

        let mut spent = Vec::with_capacity(original.inputs().len());
        for outpoint in original.inputs().iter().filter_map(|tx_in| tx_in.to_spend.as_ref()) {
            let utxo = confirmed
                .get(outpoint)
                .cloned()
                .or_else(|| backend.mempool_utxo(outpoint))
                .ok_or_else(|| WalletError::UnknownInput(outpoint.clone()))?;
            spent.push(utxo);
        }
        let total_input = spent.iter().map(UnspentTxOut::value).fold(0u64, u64::saturating_add);

        let (change, payments) = match original.outputs().split_last() {
            Some((last, rest)) if !rest.is_empty() && self.owns(&last.to_address) => (Some(last), rest),
            Some(_) => (None, original.outputs()),
            None => return Err(WalletError::NotFound(original.id().to_string())),
        };
        let payment_total = payments.iter().map(|out| out.value).fold(0u64, u64::saturating_add);
        let new_total_fee = original.serialized_size() as u64 * new_fee_per_byte;
        let need = payment_total.saturating_add(new_total_fee);
        if total_input < need {
            return Err(WalletError::InsufficientFunds {
                have: total_input,
                need,
            });
        }

        let mut outputs = payments.to_vec();
        push_change(&mut outputs, total_input - need, || match change {
            Some(change) => Ok(change.to_address.clone()),
            None => self.change_address(),
        })?;

        let inputs = spent
            .iter()
            .map(|utxo| self.sign_input(utxo, &outputs))
            .collect::<Result<Vec<_>, _>>()?;

        let replacement = Transaction::new(inputs, outputs, original.lock_time());
        log::info!(
            "Built RBF replacement {} with {} total fee ({} coins/byte)",
            replacement.id(),
            new_total_fee,
            new_fee_per_byte
        );
        Ok(replacement)
    }

    /// Bump the fee of a pooled transaction this wallet sent
    pub fn rbf(
        &self,
        backend: &dyn WalletBackend,
        tx_id: &str,
        new_fee_per_byte: u64,
    ) -> Result<Transaction, WalletError> {
        let pooled = backend.mempool_tx_ids().ok_or(WalletError::NoConnection)?;
        if !pooled.iter().any(|id| id == tx_id) {
            return Err(WalletError::NotFound(tx_id.to_string()));
        }

        let original = match backend.pooled_transaction(tx_id) {
            Some(tx) => tx,
            None => self
                .sent_tx(tx_id)?
                .ok_or_else(|| WalletError::NotFound(tx_id.to_string()))?,
        };
        if !original.signals_rbf() {
            return Err(WalletError::NotReplaceable(tx_id.to_string()));
        }

        let replacement = self.build_rbf_replacement(&original, new_fee_per_byte, backend)?;
        backend.submit(replacement.clone())?;
        self.record_sent(&replacement)?;
        Ok(replacement)
    }

    pub fn tx_status(&self, backend: &dyn WalletBackend, tx_id: &str) -> Result<TxStatus, WalletError> {
        let pooled = backend.mempool_tx_ids().ok_or(WalletError::NoConnection)?;
        if pooled.iter().any(|id| id == tx_id) {
            return Ok(TxStatus::Mempool);
        }

        let chain = backend.active_chain().ok_or(WalletError::NoConnection)?;
        for (height, block) in chain.iter().enumerate() {
            if block.txs().iter().any(|tx| tx.id() == tx_id) {
                return Ok(TxStatus::Mined {
                    block_id: block.id().to_string(),
                    height,
                });
            }
        }
        Ok(TxStatus::NotFound)
    }

    fn load_sent(&self) -> Result<Vec<Transaction>, WalletError> {
        match &self.sent_path {
            Some(path) if path.exists() => Ok(decode_exact(&fs::read(path)?)?),
            _ => Ok(Vec::new()),
        }
    }

    fn record_sent(&self, tx: &Transaction) -> Result<(), WalletError> {
        let Some(path) = &self.sent_path else {
            return Ok(());
        };
        let mut sent = self.load_sent()?;
        sent.push(tx.clone());
        fs::write(path, encode_to_vec(&sent))?;
        Ok(())
    }

    /// A transaction this wallet sent earlier
    pub fn sent_tx(&self, tx_id: &str) -> Result<Option<Transaction>, WalletError> {
        Ok(self.load_sent()?.into_iter().find(|tx| tx.id() == tx_id))
    }
}
