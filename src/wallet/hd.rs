//! Hierarchical deterministic key chain
//!
//! Keys follow the BIP44 layout `m/44'/0'/0'/<chain>/<index>`: chain 0 hands
//! out receiving addresses, chain 1 change addresses. Child derivation is
//! BIP32 as implemented by the `bip32` crate; a 32-byte seed regenerates
//! every key, so the wallet file only stores the seed and the two cursors.

use crate::core::codec::{decode_exact, encode_to_vec, BinaryBuffer, CodecError, Decode, Encode};
use crate::crypto::{KeyError, KeyPair};
use bip32::{ChildNumber, XPrv};
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const BIP44_PURPOSE: u32 = 44;
pub const COIN_TYPE: u32 = 0;
pub const DEFAULT_ACCOUNT: u32 = 0;

/// Addresses derived past each cursor so incoming payments are recognized
pub const LOOKAHEAD: u32 = 20;

pub const SEED_SIZE: usize = 32;

/// HD key chain errors
#[derive(Error, Debug)]
pub enum HdError {
    #[error("Key derivation failed: {0}")]
    Derivation(#[from] bip32::Error),
    #[error("Seed must be 16 to 64 bytes, got {0}")]
    InvalidSeed(usize),
    #[error("Derived key rejected: {0}")]
    Key(#[from] KeyError),
    #[error("Corrupt HD wallet file: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// Second-to-last path level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressChain {
    External = 0,
    Internal = 1,
}

struct CachedKey {
    key_pair: KeyPair,
    chain: AddressChain,
    index: u32,
}

/// On-disk form: the seed and both cursors
struct StoredChain {
    seed: Vec<u8>,
    next_external: u32,
    next_internal: u32,
}

impl Encode for StoredChain {
    fn encode(&self, buf: &mut BinaryBuffer) {
        buf.write_bytes(&self.seed);
        buf.write(&self.next_external);
        buf.write(&self.next_internal);
    }
}

impl Decode for StoredChain {
    fn decode(buf: &mut BinaryBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            seed: buf.read_bytes()?,
            next_external: buf.read()?,
            next_internal: buf.read()?,
        })
    }
}

/// Seed-backed key chain with a receiving and a change branch
pub struct HdKeyChain {
    seed: Vec<u8>,
    account: XPrv,
    next_external: u32,
    next_internal: u32,
    /// Number of keys derived so far on each chain, indexed by `AddressChain`
    derived: [u32; 2],
    keys: HashMap<String, CachedKey>,
    primary: KeyPair,
}

impl HdKeyChain {
    /// Fresh chain from a random seed
    pub fn generate() -> Result<Self, HdError> {
        let mut seed = vec![0u8; SEED_SIZE];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: Vec<u8>) -> Result<Self, HdError> {
        Self::restore(seed, 0, 0)
    }

    fn restore(seed: Vec<u8>, next_external: u32, next_internal: u32) -> Result<Self, HdError> {
        if !(16..=64).contains(&seed.len()) {
            return Err(HdError::InvalidSeed(seed.len()));
        }

        let mut account = XPrv::new(&seed)?;
        for index in [BIP44_PURPOSE, COIN_TYPE, DEFAULT_ACCOUNT] {
            account = account.derive_child(ChildNumber::new(index, true)?)?;
        }
        let primary = derive_key(&account, AddressChain::External, 0)?;

        let mut chain = Self {
            seed,
            account,
            next_external,
            next_internal,
            derived: [0; 2],
            keys: HashMap::new(),
            primary,
        };
        chain.fill_lookahead()?;
        Ok(chain)
    }

    pub fn load(path: &Path) -> Result<Self, HdError> {
        let stored: StoredChain = decode_exact(&fs::read(path)?)?;
        Self::restore(stored.seed, stored.next_external, stored.next_internal)
    }

    pub fn save(&self, path: &Path) -> Result<(), HdError> {
        let stored = StoredChain {
            seed: self.seed.clone(),
            next_external: self.next_external,
            next_internal: self.next_internal,
        };
        fs::write(path, encode_to_vec(&stored))?;
        Ok(())
    }

    fn fill_lookahead(&mut self) -> Result<(), HdError> {
        for (chain, next) in [
            (AddressChain::External, self.next_external),
            (AddressChain::Internal, self.next_internal),
        ] {
            let end = next.saturating_add(LOOKAHEAD);
            while self.derived[chain as usize] < end {
                let index = self.derived[chain as usize];
                let key_pair = derive_key(&self.account, chain, index)?;
                self.keys.insert(key_pair.address(), CachedKey { key_pair, chain, index });
                self.derived[chain as usize] += 1;
            }
        }
        Ok(())
    }

    fn next_address(&mut self, chain: AddressChain) -> Result<String, HdError> {
        let cursor = match chain {
            AddressChain::External => &mut self.next_external,
            AddressChain::Internal => &mut self.next_internal,
        };
        let index = *cursor;
        *cursor = cursor.saturating_add(1);

        self.fill_lookahead()?;
        let address = derive_key(&self.account, chain, index)?.address();
        log::info!(
            "New {} address {} (m/{}'/{}'/{}'/{}/{})",
            match chain {
                AddressChain::External => "receiving",
                AddressChain::Internal => "change",
            },
            address,
            BIP44_PURPOSE,
            COIN_TYPE,
            DEFAULT_ACCOUNT,
            chain as u32,
            index
        );
        Ok(address)
    }

    /// Hand out the next receiving address
    pub fn new_address(&mut self) -> Result<String, HdError> {
        self.next_address(AddressChain::External)
    }

    /// Hand out the next change address
    pub fn change_address(&mut self) -> Result<String, HdError> {
        self.next_address(AddressChain::Internal)
    }

    /// Every address derived so far, lookahead included
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.keys.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn key_for(&self, address: &str) -> Option<&KeyPair> {
        self.keys.get(address).map(|cached| &cached.key_pair)
    }

    /// Chain and index an address was derived at
    pub fn path_of(&self, address: &str) -> Option<(AddressChain, u32)> {
        self.keys.get(address).map(|cached| (cached.chain, cached.index))
    }

    pub fn owns(&self, address: &str) -> bool {
        self.keys.contains_key(address)
    }

    /// Key at `m/44'/0'/0'/0/0`
    pub fn primary(&self) -> &KeyPair {
        &self.primary
    }

    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    pub fn next_external(&self) -> u32 {
        self.next_external
    }

    pub fn next_internal(&self) -> u32 {
        self.next_internal
    }
}

fn derive_key(account: &XPrv, chain: AddressChain, index: u32) -> Result<KeyPair, HdError> {
    let key = account
        .derive_child(ChildNumber::new(chain as u32, false)?)?
        .derive_child(ChildNumber::new(index, false)?)?;
    Ok(KeyPair::from_secret_bytes(&key.to_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bip32::DerivationPath;

    #[test]
    fn test_bip32_vectors() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let master = XPrv::new(&seed).unwrap();
        assert_eq!(
            hex::encode(master.to_bytes()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(master.attrs().chain_code),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );

        let path: DerivationPath = "m/0'/1/2'/2/1000000000".parse().unwrap();
        let deep = XPrv::derive_from_path(&seed, &path).unwrap();
        assert_eq!(
            hex::encode(deep.to_bytes()),
            "471b76e389e528d6de6d816857e012c5455051cad6660850e58372a6c3e6e7c8"
        );
        assert_eq!(deep.attrs().depth, 5);
    }

    #[test]
    fn test_receiving_and_change_addresses() {
        let mut chain = HdKeyChain::generate().unwrap();
        assert_eq!(chain.seed().len(), SEED_SIZE);
        assert_eq!(chain.addresses().len(), 2 * LOOKAHEAD as usize);

        let first = chain.new_address().unwrap();
        let second = chain.new_address().unwrap();
        let change = chain.change_address().unwrap();
        assert_ne!(first, second);
        assert_ne!(first, change);
        assert_eq!(first, chain.primary().address());
        assert_eq!(chain.path_of(&second), Some((AddressChain::External, 1)));
        assert_eq!(chain.path_of(&change), Some((AddressChain::Internal, 0)));
        assert_eq!((chain.next_external(), chain.next_internal()), (2, 1));

        // Lookahead grows with the cursors
        assert_eq!(chain.addresses().len(), 2 * LOOKAHEAD as usize + 3);
        assert!(chain.owns(&change));
        assert!(!chain.owns("1InvalidAddress"));
        assert_eq!(chain.key_for(&second).unwrap().address(), second);
    }

    #[test]
    fn test_same_seed_same_keys() {
        let seed = vec![7u8; SEED_SIZE];
        let a = HdKeyChain::from_seed(seed.clone()).unwrap();
        let b = HdKeyChain::from_seed(seed).unwrap();
        assert_eq!(a.primary().address(), b.primary().address());
        assert_eq!(a.addresses(), b.addresses());

        assert!(matches!(
            HdKeyChain::from_seed(vec![1u8; 8]),
            Err(HdError::InvalidSeed(8))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.hd");
        let mut chain = HdKeyChain::generate().unwrap();
        let receiving = chain.new_address().unwrap();
        let change = chain.change_address().unwrap();
        chain.save(&path).unwrap();

        let loaded = HdKeyChain::load(&path).unwrap();
        assert_eq!(loaded.seed(), chain.seed());
        assert_eq!((loaded.next_external(), loaded.next_internal()), (1, 1));
        assert_eq!(loaded.primary().address(), chain.primary().address());
        assert!(loaded.owns(&receiving));
        assert!(loaded.owns(&change));

        fs::write(&path, [3u8; 3]).unwrap();
        assert!(matches!(HdKeyChain::load(&path), Err(HdError::Codec(_))));
    }
}
