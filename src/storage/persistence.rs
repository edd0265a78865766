//! Chain file persistence
//!
//! The chain file holds `count(blocks) ‖ block*` for every active-chain block
//! above genesis, in the binary codec. Saves either append to the existing
//! file (patching the count in place) or rewrite it through a temp file.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::core::codec::{decode_exact, BinaryBuffer, CodecError};
use crate::core::Block;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Corrupt chain file: {0}")]
    Codec(#[from] CodecError),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub chain_file: String,
    /// Keep copies of the previous file on full rewrites
    pub backup_enabled: bool,
    pub max_backups: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".tinycoin"),
            chain_file: "chain.dat".to_string(),
            backup_enabled: false,
            max_backups: 3,
        }
    }
}

/// Reads and writes the chain file
#[derive(Debug, Clone)]
pub struct ChainStore {
    config: StorageConfig,
}

impl ChainStore {
    /// Create a new store, creating the data directory if needed
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    pub fn chain_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.chain_file)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.backup.{}", self.config.chain_file, index))
    }

    pub fn exists(&self) -> bool {
        self.chain_path().exists()
    }

    /// Save the active chain (genesis first). `last_saved_height` is the
    /// height already on disk; 0 forces a full rewrite. Returns the number
    /// of blocks written.
    pub fn save(&self, active_chain: &[Block], last_saved_height: usize) -> Result<usize, StorageError> {
        let chain_size = active_chain.len().saturating_sub(1);
        let path = self.chain_path();

        if last_saved_height > 0 && last_saved_height <= chain_size && path.exists() {
            match self.stored_count()? {
                Some(count) if count == last_saved_height => {
                    let new_blocks = &active_chain[last_saved_height + 1..];
                    self.append(new_blocks, chain_size)?;
                    log::debug!(
                        "Appended {} blocks to {} (now {} blocks)",
                        new_blocks.len(),
                        path.display(),
                        chain_size
                    );
                    return Ok(new_blocks.len());
                }
                stored => log::warn!(
                    "Chain file holds {:?} blocks but {} were expected, rewriting",
                    stored,
                    last_saved_height
                ),
            }
        }

        let above_genesis = active_chain.get(1..).unwrap_or_default();
        self.write_full(above_genesis)?;
        log::debug!("Wrote {} blocks to {}", above_genesis.len(), path.display());
        Ok(above_genesis.len())
    }

    /// Blocks above genesis as stored on disk; empty if there is no file
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let path = self.chain_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path)?;
        Ok(decode_exact(&bytes)?)
    }

    pub fn delete(&self) -> Result<(), StorageError> {
        let path = self.chain_path();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// List available backups
    pub fn list_backups(&self) -> Vec<usize> {
        (0..self.config.max_backups)
            .filter(|i| self.backup_path(*i).exists())
            .collect()
    }

    /// Block count stored in the first four bytes of the file
    fn stored_count(&self) -> Result<Option<usize>, StorageError> {
        let mut file = fs::File::open(self.chain_path())?;
        let mut prefix = [0u8; 4];
        match file.read_exact(&mut prefix) {
            Ok(()) => Ok(Some(u32::from_le_bytes(prefix) as usize)),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn append(&self, new_blocks: &[Block], total: usize) -> Result<(), StorageError> {
        let mut buf = BinaryBuffer::new();
        for block in new_blocks {
            buf.write(block);
        }

        let mut file = OpenOptions::new().read(true).write(true).open(self.chain_path())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&(total as u32).to_le_bytes())?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn write_full(&self, blocks: &[Block]) -> Result<(), StorageError> {
        let path = self.chain_path();

        if self.config.backup_enabled && path.exists() {
            self.rotate_backups()?;
            fs::copy(&path, self.backup_path(0))?;
        }

        let mut buf = BinaryBuffer::new();
        buf.write(blocks);

        // Write to temporary file first
        let temp_path = self
            .config
            .data_dir
            .join(format!("{}.tmp", self.config.chain_file));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(buf.as_bytes())?;
        file.sync_data()?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn rotate_backups(&self) -> Result<(), StorageError> {
        if self.config.max_backups == 0 {
            return Ok(());
        }
        let oldest = self.backup_path(self.config.max_backups - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for i in (0..self.config.max_backups - 1).rev() {
            let current = self.backup_path(i);
            if current.exists() {
                fs::rename(&current, self.backup_path(i + 1))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::ChainParams;
    use crate::core::Transaction;
    use crate::crypto::merkle_root_of_txs;

    fn store_in(dir: &tempfile::TempDir) -> ChainStore {
        ChainStore::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        })
        .unwrap()
    }

    fn chain_of(len: usize) -> Vec<Block> {
        let mut blocks = vec![ChainParams::regtest().genesis];
        for i in 1..len {
            let txs = vec![Transaction::create_coinbase("miner", 50, i as i64)];
            let merkle = merkle_root_of_txs(&txs);
            let prev = blocks[i - 1].id().to_string();
            blocks.push(Block::new(0, prev, merkle, 1_600_000_000 + i as i64, 1, 0, txs));
        }
        blocks
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(!store.exists());
        assert!(store.load_blocks().unwrap().is_empty());
    }

    #[test]
    fn test_full_then_incremental_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let blocks = chain_of(6);

        assert_eq!(store.save(&blocks[..3], 0).unwrap(), 2);
        assert_eq!(store.load_blocks().unwrap(), blocks[1..3].to_vec());

        assert_eq!(store.save(&blocks, 2).unwrap(), 3);
        assert_eq!(store.load_blocks().unwrap(), blocks[1..].to_vec());

        // Nothing new to append
        assert_eq!(store.save(&blocks, 5).unwrap(), 0);
        assert_eq!(store.load_blocks().unwrap().len(), 5);
    }

    #[test]
    fn test_stale_save_point_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let blocks = chain_of(5);
        store.save(&blocks, 0).unwrap();

        // Chain got shorter than what is on disk
        assert_eq!(store.save(&blocks[..3], 4).unwrap(), 2);
        assert_eq!(store.load_blocks().unwrap(), blocks[1..3].to_vec());

        // Count on disk does not match the claimed save point
        assert_eq!(store.save(&blocks, 1).unwrap(), 4);
        assert_eq!(store.load_blocks().unwrap().len(), 4);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        fs::write(store.chain_path(), [5, 0, 0, 0, 1, 2]).unwrap();
        assert!(matches!(store.load_blocks(), Err(StorageError::Codec(_))));
    }

    #[test]
    fn test_backup_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::new(StorageConfig {
            data_dir: dir.path().to_path_buf(),
            backup_enabled: true,
            max_backups: 2,
            ..Default::default()
        })
        .unwrap();
        let blocks = chain_of(3);
        for _ in 0..4 {
            store.save(&blocks, 0).unwrap();
        }
        assert_eq!(store.list_backups(), vec![0, 1]);

        store.delete().unwrap();
        assert!(!store.exists());
    }
}
