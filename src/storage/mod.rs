//! Storage module for chain persistence

pub mod persistence;

pub use persistence::{ChainStore, StorageConfig, StorageError};
