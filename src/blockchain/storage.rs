use std::path::Path;

use log::debug;
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;
use super::crypto::Address;

const REGISTERED_ADDRESSES_KEY: &[u8] = b"registered_addresses";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

/// Disk persistence for a ledger.
///
/// Blocks are keyed by big-endian height so a tree scan returns them in chain
/// order. The pending pool is not persisted.
pub struct BlockchainStorage {
    db: Db,

    /// Tree for blocks
    blocks: Tree,

    /// Tree for metadata
    metadata: Tree,

    #[cfg(test)]
    reject_writes: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            metadata,
            #[cfg(test)]
            reject_writes: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Makes every following write fail until switched back
    #[cfg(test)]
    pub(crate) fn set_reject_writes(&self, reject: bool) {
        self.reject_writes
            .store(reject, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_writable(&self) -> Result<(), StorageError> {
        if self.reject_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::DatabaseError(sled::Error::Unsupported(
                "writes rejected".to_string(),
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_writable(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Saves a block at the given height
    pub fn save_block(&self, height: u64, block: &Block) -> Result<(), StorageError> {
        self.check_writable()?;
        let value = bincode::serialize(block)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.blocks.insert(height.to_be_bytes(), value)?;
        debug!("Stored block {} at height {}", block.hash, height);

        Ok(())
    }

    /// Gets all blocks in chain order
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        self.blocks
            .iter()
            .map(|entry| {
                let (_, value) = entry?;
                bincode::deserialize::<Block>(&value)
                    .map_err(|e| StorageError::DeserializationError(e.to_string()))
            })
            .collect()
    }

    /// Number of stored blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn save_registered_addresses(&self, addresses: &[Address]) -> Result<(), StorageError> {
        self.check_writable()?;
        let value = bincode::serialize(addresses)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.metadata.insert(REGISTERED_ADDRESSES_KEY, value)?;
        Ok(())
    }

    /// Registered wallets in registration order; empty if none were stored
    pub fn get_registered_addresses(&self) -> Result<Vec<Address>, StorageError> {
        match self.metadata.get(REGISTERED_ADDRESSES_KEY)? {
            Some(value) => bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Ok(Vec::new()),
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
