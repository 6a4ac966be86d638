//! Typed access to blocks, transactions and the head
//!
//! Values are stored as JSON: blocks under their hash, transactions under
//! their id and the current head under [`LAST_BLOCK_KEY`].

use super::store::{MemoryStore, SledStore, Store, StorageError};
use crate::core::{Block, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Key holding the head of the adopted chain
pub const LAST_BLOCK_KEY: &str = "last_block";

/// Chain persistence over any [`Store`]
#[derive(Clone)]
pub struct ChainStore {
    store: Arc<dyn Store>,
}

impl ChainStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Open a sled-backed chain store in `path`
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Ok(Self::new(Arc::new(SledStore::open(path)?)))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.store.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.store.put(key, &bytes)
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    pub fn get_block(&self, hash: &str) -> Result<Option<Block>, StorageError> {
        self.get_json(hash)
    }

    pub fn has_block(&self, hash: &str) -> Result<bool, StorageError> {
        Ok(self.store.get(hash)?.is_some())
    }

    /// Store a sealed block under its hash
    pub fn put_block(&self, block: &Block) -> Result<(), StorageError> {
        let hash = block
            .hash
            .as_deref()
            .ok_or_else(|| StorageError::InvalidData("cannot store unsealed block".to_string()))?;
        self.put_json(hash, block)
    }

    pub fn last_block(&self) -> Result<Option<Block>, StorageError> {
        self.get_json(LAST_BLOCK_KEY)
    }

    pub fn set_last_block(&self, block: &Block) -> Result<(), StorageError> {
        self.put_json(LAST_BLOCK_KEY, block)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.store.flush()
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn has_transaction(&self, id: &str) -> Result<bool, StorageError> {
        Ok(self.store.get(id)?.is_some())
    }

    pub fn put_transaction(&self, tx: &Transaction) -> Result<(), StorageError> {
        self.put_json(&tx.id, tx)
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// Walk from `from` back towards genesis, `from` included.
    ///
    /// The walk ends at genesis or at the first ancestor missing locally.
    pub fn ancestors(&self, from: Block) -> Ancestors<'_> {
        Ancestors {
            store: self,
            next: Some(from),
            error: None,
        }
    }

    /// Whether every ancestor of `block` down to genesis is stored locally
    pub fn has_full_ancestry(&self, block: &Block) -> Result<bool, StorageError> {
        let mut root_reached = false;
        for ancestor in self.ancestors(block.clone()) {
            root_reached = ancestor?.is_genesis();
        }
        Ok(root_reached)
    }

    /// The chain ending at `head`, ordered from genesis
    pub fn chain_from_genesis(&self, head: &Block) -> Result<Vec<Block>, StorageError> {
        let mut chain = self
            .ancestors(head.clone())
            .collect::<Result<Vec<_>, _>>()?;
        chain.reverse();
        Ok(chain)
    }
}

/// Iterator over a block and its stored ancestors
pub struct Ancestors<'a> {
    store: &'a ChainStore,
    next: Option<Block>,
    error: Option<StorageError>,
}

impl Iterator for Ancestors<'_> {
    type Item = Result<Block, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(err) = self.error.take() {
            return Some(Err(err));
        }
        let block = self.next.take()?;
        if let Some(previous) = &block.previous_hash {
            match self.store.get_block(previous) {
                Ok(parent) => self.next = parent,
                Err(err) => self.error = Some(err),
            }
        }
        Some(Ok(block))
    }
}
