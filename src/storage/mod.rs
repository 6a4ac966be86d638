//! Storage module for ledger persistence

pub mod chain_store;
pub mod store;

pub use chain_store::{Ancestors, ChainStore, LAST_BLOCK_KEY};
pub use store::{MemoryStore, SledStore, StorageError, Store};
