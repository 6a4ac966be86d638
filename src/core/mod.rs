//! Core ledger components
//!
//! This module contains the fundamental building blocks:
//! - Transactions (UTXO model, content-addressed ids)
//! - Blocks (hash chained, signed, with consensus proofs) and genesis
//! - A bounded dedup cache for gossip

pub mod block;
pub mod seen;
pub mod transaction;

pub use block::{
    Block, ConsensusData, BLOCK_VERSION, GENESIS_HEIGHT, GENESIS_SEED, GENESIS_TIMESTAMP,
};
pub use seen::{SeenCache, DEFAULT_SEEN_CAPACITY};
pub use transaction::{
    OutPoint, Transaction, TxInput, TxOutput, BLOCK_REWARD, COINBASE_INDEX,
};
