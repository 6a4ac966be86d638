//! Ledger state machine and node runtime
//!
//! - [`pool`]: pending transactions
//! - [`utxo`]: spend verification and transfer building over the stored chain
//! - [`chain`]: block and transaction routing, commit, fork choice and sync
//! - [`node`]: the async task driving a [`Ledger`] from sockets and timers

pub mod chain;
pub mod node;
pub mod pool;
pub mod utxo;

pub use chain::{Ledger, LedgerError, Outbound, RejectReason};
pub use node::{Node, NodeCommand, NodeError, NodeHandle};
pub use pool::TxPool;
pub use utxo::{build_transaction, verify_block_transactions, verify_transaction, ChainView};
