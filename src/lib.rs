//! Flood Ledger: an experimental peer-to-peer UTXO ledger
//!
//! Numbered nodes gossip blocks and transactions over raw TCP and agree on a
//! chain through a pluggable consensus engine:
//! - Proof of Work with adaptive difficulty
//! - Proof of Stake weighted by the proposer's balance
//! - Delegated Proof of Stake over fixed time slots
//! - PBFT finality on top of the DPoS schedule
//!
//! # Example
//!
//! ```rust,no_run
//! use flood_ledger::config::NodeConfig;
//! use flood_ledger::ledger::Node;
//!
//! # async fn run() -> Result<(), flood_ledger::ledger::NodeError> {
//! let config = NodeConfig {
//!     id: 3,
//!     ..NodeConfig::default()
//! };
//! let node = Node::new(config)?;
//! let handle = node.handle();
//! tokio::spawn(node.run());
//!
//! let head = handle.head().await?;
//! println!("Height {}", head.height);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod consensus;
pub mod core;
pub mod crypto;
pub mod ledger;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use config::NodeConfig;
pub use consensus::{Consensus, ConsensusKind};
pub use core::{Block, Transaction, BLOCK_REWARD};
pub use crypto::KeyPair;
pub use ledger::{Ledger, Node, NodeHandle};
