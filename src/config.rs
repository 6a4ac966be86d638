//! Node configuration
//!
//! Every field has a default, so a JSON file only needs the values it changes.

use crate::consensus::{ConsensusKind, PbftParams, PosParams, PowParams, SlotParams};
use crate::crypto::{KeyError, KeyPair};
use crate::network::{NodeId, MAX_PEERS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Port {base} + {id} is out of range")]
    PortOutOfRange { base: u16, id: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// This node's id; it listens on `base_port + id`
    pub id: NodeId,
    /// Size of the id space peers are picked from
    pub node_count: u64,
    pub host: String,
    pub base_port: u16,
    /// Peers dialed at startup
    pub fanout: usize,
    pub max_peers: usize,
    /// Root directory; each node stores its chain in `node-<id>` below it
    pub data_dir: PathBuf,
    pub consensus: ConsensusKind,
    /// Delay between startup and the first sync and tick
    pub warmup_ms: u64,
    pub tick_ms: u64,
    /// Pooled transactions included per block, besides the coinbase
    pub max_block_txs: usize,
    /// Seed phrase of the node key, derived from the id when absent
    pub seed: Option<String>,
    pub pow: PowParams,
    pub pos: PosParams,
    pub slot: SlotParams,
    pub pbft: PbftParams,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            node_count: 20,
            host: "127.0.0.1".to_string(),
            base_port: 8000,
            fanout: 5,
            max_peers: MAX_PEERS,
            data_dir: PathBuf::from("data"),
            consensus: ConsensusKind::default(),
            warmup_ms: 5_000,
            tick_ms: 1_000,
            max_block_txs: 10,
            seed: None,
            pow: PowParams::default(),
            pos: PosParams::default(),
            slot: SlotParams::default(),
            pbft: PbftParams::default(),
        }
    }
}

impl NodeConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Port node `id` listens on
    pub fn port_of(&self, id: NodeId) -> Result<u16, ConfigError> {
        u16::try_from(id)
            .ok()
            .and_then(|offset| self.base_port.checked_add(offset))
            .ok_or(ConfigError::PortOutOfRange {
                base: self.base_port,
                id,
            })
    }

    /// `host:port` of node `id`
    pub fn addr_of(&self, id: NodeId) -> Result<String, ConfigError> {
        Ok(format!("{}:{}", self.host, self.port_of(id)?))
    }

    /// Directory holding this node's store
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(format!("node-{}", self.id))
    }

    /// Key pair of this node
    pub fn keypair(&self) -> Result<KeyPair, KeyError> {
        match &self.seed {
            Some(seed) => KeyPair::from_seed(seed),
            None => KeyPair::from_seed(&format!("flood-ledger node {}", self.id)),
        }
    }
}
