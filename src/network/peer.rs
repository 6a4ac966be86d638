//! Peer management for P2P networking
//!
//! Tracks connected peers by node id and routes outgoing messages to their
//! writer tasks.

use crate::network::message::{Message, NodeId};
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Default maximum number of connected peers
pub const MAX_PEERS: usize = 32;

/// Capacity of each peer's outgoing queue
pub const PEER_QUEUE_LEN: usize = 1024;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Peer {0} send queue full")]
    QueueFull(NodeId),
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Invalid handshake")]
    InvalidHandshake,
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: NodeId,
    /// Peer's address
    pub addr: SocketAddr,
    /// Whether this is an outbound connection
    pub outbound: bool,
    /// Distinguishes several connections to the same node
    pub conn_id: u64,
}

/// Handle for sending messages to a peer
#[derive(Clone)]
pub struct PeerHandle {
    pub info: PeerInfo,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    /// Queue a message without waiting on a slow peer
    pub fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::QueueFull(self.info.id),
            mpsc::error::TrySendError::Closed(_) => PeerError::Disconnected,
        })
    }
}

/// Manages all peer connections
pub struct PeerManager {
    local_id: NodeId,
    max_peers: usize,
    handles: RwLock<HashMap<NodeId, PeerHandle>>,
    next_conn_id: AtomicU64,
}

impl PeerManager {
    pub fn new(local_id: NodeId, max_peers: usize) -> Self {
        Self {
            local_id,
            max_peers,
            handles: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Register a connection to `id` and return its connection id.
    ///
    /// A newer connection to an already known node replaces the old handle.
    /// New inbound nodes are refused once `max_peers` is reached.
    pub async fn add_peer(
        &self,
        id: NodeId,
        addr: SocketAddr,
        tx: mpsc::Sender<Message>,
        outbound: bool,
    ) -> Result<u64, PeerError> {
        if id == self.local_id {
            return Err(PeerError::InvalidHandshake);
        }

        let mut handles = self.handles.write().await;
        if !outbound && !handles.contains_key(&id) && handles.len() >= self.max_peers {
            return Err(PeerError::MaxPeersReached);
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let info = PeerInfo {
            id,
            addr,
            outbound,
            conn_id,
        };
        handles.insert(id, PeerHandle { info, tx });

        log::info!("Added peer {} at {} (outbound: {})", id, addr, outbound);
        Ok(conn_id)
    }

    /// Remove a peer if `conn_id` is still its current connection
    pub async fn remove_peer(&self, id: NodeId, conn_id: u64) {
        let mut handles = self.handles.write().await;
        if handles.get(&id).is_some_and(|h| h.info.conn_id == conn_id) {
            handles.remove(&id);
            log::info!("Removed peer {}", id);
        }
    }

    /// Get all connected peer ids
    pub async fn get_peers(&self) -> Vec<NodeId> {
        let handles = self.handles.read().await;
        handles.keys().copied().collect()
    }

    pub async fn get_all_peer_info(&self) -> Vec<PeerInfo> {
        let handles = self.handles.read().await;
        handles.values().map(|h| h.info.clone()).collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_connected(&self, id: NodeId) -> bool {
        self.handles.read().await.contains_key(&id)
    }

    /// A connected peer chosen uniformly at random
    pub async fn random_peer(&self) -> Option<NodeId> {
        let handles = self.handles.read().await;
        handles.keys().copied().choose(&mut rand::thread_rng())
    }

    /// Broadcast a message to all peers
    pub async fn broadcast(&self, msg: Message) {
        let handles = self.handles.read().await;
        for (id, handle) in handles.iter() {
            if let Err(e) = handle.send(msg.clone()) {
                log::warn!("Failed to send {} to {}: {}", msg.type_name(), id, e);
            }
        }
    }

    /// Send a message to a specific peer
    pub async fn send_to(&self, id: NodeId, msg: Message) -> Result<(), PeerError> {
        let handles = self.handles.read().await;
        match handles.get(&id) {
            Some(handle) => handle.send(msg),
            None => Err(PeerError::Disconnected),
        }
    }
}
