//! Node runtime
//!
//! One task owns the [`Ledger`] and multiplexes consensus events, peer
//! messages, the production timer and local commands. Connection tasks only
//! move frames; every decision is taken here.

use super::chain::{Ledger, LedgerError, Outbound};
use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{build_engine, now_ms, EventReceiver};
use crate::core::{Block, Transaction};
use crate::network::{dial, ConnectionContext, NodeId, PeerManager, Server};
use crate::storage::{ChainStore, StorageError};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Inbound messages buffered between connection tasks and the node
const INBOUND_QUEUE_LEN: usize = 4096;
const DIAL_ATTEMPTS: u32 = 5;
const DIAL_RETRY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
    #[error("Node stopped")]
    Stopped,
}

/// Requests from outside the node task
pub enum NodeCommand {
    Transfer {
        to: String,
        amount: u64,
        reply: oneshot::Sender<Result<Transaction, LedgerError>>,
    },
    Head(oneshot::Sender<Block>),
    Balance {
        owner: Option<String>,
        reply: oneshot::Sender<Result<u64, LedgerError>>,
    },
    Shutdown,
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<NodeCommand>,
}

impl NodeHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> NodeCommand) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Pay `amount` from the node's key to `to`
    pub async fn transfer(&self, to: impl Into<String>, amount: u64) -> Result<Transaction, NodeError> {
        let to = to.into();
        Ok(self
            .request(|reply| NodeCommand::Transfer { to, amount, reply })
            .await??)
    }

    pub async fn head(&self) -> Result<Block, NodeError> {
        self.request(NodeCommand::Head).await
    }

    /// Balance of `owner`, or of the node's own key
    pub async fn balance(&self, owner: Option<String>) -> Result<u64, NodeError> {
        Ok(self
            .request(|reply| NodeCommand::Balance { owner, reply })
            .await??)
    }

    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.commands
            .send(NodeCommand::Shutdown)
            .await
            .map_err(|_| NodeError::Stopped)
    }
}

pub struct Node {
    config: NodeConfig,
    ledger: Ledger,
    peers: Arc<PeerManager>,
    events: EventReceiver,
    commands_tx: mpsc::Sender<NodeCommand>,
    commands_rx: mpsc::Receiver<NodeCommand>,
}

impl Node {
    /// Open the node's store under `config.node_dir()`
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let store = ChainStore::open(&config.node_dir())?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: NodeConfig, store: ChainStore) -> Result<Self, NodeError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let engine = build_engine(config.consensus, config.id, &config, events_tx);
        let ledger = Ledger::new(&config, store, engine)?;
        let peers = Arc::new(PeerManager::new(config.id, config.max_peers));
        let (commands_tx, commands_rx) = mpsc::channel(64);

        Ok(Self {
            config,
            ledger,
            peers,
            events,
            commands_tx,
            commands_rx,
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            commands: self.commands_tx.clone(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Listen, dial peers, then serve until shutdown or a fatal error
    pub async fn run(self) -> Result<(), NodeError> {
        let Node {
            config,
            ledger,
            peers,
            mut events,
            commands_tx,
            mut commands_rx,
        } = self;
        drop(commands_tx);

        let id = config.id;
        let server = Server::bind(&config.host, config.port_of(id)?).await?;
        log::info!(
            "Node {} running {} consensus on {}",
            id,
            config.consensus,
            server.local_addr()
        );

        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE_LEN);
        let ctx = ConnectionContext {
            local_id: id,
            peers: peers.clone(),
            inbound: inbound_tx,
        };
        tokio::spawn(server.run(ctx.clone()));
        dial_peers(&config, &ctx)?;

        let mut runtime = Runtime { ledger, peers };

        let warmup = tokio::time::sleep(Duration::from_millis(config.warmup_ms));
        tokio::pin!(warmup);
        let mut warmed = false;
        let mut ticker = tokio::time::interval(Duration::from_millis(config.tick_ms.max(1)));

        loop {
            tokio::select! {
                _ = &mut warmup, if !warmed => {
                    warmed = true;
                    let connected: Vec<String> = runtime
                        .peers
                        .get_all_peer_info()
                        .await
                        .iter()
                        .map(|p| format!("{}@{}", p.id, p.addr))
                        .collect();
                    log::info!("Node {} warmed up with peers [{}]", id, connected.join(", "));
                    match runtime.peers.random_peer().await {
                        Some(peer) => {
                            let out = runtime.ledger.sync(peer);
                            dispatch(&runtime.peers, out).await;
                        }
                        None => log::info!("Node {} has no peers to sync with", id),
                    }
                }
                _ = ticker.tick(), if warmed => {
                    let result = runtime.ledger.tick(now_ms()).map(|()| Vec::new());
                    settle(&runtime.peers, id, result).await?;
                }
                Some(event) = events.recv() => {
                    let result = runtime.ledger.handle_event(event);
                    settle(&runtime.peers, id, result).await?;
                }
                Some((from, msg)) = inbound_rx.recv() => {
                    log::trace!("Node {} got {} from {}", id, msg.type_name(), from);
                    let result = runtime.ledger.handle_message(from, msg);
                    settle(&runtime.peers, id, result).await?;
                }
                Some(command) = commands_rx.recv() => {
                    if !runtime.on_command(id, command).await? {
                        break;
                    }
                }
            }
        }

        log::info!("Node {} stopping at height {}", id, runtime.ledger.head().height);
        if let Err(e) = runtime.ledger.print_chain() {
            log::warn!("Node {} cannot print chain: {}", id, e);
        }
        runtime.ledger.store().flush()?;
        Ok(())
    }
}

/// Dial up to `fanout` distinct random nodes, retrying while they start
fn dial_peers(config: &NodeConfig, ctx: &ConnectionContext) -> Result<(), NodeError> {
    let mut ids: Vec<NodeId> = (0..config.node_count).filter(|&n| n != config.id).collect();
    ids.shuffle(&mut rand::thread_rng());
    ids.truncate(config.fanout);

    for remote in ids {
        let addr = config.addr_of(remote)?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for attempt in 1..=DIAL_ATTEMPTS {
                if ctx.peers.is_connected(remote).await {
                    return;
                }
                match dial(&addr, remote, ctx.clone()).await {
                    Ok(()) => {
                        log::debug!("Node {} connected to {}", ctx.local_id, remote);
                        return;
                    }
                    Err(e) => {
                        log::debug!("Dial {} attempt {} failed: {}", remote, attempt, e);
                        tokio::time::sleep(DIAL_RETRY).await;
                    }
                }
            }
            log::warn!("Node {} gave up dialing {}", ctx.local_id, remote);
        });
    }
    Ok(())
}

struct Runtime {
    ledger: Ledger,
    peers: Arc<PeerManager>,
}

impl Runtime {
    /// Returns `false` on shutdown. A storage failure stops the node; the
    /// caller then sees [`NodeError::Stopped`].
    async fn on_command(&mut self, id: NodeId, command: NodeCommand) -> Result<bool, NodeError> {
        match command {
            NodeCommand::Transfer { to, amount, reply } => {
                let result = match self.ledger.create_transaction(&to, amount) {
                    Ok((tx, out)) => {
                        dispatch(&self.peers, out).await;
                        Ok(tx)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(fail_on_fatal(id, result)?);
            }
            NodeCommand::Head(reply) => {
                let _ = reply.send(self.ledger.head().clone());
            }
            NodeCommand::Balance { owner, reply } => {
                let result = match owner {
                    Some(owner) => self.ledger.balance_of(&owner),
                    None => self.ledger.balance(),
                };
                let _ = reply.send(fail_on_fatal(id, result)?);
            }
            NodeCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }
}

/// Pass refusals back to the caller, stop on storage failures
fn fail_on_fatal<T>(id: NodeId, result: Result<T, LedgerError>) -> Result<Result<T, LedgerError>, NodeError> {
    match result {
        Err(e) if e.is_fatal() => {
            log::error!("Node {} failed: {}", id, e);
            Err(e.into())
        }
        result => Ok(result),
    }
}

async fn dispatch(peers: &PeerManager, out: Vec<Outbound>) {
    for item in out {
        match item {
            Outbound::Broadcast(msg) => peers.broadcast(msg).await,
            Outbound::Send(to, msg) => {
                let kind = msg.type_name();
                if let Err(e) = peers.send_to(to, msg).await {
                    log::debug!("Cannot send {} to {}: {}", kind, to, e);
                }
            }
        }
    }
}

/// Send what the ledger produced. Only storage failures stop the node.
async fn settle(
    peers: &PeerManager,
    id: NodeId,
    result: Result<Vec<Outbound>, LedgerError>,
) -> Result<(), NodeError> {
    match result {
        Ok(out) => {
            dispatch(peers, out).await;
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            log::error!("Node {} failed: {}", id, e);
            Err(e.into())
        }
        Err(e) => {
            log::debug!("Node {} rejected: {}", id, e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusKind, PowParams};
    use crate::crypto::KeyPair;
    use crate::storage::{MemoryStore, Store};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config(id: NodeId, base_port: u16) -> NodeConfig {
        NodeConfig {
            id,
            node_count: 1,
            base_port,
            consensus: ConsensusKind::Pow,
            warmup_ms: 0,
            tick_ms: 20,
            pow: PowParams {
                initial_difficulty: 1,
                min_difficulty: 1,
                max_difficulty: 1,
                ..PowParams::default()
            },
            ..NodeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_single_node_mines_and_shuts_down() {
        let node = Node::with_store(config(0, 47_310), ChainStore::in_memory()).unwrap();
        let handle = node.handle();
        let task = tokio::spawn(node.run());

        let mut head = handle.head().await.unwrap();
        for _ in 0..200 {
            if head.height >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            head = handle.head().await.unwrap();
        }
        assert!(head.height >= 3);
        assert!(handle.balance(None).await.unwrap() >= 100);

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
        assert!(matches!(handle.head().await, Err(NodeError::Stopped)));
    }

    #[tokio::test]
    async fn test_transfer_without_funds_is_refused() {
        let mut cfg = config(0, 47_320);
        // Never produces
        cfg.tick_ms = 60_000;
        cfg.warmup_ms = 60_000;
        let node = Node::with_store(cfg, ChainStore::in_memory()).unwrap();
        let handle = node.handle();
        let task = tokio::spawn(node.run());

        let result = handle.transfer("somebody", 10).await;
        assert!(matches!(
            result,
            Err(NodeError::Ledger(LedgerError::InsufficientFunds { have: 0, need: 10 }))
        ));

        handle.shutdown().await.unwrap();
        task.await.unwrap().unwrap();
    }

    /// Memory store whose disk can be pulled out from under the node
    struct FlakyStore {
        inner: MemoryStore,
        broken: Arc<AtomicBool>,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StorageError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StorageError::InvalidData("disk gone".to_string()));
            }
            Ok(())
        }
    }

    impl Store for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.check()?;
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            self.check()?;
            self.inner.put(key, value)
        }

        fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.check()?;
            self.inner.keys()
        }
    }

    #[tokio::test]
    async fn test_storage_failure_in_command_stops_node() {
        let broken = Arc::new(AtomicBool::new(false));
        let store = ChainStore::new(Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            broken: broken.clone(),
        }));
        // Balance lookups from height 2 read genesis from the store
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = Block::new(&genesis, vec![], kp.public_key_hex());
        block.seal(&kp).unwrap();
        store.put_block(&genesis).unwrap();
        store.put_block(&block).unwrap();
        store.set_last_block(&block).unwrap();

        let mut cfg = config(0, 47_330);
        cfg.tick_ms = 60_000;
        cfg.warmup_ms = 60_000;
        let node = Node::with_store(cfg, store).unwrap();
        let handle = node.handle();
        let task = tokio::spawn(node.run());
        assert_eq!(handle.balance(None).await.unwrap(), 0);

        broken.store(true, Ordering::SeqCst);
        assert!(matches!(handle.balance(None).await, Err(NodeError::Stopped)));
        assert!(matches!(
            task.await.unwrap(),
            Err(NodeError::Ledger(LedgerError::Storage(_)))
        ));
        assert!(matches!(handle.head().await, Err(NodeError::Stopped)));
    }
}
