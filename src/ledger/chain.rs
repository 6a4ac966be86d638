//! Chain state and the decisions taken on every event
//!
//! `Ledger` is synchronous: it owns the head, the pending blocks, the pool and
//! the consensus engine, and answers each network message or consensus event
//! with the [`Outbound`] messages to send. The node task runs it.

use super::pool::TxPool;
use super::utxo::{build_transaction, verify_block_transactions, verify_transaction, ChainView};
use crate::config::NodeConfig;
use crate::consensus::{Consensus, ConsensusEvent, ProposalContext};
use crate::core::{Block, SeenCache, Transaction};
use crate::crypto::{KeyError, KeyPair};
use crate::network::{Message, NodeId, SyncBlock, SyncPayload, SyncRequest};
use crate::storage::{ChainStore, StorageError};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Why a block or transaction was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("Transaction id does not match its contents: {0}")]
    BadTxId(String),
    #[error("Transaction has no outputs")]
    NoOutputs,
    #[error("Transaction has a zero amount output")]
    ZeroOutput,
    #[error("Invalid coinbase")]
    BadCoinbase,
    #[error("Coinbase transactions are only accepted inside blocks")]
    CoinbaseNotAllowed,
    #[error("Malformed input")]
    MalformedInput,
    #[error("Unknown output {0}")]
    UnknownOutput(String),
    #[error("Output {0} already spent")]
    DoubleSpend(String),
    #[error("Invalid signature spending {0}")]
    BadSpendSignature(String),
    #[error("Value overflow")]
    ValueOverflow,
    #[error("Inputs {have} below outputs {need}")]
    InsufficientInputs { have: u64, need: u64 },
    #[error("Block has more than one coinbase")]
    MultipleCoinbase,
    #[error("Transaction {0} already in the chain")]
    KnownTransaction(String),
    #[error("Block is not sealed")]
    Unsealed,
    #[error("Merkle root mismatch")]
    BadMerkleRoot,
    #[error("Invalid block signature")]
    BadBlockSignature,
    #[error("Consensus proof rejected")]
    BadConsensus,
    #[error("Unexpected genesis block")]
    UnexpectedGenesis,
    #[error("Height {height} does not follow parent height {parent}")]
    BadHeight { height: u64, parent: u64 },
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Rejected: {0}")]
    Rejected(#[from] RejectReason),
    #[error("Insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("Amount must be positive")]
    InvalidAmount,
}

impl LedgerError {
    /// Errors the node cannot continue after
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

/// Message the node should send
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Broadcast(Message),
    Send(NodeId, Message),
}

// =============================================================================
// Ledger
// =============================================================================

pub struct Ledger {
    id: NodeId,
    keypair: KeyPair,
    store: ChainStore,
    head: Block,
    /// Verified blocks not committed yet, by hash
    pending_blocks: HashMap<String, Block>,
    pool: TxPool,
    rejected_txs: SeenCache<String>,
    engine: Box<dyn Consensus>,
    max_block_txs: usize,
    /// Hash of the remote head being synced towards
    sync_target: Option<String>,
}

impl Ledger {
    /// Load the head from `store`, persisting genesis on first start
    pub fn new(
        config: &NodeConfig,
        store: ChainStore,
        engine: Box<dyn Consensus>,
    ) -> Result<Self, LedgerError> {
        let head = match store.last_block()? {
            Some(head) => {
                log::info!("Node {} resuming at height {}", config.id, head.height);
                head
            }
            None => {
                let genesis = Block::genesis()?;
                store.put_block(&genesis)?;
                store.set_last_block(&genesis)?;
                log::info!("Node {} starting from genesis", config.id);
                genesis
            }
        };

        Ok(Self {
            id: config.id,
            keypair: config.keypair()?,
            store,
            head,
            pending_blocks: HashMap::new(),
            pool: TxPool::new(),
            rejected_txs: SeenCache::new(config.pbft.seen_capacity),
            engine,
            max_block_txs: config.max_block_txs,
            sync_target: None,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn head(&self) -> &Block {
        &self.head
    }

    pub fn public_key(&self) -> String {
        self.keypair.public_key_hex()
    }

    pub fn pool(&self) -> &TxPool {
        &self.pool
    }

    pub fn store(&self) -> &ChainStore {
        &self.store
    }

    pub fn is_pending(&self, hash: &str) -> bool {
        self.pending_blocks.contains_key(hash)
    }

    fn view(&self) -> ChainView<'_> {
        ChainView::new(&self.store, &self.head)
    }

    pub fn balance_of(&self, owner: &str) -> Result<u64, LedgerError> {
        Ok(self.view().balance_of(owner)?)
    }

    /// Balance of this node's key
    pub fn balance(&self) -> Result<u64, LedgerError> {
        self.balance_of(&self.public_key())
    }

    /// The adopted chain from genesis to the head
    pub fn chain(&self) -> Result<Vec<Block>, LedgerError> {
        Ok(self.store.chain_from_genesis(&self.head)?)
    }

    /// Log the adopted chain as `(height:hash:generator)` links
    pub fn print_chain(&self) -> Result<(), LedgerError> {
        let links: Vec<String> = self
            .chain()?
            .iter()
            .map(|b| {
                let hash = b.hash_str();
                let short = hash.get(..6).unwrap_or(hash);
                let generator = b.generator_publickey.get(..8).unwrap_or(&b.generator_publickey);
                format!("({}:{}:{})", b.height, short, generator)
            })
            .collect();
        log::info!("Node {} chain: {}", self.id, links.join(" -> "));
        Ok(())
    }

    // =========================================================================
    // Production
    // =========================================================================

    /// Propose a block if the engine allows it now
    pub fn tick(&mut self, now_ms: i64) -> Result<(), LedgerError> {
        if !self.engine.prepared(now_ms) {
            return Ok(());
        }
        let block = self.candidate(now_ms)?;
        let ctx = ProposalContext {
            parent: self.head.clone(),
            stake: self.balance()?,
        };
        log::debug!("Node {} proposing height {}", self.id, block.height);
        self.engine.make_consensus(block, ctx);
        Ok(())
    }

    /// Coinbase plus the oldest pooled transactions that still verify.
    ///
    /// Each transaction may only spend chain outputs or outputs of
    /// transactions already picked for this block.
    fn candidate(&mut self, now_ms: i64) -> Result<Block, LedgerError> {
        let memo = format!("{} node: {} coinbase tx", now_ms, self.id);
        let mut transactions = vec![Transaction::coinbase(&self.public_key(), memo)];

        let mut picked = TxPool::new();
        let mut stale = Vec::new();
        for tx in self.pool.iter() {
            if picked.len() >= self.max_block_txs {
                break;
            }
            match verify_transaction(&self.view(), &picked, tx) {
                Ok(()) => {
                    picked.add(tx.clone());
                    transactions.push(tx.clone());
                }
                Err(LedgerError::Rejected(reason)) => {
                    log::debug!("Dropping pooled tx {}: {}", tx.id, reason);
                    stale.push(tx.id.clone());
                }
                Err(e) => return Err(e),
            }
        }
        for id in stale {
            self.pool.remove(&id);
        }

        Ok(Block::new(&self.head, transactions, self.public_key()))
    }

    /// Create, pool and flood a transfer from this node's key
    pub fn create_transaction(
        &mut self,
        to: &str,
        amount: u64,
    ) -> Result<(Transaction, Vec<Outbound>), LedgerError> {
        let tx = build_transaction(&self.view(), &self.pool, &self.keypair, to, amount)?;
        verify_transaction(&self.view(), &self.pool, &tx)?;
        self.pool.add(tx.clone());
        log::info!("Node {} created tx {} ({} to {})", self.id, tx.id, amount, to);
        Ok((tx.clone(), vec![Outbound::Broadcast(Message::Transaction(tx))]))
    }

    // =========================================================================
    // Consensus events
    // =========================================================================

    pub fn handle_event(&mut self, event: ConsensusEvent) -> Result<Vec<Outbound>, LedgerError> {
        match event {
            ConsensusEvent::Proposed(mut block) => {
                block.seal(&self.keypair)?;
                self.pending_blocks
                    .insert(block.hash_str().to_string(), block.clone());
                let ctx = ProposalContext {
                    parent: self.head.clone(),
                    stake: 0,
                };
                self.engine.make_consensus(block.clone(), ctx);
                Ok(vec![Outbound::Broadcast(Message::Block(block))])
            }
            ConsensusEvent::Completed(mut block) => {
                let sealed_here = !block.is_sealed();
                if sealed_here {
                    block.seal(&self.keypair)?;
                }
                if block.extends(&self.head) {
                    self.commit(block.clone())?;
                    return Ok(if sealed_here {
                        vec![Outbound::Broadcast(Message::Block(block))]
                    } else {
                        Vec::new()
                    });
                }
                log::info!(
                    "Node {} produced stale block {} at height {}",
                    self.id,
                    block.hash_str(),
                    block.height
                );
                self.handle_fork(&block)?;
                Ok(Vec::new())
            }
            ConsensusEvent::Failed { height, reason } => {
                log::warn!("Node {} consensus failed at height {}: {}", self.id, height, reason);
                Ok(Vec::new())
            }
            ConsensusEvent::Broadcast(msg) => Ok(vec![Outbound::Broadcast(msg)]),
        }
    }

    // =========================================================================
    // Network messages
    // =========================================================================

    pub fn handle_message(&mut self, from: NodeId, msg: Message) -> Result<Vec<Outbound>, LedgerError> {
        match msg {
            Message::Block(block) => self.on_block(from, block),
            Message::Transaction(tx) => self.on_transaction(tx),
            Message::Sync(req) => self.on_sync(req),
            Message::SyncBlock(answer) => self.on_sync_block(from, answer),
            msg @ (Message::Prepare(_) | Message::Commit(_) | Message::PrePrepare(_)) => {
                self.engine.handle_message(msg);
                Ok(Vec::new())
            }
            Message::Connection(_) => Ok(Vec::new()),
        }
    }

    /// Signature, Merkle root and consensus proof
    fn verify_header(&self, block: &Block) -> Result<(), RejectReason> {
        if !block.is_sealed() {
            return Err(RejectReason::Unsealed);
        }
        if block.is_genesis() {
            return Err(RejectReason::UnexpectedGenesis);
        }
        if !block.verify_merkle_root() {
            return Err(RejectReason::BadMerkleRoot);
        }
        if !block.verify_signature() {
            return Err(RejectReason::BadBlockSignature);
        }
        if !self.engine.verify(block) {
            return Err(RejectReason::BadConsensus);
        }
        Ok(())
    }

    /// Full pipeline for a gossiped block
    fn verify_block(&self, block: &Block) -> Result<(), LedgerError> {
        self.verify_header(block)?;
        for tx in &block.transactions {
            if self.store.has_transaction(&tx.id)? {
                return Err(RejectReason::KnownTransaction(tx.id.clone()).into());
            }
        }
        // Blocks with an unknown parent are checked when their branch is adopted
        if let Some(parent) = self.parent_of(block)? {
            self.verify_on_parent(block, &parent)?;
        }
        Ok(())
    }

    /// Height, parent-relative proof and transactions of `block` on `parent`
    fn verify_on_parent(&self, block: &Block, parent: &Block) -> Result<(), LedgerError> {
        check_height(block, parent)?;
        let view = ChainView::new(&self.store, parent);
        let stake = if self.engine.uses_stake() {
            view.balance_of(&block.generator_publickey)?
        } else {
            0
        };
        let ctx = ProposalContext {
            parent: parent.clone(),
            stake,
        };
        if !self.engine.verify_on_parent(block, &ctx) {
            return Err(RejectReason::BadConsensus.into());
        }
        verify_block_transactions(&view, block)
    }

    fn parent_of(&self, block: &Block) -> Result<Option<Block>, LedgerError> {
        match &block.previous_hash {
            Some(hash) if *hash == self.head.hash_str() => Ok(Some(self.head.clone())),
            Some(hash) => Ok(self.store.get_block(hash)?),
            None => Ok(None),
        }
    }

    fn is_known(&self, hash: &str) -> Result<bool, LedgerError> {
        Ok(self.pending_blocks.contains_key(hash) || self.store.has_block(hash)?)
    }

    fn on_block(&mut self, from: NodeId, block: Block) -> Result<Vec<Outbound>, LedgerError> {
        let hash = block.hash_str().to_string();
        if hash.is_empty() {
            return Err(RejectReason::Unsealed.into());
        }
        if self.is_known(&hash)? {
            return Ok(Vec::new());
        }
        self.verify_block(&block)?;
        log::debug!("Node {} accepted block {} at height {} from {}", self.id, hash, block.height, from);

        let mut out = vec![Outbound::Broadcast(Message::Block(block.clone()))];

        if block.extends(&self.head) {
            self.pending_blocks.insert(hash, block.clone());
            if self.engine.requires_finality() {
                let ctx = ProposalContext {
                    parent: self.head.clone(),
                    stake: 0,
                };
                self.engine.make_consensus(block, ctx);
            } else {
                self.commit(block)?;
            }
        } else if block.height > self.head.height.saturating_add(1) {
            // Gap: keep the block and fetch its ancestors from the sender
            self.store.put_block(&block)?;
            self.sync_target = Some(hash);
            if let Some(previous) = block.previous_hash.clone() {
                if !self.store.has_block(&previous)? {
                    log::info!("Node {} behind at height {}, syncing from {}", self.id, self.head.height, from);
                    out.push(self.sync_request(from, Some(previous)));
                } else {
                    self.try_adopt(&block)?;
                }
            }
        } else {
            self.handle_fork(&block)?;
        }
        Ok(out)
    }

    /// Store competing blocks and switch if one makes a longer chain
    fn handle_fork(&mut self, block: &Block) -> Result<(), LedgerError> {
        let next_height =
            block.height == self.head.height.saturating_add(1) && block.previous_hash != self.head.hash;
        let sibling = block.height == self.head.height
            && block.previous_hash == self.head.previous_hash
            && block.hash != self.head.hash;
        if !(next_height || sibling) {
            log::debug!("Node {} ignoring old block at height {}", self.id, block.height);
            return Ok(());
        }

        log::info!(
            "Node {} storing fork block {} at height {} (head {})",
            self.id,
            block.hash_str(),
            block.height,
            self.head.height
        );
        self.store.put_block(block)?;
        self.try_adopt(block)?;
        Ok(())
    }

    fn on_transaction(&mut self, tx: Transaction) -> Result<Vec<Outbound>, LedgerError> {
        if self.pool.contains(&tx.id)
            || self.rejected_txs.contains(&tx.id)
            || self.store.has_transaction(&tx.id)?
        {
            return Ok(Vec::new());
        }
        if tx.is_coinbase() {
            self.rejected_txs.insert(tx.id.clone());
            return Err(RejectReason::CoinbaseNotAllowed.into());
        }
        match verify_transaction(&self.view(), &self.pool, &tx) {
            Ok(()) => {}
            Err(LedgerError::Rejected(reason)) => {
                self.rejected_txs.insert(tx.id.clone());
                return Err(reason.into());
            }
            Err(e) => return Err(e),
        }

        log::debug!("Node {} pooled tx {}", self.id, tx.id);
        self.pool.add(tx.clone());
        Ok(vec![Outbound::Broadcast(Message::Transaction(tx))])
    }

    // =========================================================================
    // Sync
    // =========================================================================

    fn sync_request(&self, to: NodeId, hash: Option<String>) -> Outbound {
        Outbound::Send(to, Message::Sync(SyncRequest { id: self.id, hash }))
    }

    /// Ask `peer` for its head
    pub fn sync(&self, peer: NodeId) -> Vec<Outbound> {
        log::info!("Node {} syncing with {}", self.id, peer);
        vec![self.sync_request(peer, None)]
    }

    fn on_sync(&self, req: SyncRequest) -> Result<Vec<Outbound>, LedgerError> {
        let payload = match req.hash {
            None => SyncPayload::LastBlock(self.head.clone()),
            Some(hash) => match self.store.get_block(&hash)? {
                Some(block) => SyncPayload::Block(block),
                None => {
                    log::debug!("Node {} cannot serve unknown block {}", self.id, hash);
                    return Ok(Vec::new());
                }
            },
        };
        let answer = SyncBlock {
            id: self.id,
            payload,
        };
        Ok(vec![Outbound::Send(req.id, Message::SyncBlock(answer))])
    }

    fn on_sync_block(&mut self, from: NodeId, answer: SyncBlock) -> Result<Vec<Outbound>, LedgerError> {
        let is_head = matches!(answer.payload, SyncPayload::LastBlock(_));
        let block = answer.payload.into_block();
        let hash = block.hash_str().to_string();

        if is_head && block.height <= self.head.height {
            log::info!("Node {} already at height {}, sync done", self.id, self.head.height);
            return Ok(Vec::new());
        }

        let known = self.store.has_block(&hash)?;
        if !known {
            self.verify_header(&block)?;
            if let Some(parent) = self.parent_of(&block)? {
                check_height(&block, &parent)?;
            }
        }
        if is_head {
            self.sync_target = Some(hash.clone());
        }

        if !known {
            self.store.put_block(&block)?;
            if let Some(previous) = &block.previous_hash {
                if !self.store.has_block(previous)? {
                    log::debug!("Node {} fetching block {} from {}", self.id, previous, from);
                    return Ok(vec![self.sync_request(from, Some(previous.clone()))]);
                }
            }
        }

        // The walk reached blocks we have
        if let Some(target) = self.sync_target.take() {
            if let Some(target_block) = self.store.get_block(&target)? {
                if self.try_adopt(&target_block)? {
                    log::info!("Node {} synced to height {}", self.id, self.head.height);
                }
            }
        }
        Ok(Vec::new())
    }

    // =========================================================================
    // Commit and fork choice
    // =========================================================================

    fn commit(&mut self, block: Block) -> Result<(), LedgerError> {
        self.store.put_block(&block)?;
        for tx in &block.transactions {
            self.store.put_transaction(tx)?;
        }
        self.pool.remove_all(&block.transactions);
        self.store.set_last_block(&block)?;

        log::info!(
            "Node {} committed block {} at height {}",
            self.id,
            block.hash_str(),
            block.height
        );
        self.pending_blocks.remove(block.hash_str());
        self.head = block;
        let height = self.head.height;
        self.pending_blocks.retain(|_, b| b.height > height);
        Ok(())
    }

    /// Adopt `candidate` as head if it is higher and its whole branch is
    /// stored and valid. Returns whether the head changed.
    fn try_adopt(&mut self, candidate: &Block) -> Result<bool, LedgerError> {
        if candidate.height <= self.head.height || !self.store.has_full_ancestry(candidate)? {
            return Ok(false);
        }

        let main: HashSet<String> = self
            .store
            .ancestors(self.head.clone())
            .map(|b| b.map(|b| b.hash_str().to_string()))
            .collect::<Result<_, _>>()?;

        // Blocks of the new branch above the fork point, newest first
        let mut branch = Vec::new();
        let mut fork_point = None;
        for block in self.store.ancestors(candidate.clone()) {
            let block = block?;
            if main.contains(block.hash_str()) {
                fork_point = Some(block);
                break;
            }
            branch.push(block);
        }
        let Some(mut parent) = fork_point else {
            return Ok(false);
        };
        branch.reverse();

        for block in &branch {
            if let Err(e) = self.verify_on_parent(block, &parent) {
                if e.is_fatal() {
                    return Err(e);
                }
                log::info!("Node {} refusing branch at height {}: {}", self.id, block.height, e);
                return Ok(false);
            }
            parent = block.clone();
        }

        for block in &branch {
            for tx in &block.transactions {
                self.store.put_transaction(tx)?;
            }
            self.pool.remove_all(&block.transactions);
        }
        self.store.set_last_block(candidate)?;
        log::info!(
            "Node {} switched to branch {} at height {} (was {})",
            self.id,
            candidate.hash_str(),
            candidate.height,
            self.head.height
        );
        self.head = candidate.clone();
        let height = self.head.height;
        self.pending_blocks.retain(|_, b| b.height > height);
        Ok(true)
    }
}

/// `block` must sit exactly one above `parent`
fn check_height(block: &Block, parent: &Block) -> Result<(), RejectReason> {
    if parent.height.checked_add(1) == Some(block.height) {
        Ok(())
    } else {
        Err(RejectReason::BadHeight {
            height: block.height,
            parent: parent.height,
        })
    }
}
