//! Pluggable consensus strategies
//!
//! An engine decides when this node may propose, writes its proof into a
//! candidate block and checks the proofs of blocks received from peers.
//! Outcomes are never returned directly: engines report on an event channel
//! that the node task drains alongside network traffic.

pub mod dpos;
pub mod pbft;
pub mod pos;
pub mod pow;
pub mod slot;

use crate::config::NodeConfig;
use crate::core::Block;
use crate::network::{Message, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

pub use dpos::Dpos;
pub use pbft::{Pbft, PbftParams, RoundState};
pub use pos::{Pos, PosParams};
pub use pow::{Pow, PowParams};
pub use slot::{SlotParams, SlotTurn};

/// Available strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    #[default]
    Pow,
    Pos,
    Dpos,
    Pbft,
}

impl fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsensusKind::Pow => "pow",
            ConsensusKind::Pos => "pos",
            ConsensusKind::Dpos => "dpos",
            ConsensusKind::Pbft => "pbft",
        };
        f.write_str(name)
    }
}

/// Why a proposal did not complete
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Nonce space exhausted at difficulty {0}")]
    Exhausted(u64),
    #[error("Proof search timed out")]
    Timeout,
    #[error("Slot {slot} belongs to delegate {owner}")]
    NotSlotOwner { slot: i64, owner: u64 },
    #[error("Worker failed: {0}")]
    WorkerFailed(String),
}

/// Engine output, drained by the node task
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// Candidate ready to be sealed and flooded (PBFT)
    Proposed(Block),
    /// Block agreed on, ready to commit
    Completed(Block),
    /// Proposal abandoned; the engine is idle again
    Failed { height: u64, reason: ConsensusError },
    /// Engine traffic for the network
    Broadcast(Message),
}

pub type EventSender = mpsc::UnboundedSender<ConsensusEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ConsensusEvent>;

/// What a proposal builds on
#[derive(Debug, Clone)]
pub struct ProposalContext {
    pub parent: Block,
    /// Proposer balance, used by proof of stake
    pub stake: u64,
}

/// Common contract of all strategies
pub trait Consensus: Send {
    fn kind(&self) -> ConsensusKind;

    /// May this node propose now
    fn prepared(&mut self, now_ms: i64) -> bool;

    /// Start producing a proof for `block`. Never blocks; the outcome
    /// arrives as an event.
    fn make_consensus(&mut self, block: Block, ctx: ProposalContext);

    /// Check the proof recorded in a received block
    fn verify(&self, block: &Block) -> bool;

    /// Check the recorded proof parameters against the block's parent.
    /// `ctx.stake` is the generator's balance at `ctx.parent` when
    /// [`Consensus::uses_stake`] holds, zero otherwise.
    fn verify_on_parent(&self, _block: &Block, _ctx: &ProposalContext) -> bool {
        true
    }

    /// Whether proofs depend on the proposer's balance
    fn uses_stake(&self) -> bool {
        false
    }

    /// Engine specific network traffic
    fn handle_message(&mut self, msg: Message) {
        log::debug!("{} ignores {} message", self.kind(), msg.type_name());
    }

    /// Whether blocks extending the head must pass through the engine before commit
    fn requires_finality(&self) -> bool {
        false
    }
}

/// Send an event, logging if the node has gone away
pub(crate) fn emit(events: &EventSender, event: ConsensusEvent) {
    if events.send(event).is_err() {
        log::debug!("Consensus event dropped: node stopped");
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Build the engine selected by `kind`
pub fn build_engine(
    kind: ConsensusKind,
    id: NodeId,
    config: &NodeConfig,
    events: EventSender,
) -> Box<dyn Consensus> {
    match kind {
        ConsensusKind::Pow => Box::new(Pow::new(config.pow.clone(), events)),
        ConsensusKind::Pos => Box::new(Pos::new(config.pos.clone(), events)),
        ConsensusKind::Dpos => Box::new(Dpos::new(id, config.slot.clone(), events)),
        ConsensusKind::Pbft => Box::new(Pbft::new(
            id,
            config.slot.clone(),
            config.pbft.clone(),
            events,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_engine_selects_strategy() {
        let config = NodeConfig::default();
        for kind in [
            ConsensusKind::Pow,
            ConsensusKind::Pos,
            ConsensusKind::Dpos,
            ConsensusKind::Pbft,
        ] {
            let (tx, _rx) = mpsc::unbounded_channel();
            let engine = build_engine(kind, 0, &config, tx);
            assert_eq!(engine.kind(), kind);
            assert_eq!(engine.requires_finality(), kind == ConsensusKind::Pbft);
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ConsensusKind::Dpos.to_string(), "dpos");
        let kind: ConsensusKind = serde_json::from_str("\"pbft\"").unwrap();
        assert_eq!(kind, ConsensusKind::Pbft);
    }
}
