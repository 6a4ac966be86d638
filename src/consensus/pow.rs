//! Proof of work
//!
//! The nonce search runs on a blocking worker so the node task keeps serving
//! the network while a block is being mined.

use super::{emit, Consensus, ConsensusError, ConsensusEvent, ConsensusKind, EventSender, ProposalContext};
use crate::core::{Block, ConsensusData};
use crate::crypto::hash_prefix;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Largest integer a double represents exactly, the base of the target
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowParams {
    /// Difficulty used when the parent carries no proof of work
    pub initial_difficulty: u64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    /// Added when blocks come faster than `target_spacing_ms`
    pub step_up: u64,
    /// Removed when blocks come slower
    pub step_down: u64,
    pub target_spacing_ms: i64,
    /// Last nonce tried before giving up
    pub max_nonce: u64,
}

impl Default for PowParams {
    fn default() -> Self {
        Self {
            initial_difficulty: 10_000,
            min_difficulty: 3_000,
            max_difficulty: MAX_SAFE_INTEGER,
            step_up: 9_000,
            step_down: 3_000,
            target_spacing_ms: 3_000,
            max_nonce: MAX_SAFE_INTEGER,
        }
    }
}

impl PowParams {
    /// Difficulty for `block` on top of `parent`
    pub fn next_difficulty(&self, block: &Block, parent: &Block) -> u64 {
        let ConsensusData::Pow { difficulty: prev, .. } = parent.consensus_data else {
            return self.initial_difficulty;
        };
        let spacing = block.timestamp - parent.timestamp;
        let next = if spacing < self.target_spacing_ms || prev < self.min_difficulty {
            prev.saturating_add(self.step_up)
        } else {
            prev.saturating_sub(self.step_down)
        };
        next.clamp(self.min_difficulty, self.max_difficulty.max(self.min_difficulty))
    }
}

/// Hash prefix bound for `difficulty`
pub fn target(difficulty: u64) -> u64 {
    MAX_SAFE_INTEGER / difficulty.max(1) * 100
}

/// Whether a hex hash satisfies `difficulty`
pub fn meets_target(hash: &str, difficulty: u64) -> bool {
    hash_prefix(hash).is_some_and(|prefix| prefix < target(difficulty))
}

/// Try nonces until the hash meets the target
fn search(mut block: Block, difficulty: u64, max_nonce: u64) -> Result<Block, ConsensusError> {
    for nonce in 0..=max_nonce {
        block.consensus_data = ConsensusData::Pow { difficulty, nonce };
        if meets_target(&block.compute_hash(), difficulty) {
            return Ok(block);
        }
    }
    Err(ConsensusError::Exhausted(difficulty))
}

pub struct Pow {
    params: PowParams,
    busy: Arc<AtomicBool>,
    events: EventSender,
}

impl Pow {
    pub fn new(params: PowParams, events: EventSender) -> Self {
        Self {
            params,
            busy: Arc::new(AtomicBool::new(false)),
            events,
        }
    }
}

impl Consensus for Pow {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Pow
    }

    fn prepared(&mut self, _now_ms: i64) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn make_consensus(&mut self, block: Block, ctx: ProposalContext) {
        let difficulty = self.params.next_difficulty(&block, &ctx.parent);
        let max_nonce = self.params.max_nonce;
        let height = block.height;
        let busy = self.busy.clone();
        let events = self.events.clone();

        busy.store(true, Ordering::SeqCst);
        log::debug!("Mining block {} at difficulty {}", height, difficulty);

        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || search(block, difficulty, max_nonce))
                .await
                .unwrap_or_else(|e| Err(ConsensusError::WorkerFailed(e.to_string())));
            busy.store(false, Ordering::SeqCst);
            let event = match outcome {
                Ok(block) => ConsensusEvent::Completed(block),
                Err(reason) => ConsensusEvent::Failed { height, reason },
            };
            emit(&events, event);
        });
    }

    fn verify(&self, block: &Block) -> bool {
        let ConsensusData::Pow { difficulty, .. } = block.consensus_data else {
            return false;
        };
        let hash = block.compute_hash();
        difficulty >= 1 && block.hash.as_deref() == Some(hash.as_str()) && meets_target(&hash, difficulty)
    }

    fn verify_on_parent(&self, block: &Block, ctx: &ProposalContext) -> bool {
        matches!(
            block.consensus_data,
            ConsensusData::Pow { difficulty, .. } if difficulty == self.params.next_difficulty(block, &ctx.parent)
        )
    }
}
