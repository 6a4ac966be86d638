//! Proof of stake
//!
//! Each attempt hashes the candidate with a fresh timestamp. The hash prefix
//! must fall under `difficulty * stake`, so a richer proposer needs fewer
//! attempts. Attempts repeat every `retry_interval_ms` until `timeout_ms`.

use super::{emit, now_ms, Consensus, ConsensusError, ConsensusEvent, ConsensusKind, EventSender, ProposalContext};
use crate::core::{Block, ConsensusData};
use crate::crypto::hash_prefix;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PosParams {
    /// Per-coin target when the parent carries no stake proof
    pub initial_difficulty: u64,
    pub min_difficulty: u64,
    pub max_difficulty: u64,
    pub target_spacing_ms: i64,
    pub retry_interval_ms: u64,
    pub timeout_ms: i64,
}

impl Default for PosParams {
    fn default() -> Self {
        Self {
            // One coin wins about one attempt in 64
            initial_difficulty: 1 << 58,
            min_difficulty: 1 << 32,
            max_difficulty: 1 << 62,
            target_spacing_ms: 3_000,
            retry_interval_ms: 1_000,
            timeout_ms: 3_600_000,
        }
    }
}

impl PosParams {
    /// Per-coin target for `block` on top of `parent`
    pub fn next_difficulty(&self, block: &Block, parent: &Block) -> u64 {
        let ConsensusData::Pos { difficulty: prev, .. } = parent.consensus_data else {
            return self.initial_difficulty;
        };
        let spacing = block.timestamp - parent.timestamp;
        let next = if spacing < self.target_spacing_ms {
            prev - prev / 4
        } else {
            prev.saturating_add(prev / 4)
        };
        next.clamp(self.min_difficulty, self.max_difficulty.max(self.min_difficulty))
    }
}

/// Whether a hex hash is under `difficulty * stake`
pub fn meets_stake_target(hash: &str, difficulty: u64, stake: u64) -> bool {
    let Some(prefix) = hash_prefix(hash) else {
        return false;
    };
    u128::from(prefix) < u128::from(difficulty) * u128::from(stake)
}

/// Write a stake proof stamped `timestamp` and report whether it wins
fn attempt(block: &mut Block, difficulty: u64, stake: u64, timestamp: i64) -> bool {
    block.consensus_data = ConsensusData::Pos {
        difficulty,
        timestamp,
        stake,
    };
    meets_stake_target(&block.compute_hash(), difficulty, stake)
}

pub struct Pos {
    params: PosParams,
    busy: Arc<AtomicBool>,
    events: EventSender,
}

impl Pos {
    pub fn new(params: PosParams, events: EventSender) -> Self {
        Self {
            params,
            busy: Arc::new(AtomicBool::new(false)),
            events,
        }
    }
}

impl Consensus for Pos {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Pos
    }

    fn prepared(&mut self, _now_ms: i64) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn make_consensus(&mut self, mut block: Block, ctx: ProposalContext) {
        let difficulty = self.params.next_difficulty(&block, &ctx.parent);
        // A fresh chain has no balances yet
        let stake = ctx.stake.max(1);
        let retry = Duration::from_millis(self.params.retry_interval_ms.max(1));
        let timeout_ms = self.params.timeout_ms;
        let busy = self.busy.clone();
        let events = self.events.clone();

        busy.store(true, Ordering::SeqCst);
        log::debug!(
            "Staking block {} with stake {} at difficulty {}",
            block.height,
            stake,
            difficulty
        );

        tokio::spawn(async move {
            let started = block.timestamp;
            let mut ticker = tokio::time::interval(retry);
            let event = loop {
                ticker.tick().await;
                let now = now_ms();
                if now - started > timeout_ms {
                    break ConsensusEvent::Failed {
                        height: block.height,
                        reason: ConsensusError::Timeout,
                    };
                }
                if attempt(&mut block, difficulty, stake, now) {
                    break ConsensusEvent::Completed(block);
                }
            };
            busy.store(false, Ordering::SeqCst);
            emit(&events, event);
        });
    }

    fn verify(&self, block: &Block) -> bool {
        let ConsensusData::Pos {
            difficulty, stake, ..
        } = block.consensus_data
        else {
            return false;
        };
        let hash = block.compute_hash();
        difficulty >= 1
            && stake >= 1
            && block.hash.as_deref() == Some(hash.as_str())
            && meets_stake_target(&hash, difficulty, stake)
    }

    fn verify_on_parent(&self, block: &Block, ctx: &ProposalContext) -> bool {
        let ConsensusData::Pos {
            difficulty, stake, ..
        } = block.consensus_data
        else {
            return false;
        };
        difficulty == self.params.next_difficulty(block, &ctx.parent) && stake <= ctx.stake.max(1)
    }

    fn uses_stake(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use crate::crypto::KeyPair;
    use tokio::sync::mpsc;

    fn candidate(parent: &Block, kp: &KeyPair) -> Block {
        let tx = Transaction::coinbase(&kp.public_key_hex(), "pos test");
        Block::new(parent, vec![tx], kp.public_key_hex())
    }

    #[test]
    fn test_stake_scales_target() {
        let hash = format!("{:016x}{}", 1000u64, "0".repeat(48));
        assert!(!meets_stake_target(&hash, 100, 10));
        assert!(meets_stake_target(&hash, 100, 11));
        // No overflow at the extremes
        assert!(meets_stake_target(&"f".repeat(64), u64::MAX, 2));
    }

    #[test]
    fn test_difficulty_adjustment() {
        let params = PosParams::default();
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = candidate(&genesis, &kp);
        assert_eq!(params.next_difficulty(&block, &genesis), params.initial_difficulty);

        let mut parent = genesis.clone();
        let prev = 1u64 << 40;
        parent.consensus_data = ConsensusData::Pos {
            difficulty: prev,
            timestamp: 0,
            stake: 1,
        };
        block.timestamp = parent.timestamp + 100;
        assert_eq!(params.next_difficulty(&block, &parent), prev - prev / 4);
        block.timestamp = parent.timestamp + 100_000;
        assert_eq!(params.next_difficulty(&block, &parent), prev + prev / 4);
    }

    #[tokio::test]
    async fn test_staked_block_verifies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let params = PosParams {
            // Every attempt wins
            initial_difficulty: u64::MAX,
            max_difficulty: u64::MAX,
            retry_interval_ms: 10,
            ..PosParams::default()
        };
        let mut pos = Pos::new(params, tx);
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();

        pos.make_consensus(
            candidate(&genesis, &kp),
            ProposalContext {
                parent: genesis.clone(),
                stake: 2,
            },
        );
        assert!(!pos.prepared(0));

        let mut block = match rx.recv().await.unwrap() {
            ConsensusEvent::Completed(block) => block,
            other => panic!("unexpected event {:?}", other),
        };
        assert!(matches!(block.consensus_data, ConsensusData::Pos { stake: 2, .. }));
        block.seal(&kp).unwrap();
        assert!(pos.verify(&block));
        assert!(pos.prepared(0));

        let funded = ProposalContext {
            parent: genesis.clone(),
            stake: 2,
        };
        assert!(pos.verify_on_parent(&block, &funded));
        // Claimed stake above the generator's balance
        let poor = ProposalContext {
            parent: genesis.clone(),
            stake: 1,
        };
        assert!(!pos.verify_on_parent(&block, &poor));
    }

    #[test]
    fn test_difficulty_must_match_parent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let params = PosParams::default();
        let pos = Pos::new(params.clone(), tx);
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let ctx = ProposalContext {
            parent: genesis.clone(),
            stake: 0,
        };

        let mut block = candidate(&genesis, &kp);
        block.consensus_data = ConsensusData::Pos {
            difficulty: params.initial_difficulty,
            timestamp: block.timestamp,
            stake: 1,
        };
        assert!(pos.verify_on_parent(&block, &ctx));

        block.consensus_data = ConsensusData::Pos {
            difficulty: u64::MAX,
            timestamp: block.timestamp,
            stake: 1,
        };
        assert!(!pos.verify_on_parent(&block, &ctx));
        assert!(pos.uses_stake());
    }

    #[tokio::test]
    async fn test_timeout_reports_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let params = PosParams {
            initial_difficulty: 1,
            min_difficulty: 1,
            retry_interval_ms: 10,
            timeout_ms: 0,
            ..PosParams::default()
        };
        let mut pos = Pos::new(params, tx);
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = candidate(&genesis, &kp);
        block.timestamp -= 1_000;

        pos.make_consensus(
            block,
            ProposalContext {
                parent: genesis.clone(),
                stake: 1,
            },
        );
        match rx.recv().await.unwrap() {
            ConsensusEvent::Failed { reason, .. } => assert_eq!(reason, ConsensusError::Timeout),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
