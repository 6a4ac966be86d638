//! Practical byzantine fault tolerance on top of slot proposals
//!
//! The slot owner proposes a block. Every node that receives it votes
//! Prepare; once more than `2f` prepares agree on the block, the node votes
//! Commit; more than `2f` commits finalize it. With `N` delegates,
//! `f = (N - 1) / 3`.
//!
//! Only one block is prepared per round, but commit tallies are kept for any
//! hash, and whichever reaches quorum first is finalized.

use super::dpos::{claim, verify_slot};
use super::slot::{SlotParams, SlotTurn};
use super::{emit, now_ms, Consensus, ConsensusEvent, ConsensusKind, EventSender, ProposalContext};
use crate::core::{Block, SeenCache, DEFAULT_SEEN_CAPACITY};
use crate::network::{Message, NodeId, Vote};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbftParams {
    /// Votes remembered per phase for duplicate suppression
    pub seen_capacity: usize,
}

impl Default for PbftParams {
    fn default() -> Self {
        Self {
            seen_capacity: DEFAULT_SEEN_CAPACITY,
        }
    }
}

/// Phase of the current round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Idle,
    Prepare,
    Commit,
}

/// Votes collected for one block
#[derive(Debug, Clone)]
struct Tally {
    height: u64,
    hash: String,
    voters: HashSet<NodeId>,
}

impl Tally {
    fn new(height: u64, hash: &str) -> Self {
        Self {
            height,
            hash: hash.to_string(),
            voters: HashSet::new(),
        }
    }
}

/// Dedup key of a vote
type VoteKey = (String, u64, NodeId);

fn vote_key(vote: &Vote) -> VoteKey {
    (vote.hash.clone(), vote.height, vote.signer)
}

pub struct Pbft {
    id: NodeId,
    slot: SlotParams,
    turn: SlotTurn,
    /// Byzantine nodes tolerated
    f: usize,
    state: RoundState,
    current_slot: i64,
    pending: HashMap<String, Block>,
    prepare: Option<Tally>,
    commits: HashMap<String, Tally>,
    prepare_seen: SeenCache<VoteKey>,
    commit_seen: SeenCache<VoteKey>,
    events: EventSender,
}

impl Pbft {
    pub fn new(id: NodeId, slot: SlotParams, params: PbftParams, events: EventSender) -> Self {
        let n = slot.delegates.max(1) as usize;
        Self {
            id,
            turn: SlotTurn::new(id),
            slot,
            f: (n - 1) / 3,
            state: RoundState::Idle,
            current_slot: i64::MIN,
            pending: HashMap::new(),
            prepare: None,
            commits: HashMap::new(),
            prepare_seen: SeenCache::new(params.seen_capacity),
            commit_seen: SeenCache::new(params.seen_capacity),
            events,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    /// Votes needed to move past a phase
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    fn clear_state(&mut self) {
        self.state = RoundState::Idle;
        self.prepare = None;
        self.commits.clear();
        self.pending.clear();
    }

    fn vote(&self, block_height: u64, hash: &str) -> Vote {
        Vote {
            height: block_height,
            hash: hash.to_string(),
            signer: self.id,
        }
    }

    fn commit_reached(&self, hash: &str) -> bool {
        self.commits
            .get(hash)
            .is_some_and(|t| t.voters.len() >= self.quorum())
    }

    /// Start a round for a sealed block, or join the round it belongs to
    fn submit(&mut self, block: Block) {
        let hash = block.hash_str().to_string();

        // Enough commits arrived before the block did
        if self.commit_reached(&hash) {
            log::debug!("Block {} already committed by quorum", hash);
            self.clear_state();
            emit(&self.events, ConsensusEvent::Completed(block));
            return;
        }

        let block_slot = self.slot.slot_number(block.timestamp);
        if block_slot > self.current_slot {
            self.clear_state();
        }
        let height = block.height;
        self.pending.insert(hash.clone(), block);

        if self.state == RoundState::Idle {
            self.current_slot = block_slot;
            self.state = RoundState::Prepare;
            let mut tally = Tally::new(height, &hash);
            tally.voters.insert(self.id);
            self.prepare = Some(tally);

            let vote = self.vote(height, &hash);
            self.prepare_seen.insert(vote_key(&vote));
            emit(&self.events, ConsensusEvent::Broadcast(Message::Prepare(vote)));
            self.check_prepare_quorum();
        }
    }

    fn check_prepare_quorum(&mut self) {
        if self.state != RoundState::Prepare {
            return;
        }
        let Some(prepare) = &self.prepare else {
            return;
        };
        if prepare.voters.len() < self.quorum() {
            return;
        }

        let (height, hash) = (prepare.height, prepare.hash.clone());
        self.state = RoundState::Commit;
        self.commits
            .entry(hash.clone())
            .or_insert_with(|| Tally::new(height, &hash))
            .voters
            .insert(self.id);

        let vote = self.vote(height, &hash);
        self.commit_seen.insert(vote_key(&vote));
        emit(&self.events, ConsensusEvent::Broadcast(Message::Commit(vote)));
        self.check_commit_quorum(&hash);
    }

    fn check_commit_quorum(&mut self, hash: &str) {
        if !self.commit_reached(hash) {
            return;
        }
        if let Some(block) = self.pending.remove(hash) {
            log::debug!("Block {} at height {} finalized", hash, block.height);
            self.clear_state();
            emit(&self.events, ConsensusEvent::Completed(block));
        }
    }

    fn on_prepare(&mut self, vote: Vote) {
        if !self.prepare_seen.insert(vote_key(&vote)) {
            return;
        }
        emit(&self.events, ConsensusEvent::Broadcast(Message::Prepare(vote.clone())));

        if self.state != RoundState::Prepare {
            return;
        }
        let counted = match &mut self.prepare {
            Some(t) if t.height == vote.height && t.hash == vote.hash => t.voters.insert(vote.signer),
            _ => false,
        };
        if counted {
            self.check_prepare_quorum();
        }
    }

    fn on_commit(&mut self, vote: Vote) {
        if !self.commit_seen.insert(vote_key(&vote)) {
            return;
        }
        emit(&self.events, ConsensusEvent::Broadcast(Message::Commit(vote.clone())));

        let counted = self
            .commits
            .entry(vote.hash.clone())
            .or_insert_with(|| Tally::new(vote.height, &vote.hash))
            .voters
            .insert(vote.signer);
        if counted {
            self.check_commit_quorum(&vote.hash);
        }
    }
}

impl Consensus for Pbft {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Pbft
    }

    fn prepared(&mut self, now_ms: i64) -> bool {
        self.turn.take(&self.slot, now_ms)
    }

    fn make_consensus(&mut self, mut block: Block, _ctx: ProposalContext) {
        if block.is_sealed() {
            self.submit(block);
            return;
        }
        let event = match claim(&self.slot, self.id, &mut block, now_ms()) {
            Ok(()) => ConsensusEvent::Proposed(block),
            Err(reason) => ConsensusEvent::Failed {
                height: block.height,
                reason,
            },
        };
        emit(&self.events, event);
    }

    fn verify(&self, block: &Block) -> bool {
        verify_slot(&self.slot, block)
    }

    fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Prepare(vote) => self.on_prepare(vote),
            Message::Commit(vote) => self.on_commit(vote),
            other => log::debug!("PBFT ignores {} message", other.type_name()),
        }
    }

    fn requires_finality(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::EventReceiver;
    use crate::crypto::KeyPair;
    use tokio::sync::mpsc;

    fn sealed_block() -> Block {
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = Block::new(&genesis, vec![], kp.public_key_hex());
        block.seal(&kp).unwrap();
        block
    }

    fn context() -> ProposalContext {
        ProposalContext {
            parent: Block::genesis().unwrap(),
            stake: 0,
        }
    }

    fn engine(id: NodeId, delegates: u64) -> (Pbft, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = SlotParams {
            delegates,
            ..SlotParams::default()
        };
        (Pbft::new(id, slot, PbftParams::default(), tx), rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ConsensusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn completed(events: &[ConsensusEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, ConsensusEvent::Completed(_)))
            .count()
    }

    fn vote(block: &Block, signer: NodeId) -> Vote {
        Vote {
            height: block.height,
            hash: block.hash_str().to_string(),
            signer,
        }
    }

    #[test]
    fn test_twenty_nodes_need_thirteen_votes_per_phase() {
        let (mut pbft, mut rx) = engine(0, 20);
        assert_eq!(pbft.quorum(), 13);
        let block = sealed_block();

        pbft.make_consensus(block.clone(), context());
        assert_eq!(pbft.state(), RoundState::Prepare);
        let events = drain(&mut rx);
        assert!(matches!(
            events.as_slice(),
            [ConsensusEvent::Broadcast(Message::Prepare(v))] if v.signer == 0
        ));

        // Self vote plus 11 peers is one short
        for signer in 1..=11 {
            pbft.handle_message(Message::Prepare(vote(&block, signer)));
        }
        assert_eq!(pbft.state(), RoundState::Prepare);
        pbft.handle_message(Message::Prepare(vote(&block, 12)));
        assert_eq!(pbft.state(), RoundState::Commit);
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ConsensusEvent::Broadcast(Message::Commit(v)) if v.signer == 0)));

        for signer in 1..=11 {
            pbft.handle_message(Message::Commit(vote(&block, signer)));
        }
        assert_eq!(completed(&drain(&mut rx)), 0);
        pbft.handle_message(Message::Commit(vote(&block, 12)));

        let events = drain(&mut rx);
        assert_eq!(completed(&events), 1);
        assert_eq!(pbft.state(), RoundState::Idle);
    }

    #[test]
    fn test_duplicate_votes_never_double_count() {
        let (mut pbft, mut rx) = engine(0, 20);
        let block = sealed_block();
        pbft.make_consensus(block.clone(), context());
        drain(&mut rx);

        pbft.handle_message(Message::Prepare(vote(&block, 1)));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1, "first sighting is forwarded");

        for _ in 0..20 {
            pbft.handle_message(Message::Prepare(vote(&block, 1)));
        }
        assert!(drain(&mut rx).is_empty(), "duplicates are dropped");
        assert_eq!(pbft.state(), RoundState::Prepare);

        // Echo of our own vote is a duplicate too
        pbft.handle_message(Message::Prepare(vote(&block, 0)));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_commit_quorum_before_block_arrives() {
        let (mut pbft, mut rx) = engine(0, 4);
        assert_eq!(pbft.quorum(), 3);
        let block = sealed_block();

        for signer in 1..=3 {
            pbft.handle_message(Message::Commit(vote(&block, signer)));
        }
        assert_eq!(completed(&drain(&mut rx)), 0);

        pbft.make_consensus(block.clone(), context());
        let events = drain(&mut rx);
        assert_eq!(completed(&events), 1);
        assert_eq!(pbft.state(), RoundState::Idle);
    }

    #[test]
    fn test_single_node_finalizes_alone() {
        let (mut pbft, mut rx) = engine(0, 1);
        let block = sealed_block();
        pbft.make_consensus(block.clone(), context());
        let events = drain(&mut rx);
        assert_eq!(completed(&events), 1);
        match events.last() {
            Some(ConsensusEvent::Completed(done)) => assert_eq!(done, &block),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unsealed_proposal_outside_slot_fails() {
        let (mut pbft, mut rx) = engine(0, 20);
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = Block::new(&genesis, vec![], kp.public_key_hex());
        // Slot 21 belongs to delegate 1
        block.timestamp = SlotParams::default().epoch_ms + 21 * 3_000;

        pbft.make_consensus(block, context());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ConsensusEvent::Failed { .. }]
        ));
    }

    #[test]
    fn test_votes_for_other_blocks_do_not_count_as_prepare() {
        let (mut pbft, mut rx) = engine(0, 4);
        let block = sealed_block();
        let other = sealed_block();
        pbft.make_consensus(block.clone(), context());
        for signer in 1..=3 {
            pbft.handle_message(Message::Prepare(vote(&other, signer)));
        }
        assert_eq!(pbft.state(), RoundState::Prepare);
        drain(&mut rx);
    }
}
