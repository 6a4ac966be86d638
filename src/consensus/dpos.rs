//! Delegated proof of stake
//!
//! Delegates take turns by time slot. Only the owner of the current slot may
//! propose, once per slot.

use super::slot::{SlotParams, SlotTurn};
use super::{emit, now_ms, Consensus, ConsensusError, ConsensusEvent, ConsensusKind, EventSender, ProposalContext};
use crate::core::{Block, ConsensusData};
use crate::network::NodeId;

pub struct Dpos {
    id: NodeId,
    params: SlotParams,
    turn: SlotTurn,
    events: EventSender,
}

impl Dpos {
    pub fn new(id: NodeId, params: SlotParams, events: EventSender) -> Self {
        Self {
            id,
            turn: SlotTurn::new(id),
            params,
            events,
        }
    }

    /// Stamp `block` if both it and `now_ms` fall in one of our slots
    pub fn claim_slot(&self, mut block: Block, now_ms: i64) -> Result<Block, ConsensusError> {
        claim(&self.params, self.id, &mut block, now_ms)?;
        Ok(block)
    }
}

/// Record `{generator_id}` when the block's slot is the current one and ours
pub(crate) fn claim(
    params: &SlotParams,
    id: NodeId,
    block: &mut Block,
    now_ms: i64,
) -> Result<(), ConsensusError> {
    let block_owner = params.owner_at(block.timestamp);
    let current_slot = params.slot_number(now_ms);
    let current_owner = params.slot_owner(current_slot);
    if block_owner != current_owner || block_owner != id {
        return Err(ConsensusError::NotSlotOwner {
            slot: current_slot,
            owner: current_owner,
        });
    }
    block.consensus_data = ConsensusData::Slot { generator_id: id };
    Ok(())
}

/// A block's recorded generator must own the slot of its timestamp
pub(crate) fn verify_slot(params: &SlotParams, block: &Block) -> bool {
    match block.consensus_data {
        ConsensusData::Slot { generator_id } => generator_id == params.owner_at(block.timestamp),
        _ => false,
    }
}

impl Consensus for Dpos {
    fn kind(&self) -> ConsensusKind {
        ConsensusKind::Dpos
    }

    fn prepared(&mut self, now_ms: i64) -> bool {
        self.turn.take(&self.params, now_ms)
    }

    fn make_consensus(&mut self, block: Block, _ctx: ProposalContext) {
        let height = block.height;
        let event = match self.claim_slot(block, now_ms()) {
            Ok(block) => ConsensusEvent::Completed(block),
            Err(reason) => ConsensusEvent::Failed { height, reason },
        };
        emit(&self.events, event);
    }

    fn verify(&self, block: &Block) -> bool {
        verify_slot(&self.params, block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use tokio::sync::mpsc;

    /// A block stamped inside slot `slot`
    fn block_in_slot(params: &SlotParams, slot: i64) -> Block {
        let genesis = Block::genesis().unwrap();
        let kp = KeyPair::generate();
        let mut block = Block::new(&genesis, vec![], kp.public_key_hex());
        block.timestamp = params.epoch_ms + slot * 3_000 + 100;
        block
    }

    #[test]
    fn test_only_slot_owner_is_prepared() {
        let params = SlotParams::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut owner = Dpos::new(5, params.clone(), tx.clone());
        let mut other = Dpos::new(6, params.clone(), tx);
        let now = params.epoch_ms + 5 * 3_000 + 10;

        assert!(owner.prepared(now));
        assert!(!owner.prepared(now + 10));
        assert!(!other.prepared(now));
    }

    #[test]
    fn test_claim_requires_current_owned_slot() {
        let params = SlotParams::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let dpos = Dpos::new(5, params.clone(), tx);
        let block = block_in_slot(&params, 5);
        let now = block.timestamp + 500;

        let claimed = dpos.claim_slot(block.clone(), now).unwrap();
        assert_eq!(claimed.consensus_data, ConsensusData::Slot { generator_id: 5 });
        assert!(dpos.verify(&claimed));

        // The slot passed before the claim
        assert!(matches!(
            dpos.claim_slot(block.clone(), now + 3_000),
            Err(ConsensusError::NotSlotOwner { owner: 6, .. })
        ));

        let foreign = block_in_slot(&params, 7);
        assert!(dpos.claim_slot(foreign.clone(), foreign.timestamp).is_err());
    }

    #[test]
    fn test_verify_checks_owner_of_timestamp() {
        let params = SlotParams::default();
        let (tx, _rx) = mpsc::unbounded_channel();
        let dpos = Dpos::new(0, params.clone(), tx);

        let mut block = block_in_slot(&params, 7);
        block.consensus_data = ConsensusData::Slot { generator_id: 7 };
        assert!(dpos.verify(&block));

        block.consensus_data = ConsensusData::Slot { generator_id: 8 };
        assert!(!dpos.verify(&block));

        block.consensus_data = ConsensusData::Empty {};
        assert!(!dpos.verify(&block));
    }

    #[test]
    fn test_make_consensus_reports_outside_slot() {
        let params = SlotParams::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dpos = Dpos::new(0, params.clone(), tx);
        // Slot 21 belongs to delegate 1
        let block = block_in_slot(&params, 21);
        let ctx = ProposalContext {
            parent: Block::genesis().unwrap(),
            stake: 0,
        };
        dpos.make_consensus(block, ctx);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ConsensusEvent::Failed { height: 2, .. }
        ));
    }
}
