//! Time slots for delegate based consensus
//!
//! Time since a fixed epoch is cut into slots of `interval_secs`; slot `s`
//! belongs to delegate `s mod delegates`.

use serde::{Deserialize, Serialize};

/// Epoch origin in milliseconds since the Unix epoch
pub const SLOT_EPOCH_MS: i64 = 1_548_988_864_492;

/// Slot length in seconds
pub const SLOT_INTERVAL_SECS: u64 = 3;

/// Number of delegates taking turns
pub const DELEGATES: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotParams {
    pub epoch_ms: i64,
    pub interval_secs: u64,
    pub delegates: u64,
}

impl Default for SlotParams {
    fn default() -> Self {
        Self {
            epoch_ms: SLOT_EPOCH_MS,
            interval_secs: SLOT_INTERVAL_SECS,
            delegates: DELEGATES,
        }
    }
}

impl SlotParams {
    /// Whole seconds elapsed since the epoch
    pub fn epoch_time(&self, timestamp_ms: i64) -> i64 {
        (timestamp_ms - self.epoch_ms).div_euclid(1000)
    }

    /// Slot containing `timestamp_ms`
    pub fn slot_number(&self, timestamp_ms: i64) -> i64 {
        let interval = self.interval_secs.max(1) as i64;
        self.epoch_time(timestamp_ms).div_euclid(interval)
    }

    /// Delegate owning `slot`
    pub fn slot_owner(&self, slot: i64) -> u64 {
        slot.rem_euclid(self.delegates.max(1) as i64) as u64
    }

    /// Delegate owning the slot that contains `timestamp_ms`
    pub fn owner_at(&self, timestamp_ms: i64) -> u64 {
        self.slot_owner(self.slot_number(timestamp_ms))
    }
}

/// Tracks the last slot a delegate proposed in, so it proposes once per slot
#[derive(Debug, Clone)]
pub struct SlotTurn {
    id: u64,
    last_slot: Option<i64>,
}

impl SlotTurn {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            last_slot: None,
        }
    }

    /// True the first time it is called inside one of our slots
    pub fn take(&mut self, params: &SlotParams, now_ms: i64) -> bool {
        let slot = params.slot_number(now_ms);
        if params.slot_owner(slot) != self.id || self.last_slot == Some(slot) {
            return false;
        }
        self.last_slot = Some(slot);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_arithmetic() {
        let params = SlotParams::default();
        let epoch = params.epoch_ms;
        assert_eq!(params.slot_number(epoch), 0);
        assert_eq!(params.slot_number(epoch + 2_999), 0);
        assert_eq!(params.slot_number(epoch + 3_000), 1);
        assert_eq!(params.owner_at(epoch + 3_000 * 21), 1);
        assert_eq!(params.slot_number(epoch - 1), -1);
        assert_eq!(params.owner_at(epoch - 1), 19);
    }

    #[test]
    fn test_turn_taken_once_per_slot() {
        let params = SlotParams::default();
        let slot_3 = params.epoch_ms + 3 * 3_000;
        let mut turn = SlotTurn::new(3);

        assert!(turn.take(&params, slot_3));
        assert!(!turn.take(&params, slot_3 + 500));
        // Slot 4 belongs to someone else
        assert!(!turn.take(&params, slot_3 + 3_000));
        // Slot 23 is ours again
        assert!(turn.take(&params, slot_3 + 20 * 3_000));
    }
}
