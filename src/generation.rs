// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus generation and local node-ID tracking (spec §4.3).
//!
//! The hardware's bus generation is an 8-bit counter that wraps. We keep a
//! 16-bit *extended* generation so that stale `MatchKey`s from before a wrap
//! can still be told apart from current ones: the high byte is bumped
//! whenever the incoming 8-bit generation is numerically *less* than the
//! low byte we already have, which can only happen by wrapping.

use crate::label::LabelAllocator;
use crate::transaction::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusState {
    pub generation: u16,
    pub local_node_id: Option<NodeId>,
}

/// Couples the extended generation (delegated to [`LabelAllocator`], which is
/// the single owner of that field) with the local node ID, which only this
/// tracker owns.
#[derive(Debug)]
pub struct GenerationTracker {
    local_node_id: Option<NodeId>,
}

impl Default for GenerationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationTracker {
    pub const fn new() -> Self {
        Self { local_node_id: None }
    }

    /// After hardware self-ID completes, the low 6 bits of the delivered
    /// node ID are the node number and bits 15:6 are the bus number; the
    /// caller (the AR-Request / SelfID-complete collaborator) is expected to
    /// have already assembled the full `NodeId` (spec §4.3, non-goal: full
    /// self-ID quadlet parsing is out of scope per SPEC_FULL §2).
    pub fn on_self_id_complete(&mut self, node_id: NodeId) {
        self.local_node_id = Some(node_id);
    }

    /// On receipt of a synthetic bus-reset packet (AR-Request, tcode 0xE,
    /// event 0x09) carrying the new 8-bit generation: clear the local node
    /// ID (it will be re-established by a subsequent self-ID complete) and
    /// roll the extended generation if the 8-bit value wrapped backward.
    pub fn on_synthetic_bus_reset(&mut self, labels: &mut LabelAllocator, gen8: u8) {
        self.local_node_id = None;
        let current = labels.current_generation();
        let current_low = (current & 0xff) as u8;
        let high = if gen8 < current_low {
            (current >> 8).wrapping_add(1)
        } else {
            current >> 8
        };
        labels.set_generation((high << 8) | gen8 as u16);
    }

    pub fn get_current_state(&self, labels: &LabelAllocator) -> BusState {
        BusState {
            generation: labels.current_generation(),
            local_node_id: self.local_node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_id_sets_node_id() {
        let mut t = GenerationTracker::new();
        let mut labels = LabelAllocator::new();
        t.on_self_id_complete(3);
        assert_eq!(t.get_current_state(&labels).local_node_id, Some(3));
        labels.set_generation(7);
        assert_eq!(t.get_current_state(&labels).generation, 7);
    }

    #[test]
    fn bus_reset_clears_node_id_and_bumps_generation() {
        let mut t = GenerationTracker::new();
        let mut labels = LabelAllocator::new();
        t.on_self_id_complete(5);
        labels.set_generation(0x00FE);
        t.on_synthetic_bus_reset(&mut labels, 0xFF);
        assert_eq!(t.get_current_state(&labels).local_node_id, None);
        // 0xFF >= 0xFE, no wraparound yet.
        assert_eq!(labels.current_generation(), 0x00FF);
    }

    #[test]
    fn bus_reset_wraparound_bumps_high_byte() {
        let mut t = GenerationTracker::new();
        let mut labels = LabelAllocator::new();
        labels.set_generation(0x02FF);
        // New 8-bit generation (0x01) is less than current low byte (0xFF):
        // the 8-bit counter wrapped, so the extended high byte rolls.
        t.on_synthetic_bus_reset(&mut labels, 0x01);
        assert_eq!(labels.current_generation(), 0x0301);
    }
}
