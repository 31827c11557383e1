// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collaborator traits this core is built against (spec §6). No
//! hardware-backed implementation lives in this crate -- providing one is
//! out of scope (spec §1 non-goal: no bus-specific glue) -- but the traits
//! are the seam a host integration (or a test fake) implements.

/// One OHCI AT or AR context's register file: `ContextControlSet`,
/// `ContextControlClear`, `CommandPtr` (OHCI 1.1 §3.1.1, §7-9).
pub trait ContextRegisters {
    fn read_control(&self) -> u32;
    fn write_control_set(&mut self, bits: u32);
    fn write_control_clear(&mut self, bits: u32);
    fn write_command_ptr(&mut self, value: u32);

    fn is_running(&self) -> bool {
        self.read_control() & crate::ohci_regs::RUN_BIT != 0
    }

    fn is_active(&self) -> bool {
        self.read_control() & crate::ohci_regs::ACTIVE_BIT != 0
    }

    fn is_dead(&self) -> bool {
        self.read_control() & crate::ohci_regs::DEAD_BIT != 0
    }
}

/// Ordering fences around descriptor/register writes (spec §5: DMA
/// coherence via acquire/release, not cache maintenance).
pub trait IoFence {
    fn io_write_fence(&self);
    fn io_read_fence(&self);
}

/// Cooperative workloop services this core needs from its host: current
/// monotonic time and a short busy-delay used by the stop sequence's
/// 1-microsecond settle (spec §4.5, `RequestStop`).
pub trait Workloop {
    fn now_us(&self) -> u64;
    fn delay_us(&self, us: u32);
}

/// Transmits a response packet built by the router (spec §4.6). Kept
/// separate from `ContextRegisters` since response sends go back through
/// the AT-Response context's own submission path, not a register write.
pub trait ResponseSender {
    fn send_response(&mut self, destination_id: u16, header: &[u8], payload: &[u8]) -> crate::error::AsyncResult<()>;
}
