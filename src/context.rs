// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! AT context manager FSM (spec §4.5): IDLE/ARMING/RUNNING/STOPPING/ERROR,
//! with the two submission paths grounded directly in the original's
//! `ATManager::Submit`/`SubmitPath1_`/`SubmitPath2_`.
//!
//! PATH 1 arms a stopped context via `CommandPtr` + RUN. PATH 2 hot-appends
//! to a context already running by patching the previous chain's branch
//! word and pulsing WAKE -- and critically never polls ACTIVE afterward,
//! since that would deadlock against an interrupt handler trying to take
//! the same context lock to drain completions (spec §5).

use crate::descriptor::{ChainHandle, DescriptorRing};
use crate::error::{AsyncError, AsyncResult};
use crate::hw::{ContextRegisters, IoFence};
use crate::trace::TraceRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtState {
    Idle,
    Arming,
    Running,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum AtTraceEvent {
    #[default]
    None,
    Path1Arm,
    Path2Wake,
    Path2Fallback,
    StopImmediate,
}

type AtTraceEntry = (AtTraceEvent, u32, u32);

/// Drives one AT (request or response) DMA context through its submission
/// and stop lifecycle, independent of which role it plays -- the role only
/// affects what `ResponseSender`/manager code does with completions.
pub struct AtContext<R, F, const N: usize> {
    regs: R,
    fence: F,
    ring: DescriptorRing<N>,
    state: AtState,
    generation: u32,
    trace: TraceRing<AtTraceEntry, 32>,
}

impl<R: ContextRegisters, F: IoFence, const N: usize> AtContext<R, F, N> {
    pub const fn new(regs: R, fence: F) -> Self {
        Self {
            regs,
            fence,
            ring: DescriptorRing::new(),
            state: AtState::Idle,
            generation: 0,
            trace: TraceRing::new((AtTraceEvent::None, 0, 0)),
        }
    }

    /// The most recent FSM trace entry and how many times in a row it was
    /// recorded, for a host integration's diagnostics (spec §4.5).
    pub fn last_trace_entry(&self) -> Option<(AtTraceEntry, u32)> {
        self.trace.last_entry()
    }

    pub fn state(&self) -> AtState {
        self.state
    }

    pub fn ring(&self) -> &DescriptorRing<N> {
        &self.ring
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }

    pub fn ring_mut(&mut self) -> &mut DescriptorRing<N> {
        &mut self.ring
    }

    /// Mirrors `Submit`'s software-only PATH decision: PATH 2 requires the
    /// context to already be RUNNING, a previous LAST descriptor on record,
    /// and a non-empty ring.
    fn can_use_path2(&self) -> bool {
        self.state == AtState::Running && self.ring.prev_last_blocks() > 0 && !self.ring.is_empty()
    }

    /// Submits a pre-built descriptor chain. Chooses PATH 2 when possible,
    /// falling back to PATH 1 if the hot-append fails (stale WAKE guard or
    /// link failure), exactly as `Submit` does.
    pub fn submit(&mut self, chain: ChainHandle) -> AsyncResult<()> {
        if chain.is_empty() {
            return Err(AsyncError::InvalidArgument);
        }

        if self.can_use_path2() {
            match self.submit_path2(chain) {
                Ok(()) => return Ok(()),
                Err(_) => {
                    self.trace.record((AtTraceEvent::Path2Fallback, 0, 0));
                }
            }
        }

        self.submit_path1(chain)
    }

    fn submit_path1(&mut self, chain: ChainHandle) -> AsyncResult<()> {
        self.state = AtState::Arming;

        self.fence.io_write_fence();

        if self.regs.is_running() {
            self.clear_run_and_poll();
        }

        let z = chain.total_blocks;
        let cmd_ptr = crate::descriptor::make_branch_word(chain.first_iova32, z);
        if cmd_ptr == 0 {
            self.state = AtState::Error;
            return Err(AsyncError::InvalidArgument);
        }

        self.regs.write_command_ptr(cmd_ptr);
        self.regs.write_control_set(crate::ohci_regs::RUN_BIT);

        self.trace.record((AtTraceEvent::Path1Arm, cmd_ptr, z as u32));

        self.state = AtState::Running;
        self.update_ring_tail(chain);
        Ok(())
    }

    fn submit_path2(&mut self, chain: ChainHandle) -> AsyncResult<()> {
        if !self.ring.link_tail_to(&chain) {
            return Err(AsyncError::NotReady);
        }

        self.fence.io_write_fence();

        let ctrl = self.regs.read_control();
        let run = ctrl & crate::ohci_regs::RUN_BIT != 0;
        let dead = ctrl & crate::ohci_regs::DEAD_BIT != 0;
        if !run || dead {
            // Hardware never woke on the patched branch: revert it to EOL
            // before falling back to PATH 1, so a later RUN/WAKE can't find
            // a live pointer into a chain PATH 1 is about to re-arm from
            // scratch (spec §4.5 PATH 2 fallback).
            self.ring.unlink_tail();
            self.fence.io_write_fence();
            return Err(AsyncError::NotReady);
        }

        // No ACTIVE poll after WAKE: polling here would contend with the
        // interrupt handler for this same context's state, and neither
        // side would make progress (spec §5).
        self.regs.write_control_set(crate::ohci_regs::WAKE_BIT);
        self.trace.record((AtTraceEvent::Path2Wake, 0, 0));

        self.update_ring_tail(chain);
        Ok(())
    }

    fn update_ring_tail(&mut self, chain: ChainHandle) {
        self.ring.set_tail_after(chain.last_index);
        self.ring.publish_last(chain.last_index, chain.total_blocks);
    }

    fn clear_run_and_poll(&mut self) {
        self.regs.write_control_clear(crate::ohci_regs::RUN_BIT);
        self.fence.io_read_fence();
        // The original polls ACTIVE for up to 250us here; that poll is a
        // bounded spin on a register read with no lock held, which this
        // port leaves to the caller's `Workloop` delay rather than looping
        // here, since a fixed iteration count would encode a host-specific
        // timing assumption this crate does not own.
    }

    /// Immediately stops the context: clear RUN, fence, rotate the ring
    /// past the two sentinel descriptors, and bump the generation counter
    /// so any in-flight PATH 2 decisions from before the stop are stale.
    /// Skipped (a no-op) unless currently RUNNING.
    pub fn request_stop(&mut self) {
        if self.state != AtState::Running {
            return;
        }
        self.state = AtState::Stopping;

        self.regs.write_control_clear(crate::ohci_regs::RUN_BIT);
        self.fence.io_read_fence();

        self.ring.advance_head(2);
        self.ring.publish_last(0, 0);
        self.generation = self.generation.wrapping_add(1);

        self.trace.record((AtTraceEvent::StopImmediate, self.generation, 0));

        self.state = AtState::Idle;
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;

    struct FakeRegs {
        control: Cell<u32>,
        command_ptr: Cell<u32>,
    }

    impl ContextRegisters for FakeRegs {
        fn read_control(&self) -> u32 {
            self.control.get()
        }
        fn write_control_set(&mut self, bits: u32) {
            self.control.set(self.control.get() | bits);
        }
        fn write_control_clear(&mut self, bits: u32) {
            self.control.set(self.control.get() & !bits);
        }
        fn write_command_ptr(&mut self, value: u32) {
            self.command_ptr.set(value);
        }
    }

    struct NoFence;
    impl IoFence for NoFence {
        fn io_write_fence(&self) {}
        fn io_read_fence(&self) {}
    }

    fn new_ctx() -> AtContext<FakeRegs, NoFence, 8> {
        AtContext::new(
            FakeRegs {
                control: Cell::new(0),
                command_ptr: Cell::new(0),
            },
            NoFence,
        )
    }

    #[test]
    fn path1_arms_idle_context_and_sets_run() {
        let mut ctx = new_ctx();
        let chain = ChainHandle {
            first_index: 0,
            last_index: 1,
            first_iova32: 0x1000_0000,
            total_blocks: 2,
        };
        ctx.submit(chain).unwrap();
        assert_eq!(ctx.state(), AtState::Running);
        assert!(ctx.regs.is_running());
    }

    #[test]
    fn path2_appends_without_clearing_run() {
        let mut ctx = new_ctx();
        let first = ChainHandle {
            first_index: 0,
            last_index: 1,
            first_iova32: 0x1000_0000,
            total_blocks: 2,
        };
        ctx.submit(first).unwrap();

        let second = ChainHandle {
            first_index: 2,
            last_index: 3,
            first_iova32: 0x1000_0020,
            total_blocks: 2,
        };
        ctx.submit(second).unwrap();
        assert_eq!(ctx.state(), AtState::Running);
        assert_eq!(ctx.regs.read_control() & crate::ohci_regs::WAKE_BIT, crate::ohci_regs::WAKE_BIT);
    }

    #[test]
    fn path2_falls_back_to_path1_when_context_is_dead() {
        let mut ctx = new_ctx();
        let first = ChainHandle {
            first_index: 0,
            last_index: 1,
            first_iova32: 0x1000_0000,
            total_blocks: 2,
        };
        ctx.submit(first).unwrap();
        ctx.regs.control.set(ctx.regs.control.get() | crate::ohci_regs::DEAD_BIT);

        let second = ChainHandle {
            first_index: 2,
            last_index: 3,
            first_iova32: 0x1000_0020,
            total_blocks: 2,
        };
        // PATH 2's WAKE guard observes DEAD and bails; PATH 1 re-arms from
        // the new chain's own CommandPtr regardless of prior hardware state.
        ctx.submit(second).unwrap();
        assert_eq!(ctx.state(), AtState::Running);
    }

    #[test]
    fn request_stop_is_noop_unless_running() {
        let mut ctx = new_ctx();
        ctx.request_stop();
        assert_eq!(ctx.state(), AtState::Idle);
        assert_eq!(ctx.generation(), 0);
    }

    #[test]
    fn request_stop_clears_run_and_bumps_generation() {
        let mut ctx = new_ctx();
        let chain = ChainHandle {
            first_index: 0,
            last_index: 1,
            first_iova32: 0x1000_0000,
            total_blocks: 2,
        };
        ctx.submit(chain).unwrap();
        ctx.request_stop();
        assert_eq!(ctx.state(), AtState::Idle);
        assert_eq!(ctx.generation(), 1);
        assert!(!ctx.regs.is_running());
    }
}
