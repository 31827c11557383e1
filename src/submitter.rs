// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Glues the label allocator, generation tracker, transaction manager,
//! packet builder, descriptor ring, and DMA slab into the single call a
//! command layer makes to put a request on the wire (spec §6, grounded in
//! `AsyncCommand<Derived>::Submit`'s eleven-step sequence) and the
//! matching call a responder makes to answer a write request (grounded in
//! `ResponseSender::SendWriteResponse`).
//!
//! Unlike the original, this port always uses `KEY_STANDARD` descriptors
//! with header bytes copied into the DMA slab rather than `KEY_IMMEDIATE`
//! descriptors carrying header bytes inline in the descriptor block itself
//! -- modeling the immediate encoding's extra descriptor-block layout
//! didn't earn its keep against the one extra slab copy it would save.

use crate::descriptor::{self, ChainHandle};
use crate::dma::DmaSlab;
use crate::error::{AsyncError, AsyncResult};
use crate::generation::GenerationTracker;
use crate::hw::{ContextRegisters, IoFence};
use crate::label::LabelAllocator;
use crate::manager::TransactionManager;
use crate::ohci_regs::TCode;
use crate::packet::{self, HeaderParams, LockOp};
use crate::router::PacketView;
use crate::transaction::{CompletionStrategy, NodeId, ResponseHandler, TLabel, Transaction};

/// Bus state a submission is built against (spec §6 `PrepareTransactionContext`).
#[derive(Debug, Clone, Copy)]
pub struct TransactionContext {
    pub generation: u16,
    pub local_node_id: NodeId,
}

/// Fails with `NotReady` until a self-ID complete has established a local
/// node ID (spec §4.3): there is no valid source address to put on the
/// wire before that.
pub fn prepare_transaction_context(
    generation: &GenerationTracker,
    labels: &LabelAllocator,
) -> AsyncResult<TransactionContext> {
    let state = generation.get_current_state(labels);
    let local_node_id = state.local_node_id.ok_or(AsyncError::NotReady)?;
    Ok(TransactionContext {
        generation: state.generation,
        local_node_id,
    })
}

/// Everything a caller supplies to submit one request (spec §6
/// `Read`/`Write`/`Lock`/`SendPhy`, flattened into one call since this
/// port has no per-command CRTP hierarchy to dispatch through).
pub struct RequestParams<'a> {
    pub destination_id: NodeId,
    pub tcode: TCode,
    pub offset: u64,
    pub priority: u8,
    pub retry: u8,
    /// Write/lock payload. Ignored for reads.
    pub write_payload: &'a [u8],
    /// Expected response length for block reads. Ignored otherwise.
    pub read_length: u16,
    pub extended_tcode: Option<LockOp>,
    pub handler: ResponseHandler,
    pub handler_ctx: u32,
    pub timeout_us: u64,
}

fn default_strategy(tcode: TCode) -> CompletionStrategy {
    match tcode {
        TCode::ReadQuadlet | TCode::ReadBlock | TCode::LockRequest => {
            CompletionStrategy::CompleteOnAR
        }
        TCode::Phy => CompletionStrategy::CompleteOnPHY,
        _ => CompletionStrategy::CompleteOnAT,
    }
}

/// Submits a request: allocates a label and a transaction slot, builds the
/// wire header, lays out a one- or two-block descriptor chain in the DMA
/// slab, and arms the AT-Request context (spec §6 steps 1-9 collapsed).
/// Returns the allocated label, which doubles as the caller's handle.
#[allow(clippy::too_many_arguments)]
pub fn submit_request<R: ContextRegisters, F: IoFence, const N: usize, const SIZE: usize>(
    labels: &mut LabelAllocator,
    generation: &GenerationTracker,
    manager: &mut TransactionManager,
    ctx: &mut crate::context::AtContext<R, F, N>,
    slab: &mut DmaSlab<SIZE>,
    now_us: u64,
    params: RequestParams<'_>,
) -> AsyncResult<TLabel> {
    let txctx = prepare_transaction_context(generation, labels)?;
    let label = labels.allocate()?;

    let result = submit_request_with_label(manager, ctx, slab, now_us, label, txctx, params);
    if result.is_err() {
        labels.free(label);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn submit_request_with_label<R: ContextRegisters, F: IoFence, const N: usize, const SIZE: usize>(
    manager: &mut TransactionManager,
    ctx: &mut crate::context::AtContext<R, F, N>,
    slab: &mut DmaSlab<SIZE>,
    now_us: u64,
    label: TLabel,
    txctx: TransactionContext,
    params: RequestParams<'_>,
) -> AsyncResult<TLabel> {
    // PHY packets here ride their one data quadlet the same way a quadlet
    // write does, rather than modeling OHCI's separate non-addressed
    // data/~data PHY wire format -- this port's uniform header layout
    // already repurposes fields (destination/offset) for packets that
    // don't really have them (spec §4.4 item 2 groups phy with quadlet
    // read/write/lock as "header-only").
    let embeds_quadlet_payload = matches!(params.tcode, TCode::WriteQuadlet | TCode::Phy);
    let carries_payload = params.tcode.carries_payload();

    if embeds_quadlet_payload && params.write_payload.len() != 4 {
        return Err(AsyncError::InvalidArgument);
    }
    if carries_payload && params.write_payload.is_empty() {
        return Err(AsyncError::InvalidArgument);
    }

    let data_length = if carries_payload {
        params.write_payload.len() as u16
    } else if matches!(params.tcode, TCode::ReadBlock) {
        params.read_length
    } else {
        0
    };

    let header_params = HeaderParams {
        destination_id: params.destination_id,
        source_id: txctx.local_node_id,
        t_label: label,
        retry: params.retry,
        tcode: params.tcode,
        priority: params.priority,
        offset: params.offset,
        data_length,
        extended_tcode: params.extended_tcode,
    };
    let mut header = packet::build_header(&header_params);
    if embeds_quadlet_payload {
        let mut quadlet = [0u8; 4];
        quadlet.copy_from_slice(params.write_payload);
        header.set_quadlet_payload(quadlet);
    }

    let needs_separate_payload = carries_payload;
    let blocks: u8 = if needs_separate_payload { 2 } else { 1 };
    let start = ctx.ring_mut().reserve_blocks(blocks)?;

    let header_region = slab.allocate_region(header.as_slice().len())?;
    slab.region_bytes_mut(header_region)
        .copy_from_slice(header.as_slice());

    let header_desc = ctx.ring().at(start);
    header_desc.set_data_address(header_region.iova32);
    let header_cmd = if needs_separate_payload {
        descriptor::CMD_OUTPUT_MORE
    } else {
        descriptor::CMD_OUTPUT_LAST
    };
    let header_int = if needs_separate_payload {
        descriptor::INT_NEVER
    } else {
        descriptor::INT_ALWAYS
    };
    header_desc.set_control(descriptor::build_control(
        header.as_slice().len() as u16,
        header_cmd,
        descriptor::KEY_STANDARD,
        header_int,
        descriptor::BRANCH_ALWAYS,
    ));
    header_desc.set_branch_word(0);

    let last_index = if needs_separate_payload {
        let payload_region = slab.allocate_region(params.write_payload.len())?;
        slab.region_bytes_mut(payload_region)
            .copy_from_slice(params.write_payload);

        let payload_index = start + 1;
        let payload_desc = ctx.ring().at(payload_index);
        payload_desc.set_data_address(payload_region.iova32);
        payload_desc.set_control(descriptor::build_control(
            params.write_payload.len() as u16,
            descriptor::CMD_OUTPUT_LAST,
            descriptor::KEY_STANDARD,
            descriptor::INT_ALWAYS,
            descriptor::BRANCH_ALWAYS,
        ));
        payload_desc.set_branch_word(0);
        payload_index
    } else {
        start
    };

    let chain = ChainHandle {
        first_index: start,
        last_index,
        first_iova32: ctx.ring().iova32_of(start),
        total_blocks: blocks,
    };

    let strategy = default_strategy(params.tcode);
    let mut txn = Transaction::new(
        label,
        txctx.generation,
        params.destination_id,
        params.tcode,
        strategy,
        now_us + params.timeout_us,
    );
    txn.handler = params.handler;
    txn.handler_ctx = params.handler_ctx;
    txn.transition_to(crate::transaction::TransactionState::Created, 0).ok();
    txn.transition_to(crate::transaction::TransactionState::Submitted, 0).ok();

    manager.allocate(txn)?;

    if let Err(e) = ctx.submit(chain) {
        manager.remove(label);
        return Err(e);
    }

    if let Some(t) = manager.find_mut(label) {
        t.transition_to(crate::transaction::TransactionState::ATPosted, 0).ok();
    }

    Ok(label)
}

/// Builds the `WriteResponse` header for `request` and hands it to the
/// host's `ResponseSender` collaborator (spec §4.6/§6 supplement, grounded
/// in `ResponseSender::SendWriteResponse`). Actually emitting the response
/// onto the AT-Response context is the collaborator's job (spec §6 lists a
/// response sender as an interface *consumed*, not implemented, here) --
/// this function only decides *whether* one is owed and builds its bytes.
/// Broadcast requests (`destination_id == 0xFFFF`) and non-write tcodes are
/// silently skipped, matching the original.
pub fn dispatch_write_response<S: crate::hw::ResponseSender>(
    request: &PacketView<'_>,
    local_node_id: NodeId,
    rcode: u8,
    sender: &mut S,
) -> AsyncResult<()> {
    if request.destination_id == 0xFFFF {
        return Ok(());
    }
    if !matches!(
        TCode::from_raw(request.tcode_raw),
        Some(TCode::WriteQuadlet) | Some(TCode::WriteBlock)
    ) {
        return Ok(());
    }

    let header_params = HeaderParams {
        destination_id: request.source_id,
        source_id: local_node_id,
        t_label: request.t_label,
        retry: 1,
        tcode: TCode::WriteResponse,
        priority: 0,
        offset: (rcode & 0xF) as u64,
        data_length: 0,
        extended_tcode: None,
    };
    let header = packet::build_header(&header_params);
    sender.send_response(request.source_id, header.as_slice(), &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AtContext;
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
        let mut ctx = AtContext::new(
            FakeRegs {
                control: Cell::new(0),
                command_ptr: Cell::new(0),
            },
            NoFence,
        );
        ctx.ring_mut().set_base_iova32(0x5000_0000);
        ctx
    }

    fn no_handler(_ctx: u32, _outcome: crate::transaction::Outcome<'_>) {}

    #[test]
    fn submit_request_fails_before_self_id_complete() {
        let mut labels = LabelAllocator::new();
        let generation = GenerationTracker::new();
        let mut manager = TransactionManager::new();
        manager.initialize();
        let mut ctx = new_ctx();
        let mut slab: DmaSlab<4096> = DmaSlab::new(0x6000_0000);

        let result = submit_request(
            &mut labels,
            &generation,
            &mut manager,
            &mut ctx,
            &mut slab,
            0,
            RequestParams {
                destination_id: 0xFFC1,
                tcode: TCode::ReadQuadlet,
                offset: 0x10,
                priority: 0,
                retry: 0,
                write_payload: &[],
                read_length: 0,
                extended_tcode: None,
                handler: no_handler,
                handler_ctx: 0,
                timeout_us: 1_000_000,
            },
        );
        assert_eq!(result, Err(AsyncError::NotReady));
    }

    #[test]
    fn submit_quadlet_read_allocates_label_and_arms_context() {
        let mut labels = LabelAllocator::new();
        let mut generation = GenerationTracker::new();
        generation.on_self_id_complete(0xFFC0);
        let mut manager = TransactionManager::new();
        manager.initialize();
        let mut ctx = new_ctx();
        let mut slab: DmaSlab<4096> = DmaSlab::new(0x6000_0000);

        let label = submit_request(
            &mut labels,
            &generation,
            &mut manager,
            &mut ctx,
            &mut slab,
            0,
            RequestParams {
                destination_id: 0xFFC1,
                tcode: TCode::ReadQuadlet,
                offset: 0x10,
                priority: 0,
                retry: 0,
                write_payload: &[],
                read_length: 0,
                extended_tcode: None,
                handler: no_handler,
                handler_ctx: 0,
                timeout_us: 1_000_000,
            },
        )
        .unwrap();

        assert!(labels.is_in_use(label));
        assert_eq!(
            manager.find(label).unwrap().state,
            crate::transaction::TransactionState::ATPosted
        );
        assert!(ctx.regs().is_running());
    }

    #[test]
    fn submit_block_write_reserves_two_descriptor_blocks() {
        let mut labels = LabelAllocator::new();
        let mut generation = GenerationTracker::new();
        generation.on_self_id_complete(0xFFC0);
        let mut manager = TransactionManager::new();
        manager.initialize();
        let mut ctx = new_ctx();
        let mut slab: DmaSlab<4096> = DmaSlab::new(0x6000_0000);

        let payload = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF, 0x00, 0x11];
        let label = submit_request(
            &mut labels,
            &generation,
            &mut manager,
            &mut ctx,
            &mut slab,
            0,
            RequestParams {
                destination_id: 0xFFC1,
                tcode: TCode::WriteBlock,
                offset: 0x20,
                priority: 0,
                retry: 0,
                write_payload: &payload,
                read_length: 0,
                extended_tcode: None,
                handler: no_handler,
                handler_ctx: 0,
                timeout_us: 1_000_000,
            },
        )
        .unwrap();

        assert_eq!(
            manager.find(label).unwrap().strategy,
            CompletionStrategy::CompleteOnAT
        );
        assert_eq!(ctx.ring().tail(), 2);
    }

    #[derive(Default)]
    struct FakeResponseSender {
        calls: std::vec::Vec<(u16, std::vec::Vec<u8>)>,
    }

    impl crate::hw::ResponseSender for FakeResponseSender {
        fn send_response(
            &mut self,
            destination_id: u16,
            header: &[u8],
            _payload: &[u8],
        ) -> AsyncResult<()> {
            self.calls.push((destination_id, header.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn write_response_skips_broadcast_destination() {
        let mut sender = FakeResponseSender::default();
        let request = PacketView {
            tcode_raw: TCode::WriteQuadlet as u8,
            destination_id: 0xFFFF,
            source_id: 0xFFC2,
            t_label: 4,
            rcode: 0,
            header: &[],
            payload: &[],
        };
        dispatch_write_response(&request, 0xFFC0, 0, &mut sender).unwrap();
        assert!(sender.calls.is_empty());
    }

    #[test]
    fn write_response_arms_context_for_a_real_write_request() {
        let mut sender = FakeResponseSender::default();
        let request = PacketView {
            tcode_raw: TCode::WriteQuadlet as u8,
            destination_id: 0xFFC0,
            source_id: 0xFFC2,
            t_label: 4,
            rcode: 0x3,
            header: &[],
            payload: &[],
        };
        dispatch_write_response(&request, 0xFFC0, 0x3, &mut sender).unwrap();
        assert_eq!(sender.calls.len(), 1);
        let (destination_id, header) = &sender.calls[0];
        assert_eq!(*destination_id, 0xFFC2);
        assert_eq!(header.len(), 12);
        let q2 = u32::from_be_bytes(header[8..12].try_into().unwrap());
        assert_eq!(crate::packet::extract_rcode(q2), 0x3);
    }
}
