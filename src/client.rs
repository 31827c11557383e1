// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command layer a host integration drives (spec §6): `Read`/`Write`/
//! `Lock`/`SendPhy` submission entry points, `CancelByGeneration`/
//! `CancelAll`, `PrepareTransactionContext`, and `GetCompletionQueue`, plus
//! the hardware-event entry points (`on_at_completion`/`on_ar_response`/
//! `on_timeout`/`on_self_id_complete`/`on_synthetic_bus_reset`) a workloop
//! calls as interrupts and timers fire. `Client` is the one object that
//! owns every piece the submitter and manager need -- labels, generation,
//! transaction slots, the AT-Request context, and its DMA slab -- so a host
//! integration has a single handle to construct and drive.

use crate::ar::BufferRing;
use crate::borrow_cell::BorrowCell;
use crate::completion::CompletionQueue;
use crate::context::AtContext;
use crate::descriptor::DescriptorRing;
use crate::dma::DmaSlab;
use crate::error::{AsyncError, AsyncResult};
use crate::generation::GenerationTracker;
use crate::hw::{ContextRegisters, IoFence, ResponseSender};
use crate::label::{LabelAllocator, MAX_LABELS};
use crate::manager::{ArResponse, AtCompletion, TransactionManager};
use crate::ohci_regs::TCode;
use crate::packet::LockOp;
use crate::router::{self, ResponseKind};
use crate::submitter::{self, RequestParams, TransactionContext};
use crate::transaction::{MatchKey, NodeId, Outcome, TLabel};

/// A submitted request's handle, per spec §6 (`Read`/`Write`/`Lock`
/// return an `AsyncHandle`). The label doubles as the handle, since it is
/// already the unique key into the transaction manager's slot array.
pub type AsyncHandle = TLabel;

/// Capacity of the completion queue returned by [`Client::completion_queue`].
/// Matches the transaction manager's 64 slots: in the worst case every slot
/// completes before anything drains the queue.
pub const COMPLETION_QUEUE_CAPACITY: usize = MAX_LABELS as usize;

/// Outcome of a completed transaction as handed to a client dispatch queue
/// (spec §5 "Client dispatch queue(s) consume completion-queue tokens"),
/// distinct from the immediate per-transaction `ResponseHandler` callback:
/// this is the record an external drain loop sees, not the same-stack
/// callback invoked on the workloop thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    Error(AsyncError),
}

/// One completion-queue entry: the caller-supplied dispatch tag from
/// `RequestParams::handler_ctx`/the `handler_ctx` parameter below, plus the
/// outcome. No payload bytes travel through this queue -- a terminal
/// `Outcome::Success` payload is only valid for the duration of the
/// `ResponseHandler` callback that already ran, so a queue of `Copy` tokens
/// carries a status, not the borrowed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionToken {
    pub handler_ctx: u32,
    pub status: CompletionStatus,
}

static COMPLETION_QUEUE: BorrowCell<CompletionQueue<CompletionToken, COMPLETION_QUEUE_CAPACITY>> =
    BorrowCell::new(CompletionQueue::new());

/// The `ResponseHandler` every `Client` submission registers: pushes a
/// [`CompletionToken`] onto the single process-wide completion queue rather
/// than doing any per-caller dispatch itself, since `ResponseHandler` is a
/// plain function pointer with no captured state (spec §3: "enough for a
/// client layer to dispatch... without capturing environment").
fn enqueue_completion(handler_ctx: u32, outcome: Outcome<'_>) {
    let status = match outcome {
        Outcome::Success { .. } => CompletionStatus::Success,
        Outcome::Error(e) => CompletionStatus::Error(e),
    };
    let mut queue = COMPLETION_QUEUE.borrow_mut();
    queue.push(CompletionToken { handler_ctx, status });
}

/// Owns every collaborator the submission and completion pipelines need for
/// one AT-Request context: the label allocator, generation tracker,
/// transaction manager, AT context FSM, its backing DMA slab, and the
/// AR-Request/AR-Response buffer-fill rings (spec §4.6). `AR_N`/`AR_SIZE`
/// are shared by both AR rings for simplicity -- a host with asymmetric
/// request/response traffic can still round each up to the same buffer
/// count and size without losing correctness, just some buffer memory.
pub struct Client<
    R: ContextRegisters,
    F: IoFence,
    const N: usize,
    const SIZE: usize,
    const AR_N: usize,
    const AR_SIZE: usize,
> {
    labels: LabelAllocator,
    generation: GenerationTracker,
    manager: TransactionManager,
    at_request: AtContext<R, F, N>,
    slab: DmaSlab<SIZE>,
    ar_request: BufferRing<AR_N, AR_SIZE>,
    ar_response: BufferRing<AR_N, AR_SIZE>,
}

impl<
        R: ContextRegisters,
        F: IoFence,
        const N: usize,
        const SIZE: usize,
        const AR_N: usize,
        const AR_SIZE: usize,
    > Client<R, F, N, SIZE, AR_N, AR_SIZE>
{
    /// `ring_base_iova32` and `slab_base_iova32` are the device-visible
    /// addresses of the AT-Request descriptor ring and the DMA slab backing
    /// its header/payload regions, established once by whatever maps them
    /// (spec §6: "allocates DMA-capable buffers returning a (CPU virtual,
    /// device IOVA) pair").
    pub fn new(regs: R, fence: F, ring_base_iova32: u32, slab_base_iova32: u32) -> Self {
        let mut at_request = AtContext::new(regs, fence);
        at_request.ring_mut().set_base_iova32(ring_base_iova32);

        let mut manager = TransactionManager::new();
        manager.initialize();

        // The completion queue is process-wide (spec §6 `GetCompletionQueue`
        // hands back the same queue to every caller), so it is activated
        // here rather than left for a caller to remember; both calls are
        // idempotent if more than one `Client` is constructed.
        let mut queue = COMPLETION_QUEUE.borrow_mut();
        queue.activate();
        queue.set_client_bound();
        drop(queue);

        Self {
            labels: LabelAllocator::new(),
            generation: GenerationTracker::new(),
            manager,
            at_request,
            slab: DmaSlab::new(slab_base_iova32),
            ar_request: BufferRing::new(),
            ar_response: BufferRing::new(),
        }
    }

    pub fn at_context(&self) -> &AtContext<R, F, N> {
        &self.at_request
    }

    pub fn at_context_mut(&mut self) -> &mut AtContext<R, F, N> {
        &mut self.at_request
    }

    pub fn ring(&self) -> &DescriptorRing<N> {
        self.at_request.ring()
    }

    /// Returns the current bus state or `NotReady` before the first self-ID
    /// complete (spec §6 `PrepareTransactionContext`).
    pub fn prepare_transaction_context(&self) -> AsyncResult<TransactionContext> {
        submitter::prepare_transaction_context(&self.generation, &self.labels)
    }

    /// Hands back the process-wide completion queue (spec §6
    /// `GetCompletionQueue`). Matches `BorrowCell`'s single-borrow contract:
    /// the returned guard must be dropped before the next completion can be
    /// enqueued, so callers should drain it and let it go rather than
    /// holding it across a dispatch callback.
    pub fn completion_queue(
        &self,
    ) -> crate::borrow_cell::BorrowGuard<'static, CompletionQueue<CompletionToken, COMPLETION_QUEUE_CAPACITY>>
    {
        COMPLETION_QUEUE.borrow_mut()
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &mut self,
        tcode: TCode,
        destination_id: NodeId,
        offset: u64,
        priority: u8,
        write_payload: &[u8],
        read_length: u16,
        extended_tcode: Option<LockOp>,
        now_us: u64,
        timeout_us: u64,
        handler_ctx: u32,
    ) -> AsyncResult<AsyncHandle> {
        submitter::submit_request(
            &mut self.labels,
            &self.generation,
            &mut self.manager,
            &mut self.at_request,
            &mut self.slab,
            now_us,
            RequestParams {
                destination_id,
                tcode,
                offset,
                priority,
                retry: 0,
                write_payload,
                read_length,
                extended_tcode,
                handler: enqueue_completion,
                handler_ctx,
                timeout_us,
            },
        )
    }

    /// Issues a quadlet or block read depending on `length` (spec §6
    /// `Read`).
    #[allow(clippy::too_many_arguments)]
    pub fn read(
        &mut self,
        destination_id: NodeId,
        offset: u64,
        length: u16,
        priority: u8,
        now_us: u64,
        timeout_us: u64,
        handler_ctx: u32,
    ) -> AsyncResult<AsyncHandle> {
        let tcode = if length == 4 {
            TCode::ReadQuadlet
        } else {
            TCode::ReadBlock
        };
        self.submit(
            tcode,
            destination_id,
            offset,
            priority,
            &[],
            length,
            None,
            now_us,
            timeout_us,
            handler_ctx,
        )
    }

    /// Issues a quadlet or block write depending on `payload.len()` (spec
    /// §6 `Write`).
    #[allow(clippy::too_many_arguments)]
    pub fn write(
        &mut self,
        destination_id: NodeId,
        offset: u64,
        payload: &[u8],
        priority: u8,
        now_us: u64,
        timeout_us: u64,
        handler_ctx: u32,
    ) -> AsyncResult<AsyncHandle> {
        let tcode = if payload.len() == 4 {
            TCode::WriteQuadlet
        } else {
            TCode::WriteBlock
        };
        self.submit(
            tcode,
            destination_id,
            offset,
            priority,
            payload,
            0,
            None,
            now_us,
            timeout_us,
            handler_ctx,
        )
    }

    /// Issues a lock request (spec §6 `Lock`).
    #[allow(clippy::too_many_arguments)]
    pub fn lock(
        &mut self,
        destination_id: NodeId,
        offset: u64,
        op: LockOp,
        payload: &[u8],
        priority: u8,
        now_us: u64,
        timeout_us: u64,
        handler_ctx: u32,
    ) -> AsyncResult<AsyncHandle> {
        self.submit(
            TCode::LockRequest,
            destination_id,
            offset,
            priority,
            payload,
            0,
            Some(op),
            now_us,
            timeout_us,
            handler_ctx,
        )
    }

    /// Sends a PHY packet carrying `quadlet` as its one data word (spec §6
    /// `SendPhy`). PHY packets have no meaningful destination node or
    /// offset on the wire; `destination_id`/`offset` are accepted only
    /// because this port's header layout is uniform across tcodes (see
    /// `submitter` module docs) and are otherwise ignored by the receiver.
    pub fn send_phy(
        &mut self,
        quadlet: [u8; 4],
        now_us: u64,
        timeout_us: u64,
        handler_ctx: u32,
    ) -> AsyncResult<AsyncHandle> {
        self.submit(
            TCode::Phy,
            0,
            0,
            0,
            &quadlet,
            0,
            None,
            now_us,
            timeout_us,
            handler_ctx,
        )
    }

    /// Feeds an AT-context completion into the manager, freeing the label
    /// if the transaction reached a terminal state (spec §4.1).
    pub fn on_at_completion(&mut self, completion: AtCompletion) -> AsyncResult<bool> {
        let extracted = self.manager.on_at_completion(completion)?;
        if extracted {
            self.labels.free(completion.label);
        }
        Ok(extracted)
    }

    /// Feeds a routed AR-response packet into the manager, freeing the
    /// label if a matching transaction completed (spec §4.1).
    pub fn on_ar_response(&mut self, response: ArResponse<'_>) -> bool {
        Self::complete_ar_response(&mut self.manager, &mut self.labels, response)
    }

    /// Shared body of `on_ar_response`/`on_ar_response_interrupt`, taking
    /// only the two fields it needs so the interrupt path can call it while
    /// a buffer-region slice borrowed from `self.ar_response` is still alive
    /// (a `&mut self` method call would conflict with that borrow).
    fn complete_ar_response(
        manager: &mut TransactionManager,
        labels: &mut LabelAllocator,
        response: ArResponse<'_>,
    ) -> bool {
        let label = response.key.label;
        let completed = manager.on_ar_response(response);
        if completed {
            labels.free(label);
        }
        completed
    }

    /// Drains one filled AR-Response buffer: routes its packets and feeds
    /// each into the transaction manager, then recycles the buffer back to
    /// hardware (spec §4.6). Returns whether any transaction completed.
    pub fn on_ar_response_interrupt(&mut self) -> AsyncResult<bool> {
        let Some(filled) = self.ar_response.dequeue() else {
            return Ok(false);
        };
        let full = self.ar_response.data(filled.index);
        let region = &full[filled.start..filled.start + filled.new_len];
        let generation = self.labels.current_generation();

        // Disjoint field borrows (not a whole-`self` reborrow) so `region`
        // -- which still points into `self.ar_response` -- stays valid
        // alongside mutable access to the other two fields.
        let manager = &mut self.manager;
        let labels = &mut self.labels;
        let mut any_completed = false;
        router::route_buffer(region, |view| {
            let response = ArResponse {
                key: MatchKey {
                    node_id: view.source_id,
                    generation,
                    label: view.t_label,
                },
                rcode: view.rcode,
                payload: view.payload,
            };
            if Self::complete_ar_response(manager, labels, response) {
                any_completed = true;
            }
        });

        self.ar_response.recycle(filled.index)?;
        Ok(any_completed)
    }

    /// Drains one filled AR-Request buffer (spec §4.6). A synthetic
    /// bus-reset packet (tcode 0xE, event 0x09, OHCI 1.1 §C.3) is detected
    /// from the descriptor's `xferStatus` and handled directly; everything
    /// else is routed to per-packet write-response dispatch. Returns
    /// whether a response was sent.
    pub fn on_ar_request_interrupt<S: ResponseSender>(&mut self, sender: &mut S) -> AsyncResult<bool> {
        let Some(filled) = self.ar_request.dequeue() else {
            return Ok(false);
        };

        let event_code = (self.ar_request.descriptor(filled.index).xfer_status() as u32
            & crate::ohci_regs::EVENT_CODE_MASK) as u8;
        if crate::ar::is_synthetic_bus_reset(event_code) {
            let full = self.ar_request.data(filled.index);
            let region = &full[filled.start..filled.start + filled.new_len];
            // The synthetic bus-reset packet's one data quadlet carries the
            // new 8-bit generation in its low byte (OHCI 1.1 §C.3's layout
            // for this event, not otherwise specified by the packet
            // header fields the router understands).
            let gen8 = (region.len() >= 4).then(|| region[3]);
            if let Some(gen8) = gen8 {
                self.on_synthetic_bus_reset(gen8);
            }
            self.ar_request.recycle(filled.index)?;
            return Ok(true);
        }

        let Some(local_node_id) = self.generation.get_current_state(&self.labels).local_node_id
        else {
            self.ar_request.recycle(filled.index)?;
            return Ok(false);
        };

        let full = self.ar_request.data(filled.index);
        let region = &full[filled.start..filled.start + filled.new_len];
        let mut dispatched = false;
        router::route_buffer(region, |view| {
            if let ResponseKind::Ack(rcode) = router::default_response_kind(view.tcode_raw) {
                if submitter::dispatch_write_response(&view, local_node_id, rcode, sender).is_ok() {
                    dispatched = true;
                }
            }
        });

        self.ar_request.recycle(filled.index)?;
        Ok(dispatched)
    }

    /// Runs the timeout/retry policy for `label`, freeing it if the
    /// transaction timed out terminally (spec §4.1 `OnTimeout`).
    pub fn on_timeout(&mut self, label: TLabel) -> bool {
        let timed_out = self.manager.on_timeout(label);
        if timed_out {
            self.labels.free(label);
        }
        timed_out
    }

    /// Records the local node ID established by a self-ID complete (spec
    /// §4.3).
    pub fn on_self_id_complete(&mut self, node_id: NodeId) {
        self.generation.on_self_id_complete(node_id);
    }

    /// Handles the synthetic bus-reset packet delivered on the AR-Request
    /// context: rolls the extended generation, then cancels every
    /// transaction from the generation just left behind and frees their
    /// labels (spec.md §4.6: "cancel all transactions from the prior
    /// generation and free their labels").
    pub fn on_synthetic_bus_reset(&mut self, gen8: u8) {
        let prior_generation = self.labels.current_generation();
        self.generation
            .on_synthetic_bus_reset(&mut self.labels, gen8);
        self.cancel_by_generation(prior_generation);
    }

    /// Cancels every transaction whose generation matches `gen`, freeing
    /// their labels (spec §5 `CancelByGeneration`).
    pub fn cancel_by_generation(&mut self, gen: u16) {
        let Self { manager, labels, .. } = self;
        manager.cancel_by_generation(gen, |label| labels.free(label));
    }

    /// Cancels every live transaction regardless of generation, freeing
    /// every label (spec §5 `CancelAllAndFreeLabels`).
    pub fn cancel_all(&mut self) {
        let Self { manager, labels, .. } = self;
        manager.cancel_all(|label| labels.free(label));
        labels.clear_bitmap();
    }
}
