// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The authoritative per-request object (spec §3, `Transaction`).

use core::sync::atomic::{AtomicBool, Ordering};

use crate::error::AsyncError;
use crate::ohci_regs::{AckCode, TCode};

/// 6-bit transaction label (0-63), matching request to response on the bus.
pub type TLabel = u8;
/// 16-bit node address (bus number : node number), destination/source of a
/// packet.
pub type NodeId = u16;

/// `(NodeID, BusGeneration, TLabel)` -- the response-matching key (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchKey {
    pub node_id: NodeId,
    pub generation: u16,
    pub label: TLabel,
}

/// Per-transaction policy choosing which event terminates it (spec §3, §9
/// open question on `CompleteOnPHY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStrategy {
    /// AT completion alone is sufficient (writes with `ack_complete`).
    CompleteOnAT,
    /// Wait for an AR response packet (reads, and writes that got
    /// `ack_pending`/tardy-like acks).
    CompleteOnAR,
    /// PHY packets only partially exercise AT completion in the original
    /// (spec §9 open question); treated as AT-only here pending further
    /// data, exactly as the spec recommends.
    CompleteOnPHY,
}

/// Lifecycle states (spec §3). Terminal states are `Completed`, `Failed`,
/// `TimedOut`, `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Submitted,
    ATPosted,
    ATCompleted,
    AwaitingAR,
    ARReceived,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TransactionState {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Completed
                | TransactionState::Failed
                | TransactionState::TimedOut
                | TransactionState::Cancelled
        )
    }
}

/// Outcome handed to a transaction's response handler on a terminal
/// transition.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    Success { payload: &'a [u8] },
    Error(AsyncError),
}

/// A fixed-depth ring of recent state transitions, kept per-transaction for
/// diagnostics (SPEC_FULL §3 supplement).
#[derive(Debug, Clone, Copy)]
pub struct TransitionHistory {
    entries: [Option<(TransactionState, u32)>; 8],
    next: usize,
}

impl TransitionHistory {
    pub const fn new() -> Self {
        Self {
            entries: [None; 8],
            next: 0,
        }
    }

    pub fn push(&mut self, state: TransactionState, timestamp_us: u32) {
        self.entries[self.next] = Some((state, timestamp_us));
        self.next = (self.next + 1) % self.entries.len();
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TransactionState, u32)> {
        self.entries.iter().filter_map(|e| e.as_ref())
    }
}

impl Default for TransitionHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Bound on the inline payload a `Transaction` can own directly. Block
/// writes/locks larger than this live in the DMA slab and are referenced by
/// `DescriptorChain`/`dma` module handles instead; this cap matches a
/// quadlet-ish "a few words" lock payload, the common case for this engine.
pub const INLINE_PAYLOAD_CAP: usize = 16;

/// Owned (or empty, for header-only requests) payload carried by a
/// transaction (spec §3, "Ownership").
#[derive(Debug, Clone, Copy)]
pub struct PayloadHandle {
    buf: [u8; INLINE_PAYLOAD_CAP],
    len: usize,
}

impl PayloadHandle {
    pub const fn empty() -> Self {
        Self {
            buf: [0; INLINE_PAYLOAD_CAP],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, AsyncError> {
        if data.len() > INLINE_PAYLOAD_CAP {
            return Err(AsyncError::InvalidArgument);
        }
        let mut buf = [0u8; INLINE_PAYLOAD_CAP];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self { buf, len: data.len() })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for PayloadHandle {
    fn default() -> Self {
        Self::empty()
    }
}

/// Response handler invoked exactly once on terminal state (spec §3).
/// Boxed trait objects need `alloc`, which this crate avoids, so handlers
/// are plain function pointers plus an opaque `u32` context tag -- enough
/// for a client layer to dispatch to the right `AsyncHandle`/completion slot
/// without capturing environment.
pub type ResponseHandler = fn(ctx: u32, outcome: Outcome<'_>);

fn noop_handler(_ctx: u32, _outcome: Outcome<'_>) {}

/// The authoritative per-request object, indexed by a 6-bit `TLabel`
/// (spec §3).
pub struct Transaction {
    pub label: TLabel,
    pub generation: u16,
    pub node_id: NodeId,
    pub tcode: TCode,
    pub strategy: CompletionStrategy,
    pub deadline_us: u64,
    pub last_ack: Option<AckCode>,
    pub retry_count: u8,
    pub payload: PayloadHandle,
    pub handler: ResponseHandler,
    pub handler_ctx: u32,
    pub state: TransactionState,
    pub history: TransitionHistory,
    completion_taken: AtomicBool,
}

impl Transaction {
    pub fn new(
        label: TLabel,
        generation: u16,
        node_id: NodeId,
        tcode: TCode,
        strategy: CompletionStrategy,
        deadline_us: u64,
    ) -> Self {
        Self {
            label,
            generation,
            node_id,
            tcode,
            strategy,
            deadline_us,
            last_ack: None,
            retry_count: 0,
            payload: PayloadHandle::empty(),
            handler: noop_handler,
            handler_ctx: 0,
            state: TransactionState::Created,
            history: TransitionHistory::new(),
            completion_taken: AtomicBool::new(false),
        }
    }

    pub fn match_key(&self) -> MatchKey {
        MatchKey {
            node_id: self.node_id,
            generation: self.generation,
            label: self.label,
        }
    }

    /// Rejects illegal transitions (spec §3: "Illegal transitions are
    /// rejected"). A transition out of a terminal state is always illegal.
    pub fn transition_to(&mut self, next: TransactionState, now_us: u32) -> Result<(), AsyncError> {
        if self.state.is_terminal() {
            return Err(AsyncError::IllegalState);
        }
        self.state = next;
        self.history.push(next, now_us);
        Ok(())
    }

    /// Compare-and-swap guard ensuring exactly one of {AT-side, AR-side}
    /// completes this transaction (spec §3 invariant, §5 "split completion
    /// race"). Returns `true` exactly once, on the first caller to claim it.
    pub fn try_claim_completion(&self) -> bool {
        self.completion_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn completion_taken(&self) -> bool {
        self.completion_taken.load(Ordering::Acquire)
    }

    pub fn extend_deadline(&mut self, extra_us: u64) {
        self.deadline_us += extra_us;
    }

    /// Invokes the stored handler exactly once for a terminal transition.
    /// Callers must only call this after extracting the transaction from
    /// the manager's array (spec §4.1: "invoked outside the manager lock to
    /// avoid re-entrancy").
    pub fn fire_handler(&self, outcome: Outcome<'_>) {
        (self.handler)(self.handler_ctx, outcome);
    }
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Transaction")
            .field("label", &self.label)
            .field("generation", &self.generation)
            .field("node_id", &self.node_id)
            .field("tcode", &self.tcode)
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(strategy: CompletionStrategy) -> Transaction {
        Transaction::new(3, 1, 0xFFC0, TCode::ReadQuadlet, strategy, 1_000)
    }

    #[test]
    fn terminal_state_rejects_further_transitions() {
        let mut t = make(CompletionStrategy::CompleteOnAR);
        t.transition_to(TransactionState::Submitted, 0).unwrap();
        t.transition_to(TransactionState::Completed, 1).unwrap();
        assert_eq!(
            t.transition_to(TransactionState::Failed, 2),
            Err(AsyncError::IllegalState)
        );
    }

    #[test]
    fn completion_claim_is_exactly_once() {
        let t = make(CompletionStrategy::CompleteOnAR);
        assert!(t.try_claim_completion());
        assert!(!t.try_claim_completion());
    }

    #[test]
    fn history_ring_wraps_without_panicking() {
        let mut t = make(CompletionStrategy::CompleteOnAT);
        for i in 0..20u32 {
            t.transition_to(TransactionState::Submitted, i).ok();
            // Submitted -> Submitted is a no-op transition for this test;
            // real FSM code never re-enters the same state, but the ring
            // itself must tolerate more pushes than its capacity.
            t.state = TransactionState::Created;
        }
        assert_eq!(t.history.iter().count(), 8);
    }

    #[test]
    fn payload_handle_rejects_oversize_slice() {
        let big = [0u8; INLINE_PAYLOAD_CAP + 1];
        assert_eq!(
            PayloadHandle::from_slice(&big).unwrap_err(),
            AsyncError::InvalidArgument
        );
    }
}
