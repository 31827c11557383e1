// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transaction manager (spec §4.1): owns the 64 transaction slots and the
//! two hardware-facing state-machine entry points, `on_at_completion` and
//! `on_ar_response`, plus the timeout retry policy in `on_timeout`.

use crate::error::{AsyncError, AsyncResult};
use crate::label::MAX_LABELS;
use crate::ohci_regs::AckCode;
use crate::transaction::{
    CompletionStrategy, MatchKey, Outcome, TLabel, Transaction, TransactionState,
};

/// Feedback delivered by the AT context manager when a descriptor for this
/// transaction's chain completes (spec §4.1 "OnATCompletion").
#[derive(Debug, Clone, Copy)]
pub struct AtCompletion {
    pub label: TLabel,
    pub ack: AckCode,
    pub event: Option<crate::ohci_regs::EventCode>,
}

/// A response packet routed to the manager by the AR receive path
/// (spec §4.1 "OnARResponse").
#[derive(Debug, Clone, Copy)]
pub struct ArResponse<'a> {
    pub key: MatchKey,
    pub rcode: u8,
    pub payload: &'a [u8],
}

/// Extra time granted to a transaction while we wait for the hardware or
/// target to catch up (spec §4.1 dispatch table, §4.1 `OnTimeout`).
const BUSY_BACKOFF_US: u64 = 200_000;
const NO_ACK_BACKOFF_US: u64 = 250_000;
const AWAITING_AR_BACKOFF_US: u64 = 250_000;

const MAX_BUSY_RETRIES: u8 = 3;
const MAX_NO_ACK_RETRIES: u8 = 2;
const MAX_AWAITING_AR_RETRIES: u8 = 3;

/// Single-borrow re-entrancy guard: the manager's operations reject a
/// re-entrant call (a handler invoked while the manager is still borrowed
/// trying to call back in) rather than blocking, since spec §5 states the
/// whole core runs single-threaded cooperative on one workloop -- there is
/// no second thread to wait out, only a bug to catch.
#[derive(Debug, Default)]
struct BorrowGuard {
    borrowed: bool,
}

impl BorrowGuard {
    fn try_enter(&mut self) -> AsyncResult<()> {
        if self.borrowed {
            return Err(AsyncError::Busy);
        }
        self.borrowed = true;
        Ok(())
    }

    fn exit(&mut self) {
        self.borrowed = false;
    }
}

/// Fixed array of 64 optional transaction slots (spec §4.1).
pub struct TransactionManager {
    slots: [Option<Transaction>; 64],
    guard: BorrowGuard,
    initialized: bool,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

const NONE_TX: Option<Transaction> = None;

impl TransactionManager {
    pub const fn new() -> Self {
        Self {
            slots: [NONE_TX; 64],
            guard: BorrowGuard { borrowed: false },
            initialized: false,
        }
    }

    pub fn initialize(&mut self) {
        self.initialized = true;
    }

    /// Allocate a transaction at `label`. Fails with `Busy` if occupied,
    /// `InvalidArgument` if `label >= 64`, `NotReady` if not initialized.
    pub fn allocate(&mut self, txn: Transaction) -> AsyncResult<&mut Transaction> {
        if !self.initialized {
            return Err(AsyncError::NotReady);
        }
        let label = txn.label as usize;
        if label >= MAX_LABELS as usize {
            return Err(AsyncError::InvalidArgument);
        }
        if self.slots[label].is_some() {
            return Err(AsyncError::Busy);
        }
        self.slots[label] = Some(txn);
        Ok(self.slots[label].as_mut().unwrap())
    }

    pub fn find(&self, label: TLabel) -> Option<&Transaction> {
        self.slots.get(label as usize)?.as_ref()
    }

    pub fn find_mut(&mut self, label: TLabel) -> Option<&mut Transaction> {
        self.slots.get_mut(label as usize)?.as_mut()
    }

    /// Stale matches (wrong generation or node) return `None`, per spec §8
    /// invariant 8.
    pub fn find_by_match_key(&self, key: MatchKey) -> Option<&Transaction> {
        self.find(key.label).filter(|t| {
            t.match_key().generation == key.generation && t.match_key().node_id == key.node_id
        })
    }

    fn find_mut_by_match_key(&mut self, key: MatchKey) -> Option<&mut Transaction> {
        let label = key.label;
        let found = self
            .find(label)
            .map(|t| t.match_key().generation == key.generation && t.match_key().node_id == key.node_id)
            .unwrap_or(false);
        if found {
            self.find_mut(label)
        } else {
            None
        }
    }

    /// Invokes `fn` under the re-entrancy guard with the live transaction,
    /// if present. Returns `false` if no transaction exists at `label`.
    pub fn with_transaction<F: FnOnce(&mut Transaction)>(
        &mut self,
        label: TLabel,
        f: F,
    ) -> AsyncResult<bool> {
        self.guard.try_enter()?;
        let found = match self.find_mut(label) {
            Some(t) => {
                f(t);
                true
            }
            None => false,
        };
        self.guard.exit();
        Ok(found)
    }

    /// Atomically removes and returns the transaction at `label`, so the
    /// caller can invoke its handler outside of any manager borrow (spec
    /// §4.1 "Extract").
    pub fn extract(&mut self, label: TLabel) -> Option<Transaction> {
        self.slots.get_mut(label as usize)?.take()
    }

    pub fn remove(&mut self, label: TLabel) {
        if let Some(slot) = self.slots.get_mut(label as usize) {
            *slot = None;
        }
    }

    pub fn for_each_transaction<F: FnMut(&Transaction)>(&self, mut f: F) {
        for slot in self.slots.iter().flatten() {
            f(slot);
        }
    }

    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Cancels every transaction whose generation matches `gen`, firing
    /// each handler with `Cancelled` and freeing its label via `free_label`
    /// (spec §5 `CancelByGeneration`).
    pub fn cancel_by_generation<F: FnMut(TLabel)>(&mut self, gen: u16, mut free_label: F) {
        for i in 0..self.slots.len() {
            let matches = self.slots[i]
                .as_ref()
                .map(|t| t.generation == gen)
                .unwrap_or(false);
            if matches {
                if let Some(txn) = self.slots[i].take() {
                    if txn.try_claim_completion() {
                        txn.fire_handler(Outcome::Error(AsyncError::Cancelled));
                    }
                    free_label(txn.label);
                }
            }
        }
    }

    /// Cancels every live transaction regardless of generation (spec §5
    /// `CancelAllAndFreeLabels`).
    pub fn cancel_all<F: FnMut(TLabel)>(&mut self, mut free_label: F) {
        for slot in self.slots.iter_mut() {
            if let Some(txn) = slot.take() {
                if txn.try_claim_completion() {
                    txn.fire_handler(Outcome::Error(AsyncError::Cancelled));
                }
                free_label(txn.label);
            }
        }
    }

    /// AT completion dispatch table (spec §4.1). Returns `true` if the
    /// transaction reached a terminal state and was extracted (the caller
    /// should free its label).
    pub fn on_at_completion(&mut self, completion: AtCompletion) -> AsyncResult<bool> {
        let label = completion.label;

        let bypass_at = match self.find(label) {
            Some(t) => t.tcode.is_read() || t.strategy == CompletionStrategy::CompleteOnAR,
            None => return Ok(false),
        };

        if bypass_at {
            // Reads and CompleteOnAR writes short-circuit the AT dispatch
            // table: AT completion alone never terminates them (spec §4.1).
            if let Some(t) = self.find_mut(label) {
                t.last_ack = Some(completion.ack);
                t.transition_to(TransactionState::AwaitingAR, 0).ok();
            }
            return Ok(false);
        }

        let action = {
            let t = self.find_mut(label).ok_or(AsyncError::IllegalState)?;
            t.last_ack = Some(completion.ack);

            if let Some(event) = completion.event {
                if (event == crate::ohci_regs::EventCode::Timeout
                    || event == crate::ohci_regs::EventCode::MissingAck)
                    && completion.ack != AckCode::Pending
                {
                    Action::Failed(AsyncError::Timeout)
                } else if event == crate::ohci_regs::EventCode::Flushed {
                    Action::Cancelled
                } else {
                    Self::classify_ack(completion.ack)
                }
            } else {
                Self::classify_ack(completion.ack)
            }
        };

        match action {
            Action::AwaitAr => {
                self.find_mut(label)
                    .unwrap()
                    .transition_to(TransactionState::AwaitingAR, 0)
                    .ok();
                Ok(false)
            }
            Action::TryComplete => {
                let t = self.find_mut(label).unwrap();
                if t.try_claim_completion() {
                    t.transition_to(TransactionState::Completed, 0).ok();
                    let txn = self.extract(label).unwrap();
                    txn.fire_handler(Outcome::Success { payload: &[] });
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Action::StayBusy => {
                let t = self.find_mut(label).unwrap();
                t.retry_count = t.retry_count.saturating_add(1);
                t.extend_deadline(BUSY_BACKOFF_US);
                t.transition_to(TransactionState::ATCompleted, 0).ok();
                Ok(false)
            }
            Action::Failed(err) => {
                let t = self.find_mut(label).unwrap();
                if t.try_claim_completion() {
                    t.transition_to(TransactionState::Failed, 0).ok();
                    let txn = self.extract(label).unwrap();
                    txn.fire_handler(Outcome::Error(err));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Action::Cancelled => {
                let t = self.find_mut(label).unwrap();
                if t.try_claim_completion() {
                    t.transition_to(TransactionState::Cancelled, 0).ok();
                    let txn = self.extract(label).unwrap();
                    txn.fire_handler(Outcome::Error(AsyncError::Cancelled));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn classify_ack(ack: AckCode) -> Action {
        use Action::*;
        match ack {
            AckCode::Complete => TryComplete,
            AckCode::Pending => AwaitAr,
            AckCode::BusyX | AckCode::BusyA | AckCode::BusyB => StayBusy,
            AckCode::DataError => Failed(AsyncError::HardwareError),
            AckCode::TypeError => Failed(AsyncError::HardwareError),
            // tardy, the Agere quirk, and anything unrecognized are all
            // treated as "the device will respond on AR" (spec §4.1 table).
            _ => AwaitAr,
        }
    }

    /// AR response dispatch (spec §4.1 "OnARResponse"). Returns `true` if a
    /// matching, non-terminal transaction was found and completed.
    pub fn on_ar_response(&mut self, response: ArResponse<'_>) -> bool {
        let label = response.key.label;
        let matches = self
            .find_mut_by_match_key(response.key)
            .map(|t| !t.state.is_terminal())
            .unwrap_or(false);
        if !matches {
            return false;
        }
        let t = self.find_mut(label).unwrap();
        if !t.try_claim_completion() {
            return false;
        }
        t.transition_to(TransactionState::ARReceived, 0).ok();
        let final_state = if response.rcode == 0 {
            TransactionState::Completed
        } else {
            TransactionState::Failed
        };
        t.transition_to(final_state, 0).ok();
        let txn = self.extract(label).unwrap();
        if response.rcode == 0 {
            txn.fire_handler(Outcome::Success {
                payload: response.payload,
            });
        } else {
            txn.fire_handler(Outcome::Error(AsyncError::HardwareError));
        }
        true
    }

    /// Smart-retry timeout policy (spec §4.1 "OnTimeout"). Returns `true`
    /// if the transaction timed out terminally and was extracted.
    pub fn on_timeout(&mut self, label: TLabel) -> bool {
        enum Verdict {
            Extend(u64),
            TimedOut,
            NotFound,
        }

        let verdict = match self.find_mut(label) {
            None => Verdict::NotFound,
            Some(t) => {
                let busy = t.last_ack.map(AckCode::is_busy).unwrap_or(false);
                let tardy_like = t
                    .last_ack
                    .map(|a| a.is_tardy_like() || a == AckCode::Pending)
                    .unwrap_or(false);

                if busy && t.retry_count < MAX_BUSY_RETRIES {
                    t.retry_count += 1;
                    Verdict::Extend(BUSY_BACKOFF_US)
                } else if t.state == TransactionState::ATPosted
                    && t.last_ack.is_none()
                    && t.retry_count < MAX_NO_ACK_RETRIES
                {
                    t.retry_count += 1;
                    Verdict::Extend(NO_ACK_BACKOFF_US)
                } else if t.state == TransactionState::AwaitingAR
                    && tardy_like
                    && t.retry_count < MAX_AWAITING_AR_RETRIES
                {
                    t.retry_count += 1;
                    Verdict::Extend(AWAITING_AR_BACKOFF_US)
                } else {
                    Verdict::TimedOut
                }
            }
        };

        match verdict {
            Verdict::NotFound => false,
            Verdict::Extend(extra) => {
                self.find_mut(label).unwrap().extend_deadline(extra);
                false
            }
            Verdict::TimedOut => {
                let t = self.find_mut(label).unwrap();
                if !t.try_claim_completion() {
                    return false;
                }
                t.transition_to(TransactionState::TimedOut, 0).ok();
                let txn = self.extract(label).unwrap();
                txn.fire_handler(Outcome::Error(AsyncError::Timeout));
                true
            }
        }
    }
}

/// Internal dispatch-table verdict for `on_at_completion` (spec §4.1 table).
enum Action {
    AwaitAr,
    TryComplete,
    StayBusy,
    Failed(AsyncError),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ohci_regs::TCode;

    fn handler(_ctx: u32, _outcome: Outcome<'_>) {}

    fn new_manager() -> TransactionManager {
        let mut m = TransactionManager::new();
        m.initialize();
        m
    }

    fn txn(label: TLabel, tcode: TCode, strategy: CompletionStrategy) -> Transaction {
        let mut t = Transaction::new(label, 1, 0xFFC2, tcode, strategy, 1_000_000);
        t.handler = handler;
        t.transition_to(TransactionState::Submitted, 0).unwrap();
        t.transition_to(TransactionState::ATPosted, 0).unwrap();
        t
    }

    #[test]
    fn e2e_a_quadlet_read_split_transaction() {
        let mut m = new_manager();
        m.allocate(txn(3, TCode::ReadQuadlet, CompletionStrategy::CompleteOnAR))
            .unwrap();

        let extracted = m
            .on_at_completion(AtCompletion {
                label: 3,
                ack: AckCode::Pending,
                event: None,
            })
            .unwrap();
        assert!(!extracted);
        assert_eq!(m.find(3).unwrap().state, TransactionState::AwaitingAR);

        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let completed = m.on_ar_response(ArResponse {
            key: MatchKey {
                node_id: 0xFFC2,
                generation: 1,
                label: 3,
            },
            rcode: 0,
            payload: &payload,
        });
        assert!(completed);
        assert!(m.find(3).is_none());
    }

    #[test]
    fn e2e_b_block_write_immediate_ack_completes_without_ar() {
        let mut m = new_manager();
        m.allocate(txn(5, TCode::WriteBlock, CompletionStrategy::CompleteOnAT))
            .unwrap();
        let extracted = m
            .on_at_completion(AtCompletion {
                label: 5,
                ack: AckCode::Complete,
                event: None,
            })
            .unwrap();
        assert!(extracted);
        assert!(m.find(5).is_none());
    }

    #[test]
    fn e2e_c_busy_retry_then_success() {
        let mut m = new_manager();
        m.allocate(txn(6, TCode::WriteQuadlet, CompletionStrategy::CompleteOnAT))
            .unwrap();
        let extracted = m
            .on_at_completion(AtCompletion {
                label: 6,
                ack: AckCode::BusyB,
                event: None,
            })
            .unwrap();
        assert!(!extracted);
        assert_eq!(m.find(6).unwrap().state, TransactionState::ATCompleted);
        assert_eq!(m.find(6).unwrap().retry_count, 1);

        let extracted = m
            .on_at_completion(AtCompletion {
                label: 6,
                ack: AckCode::Complete,
                event: None,
            })
            .unwrap();
        assert!(extracted);
    }

    #[test]
    fn e2e_d_timeout_with_no_response() {
        let mut m = new_manager();
        m.allocate(txn(7, TCode::ReadQuadlet, CompletionStrategy::CompleteOnAR))
            .unwrap();
        m.on_at_completion(AtCompletion {
            label: 7,
            ack: AckCode::Pending,
            event: None,
        })
        .unwrap();
        assert_eq!(m.find(7).unwrap().state, TransactionState::AwaitingAR);

        assert!(!m.on_timeout(7));
        assert!(!m.on_timeout(7));
        assert!(!m.on_timeout(7));
        assert!(m.on_timeout(7));
        assert!(m.find(7).is_none());
    }

    #[test]
    fn e2e_e_bus_reset_cancels_generation() {
        let mut m = new_manager();
        m.allocate(txn(1, TCode::ReadQuadlet, CompletionStrategy::CompleteOnAR))
            .unwrap();
        m.allocate(txn(2, TCode::ReadQuadlet, CompletionStrategy::CompleteOnAR))
            .unwrap();
        let mut freed = std::vec::Vec::new();
        m.cancel_by_generation(1, |label| freed.push(label));
        freed.sort();
        assert_eq!(freed, std::vec![1, 2]);
        assert!(m.find(1).is_none());
        assert!(m.find(2).is_none());
    }

    #[test]
    fn stale_match_key_generation_finds_nothing() {
        let mut m = new_manager();
        m.allocate(txn(4, TCode::ReadQuadlet, CompletionStrategy::CompleteOnAR))
            .unwrap();
        let found = m.find_by_match_key(MatchKey {
            node_id: 0xFFC2,
            generation: 99,
            label: 4,
        });
        assert!(found.is_none());
    }

    #[test]
    fn handler_fires_exactly_once_across_timeout_and_cancel() {
        // Regression for spec invariant 2: once a transaction is extracted
        // via one path, a second path must find nothing to act on.
        let mut m = new_manager();
        m.allocate(txn(9, TCode::ReadQuadlet, CompletionStrategy::CompleteOnAR))
            .unwrap();
        m.on_at_completion(AtCompletion {
            label: 9,
            ack: AckCode::Pending,
            event: None,
        })
        .unwrap();

        let payload = [1, 2, 3, 4];
        assert!(m.on_ar_response(ArResponse {
            key: MatchKey {
                node_id: 0xFFC2,
                generation: 1,
                label: 9,
            },
            rcode: 0,
            payload: &payload,
        }));
        // Transaction already extracted; a second AR response for the same
        // label must find nothing.
        assert!(!m.on_ar_response(ArResponse {
            key: MatchKey {
                node_id: 0xFFC2,
                generation: 1,
                label: 9,
            },
            rcode: 0,
            payload: &payload,
        }));
    }
}
