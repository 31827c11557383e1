// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed error taxonomy for the async transaction engine.
//!
//! Every fallible entry point in this crate returns a `Result<T, AsyncError>`
//! rather than panicking. `AsyncError` is `Copy` so it can be threaded
//! through `no_std` code without an allocator, mirroring the small `Copy`
//! error enums returned by hubris's `drv/*-api` client crates.

/// Taxonomy from spec §7: success is the `Ok` side of `Result`; every other
/// outcome is one of these variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncError {
    /// Caller input was invalid (out-of-range label, zero-length payload on
    /// a block operation, etc). Returned before any hardware effect.
    InvalidArgument,
    /// A resource (descriptor ring slot, DMA slab space, transaction slot)
    /// could not be allocated. Returned immediately; no transaction exists.
    ResourceExhausted,
    /// The requested label/slot is already occupied by a live transaction.
    Busy,
    /// The component has not completed initialization.
    NotReady,
    /// The transaction ended without a response after exhausting retries.
    Timeout,
    /// The hardware reported a terminal error event (data error, type
    /// error, descriptor read error, or DEAD context).
    HardwareError,
    /// The transaction or context was cancelled (caller-initiated, or
    /// `evt_flushed`, or a bus reset invalidating the generation).
    Cancelled,
    /// An operation was attempted against a transaction/context that is not
    /// in a state where it is legal (double-completion, stale match, etc).
    IllegalState,
}

impl AsyncError {
    /// True for errors that a caller may reasonably retry unmodified
    /// (as opposed to `InvalidArgument`, which will never succeed).
    pub const fn is_recoverable(self) -> bool {
        matches!(self, AsyncError::Busy | AsyncError::ResourceExhausted)
    }
}

pub type AsyncResult<T> = Result<T, AsyncError>;
