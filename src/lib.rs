// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous transaction engine for an IEEE 1394 OHCI 1.1 host
//! controller: issues quadlet/block read, write, and lock requests over the
//! AT DMA context, matches responses arriving on the AR DMA context, and
//! delivers results to callers with ordering and timeout guarantees.
//!
//! This crate owns the bus-protocol and hardware-FSM logic only. It is
//! built against the collaborator traits in [`hw`] -- MMIO register access,
//! DMA buffer allocation, a cooperative workloop, and response
//! transmission -- and carries no implementation of any of them; a host
//! integration supplies those and drives [`client::Client`] from its
//! interrupt/workloop handlers.

#![cfg_attr(not(test), no_std)]

cfg_if::cfg_if! {
    if #[cfg(test)] {
        extern crate std;
    }
}

pub mod ar;
pub mod borrow_cell;
pub mod client;
pub mod completion;
pub mod context;
pub mod descriptor;
pub mod dma;
pub mod error;
pub mod generation;
pub mod hw;
pub mod label;
pub mod manager;
pub mod ohci_regs;
pub mod packet;
pub mod router;
pub mod submitter;
pub mod trace;
pub mod transaction;

pub use client::{AsyncHandle, Client};
pub use error::{AsyncError, AsyncResult};
pub use transaction::{CompletionStrategy, MatchKey, NodeId, Outcome, TLabel, TransactionState};
