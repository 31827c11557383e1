// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single-borrow cell for process-wide static state (the completion
//! queue, spec §4.8/§6). `TransactionManager` has its own flat
//! re-entrancy flag for `&mut self` access (`manager::BorrowGuard`); this
//! is the same idea for a `static` reached through `&self`, where the
//! guard has to live in an `AtomicBool` rather than a plain field.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// A `RefCell`-style container usable from a `static`, providing only
/// mutable access (no shared-reader/single-writer split, just a single
/// outstanding borrow at a time).
pub struct BorrowCell<T> {
    borrowed: AtomicBool,
    cell: UnsafeCell<T>,
}

impl<T> BorrowCell<T> {
    pub const fn new(contents: T) -> Self {
        Self {
            borrowed: AtomicBool::new(false),
            cell: UnsafeCell::new(contents),
        }
    }

    /// Gets mutable access to the contents of `self`.
    ///
    /// Panics if a [`BorrowGuard`] for `self` is still outstanding
    /// anywhere in the program.
    pub fn borrow_mut(&self) -> BorrowGuard<'_, T> {
        let already_borrowed = self.borrowed.swap(true, Ordering::Acquire);
        if already_borrowed {
            panic!("BorrowCell already borrowed");
        }
        // Safety: the swap above ensures this is the only outstanding
        // `&mut` into `cell`.
        unsafe {
            BorrowGuard {
                contents: &mut *self.cell.get(),
                borrowed: &self.borrowed,
            }
        }
    }
}

// Safety: only one `BorrowGuard` can exist at a time, so `&BorrowCell<T>`
// shared across contexts never yields concurrent `&mut T`.
unsafe impl<T> Sync for BorrowCell<T> where for<'a> &'a mut T: Send {}

pub struct BorrowGuard<'a, T> {
    contents: &'a mut T,
    borrowed: &'a AtomicBool,
}

impl<'a, T> Drop for BorrowGuard<'a, T> {
    fn drop(&mut self) {
        self.borrowed.store(false, Ordering::Release);
    }
}

impl<'a, T> core::ops::Deref for BorrowGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.contents
    }
}

impl<'a, T> core::ops::DerefMut for BorrowGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.contents
    }
}
