// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Object header
//!
//! Every object managed by [`crate::Rlu`] lives in an arena slot and is addressed by an [`ObjRef`].
//! The slot carries a [`Header`] next to the object data. The header holds the lock word of an
//! original and, for a copy, the write set information pointing back to the original it was
//! cloned from.

use std::{
    fmt,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

/// Lock word of an unlocked original
const UNLOCKED: u64 = 0;

/// Lock word of a copy. It can never collide with an encoded handle, since handles are 32 bit wide.
const COPY_SENTINEL: u64 = u64::MAX;

/// A stable handle to an object inside the arena of an [`crate::Rlu`] instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    /// Returns the arena index of this handle
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The decoded state of a lock word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockState {
    /// An original, that is not locked by any section
    Unlocked,

    /// An original, that is locked. The handle points to the private copy of the locking section.
    Locked(ObjRef),

    /// The object is itself a copy and must not be resolved any further
    Copy,
}

impl LockState {
    fn encode(self) -> u64 {
        match self {
            LockState::Unlocked => UNLOCKED,
            LockState::Locked(copy) => copy.0 as u64 + 1,
            LockState::Copy => COPY_SENTINEL,
        }
    }

    fn decode(word: u64) -> Self {
        match word {
            UNLOCKED => LockState::Unlocked,
            COPY_SENTINEL => LockState::Copy,
            n => LockState::Locked(ObjRef((n - 1) as u32)),
        }
    }
}

/// Write set information of a copy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteSet {
    /// Registry id of the thread owning the copy
    pub thread_id: usize,

    /// Run counter of the owning thread at the time the copy was created
    pub run_counter: u64,

    /// The original this copy was cloned from
    pub original: ObjRef,
}

#[derive(Default)]
pub(crate) struct Header {
    lock: AtomicU64,
    thread_id: AtomicUsize,
    run_counter: AtomicU64,
    original: AtomicU32,
}

impl Header {
    pub(crate) fn lock_state(&self) -> LockState {
        LockState::decode(self.lock.load(Ordering::Acquire))
    }

    /// Single CAS of the lock word from unlocked to `copy`. Returns `false`, if the race was lost.
    pub(crate) fn try_lock(&self, copy: ObjRef) -> bool {
        self.lock
            .compare_exchange(
                UNLOCKED,
                LockState::Locked(copy).encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.lock.store(UNLOCKED, Ordering::Release);
    }

    /// Stamps this header as a copy of `write_set.original`. The write set fields are published
    /// by the release store of the sentinel and become visible to every thread that later
    /// acquires the original's lock word.
    pub(crate) fn mark_copy(&self, write_set: WriteSet) {
        self.thread_id.store(write_set.thread_id, Ordering::Relaxed);
        self.run_counter.store(write_set.run_counter, Ordering::Relaxed);
        self.original.store(write_set.original.0, Ordering::Relaxed);
        self.lock.store(COPY_SENTINEL, Ordering::Release);
    }

    /// Returns the write set, if this header belongs to a copy
    pub(crate) fn write_set(&self) -> Option<WriteSet> {
        match self.lock_state() {
            LockState::Copy => Some(WriteSet {
                thread_id: self.thread_id.load(Ordering::Relaxed),
                run_counter: self.run_counter.load(Ordering::Relaxed),
                original: ObjRef(self.original.load(Ordering::Relaxed)),
            }),
            _ => None,
        }
    }

    /// Clears the header for reuse of the slot
    pub(crate) fn reset(&self) {
        self.thread_id.store(0, Ordering::Relaxed);
        self.run_counter.store(0, Ordering::Relaxed);
        self.original.store(0, Ordering::Relaxed);
        self.lock.store(UNLOCKED, Ordering::Release);
    }
}
