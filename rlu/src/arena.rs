// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Object arena
//!
//! Originals and copies reference each other (a copy points to its original, a locked original
//! points to its copy). Instead of pointers, all objects are stored in an arena of slots and
//! are addressed by stable [`ObjRef`] handles. The arena grows in segments of doubling size, so
//! a slot never moves once allocated and can be read without taking any lock on the arena.
//!
//! Slots are returned to the arena only by the engine, after the grace period protocol
//! guarantees that no section can still reach them.

use crate::{
    var::{Header, ObjRef},
    Result, RluError,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

/// log2 of the size of the first segment
const BASE_SHIFT: u32 = 5;

/// Number of segments. Together they cover the whole 32 bit handle space.
const NUM_SEGMENTS: usize = 28;

pub(crate) struct Slot<T> {
    pub(crate) header: Header,
    data: RwLock<Option<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            header: Header::default(),
            data: RwLock::new(None),
        }
    }
}

impl<T> Slot<T> {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Option<T>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Option<T>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct Arena<T> {
    segments: Box<[OnceLock<Box<[Slot<T>]>>]>,
    next: AtomicUsize,
    free: Mutex<Vec<ObjRef>>,
    live: AtomicUsize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            segments: (0..NUM_SEGMENTS).map(|_| OnceLock::new()).collect(),
            next: AtomicUsize::new(0),
            free: Mutex::new(Vec::new()),
            live: AtomicUsize::new(0),
        }
    }
}

/// Maps an arena index to its segment and the offset inside the segment
fn locate(index: usize) -> (usize, usize) {
    let n = index + (1 << BASE_SHIFT);
    let bit = usize::BITS - 1 - n.leading_zeros();
    let segment = (bit - BASE_SHIFT) as usize;
    (segment, n - (1 << bit))
}

fn segment_len(segment: usize) -> usize {
    1 << (segment as u32 + BASE_SHIFT)
}

impl<T> Arena<T> {
    /// Places `data` into a free slot and returns its handle. The slot header is unlocked.
    pub(crate) fn alloc(&self, data: T) -> Result<ObjRef> {
        let reused = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop();

        let obj = match reused {
            Some(obj) => obj,
            None => {
                let index = self.next.fetch_add(1, Ordering::Relaxed);
                if index > u32::MAX as usize {
                    self.next.fetch_sub(1, Ordering::Relaxed);
                    return Err(RluError::ArenaExhausted);
                }
                ObjRef(index as u32)
            }
        };

        let (segment, offset) = locate(obj.index());
        let slot = &self.segments[segment].get_or_init(|| {
            (0..segment_len(segment))
                .map(|_| Slot::default())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        })[offset];

        slot.header.reset();
        *slot.write() = Some(data);
        self.live.fetch_add(1, Ordering::Relaxed);

        Ok(obj)
    }

    /// Returns the slot behind `obj`
    pub(crate) fn slot(&self, obj: ObjRef) -> Result<&Slot<T>> {
        let (segment, offset) = locate(obj.index());
        self.segments
            .get(segment)
            .and_then(|segment| segment.get())
            .map(|slots| &slots[offset])
            .ok_or(RluError::InvalidObject(obj))
    }

    /// Drops the data of `obj` and hands the slot back for reuse.
    ///
    /// The caller must guarantee, that no section can reach `obj` anymore.
    pub(crate) fn release(&self, obj: ObjRef) {
        if let Ok(slot) = self.slot(obj) {
            if slot.write().take().is_none() {
                return;
            }
            slot.header.reset();
            self.live.fetch_sub(1, Ordering::Relaxed);
            self.free.lock().unwrap_or_else(PoisonError::into_inner).push(obj);
        }
    }

    /// Number of objects currently stored
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}
