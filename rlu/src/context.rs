// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    arena::Arena,
    guard::SectionGuard,
    rlog::{FreeList, RLULog},
    rlu::{ThreadState, INFINITY},
    var::{LockState, ObjRef, WriteSet},
    Result, Rlu, RluError, RluObject, RluStrategy,
};
use log::*;
use std::{
    mem,
    sync::{atomic::Ordering, Arc},
};

/// Number of spins in the grace period wait, after which the waiting thread yields its time slice
const SPINS_BEFORE_YIELD: usize = 1 << 10;

/// Run counter snapshot of a thread, that a committing writer has to wait for
#[derive(Clone, Copy, Debug)]
struct WaitEntry {
    thread_id: usize,
    run_counter: u64,
}

/// The [`RluContext`] stores the per thread state of a thread registered with [`Rlu`]. All
/// reads and writes of objects go through the context of the calling thread.
///
/// A context is a capability: it is created once by [`Rlu::register`], can be moved to another
/// thread, but is never shared. Its run counter, local clock and write clock are published to
/// the other threads, everything else is private.
pub struct RluContext<T> {
    id: usize,
    rlu: Rlu<T>,
    state: Arc<ThreadState>,
    is_writer: bool,

    /// copies created by the current and the previous committing section
    log: RLULog<ObjRef>,

    /// originals retired by the current section
    free: FreeList<ObjRef>,

    /// copies of aborted sections, released after the next grace period
    aborted: Vec<ObjRef>,

    wait_on: Vec<WaitEntry>,
}

impl<T> RluContext<T> {
    pub(crate) fn new(rlu: Rlu<T>, id: usize, state: Arc<ThreadState>) -> Self {
        let config = &rlu.shared.config;
        let (max_log_entries, max_free_nodes, max_threads) =
            (config.max_log_entries, config.max_free_nodes, config.max_threads);

        Self {
            id,
            state,
            is_writer: false,
            log: RLULog::with_capacity(max_log_entries),
            free: FreeList::with_capacity(max_free_nodes),
            aborted: Vec::new(),
            wait_on: Vec::with_capacity(max_threads),
            rlu,
        }
    }

    /// Returns the registry id of this context
    pub fn id(&self) -> usize {
        self.id
    }

    /// Returns the [`Rlu`] this context is registered with
    pub fn rlu(&self) -> &Rlu<T> {
        &self.rlu
    }

    /// Returns `true` while the context is inside a section
    pub fn in_section(&self) -> bool {
        self.state.run_counter.load(Ordering::SeqCst) & 1 == 1
    }

    /// Returns `true`, if the current section holds locks
    pub fn is_writer(&self) -> bool {
        self.is_writer
    }

    fn arena(&self) -> &Arena<T> {
        &self.rlu.shared.arena
    }

    /// Returns the write set of `obj`, if it is a copy held by the current section of this
    /// context
    fn owned_write_set(&self, obj: ObjRef) -> Option<WriteSet> {
        let run_counter = self.state.run_counter.load(Ordering::SeqCst);
        self.arena()
            .slot(obj)
            .ok()
            .and_then(|slot| slot.header.write_set())
            .filter(|ws| ws.thread_id == self.id && ws.run_counter == run_counter)
    }

    /// Enters a read section. The section observes all commits, that happened before the
    /// snapshot of the global clock taken here.
    ///
    /// # Panics
    /// Panics, if the context is already inside a section.
    pub fn read_lock(&mut self) {
        let run_counter = self.state.run_counter.load(Ordering::SeqCst);
        assert!(
            run_counter & 1 == 0,
            "thread {} entered a section while already inside one",
            self.id
        );

        self.state.run_counter.store(run_counter + 1, Ordering::SeqCst);
        self.is_writer = false;
        self.state
            .local_clock
            .store(self.rlu.shared.global_clock.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    /// Resolves `obj` to the version this section must observe.
    ///
    /// An unlocked object and a copy are returned as they are. A locked object resolves to its
    /// copy, if the copy belongs to the current section of this context, or if the owner's
    /// commit epoch is not newer than the snapshot of this section. Otherwise the original is
    /// returned.
    pub fn dereference(&self, obj: Option<ObjRef>) -> Option<ObjRef> {
        obj.map(|obj| self.resolve(obj))
    }

    fn resolve(&self, obj: ObjRef) -> ObjRef {
        let shared = &self.rlu.shared;

        let copy = match shared.arena.slot(obj).map(|slot| slot.header.lock_state()) {
            Ok(LockState::Locked(copy)) => copy,
            _ => return obj,
        };

        let ws = match shared.arena.slot(copy).ok().and_then(|slot| slot.header.write_set()) {
            Some(ws) if ws.original == obj => ws,
            // the copy has been written back and reclaimed in the meantime
            _ => return obj,
        };

        if ws.thread_id == self.id && ws.run_counter == self.state.run_counter.load(Ordering::SeqCst) {
            return copy;
        }

        let owner = match shared.registry.get(ws.thread_id) {
            Some(owner) => owner,
            None => {
                warn!("copy {} references unknown thread {}", copy, ws.thread_id);
                return obj;
            }
        };

        let write_clock = owner.write_clock.load(Ordering::SeqCst);
        let local_clock = self.state.local_clock.load(Ordering::SeqCst);

        // check for stealing
        if write_clock <= local_clock {
            trace!(
                "thread {} steals copy {} of {} (write clock {} <= local clock {})",
                self.id,
                copy,
                obj,
                write_clock,
                local_clock
            );
            return copy;
        }

        obj
    }

    /// Returns the original of a copy, or `obj` itself. Every handle stored into a shared
    /// object must pass through here, so that no shared object ever references a private copy.
    pub fn normalize(&self, obj: Option<ObjRef>) -> Option<ObjRef> {
        obj.map(|obj| {
            self.arena()
                .slot(obj)
                .ok()
                .and_then(|slot| slot.header.write_set())
                .map_or(obj, |ws| ws.original)
        })
    }

    /// Gives read access to the data of `obj`. The handle is read as is, a reader resolves it
    /// with [`RluContext::dereference`] first.
    pub fn read<R, F>(&self, obj: ObjRef, func: F) -> Result<R>
    where
        F: FnOnce(&T) -> R,
    {
        let slot = self.arena().slot(obj)?;
        let guard = slot.read();
        guard.as_ref().map(func).ok_or(RluError::InvalidObject(obj))
    }

    /// Gives write access to the data of a copy locked by the current section
    pub fn write<R, F>(&self, copy: ObjRef, func: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        if self.owned_write_set(copy).is_none() {
            return Err(RluError::NotOwned(copy));
        }

        let slot = self.arena().slot(copy)?;
        let mut guard = slot.write();
        guard.as_mut().map(func).ok_or(RluError::InvalidObject(copy))
    }

    /// Allocates a new unlocked object
    pub fn alloc(&self, data: T) -> Result<ObjRef> {
        self.arena().alloc(data)
    }

    /// Aborts the current section. All objects locked by the section are unlocked without
    /// writing back their copies, objects retired by the section are kept.
    ///
    /// # Panics
    /// Panics, if the context is not inside a section.
    pub fn abort(&mut self) {
        let run_counter = self.state.run_counter.load(Ordering::SeqCst);
        assert!(
            run_counter & 1 == 1,
            "thread {} aborted outside of a section",
            self.id
        );
        self.state.run_counter.store(run_counter + 1, Ordering::SeqCst);

        let retained = self.free.take();
        if !retained.is_empty() {
            debug!("thread {} abort keeps {} retired objects", self.id, retained.len());
        }

        if self.is_writer {
            self.is_writer = false;
            self.unlock_objects();
        }
    }

    fn unlock_objects(&mut self) {
        let copies = self.log.rewind();
        debug!("thread {} abort unlocks {} objects", self.id, copies.len());

        for copy in copies {
            if let Some(ws) = self.arena().slot(copy).ok().and_then(|slot| slot.header.write_set()) {
                if let Ok(original) = self.arena().slot(ws.original) {
                    original.header.unlock();
                }
            }
            self.aborted.push(copy);
        }

        if self.aborted.len() >= self.rlu.shared.config.max_log_entries {
            self.reclaim_aborted();
        }
    }

    /// Waits for a grace period and releases the copies of aborted sections. Runs, when no
    /// commit has released them before the queue filled up.
    fn reclaim_aborted(&mut self) {
        self.quiesce();

        debug!("thread {} reclaims {} aborted copies", self.id, self.aborted.len());
        for copy in self.aborted.drain(..) {
            self.rlu.shared.arena.release(copy);
        }
    }

    /// Waits until every section, that was running when this is called, has ended
    fn quiesce(&mut self) {
        let clock = self.rlu.shared.global_clock.load(Ordering::SeqCst);
        self.synchronize(clock + 1);
    }

    /// Waits until every other thread, that is inside a section which started before
    /// `write_clock`, has left that section.
    fn synchronize(&mut self, write_clock: u64) {
        let registry = &self.rlu.shared.registry;
        let mut wait_on = mem::take(&mut self.wait_on);
        wait_on.clear();

        // sychronize with other contexts, collect their run stats
        for (thread_id, state) in registry.iter() {
            if thread_id == self.id {
                continue;
            }
            let run_counter = state.run_counter.load(Ordering::SeqCst);
            if run_counter & 1 == 1 {
                wait_on.push(WaitEntry {
                    thread_id,
                    run_counter,
                });
            }
        }

        // wait for other contexts
        for entry in &wait_on {
            let other = match registry.get(entry.thread_id) {
                Some(other) => other,
                None => continue,
            };

            let mut spins = 0usize;
            loop {
                if other.run_counter.load(Ordering::SeqCst) != entry.run_counter {
                    // has progressed
                    break;
                }

                if write_clock <= other.local_clock.load(Ordering::SeqCst) {
                    // started after this commit
                    break;
                }

                spins += 1;
                if spins % SPINS_BEFORE_YIELD == 0 {
                    std::thread::yield_now();
                } else {
                    core::hint::spin_loop();
                }
            }
        }

        self.wait_on = wait_on;
    }

}

impl<T> RluContext<T>
where
    T: RluObject,
{
    /// Leaves the current read section. If the section locked any objects, their copies are
    /// committed before this returns.
    ///
    /// # Panics
    /// Panics, if the context is not inside a section.
    pub fn read_unlock(&mut self) {
        let run_counter = self.state.run_counter.load(Ordering::SeqCst);
        assert!(
            run_counter & 1 == 1,
            "thread {} left a section it never entered",
            self.id
        );
        self.state.run_counter.store(run_counter + 1, Ordering::SeqCst);

        if self.is_writer {
            self.is_writer = false;
            self.commit_log();
        }
    }

    /// Enters a section, that is left when the returned guard is dropped
    pub fn section(&mut self) -> SectionGuard<'_, T> {
        SectionGuard::new(self)
    }

    /// Tries to lock `obj` for the current section and returns the private copy to modify.
    ///
    /// Locking an object twice in the same section returns the same copy. If the object is
    /// locked by any other section, [`RluError::Locked`] is returned and the caller has to abort
    /// and retry its section.
    ///
    /// # Panics
    /// Panics, if the context is not inside a section.
    pub fn try_lock(&mut self, obj: ObjRef) -> Result<ObjRef> {
        let run_counter = self.state.run_counter.load(Ordering::SeqCst);
        assert!(run_counter & 1 == 1, "thread {} locked outside of a section", self.id);

        // get actual object
        let original = self.normalize(Some(obj)).unwrap_or(obj);
        let arena = &self.rlu.shared.arena;
        let slot = arena.slot(original)?;

        match slot.header.lock_state() {
            LockState::Unlocked => {}
            LockState::Locked(copy) => {
                if self.owned_write_set(copy).is_some() {
                    return Ok(copy);
                }
                trace!("thread {} failed to lock {}: held by copy {}", self.id, original, copy);
                return Err(RluError::Locked(original));
            }
            LockState::Copy => return Err(RluError::InvalidObject(original)),
        }

        let capacity = self.rlu.shared.config.section_log_capacity();
        if self.log.num_objs() >= capacity {
            error!("thread {} exceeded the write log capacity of {}", self.id, capacity);
            return Err(RluError::LogExhausted(capacity));
        }

        let copy = self.clone_with_ownership(original, run_counter)?;

        if !slot.header.try_lock(copy) {
            // the copy has never been published
            arena.release(copy);
            trace!("thread {} lost the race to lock {}", self.id, original);
            return Err(RluError::Locked(original));
        }

        if let Err(e) = self.log.push(copy) {
            slot.header.unlock();
            arena.release(copy);
            error!("thread {} cannot log copy of {}: {}", self.id, original, e);
            return Err(e);
        }
        self.is_writer = true;

        trace!("thread {} locked {} with copy {}", self.id, original, copy);
        Ok(copy)
    }

    fn clone_with_ownership(&self, original: ObjRef, run_counter: u64) -> Result<ObjRef> {
        let data = self.read(original, T::clone_for_write)?;
        let copy = self.arena().alloc(data)?;

        self.arena().slot(copy)?.header.mark_copy(WriteSet {
            thread_id: self.id,
            run_counter,
            original,
        });

        Ok(copy)
    }

    /// Retires the original of `copy`. The original is reclaimed after the grace period of the
    /// current section has elapsed, never earlier.
    ///
    /// # Panics
    /// Panics, if `copy` is not a copy locked by the current section.
    pub fn free(&mut self, copy: ObjRef) -> Result<()> {
        let original = match self.owned_write_set(copy) {
            Some(ws) => ws.original,
            None => panic!("thread {} cannot free {}: not a copy locked by this section", self.id, copy),
        };

        if self.free.contains(&original) {
            return Ok(());
        }

        self.free.push(original).map_err(|e| {
            error!("thread {} cannot retire {}: {}", self.id, original, e);
            e
        })
    }

    /// Executes `func` inside a section. The section is committed, if `func` succeeds, and
    /// aborted otherwise. Contention is handled by the [`RluStrategy`] of the [`Rlu`].
    ///
    /// `func` may be called more than once and must not enter or leave sections itself.
    pub fn execute<R, F>(&mut self, mut func: F) -> Result<R>
    where
        F: FnMut(&mut Self) -> Result<R>,
    {
        let strategy = self.rlu.shared.config.strategy.clone();

        loop {
            self.read_lock();

            let err = match func(self) {
                Ok(value) => {
                    self.read_unlock();
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.abort();

            if !err.is_contention() {
                return Err(err);
            }

            match &strategy {
                RluStrategy::Abort => return Err(err),
                RluStrategy::Retry => core::hint::spin_loop(),
                RluStrategy::RetryWithBreaker(breaker) => breaker.spin()?,
            }

            trace!("thread {} retries section after {}", self.id, err);
        }
    }

    fn commit_log(&mut self) {
        let shared = &self.rlu.shared;

        // A concurrent commit may advance the clock between the load and the increment, both
        // commits then share an epoch. A section, that entered at that epoch before this write
        // clock became visible, is not waited for and may steal these copies after it has read
        // an original already.
        let write_clock = shared.global_clock.load(Ordering::SeqCst) + 1;
        self.state.write_clock.store(write_clock, Ordering::SeqCst);
        shared.global_clock.fetch_add(1, Ordering::SeqCst);

        debug!(
            "thread {} commits {} objects at write clock {}",
            self.id,
            self.log.num_objs(),
            write_clock
        );

        self.synchronize(write_clock);
        self.write_back_log();
        self.state.write_clock.store(INFINITY, Ordering::SeqCst);
        self.swap_logs();
        self.process_free();
    }

    fn write_back_log(&mut self) {
        let arena = &self.rlu.shared.arena;

        for copy in self.log.window() {
            let copy_slot = match arena.slot(copy) {
                Ok(slot) => slot,
                Err(e) => {
                    error!("write back of {} failed: {}", copy, e);
                    continue;
                }
            };
            let original = match copy_slot.header.write_set() {
                Some(ws) => ws.original,
                None => {
                    error!("write back of {} failed: not a copy", copy);
                    continue;
                }
            };
            let original_slot = match arena.slot(original) {
                Ok(slot) => slot,
                Err(e) => {
                    error!("write back of {} failed: {}", copy, e);
                    continue;
                }
            };

            {
                let source = copy_slot.read();
                let mut target = original_slot.write();
                if let (Some(source), Some(target)) = (source.as_ref(), target.as_mut()) {
                    source.publish_back(target);
                }
            }

            original_slot.header.unlock();
        }

        self.log.reset_window();
    }

    /// Switches to the other half of the write log. The copies still held by that half were
    /// committed by the previous section, the grace period of this commit covers every reader
    /// that could have stolen them.
    fn swap_logs(&mut self) {
        let released = self.log.next();
        if !released.is_empty() {
            debug!("thread {} reclaims {} copies", self.id, released.len());
        }
        for copy in released {
            self.rlu.shared.arena.release(copy);
        }
    }

    fn process_free(&mut self) {
        let arena = &self.rlu.shared.arena;

        let retired = self.free.take();
        if !retired.is_empty() {
            debug!("thread {} reclaims {} retired objects", self.id, retired.len());
        }
        for original in retired {
            arena.release(original);
        }

        for copy in self.aborted.drain(..) {
            arena.release(copy);
        }
    }
}

impl<T> Drop for RluContext<T> {
    fn drop(&mut self) {
        if self.in_section() {
            warn!("thread {} dropped its context inside a section, aborting", self.id);
            self.abort();
        }

        // copies of the last commit may still be read by sections, that stole them
        let mut copies = self.log.drain_all();
        copies.append(&mut self.aborted);
        if copies.is_empty() {
            return;
        }

        self.quiesce();
        debug!("thread {} releases {} copies on drop", self.id, copies.len());
        for copy in copies {
            self.rlu.shared.arena.release(copy);
        }
    }
}
