// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{
    arena::Arena,
    var::{LockState, ObjRef},
    Result, RluConfig, RluContext, RluError, RluObject, RluStrategy,
};
use log::*;
use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, OnceLock,
};

/// Write clock value of a thread, that is not committing
pub(crate) const INFINITY: u64 = u64::MAX;

/// The epoch state of a registered thread, that other threads observe.
pub(crate) struct ThreadState {
    /// Odd while the thread is inside a section
    pub(crate) run_counter: AtomicU64,

    /// Snapshot of the global clock taken at section entry
    pub(crate) local_clock: AtomicU64,

    /// Commit epoch while a commit is in flight, [`INFINITY`] otherwise
    pub(crate) write_clock: AtomicU64,
}

impl Default for ThreadState {
    fn default() -> Self {
        Self {
            run_counter: AtomicU64::new(0),
            local_clock: AtomicU64::new(0),
            write_clock: AtomicU64::new(INFINITY),
        }
    }
}

/// Append-only table of thread states with a fixed capacity
pub(crate) struct Registry {
    threads: Box<[OnceLock<Arc<ThreadState>>]>,
    next_thread_id: AtomicUsize,
}

impl Registry {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            threads: (0..capacity).map(|_| OnceLock::new()).collect(),
            next_thread_id: AtomicUsize::new(0),
        }
    }

    fn register(&self) -> Result<(usize, Arc<ThreadState>)> {
        let id = self.next_thread_id.fetch_add(1, Ordering::SeqCst);
        match self.threads.get(id) {
            Some(slot) => Ok((id, slot.get_or_init(Arc::default).clone())),
            None => {
                error!("Cannot register thread: registry capacity of {} exhausted", self.capacity());
                Err(RluError::RegistryExhausted(self.capacity()))
            }
        }
    }

    pub(crate) fn get(&self, id: usize) -> Option<&ThreadState> {
        self.threads.get(id).and_then(OnceLock::get).map(Arc::as_ref)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.threads.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.next_thread_id.load(Ordering::SeqCst).min(self.capacity())
    }

    /// Iterates over all registered threads with their ids
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &ThreadState)> {
        self.threads[..self.len()]
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.get().map(|state| (id, state.as_ref())))
    }
}

pub(crate) struct Shared<T> {
    pub(crate) global_clock: AtomicU64,
    pub(crate) registry: Registry,
    pub(crate) arena: Arena<T>,
    pub(crate) config: RluConfig,
}

/// [`Rlu`] is the global context, where memory gets synchronized in concurrent setups. It owns
/// the global clock, the thread registry and the objects of one RLU domain. Cloning an [`Rlu`]
/// returns another handle to the same domain, so it can be moved into every participating
/// thread. A thread takes part by calling [`Rlu::register`] once and using the returned
/// [`RluContext`] for all of its sections.
///
/// # Example
/// ```
/// use rlu_engine::Rlu;
///
/// let rlu = Rlu::<usize>::new();
/// let counter = rlu.alloc(6).unwrap();
///
/// let mut context = rlu.register().unwrap();
/// context
///     .execute(|ctx| {
///         let copy = ctx.try_lock(counter)?;
///         ctx.write(copy, |value| *value += 9)
///     })
///     .unwrap();
///
/// let value = context.execute(|ctx| ctx.read(counter, |value| *value)).unwrap();
/// assert_eq!(value, 15);
/// ```
pub struct Rlu<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T> Clone for Rlu<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Rlu<T>
where
    T: RluObject,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Rlu<T>
where
    T: RluObject,
{
    /// Creates a new [`Rlu`] with the default configuration and a [`RluStrategy::Retry`] strategy.
    pub fn new() -> Self {
        Self::from_config(RluConfig::default())
    }

    /// Creates a new [`Rlu`] with a defined strategy for handling the results of executing
    /// sections with [`RluContext::execute`].
    pub fn with_strategy(strategy: RluStrategy) -> Self {
        Self::from_config(RluConfig::default().with_strategy(strategy))
    }

    /// Creates a new [`Rlu`] from a validated configuration
    pub fn with_config(config: RluConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    fn from_config(config: RluConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                global_clock: AtomicU64::new(0),
                registry: Registry::with_capacity(config.max_threads),
                arena: Arena::default(),
                config,
            }),
        }
    }

    /// Registers the calling thread and returns its context. Fails, if the thread registry is
    /// exhausted. Registered slots are never reused.
    pub fn register(&self) -> Result<RluContext<T>> {
        let (id, state) = self.shared.registry.register()?;
        debug!("registered thread {} ({:?})", id, std::thread::current().id());
        Ok(RluContext::new(self.clone(), id, state))
    }

    /// Allocates a new unlocked object. Objects are published to other threads only by linking
    /// them into a structure that is already shared.
    pub fn alloc(&self, data: T) -> Result<ObjRef> {
        self.shared.arena.alloc(data)
    }

    /// Returns the lock state of `obj`
    pub fn lock_state(&self, obj: ObjRef) -> Result<LockState> {
        Ok(self.shared.arena.slot(obj)?.header.lock_state())
    }

    /// Returns the current value of the global clock
    pub fn global_clock(&self) -> u64 {
        self.shared.global_clock.load(Ordering::SeqCst)
    }

    /// Returns the number of registered threads
    pub fn registered_threads(&self) -> usize {
        self.shared.registry.len()
    }

    /// Returns the number of objects, originals and copies, held by the arena
    pub fn live_objects(&self) -> usize {
        self.shared.arena.live()
    }

    pub fn config(&self) -> &RluConfig {
        &self.shared.config
    }

    /// Returns `true`, if both handles refer to the same domain
    pub fn same_domain(&self, other: &Rlu<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
