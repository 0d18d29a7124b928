// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, RluError};
use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_WAIT_UNITS: usize = 7;

/// # BusyBreaker
/// [`BusyBreaker`] is kind of a circuit-breaker and busy keeper for short delays on spin loops on the CPU.
///
/// Every call to [`BusyBreaker::spin`] doubles the time spent spinning. After the configured number
/// of wait units the breaker trips and reports [`RluError::BreakerTripped`].
///
/// # Example
/// ```
/// use rlu_engine::BusyBreaker;
///
/// let breaker = BusyBreaker::with_limit(2);
/// assert!(breaker.spin().is_ok());
/// assert!(breaker.spin().is_ok());
/// assert!(breaker.spin().is_ok());
/// assert!(breaker.spin().is_err());
///
/// breaker.reset();
/// assert!(breaker.spin().is_ok());
/// ```
#[derive(Debug)]
pub struct BusyBreaker {
    unit: AtomicUsize,
    limit: usize,
}

impl Default for BusyBreaker {
    fn default() -> Self {
        Self::with_limit(MAX_WAIT_UNITS)
    }
}

impl Clone for BusyBreaker {
    /// Returns a breaker with the same limit, that has not spun yet
    fn clone(&self) -> Self {
        Self::with_limit(self.limit)
    }
}

impl BusyBreaker {
    /// Creates a breaker that trips after `limit + 1` spins
    pub fn with_limit(limit: usize) -> Self {
        Self {
            unit: AtomicUsize::new(0),
            limit,
        }
    }

    /// Keeps the CPU busy but hints to the CPU reschedule the CPU time
    ///
    /// [`core::hint::spin_loop()`] may be available on the integrating system,
    /// otherwise this function call is just a busy loop, that wastes some CPU cycles
    pub fn spin(&self) -> Result<()> {
        match self.unit.load(Ordering::Acquire) {
            unit if unit <= self.limit => {
                for _ in 0..(1usize << unit.min(usize::BITS as usize - 1)) {
                    core::hint::spin_loop();
                }
                self.unit.store(unit + 1, Ordering::Release);

                Ok(())
            }
            unit => Err(RluError::BreakerTripped(unit)),
        }
    }

    /// Resets the breaker to zero
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}
