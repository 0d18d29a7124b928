// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{BusyBreaker, Result, RluError};

/// Maximum number of threads, that can be registered with one [`crate::Rlu`]
pub const DEFAULT_MAX_THREADS: usize = 32;

/// Number of write log entries of a thread. Each of the two log halves serves one section.
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 128;

/// Maximum number of objects a single section may retire
pub const DEFAULT_MAX_FREE_NODES: usize = 100;

/// Handling of sections run through [`crate::RluContext::execute`], that failed due to lock
/// contention. The internal execution can either [`RluStrategy::Abort`], [`RluStrategy::Retry`]
/// an unlimited number of times, or [`RluStrategy::RetryWithBreaker`] with a busy breaker.
#[derive(Clone, Debug)]
pub enum RluStrategy {
    /// Abort execution on failure
    Abort,

    /// Retry executing the calling function repeatedly until it succeeds. Every failed attempt
    /// has aborted its section before the retry, so a conflicting writer can finish its commit.
    Retry,

    /// Retry with an exponential breaker. Each retry spins for twice as long as the previous
    /// one, until the breaker trips and the contention is returned to the caller.
    RetryWithBreaker(BusyBreaker),
}

/// Tunables of an [`crate::Rlu`] instance
#[derive(Clone, Debug)]
pub struct RluConfig {
    pub max_threads: usize,
    pub max_log_entries: usize,
    pub max_free_nodes: usize,
    pub strategy: RluStrategy,
}

impl Default for RluConfig {
    fn default() -> Self {
        Self {
            max_threads: DEFAULT_MAX_THREADS,
            max_log_entries: DEFAULT_MAX_LOG_ENTRIES,
            max_free_nodes: DEFAULT_MAX_FREE_NODES,
            strategy: RluStrategy::Retry,
        }
    }
}

impl RluConfig {
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the size of the whole write log. A single section may lock half of it.
    pub fn with_max_log_entries(mut self, max_log_entries: usize) -> Self {
        self.max_log_entries = max_log_entries;
        self
    }

    pub fn with_max_free_nodes(mut self, max_free_nodes: usize) -> Self {
        self.max_free_nodes = max_free_nodes;
        self
    }

    pub fn with_strategy(mut self, strategy: RluStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Number of objects a single section may lock
    pub fn section_log_capacity(&self) -> usize {
        self.max_log_entries / 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(RluError::Config("max_threads must be at least 1".to_string()));
        }
        if self.max_log_entries < 2 || self.max_log_entries % 2 != 0 {
            return Err(RluError::Config(format!(
                "max_log_entries must be an even number of at least 2, got {}",
                self.max_log_entries
            )));
        }
        if self.max_free_nodes == 0 {
            return Err(RluError::Config("max_free_nodes must be at least 1".to_string()));
        }
        Ok(())
    }
}
