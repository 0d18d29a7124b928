// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{Result, RluError};
use std::mem;

/// One half of the write log
pub(crate) struct Node<T> {
    alloc: Box<[Option<T>]>,
    index: usize,
}

impl<T> Node<T>
where
    T: Copy,
{
    fn with_capacity(capacity: usize) -> Self {
        Self {
            alloc: (0..capacity).map(|_| None).collect(),
            index: 0,
        }
    }

    fn push(&mut self, value: T) -> bool {
        if self.index >= self.alloc.len() {
            return false;
        }
        self.alloc[self.index] = Some(value);
        self.index += 1;
        true
    }

    /// Empties this half and returns the entries it held
    fn clear(&mut self) -> Vec<T> {
        self.index = 0;
        self.alloc.iter_mut().filter_map(Option::take).collect()
    }

    pub fn len(&self) -> usize {
        self.alloc.len()
    }
}

/// The per thread write log.
///
/// The log consists of two halves. A section appends the copies it creates to the current half.
/// After a commit, the log switches to the other half and clears it. The half used by the last
/// commit is kept until the next commit is done, so its copies stay alive while lagging readers
/// may still dereference them.
pub(crate) struct RLULog<T> {
    current_log_index: usize,
    num_objs: usize,
    logs: [Node<T>; 2],
}

impl<T> RLULog<T>
where
    T: Copy,
{
    /// Creates a log with `capacity` entries, split into two halves
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            current_log_index: 0,
            num_objs: 0,
            logs: [Node::with_capacity(capacity / 2), Node::with_capacity(capacity / 2)],
        }
    }

    /// Number of entries written by the current section
    pub fn num_objs(&self) -> usize {
        self.num_objs
    }

    /// Appends an entry to the window of the current section
    pub fn push(&mut self, value: T) -> Result<()> {
        let node = &mut self.logs[self.current_log_index];
        if !node.push(value) {
            return Err(RluError::LogExhausted(node.len()));
        }
        self.num_objs += 1;
        Ok(())
    }

    /// Returns the entries written by the current section
    pub fn window(&self) -> impl Iterator<Item = T> + '_ {
        let node = &self.logs[self.current_log_index];
        node.alloc[node.index - self.num_objs..node.index].iter().flatten().copied()
    }

    /// Closes the window after its entries have been written back
    pub fn reset_window(&mut self) {
        self.num_objs = 0;
    }

    /// Removes the entries of the current section from the log and returns them
    pub fn rewind(&mut self) -> Vec<T> {
        let node = &mut self.logs[self.current_log_index];
        let start = node.index - self.num_objs;
        let entries = node.alloc[start..node.index].iter_mut().filter_map(Option::take).collect();
        node.index = start;
        self.num_objs = 0;
        entries
    }

    /// Removes every entry from both halves
    pub fn drain_all(&mut self) -> Vec<T> {
        self.num_objs = 0;
        let mut entries = self.logs[0].clear();
        entries.append(&mut self.logs[1].clear());
        entries
    }

    /// Selects the other half of the log and clears it. Returns the entries, that were still
    /// held by the other half.
    pub fn next(&mut self) -> Vec<T> {
        debug_assert_eq!(self.num_objs, 0, "log swapped with an open window");
        self.current_log_index = (self.current_log_index + 1) % self.logs.len();
        self.logs[self.current_log_index].clear()
    }

}

/// Originals retired by the current section. They are handed back to the arena once the grace
/// period of the committing section has elapsed.
pub(crate) struct FreeList<T> {
    nodes: Vec<T>,
    capacity: usize,
}

impl<T> FreeList<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) -> Result<()> {
        if self.nodes.len() >= self.capacity {
            return Err(RluError::FreeListExhausted(self.capacity));
        }
        self.nodes.push(value);
        Ok(())
    }

    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.nodes.contains(value)
    }

    pub fn take(&mut self) -> Vec<T> {
        mem::take(&mut self.nodes)
    }
}
