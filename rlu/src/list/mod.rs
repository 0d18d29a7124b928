// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Sorted sets on top of RLU
//!
//! Sets of `i64` keys, stored as a sorted linked list of [`Node`]s between two sentinels. Readers
//! traverse the list with [`RluContext::dereference`] and never block. Writers lock the nodes
//! they modify, link or unlink nodes in their private copies and commit when the section ends.
//! A lock conflict aborts the section, which is then retried from the head of the list.

mod coarse;
mod fine;

pub use self::{coarse::CoarseList, fine::FineList};

use crate::{ObjRef, Result, Rlu, RluContext, RluError, RluObject};

/// A key of the list. The sentinels order before and after every value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    NegInf,
    Value(i64),
    PosInf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    pub key: Key,
    pub next: Option<ObjRef>,
}

impl RluObject for Node {
    fn clone_for_write(&self) -> Self {
        self.clone()
    }

    fn publish_back(&self, original: &mut Self) {
        // keys never change, only links are written by a section
        original.next = self.next;
    }
}

/// A set of `i64` keys, that can be used concurrently from threads registered with the same
/// [`Rlu`].
pub trait ConcurrentSet: Send + Sync {
    /// Inserts `key`. Returns `false`, if the key was present already.
    fn add(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool>;

    /// Removes `key`. Returns `false`, if the key was not present.
    fn remove(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool>;

    fn contains(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool>;

    /// Returns all keys in ascending order, as seen by a single section
    fn keys(&self, ctx: &mut RluContext<Node>) -> Result<Vec<i64>>;

    /// Returns the keys in `start..=end` in ascending order, as seen by a single section
    fn range(&self, ctx: &mut RluContext<Node>, start: i64, end: i64) -> Result<Vec<i64>>;

    fn len(&self, ctx: &mut RluContext<Node>) -> Result<usize> {
        Ok(self.keys(ctx)?.len())
    }
}

/// The position of a key inside the list: `curr` is the first node with a key greater or equal
/// than the searched key and `prev` its predecessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub prev: ObjRef,
    pub curr: ObjRef,
    pub curr_key: Key,
}

impl Position {
    pub fn is_match(&self, key: i64) -> bool {
        self.curr_key == Key::Value(key)
    }
}

/// The sentinel bounded list shared by [`CoarseList`] and [`FineList`]
pub struct SortedList {
    rlu: Rlu<Node>,
    head: ObjRef,
}

impl SortedList {
    /// Creates the list `[-inf, +inf]`
    pub fn new(rlu: &Rlu<Node>) -> Result<Self> {
        let tail = rlu.alloc(Node {
            key: Key::PosInf,
            next: None,
        })?;
        let head = rlu.alloc(Node {
            key: Key::NegInf,
            next: Some(tail),
        })?;

        Ok(Self { rlu: rlu.clone(), head })
    }

    pub fn rlu(&self) -> &Rlu<Node> {
        &self.rlu
    }

    pub fn head(&self) -> ObjRef {
        self.head
    }

    fn node(ctx: &RluContext<Node>, obj: ObjRef) -> Result<Node> {
        ctx.read(obj, Node::clone)
    }

    /// Searches for `key` inside the current section of `ctx`
    pub fn find(&self, ctx: &RluContext<Node>, key: i64) -> Result<Position> {
        debug_assert!(ctx.rlu().same_domain(&self.rlu), "context of a foreign domain");
        let target = Key::Value(key);

        let mut prev = ctx.dereference(Some(self.head)).ok_or(RluError::InvalidObject(self.head))?;
        let mut curr = Self::node(ctx, prev)?.next;

        loop {
            let obj = match ctx.dereference(curr) {
                Some(obj) => obj,
                None => return Err(RluError::InvalidObject(prev)),
            };
            let node = Self::node(ctx, obj)?;

            if node.key >= target {
                return Ok(Position {
                    prev,
                    curr: obj,
                    curr_key: node.key,
                });
            }

            prev = obj;
            curr = node.next;
        }
    }

    pub fn contains(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool> {
        let section = ctx.section();
        Ok(self.find(&section, key)?.is_match(key))
    }

    pub fn keys(&self, ctx: &mut RluContext<Node>) -> Result<Vec<i64>> {
        let section = ctx.section();
        let mut keys = Vec::new();
        let mut curr = section.dereference(Some(self.head));

        while let Some(obj) = curr {
            let node = Self::node(&section, obj)?;
            if let Key::Value(key) = node.key {
                keys.push(key);
            }
            curr = section.dereference(node.next);
        }

        Ok(keys)
    }

    pub fn range(&self, ctx: &mut RluContext<Node>, start: i64, end: i64) -> Result<Vec<i64>> {
        let mut keys = Vec::new();
        if start > end {
            return Ok(keys);
        }

        let section = ctx.section();
        let mut curr = Some(self.find(&section, start)?.curr);

        while let Some(obj) = curr {
            let node = Self::node(&section, obj)?;
            match node.key {
                Key::Value(key) if key <= end => keys.push(key),
                _ => break,
            }
            curr = section.dereference(node.next);
        }

        Ok(keys)
    }

    /// Links a new node with `key` between `position.prev` and `position.curr`
    pub(crate) fn link(&self, ctx: &mut RluContext<Node>, position: Position, key: i64) -> Result<()> {
        let prev = ctx.try_lock(position.prev)?;

        let node = ctx.alloc(Node {
            key: Key::Value(key),
            next: ctx.normalize(Some(position.curr)),
        })?;
        let next = ctx.normalize(Some(node));
        ctx.write(prev, |prev| prev.next = next)
    }

    /// Unlinks `position.curr` and retires it
    pub(crate) fn unlink(&self, ctx: &mut RluContext<Node>, position: Position) -> Result<()> {
        let prev = ctx.try_lock(position.prev)?;
        let curr = ctx.try_lock(position.curr)?;

        let succ = ctx.read(curr, |node| node.next)?;
        if let Some(succ) = succ {
            ctx.try_lock(succ)?;
        }

        let next = ctx.normalize(succ);
        ctx.write(prev, |prev| prev.next = next)?;
        ctx.free(curr)
    }
}
