// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # B+ tree on top of RLU
//!
//! An ordered map from `i64` keys to `i64` values. Readers descend from the root and scan the
//! linked leaves without locks. An insert locks the leaf it changes and every inner node a split
//! propagates into, and commits the whole change, splits included, in a single section. Writers
//! are serialized by a writer lock.

use crate::{ObjRef, Result, Rlu, RluContext, RluError, RluObject};
use log::*;
use std::sync::{Mutex, PoisonError};

/// Maximum number of keys in a node. A node holding more is split in two.
pub const MAX_KEYS: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeNode {
    /// Fixed entry point, that references the current root
    Anchor { root: ObjRef },

    /// `children[i]` holds the keys below `keys[i]`, the last child all remaining keys
    Inner { keys: Vec<i64>, children: Vec<ObjRef> },

    Leaf {
        keys: Vec<i64>,
        values: Vec<i64>,
        next: Option<ObjRef>,
    },
}

impl RluObject for TreeNode {
    fn clone_for_write(&self) -> Self {
        self.clone()
    }

    fn publish_back(&self, original: &mut Self) {
        original.clone_from(self);
    }
}

/// Index of the child of an inner node, that covers `key`
fn child_index(keys: &[i64], key: i64) -> usize {
    keys.partition_point(|separator| *separator <= key)
}

impl TreeNode {
    fn empty_leaf() -> Self {
        TreeNode::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }

    /// Inserts or replaces `key` in a leaf and returns the replaced value
    fn upsert(&mut self, obj: ObjRef, key: i64, value: i64) -> Result<Option<i64>> {
        match self {
            TreeNode::Leaf { keys, values, .. } => match keys.binary_search(&key) {
                Ok(i) => Ok(Some(std::mem::replace(&mut values[i], value))),
                Err(i) => {
                    keys.insert(i, key);
                    values.insert(i, value);
                    Ok(None)
                }
            },
            _ => Err(RluError::InvalidObject(obj)),
        }
    }

    /// Adds the separator and the new right sibling of one of the children of an inner node
    fn insert_child(&mut self, obj: ObjRef, separator: i64, right: ObjRef) -> Result<()> {
        match self {
            TreeNode::Inner { keys, children } => {
                let i = child_index(keys, separator);
                keys.insert(i, separator);
                children.insert(i + 1, right);
                Ok(())
            }
            _ => Err(RluError::InvalidObject(obj)),
        }
    }

    /// Moves the upper half of an overfull node into a new sibling. Returns the separator for
    /// the parent together with the sibling, or `None` if the node has room.
    fn split(&mut self) -> Option<(i64, TreeNode)> {
        match self {
            TreeNode::Leaf { keys, values, next } if keys.len() > MAX_KEYS => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid);
                let separator = right_keys[0];
                let right = TreeNode::Leaf {
                    keys: right_keys,
                    values: values.split_off(mid),
                    next: *next,
                };
                Some((separator, right))
            }
            TreeNode::Inner { keys, children } if keys.len() > MAX_KEYS => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let separator = keys.pop()?;
                let right = TreeNode::Inner {
                    keys: right_keys,
                    children: children.split_off(mid + 1),
                };
                Some((separator, right))
            }
            _ => None,
        }
    }
}

pub struct BPlusTree {
    rlu: Rlu<TreeNode>,
    anchor: ObjRef,
    writer: Mutex<()>,
}

impl BPlusTree {
    /// Creates an empty tree, a single empty leaf below the anchor
    pub fn new(rlu: &Rlu<TreeNode>) -> Result<Self> {
        let root = rlu.alloc(TreeNode::empty_leaf())?;
        let anchor = rlu.alloc(TreeNode::Anchor { root })?;

        Ok(Self {
            rlu: rlu.clone(),
            anchor,
            writer: Mutex::new(()),
        })
    }

    pub fn rlu(&self) -> &Rlu<TreeNode> {
        &self.rlu
    }

    fn resolve(ctx: &RluContext<TreeNode>, obj: ObjRef) -> ObjRef {
        ctx.dereference(Some(obj)).unwrap_or(obj)
    }

    /// Returns the nodes from the root down to the leaf responsible for `key`
    fn descend(&self, ctx: &RluContext<TreeNode>, key: i64) -> Result<Vec<ObjRef>> {
        debug_assert!(ctx.rlu().same_domain(&self.rlu), "context of a foreign domain");

        let anchor = Self::resolve(ctx, self.anchor);
        let mut curr = ctx.read(anchor, |node| match node {
            TreeNode::Anchor { root } => Ok(*root),
            _ => Err(RluError::InvalidObject(anchor)),
        })??;

        let mut path = Vec::new();
        loop {
            let obj = Self::resolve(ctx, curr);
            path.push(obj);

            let child = ctx.read(obj, |node| match node {
                TreeNode::Inner { keys, children } => Ok(Some(children[child_index(keys, key)])),
                TreeNode::Leaf { .. } => Ok(None),
                TreeNode::Anchor { .. } => Err(RluError::InvalidObject(obj)),
            })??;

            match child {
                Some(child) => curr = child,
                None => return Ok(path),
            }
        }
    }

    /// Returns the value stored for `key`
    pub fn search(&self, ctx: &mut RluContext<TreeNode>, key: i64) -> Result<Option<i64>> {
        let section = ctx.section();
        let path = self.descend(&section, key)?;
        let leaf = *path.last().ok_or(RluError::InvalidObject(self.anchor))?;

        section.read(leaf, |node| match node {
            TreeNode::Leaf { keys, values, .. } => keys.binary_search(&key).ok().map(|i| values[i]),
            _ => None,
        })
    }

    /// Returns all entries with keys in `start..=end` in ascending order, read from a single
    /// section
    pub fn range(&self, ctx: &mut RluContext<TreeNode>, start: i64, end: i64) -> Result<Vec<(i64, i64)>> {
        let mut entries = Vec::new();
        if start > end {
            return Ok(entries);
        }

        let section = ctx.section();
        let path = self.descend(&section, start)?;
        let mut curr = path.last().copied();

        while let Some(obj) = curr {
            let (next, done) = section.read(obj, |node| match node {
                TreeNode::Leaf { keys, values, next } => {
                    entries.extend(
                        keys.iter()
                            .zip(values)
                            .filter(|(key, _)| (start..=end).contains(*key))
                            .map(|(key, value)| (*key, *value)),
                    );
                    (*next, keys.last().map_or(false, |last| *last >= end))
                }
                _ => (None, true),
            })?;

            if done {
                break;
            }
            curr = next.map(|next| Self::resolve(&section, next));
        }

        Ok(entries)
    }

    /// Number of entries
    pub fn len(&self, ctx: &mut RluContext<TreeNode>) -> Result<usize> {
        Ok(self.range(ctx, i64::MIN, i64::MAX)?.len())
    }

    pub fn is_empty(&self, ctx: &mut RluContext<TreeNode>) -> Result<bool> {
        Ok(self.len(ctx)? == 0)
    }

    /// Number of levels from the root down to the leaves
    pub fn depth(&self, ctx: &mut RluContext<TreeNode>) -> Result<usize> {
        let section = ctx.section();
        Ok(self.descend(&section, i64::MIN)?.len())
    }

    /// Inserts `value` for `key` and returns the value it replaced
    pub fn insert(&self, ctx: &mut RluContext<TreeNode>, key: i64, value: i64) -> Result<Option<i64>> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        ctx.execute(|ctx| self.insert_in_section(ctx, key, value))
    }

    fn insert_in_section(&self, ctx: &mut RluContext<TreeNode>, key: i64, value: i64) -> Result<Option<i64>> {
        let path = self.descend(ctx, key)?;
        let mut level = path.len().checked_sub(1).ok_or(RluError::InvalidObject(self.anchor))?;

        let mut copy = ctx.try_lock(path[level])?;
        let previous = ctx.write(copy, |node| node.upsert(copy, key, value))??;

        loop {
            let (separator, sibling) = match ctx.write(copy, TreeNode::split)? {
                Some(split) => split,
                None => return Ok(previous),
            };

            let sibling = ctx.alloc(sibling)?;
            ctx.write(copy, |node| {
                if let TreeNode::Leaf { next, .. } = node {
                    *next = Some(sibling);
                }
            })?;
            trace!("thread {} split {} at {}", ctx.id(), path[level], separator);

            if level == 0 {
                let left = ctx.normalize(Some(copy)).unwrap_or(copy);
                let root = ctx.alloc(TreeNode::Inner {
                    keys: vec![separator],
                    children: vec![left, sibling],
                })?;

                let anchor = ctx.try_lock(self.anchor)?;
                ctx.write(anchor, |node| {
                    if let TreeNode::Anchor { root: current } = node {
                        *current = root;
                    }
                })?;
                debug!("thread {} grows the tree with root {}", ctx.id(), root);
                return Ok(previous);
            }

            level -= 1;
            copy = ctx.try_lock(path[level])?;
            ctx.write(copy, |node| node.insert_child(copy, separator, sibling))??;
        }
    }
}
