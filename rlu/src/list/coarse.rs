// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{ConcurrentSet, Node, SortedList};
use crate::{Result, Rlu, RluContext};
use log::*;
use std::sync::{Mutex, PoisonError};

/// A sorted set, where updates are serialized by a single writer lock. Readers never take the
/// writer lock.
pub struct CoarseList {
    list: SortedList,
    writer: Mutex<()>,
}

impl CoarseList {
    pub fn new(rlu: &Rlu<Node>) -> Result<Self> {
        Ok(Self {
            list: SortedList::new(rlu)?,
            writer: Mutex::new(()),
        })
    }

    pub fn list(&self) -> &SortedList {
        &self.list
    }
}

impl ConcurrentSet for CoarseList {
    fn add(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        ctx.execute(|ctx| {
            let position = self.list.find(ctx, key)?;
            if position.is_match(key) {
                return Ok(false);
            }

            self.list.link(ctx, position, key)?;
            trace!("thread {} added {}", ctx.id(), key);
            Ok(true)
        })
    }

    fn remove(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        ctx.execute(|ctx| {
            let position = self.list.find(ctx, key)?;
            if !position.is_match(key) {
                return Ok(false);
            }

            self.list.unlink(ctx, position)?;
            trace!("thread {} removed {}", ctx.id(), key);
            Ok(true)
        })
    }

    fn contains(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool> {
        self.list.contains(ctx, key)
    }

    fn keys(&self, ctx: &mut RluContext<Node>) -> Result<Vec<i64>> {
        self.list.keys(ctx)
    }

    fn range(&self, ctx: &mut RluContext<Node>, start: i64, end: i64) -> Result<Vec<i64>> {
        self.list.range(ctx, start, end)
    }
}
