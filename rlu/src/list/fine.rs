// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use super::{ConcurrentSet, Node, SortedList};
use crate::{Result, Rlu, RluContext};
use log::*;

/// A sorted set, where writers only lock the nodes they change. Writers touching disjoint parts
/// of the list commit concurrently, a conflict aborts and retries the section.
///
/// The position found by a traversal stays valid until the section locks it: a concurrent
/// writer, that changed the same nodes, holds their locks until its grace period has elapsed,
/// which includes the traversal of this section.
pub struct FineList {
    list: SortedList,
}

impl FineList {
    pub fn new(rlu: &Rlu<Node>) -> Result<Self> {
        Ok(Self {
            list: SortedList::new(rlu)?,
        })
    }

    pub fn list(&self) -> &SortedList {
        &self.list
    }
}

impl ConcurrentSet for FineList {
    fn add(&self, ctx: &mut RluContext<Node>, key: i64) -> Result<bool> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RluError, RluStrategy};

    #[test]
    fn test_add_remove() -> Result<()> {
        let rlu = Rlu::new();
        let set = FineList::new(&rlu)?;
        let mut ctx = rlu.register()?;

        for key in [5, -3, 8, 0] {
            assert!(set.add(&mut ctx, key)?);
        }
        assert_eq!(set.keys(&mut ctx)?, vec![-3, 0, 5, 8]);

        assert!(set.remove(&mut ctx, 5)?);
        assert!(!set.remove(&mut ctx, 5)?);
        assert!(!set.contains(&mut ctx, 5)?);
        assert_eq!(set.keys(&mut ctx)?, vec![-3, 0, 8]);
        assert_eq!(set.len(&mut ctx)?, 3);

        Ok(())
    }

    #[test]
    fn test_conflicting_writer_aborts() -> Result<()> {
        let rlu = Rlu::with_strategy(RluStrategy::Abort);
        let set = FineList::new(&rlu)?;
        let mut writer = rlu.register()?;
        let mut other = rlu.register()?;

        set.add(&mut writer, 10)?;

        // hold the lock on the predecessor of 5
        writer.read_lock();
        let position = set.list().find(&writer, 5)?;
        writer.try_lock(position.prev)?;

        assert_eq!(set.add(&mut other, 5), Err(RluError::Locked(position.prev)));
        assert!(set.contains(&mut other, 10)?);

        writer.abort();
        assert!(set.add(&mut other, 5)?);
        assert_eq!(set.keys(&mut other)?, vec![5, 10]);

        Ok(())
    }
}
