// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::Rng;
use rlu_engine::{
    list::SortedList, BPlusTree, CoarseList, ConcurrentSet, FineList, Key, LockState, Node, ObjRef, Result, Rlu,
    RluConfig, RluContext, RluError, RluStrategy,
};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
    thread::spawn,
    time::Duration,
};
use threadpool::ThreadPool;

#[cfg(test)]
#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

/// Checks, that no object of the published list is a copy or still locked, and returns the keys
/// in list order, sentinels excluded
fn published_keys(set: &SortedList, ctx: &mut RluContext<Node>) -> Result<Vec<i64>> {
    let rlu = set.rlu().clone();
    let mut keys = Vec::new();
    let mut curr: Option<ObjRef> = Some(set.head());

    while let Some(obj) = curr {
        assert_eq!(rlu.lock_state(obj)?, LockState::Unlocked, "{} must be an unlocked original", obj);
        let node = ctx.execute(|ctx| ctx.read(obj, Node::clone))?;
        if let Key::Value(key) = node.key {
            keys.push(key);
        }
        curr = node.next;
    }

    Ok(keys)
}

fn concurrent_add_same_key<S>(make: fn(&Rlu<Node>) -> Result<S>)
where
    S: ConcurrentSet + 'static,
{
    for _ in 0..100 {
        let rlu = Rlu::new();
        let set = Arc::new(make(&rlu).expect("failed to create set"));
        let barrier = Arc::new(Barrier::new(2));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let (set, barrier) = (set.clone(), barrier.clone());
                let mut ctx = rlu.register().expect("failed to register");
                spawn(move || {
                    barrier.wait();
                    set.add(&mut ctx, 5).expect("failed to add")
                })
            })
            .collect();

        let added = threads
            .into_iter()
            .map(|thread| thread.join().expect("failed to join"))
            .filter(|added| *added)
            .count();
        assert_eq!(added, 1);

        let mut ctx = rlu.register().expect("failed to register");
        assert_eq!(set.keys(&mut ctx).expect("failed to read keys"), vec![5]);
    }
}

#[test]
fn test_concurrent_add_same_key_coarse() {
    concurrent_add_same_key(CoarseList::new);
}

#[test]
fn test_concurrent_add_same_key_fine() {
    concurrent_add_same_key(FineList::new);
}

#[test]
fn test_sequential_inserts_are_ordered() -> Result<()> {
    let rlu = Rlu::new();
    let set = FineList::new(&rlu)?;
    let mut ctx = rlu.register()?;

    for key in [3, 1, 2] {
        assert!(set.add(&mut ctx, key)?);
    }

    assert!(set.contains(&mut ctx, 2)?);
    assert_eq!(set.keys(&mut ctx)?, vec![1, 2, 3]);
    assert_eq!(published_keys(set.list(), &mut ctx)?, vec![1, 2, 3]);

    Ok(())
}

#[test]
fn test_locked_predecessor_does_not_block_readers() -> Result<()> {
    let rlu = Rlu::new();
    let set = Arc::new(CoarseList::new(&rlu)?);
    let mut writer = rlu.register()?;

    set.add(&mut writer, 3)?;
    set.add(&mut writer, 9)?;

    writer.read_lock();
    let position = set.list().find(&writer, 7)?;
    let copy = writer.try_lock(position.prev)?;
    let node = writer.alloc(Node {
        key: Key::Value(7),
        next: writer.normalize(Some(position.curr)),
    })?;
    writer.write(copy, |prev| prev.next = Some(node))?;

    let reader = {
        let set = set.clone();
        let mut ctx = rlu.register()?;
        spawn(move || -> Result<(bool, Vec<i64>)> { Ok((set.contains(&mut ctx, 7)?, set.keys(&mut ctx)?)) })
    };
    let (found, keys) = reader.join().expect("failed to join reader")?;
    assert!(!found);
    assert_eq!(keys, vec![3, 9]);

    writer.abort();
    assert_eq!(rlu.lock_state(position.prev)?, LockState::Unlocked);
    assert!(!set.contains(&mut writer, 7)?);
    assert_eq!(published_keys(set.list(), &mut writer)?, vec![3, 9]);

    Ok(())
}

/// Increments the counter when dropped, also when the owning job panics
struct Finished(Arc<AtomicUsize>);

impl Drop for Finished {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

/// Runs random adds and removes from several writers next to snapshot readers and returns the
/// keys, that must be left in the set
fn stress<S>(set: Arc<S>, rlu: &Rlu<Node>) -> Vec<i64>
where
    S: ConcurrentSet + 'static,
{
    const WRITERS: usize = 6;
    const READERS: usize = 2;
    const OPERATIONS: usize = 2_000;
    const KEYS: i64 = 64;

    let pool = ThreadPool::new(WRITERS + READERS);
    let writers_done = Arc::new(AtomicUsize::new(0));
    let expected = Arc::new(Mutex::new(BTreeSet::new()));

    for id in 0..WRITERS {
        let (set, done, expected) = (set.clone(), writers_done.clone(), expected.clone());
        let mut ctx = rlu.register().expect("failed to register");

        pool.execute(move || {
            let _finished = Finished(done);
            let mut rng = rand::thread_rng();
            let mut owned = BTreeSet::new();

            for _ in 0..OPERATIONS {
                // every writer owns the keys congruent to its id
                let key = rng.gen_range(0..KEYS) * WRITERS as i64 + id as i64;
                if rng.gen_bool(0.6) {
                    let added = set.add(&mut ctx, key).expect("failed to add");
                    assert_eq!(added, owned.insert(key));
                } else {
                    let removed = set.remove(&mut ctx, key).expect("failed to remove");
                    assert_eq!(removed, owned.remove(&key));
                }
            }

            expected.lock().expect("poisoned").extend(owned);
        });
    }

    for _ in 0..READERS {
        let (set, done) = (set.clone(), writers_done.clone());
        let mut ctx = rlu.register().expect("failed to register");

        pool.execute(move || {
            while done.load(Ordering::SeqCst) < WRITERS {
                let keys = set.keys(&mut ctx).expect("failed to read keys");
                assert!(keys.windows(2).all(|pair| pair[0] < pair[1]), "unordered snapshot {:?}", keys);

                let range = set.range(&mut ctx, 0, KEYS * WRITERS as i64 / 2).expect("failed to read range");
                assert!(range.windows(2).all(|pair| pair[0] < pair[1]), "unordered range {:?}", range);
            }
        });
    }

    pool.join();
    assert_eq!(pool.panic_count(), 0);

    let keys = expected.lock().expect("poisoned").iter().copied().collect::<Vec<_>>();
    keys
}

#[test]
fn test_stress_coarse_list() -> Result<()> {
    let rlu = Rlu::new();
    let set = Arc::new(CoarseList::new(&rlu)?);
    let expected = stress(set.clone(), &rlu);

    let mut ctx = rlu.register()?;
    assert_eq!(set.keys(&mut ctx)?, expected);
    assert_eq!(published_keys(set.list(), &mut ctx)?, expected);
    Ok(())
}

#[test]
fn test_stress_fine_list() -> Result<()> {
    let rlu = Rlu::new();
    let set = Arc::new(FineList::new(&rlu)?);
    let expected = stress(set.clone(), &rlu);

    let mut ctx = rlu.register()?;
    assert_eq!(set.keys(&mut ctx)?, expected);
    assert_eq!(published_keys(set.list(), &mut ctx)?, expected);
    Ok(())
}

#[test]
fn test_stress_with_small_write_log() -> Result<()> {
    let rlu = Rlu::with_config(RluConfig::default().with_max_log_entries(6).with_max_free_nodes(1))?;
    let set = Arc::new(FineList::new(&rlu)?);
    let expected = stress(set.clone(), &rlu);

    let mut ctx = rlu.register()?;
    assert_eq!(published_keys(set.list(), &mut ctx)?, expected);
    Ok(())
}

#[test]
fn test_synchronize_terminates_with_busy_readers() -> Result<()> {
    let rlu = Rlu::<usize>::new();
    let counter = rlu.alloc(0)?;
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let stop = stop.clone();
            let mut ctx = rlu.register().expect("failed to register");
            spawn(move || {
                let mut last = 0;
                while !stop.load(Ordering::SeqCst) {
                    let value = ctx.execute(|ctx| ctx.read(counter, |value| *value)).expect("failed to read");
                    assert!(value >= last, "counter went back from {} to {}", last, value);
                    last = value;
                }
            })
        })
        .collect();

    let mut writer = rlu.register()?;
    for _ in 0..500 {
        writer.execute(|ctx| {
            let copy = ctx.try_lock(counter)?;
            ctx.write(copy, |value| *value += 1)
        })?;
    }

    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().expect("failed to join reader");
    }

    assert_eq!(writer.execute(|ctx| ctx.read(counter, |value| *value))?, 500);
    assert_eq!(rlu.lock_state(counter)?, LockState::Unlocked);
    Ok(())
}

#[test]
fn test_versions_never_go_back_within_a_section() -> Result<()> {
    const COMMITS: u64 = 2_000;
    const READS_PER_SECTION: usize = 64;

    let rlu = Rlu::<u64>::new();
    let (x, y) = (rlu.alloc(0)?, rlu.alloc(0)?);
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let stop = stop.clone();
            let mut ctx = rlu.register().expect("failed to register");
            spawn(move || -> Result<()> {
                while !stop.load(Ordering::SeqCst) {
                    let section = ctx.section();
                    let mut seen = 0;

                    for _ in 0..READS_PER_SECTION {
                        let x_value = section.read(section.dereference(Some(x)).unwrap_or(x), |value| *value)?;
                        let y_value = section.read(section.dereference(Some(y)).unwrap_or(y), |value| *value)?;

                        // both objects are written by the same commit
                        assert_eq!(x_value, y_value, "commit seen half applied");
                        assert!(x_value >= seen, "section went back from {} to {}", seen, x_value);
                        seen = x_value;
                    }
                }
                Ok(())
            })
        })
        .collect();

    let mut writer = rlu.register()?;
    for _ in 0..COMMITS {
        writer.execute(|ctx| {
            let x_copy = ctx.try_lock(x)?;
            let y_copy = ctx.try_lock(y)?;
            ctx.write(x_copy, |value| *value += 1)?;
            ctx.write(y_copy, |value| *value += 1)
        })?;
    }

    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().expect("failed to join reader")?;
    }

    assert_eq!(writer.execute(|ctx| ctx.read(x, |value| *value))?, COMMITS);
    assert_eq!(writer.execute(|ctx| ctx.read(y, |value| *value))?, COMMITS);
    Ok(())
}

#[test]
fn test_tree_range_scans_during_inserts() -> Result<()> {
    const KEYS: i64 = 2_000;

    let rlu = Rlu::new();
    let tree = Arc::new(BPlusTree::new(&rlu)?);
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let (tree, done) = (tree.clone(), done.clone());
            let mut ctx = rlu.register().expect("failed to register");
            spawn(move || -> Result<()> {
                let mut rng = rand::thread_rng();
                let mut last_len = 0;
                while !done.load(Ordering::SeqCst) {
                    let start = rng.gen_range(0..KEYS);
                    let entries = tree.range(&mut ctx, start, start + 50)?;
                    assert!(entries.windows(2).all(|pair| pair[0].0 < pair[1].0));
                    assert!(entries.iter().all(|(key, value)| *value == key * 10));

                    // keys are inserted in ascending order, a snapshot holds a prefix of them
                    let all = tree.range(&mut ctx, 0, KEYS)?;
                    assert!(all.iter().enumerate().all(|(i, (key, _))| *key == i as i64));
                    assert!(all.len() >= last_len);
                    last_len = all.len();
                }
                Ok(())
            })
        })
        .collect();

    let mut writer = rlu.register()?;
    for key in 0..KEYS {
        assert_eq!(tree.insert(&mut writer, key, key * 10)?, None);
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        reader.join().expect("failed to join reader")?;
    }

    assert_eq!(tree.len(&mut writer)?, KEYS as usize);
    assert_eq!(tree.range(&mut writer, 100, 102)?, vec![(100, 1000), (101, 1010), (102, 1020)]);
    Ok(())
}

#[test]
fn test_multiple_readers_single_write() -> Result<()> {
    const EXPECTED: usize = 15;

    let rlu = Rlu::<usize>::new();
    let var = rlu.alloc(6)?;

    let mut ctx = rlu.register()?;
    let writer = spawn(move || {
        ctx.execute(|ctx| {
            let copy = ctx.try_lock(var)?;
            ctx.write(copy, |value| *value += 9)
        })
        .expect("failed to write");
    });

    let readers: Vec<_> = (0..16)
        .map(|_| {
            let mut ctx = rlu.register().expect("failed to register");
            spawn(move || {
                let value = ctx.execute(|ctx| ctx.read(var, |value| *value)).expect("failed to read");
                assert!(value == 6 || value == EXPECTED, "unexpected value {}", value);
            })
        })
        .collect();

    writer.join().expect("failed to join writer");
    readers
        .into_iter()
        .for_each(|reader| reader.join().expect("failed to join reader"));

    let mut ctx = rlu.register()?;
    assert_eq!(ctx.execute(|ctx| ctx.read(var, |value| *value))?, EXPECTED);
    Ok(())
}

#[test]
fn test_concurrent_reads_complex_type() -> Result<()> {
    let rlu = Rlu::<Vec<String>>::new();
    let var = rlu.alloc(Vec::new())?;

    let mut writer = rlu.register()?;
    writer.execute(|ctx| {
        let copy = ctx.try_lock(var)?;
        ctx.write(copy, |list| list.push("hello, world".to_string()))
    })?;

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let mut ctx = rlu.register().expect("failed to register");
            spawn(move || {
                ctx.execute(|ctx| ctx.read(var, |list| list.iter().any(|entry| entry == "hello, world")))
                    .expect("failed to read")
            })
        })
        .collect();

    for reader in readers {
        assert!(reader.join().expect("failed to join reader"));
    }
    Ok(())
}

#[test]
fn test_abort_strategy_reports_contention() -> Result<()> {
    let rlu = Rlu::<usize>::with_strategy(RluStrategy::Abort);
    let var = rlu.alloc(1)?;
    let mut holder = rlu.register()?;
    let mut other = rlu.register()?;

    holder.read_lock();
    holder.try_lock(var)?;

    let result = other.execute(|ctx| {
        let copy = ctx.try_lock(var)?;
        ctx.write(copy, |value| *value = 2)
    });
    assert_eq!(result, Err(RluError::Locked(var)));

    holder.read_unlock();
    other.execute(|ctx| {
        let copy = ctx.try_lock(var)?;
        ctx.write(copy, |value| *value = 2)
    })?;
    assert_eq!(other.execute(|ctx| ctx.read(var, |value| *value))?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_set_async() -> Result<()> {
    let rlu = Rlu::new();
    let set = Arc::new(FineList::new(&rlu)?);
    let mut tasks = Vec::new();

    for id in 0..8i64 {
        let set = set.clone();
        let mut ctx = rlu.register()?;
        tasks.push(tokio::spawn(async move {
            for key in 0..32 {
                assert!(set.add(&mut ctx, key * 8 + id).expect("failed to add"));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            for key in 0..16 {
                assert!(set.remove(&mut ctx, key * 8 + id).expect("failed to remove"));
            }
        }));
    }

    for task in tasks {
        task.await.expect("failed to join task");
    }

    let mut ctx = rlu.register()?;
    let expected: Vec<i64> = (16 * 8..32 * 8).collect();
    assert_eq!(set.keys(&mut ctx)?, expected);
    Ok(())
}
