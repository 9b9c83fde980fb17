use hazmap::{HazardContext, HazardDomain, MarkedPtr, SplitOrderedMap};

use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

struct CountDrops(Arc<AtomicUsize>);
impl Drop for CountDrops {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Node {
    value: usize,
    next: MarkedPtr<Node>,
}

/// 32 threads concurrently prepend 50 pre-allocated nodes each onto one list
/// head. The interleaving is arbitrary, but each thread's own nodes must keep
/// their relative order.
#[test]
fn concurrent_prepend_keeps_per_thread_order() {
    const THREADS: usize = 32;
    const PER_THREAD: usize = 50;

    let head: &'static MarkedPtr<Node> = Box::leak(Box::new(MarkedPtr::null()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // Pre-allocate before the rendezvous so the measured section
                // is pure CAS traffic.
                let nodes: Vec<*mut Node> = (0..PER_THREAD)
                    .map(|i| {
                        Box::into_raw(Box::new(Node {
                            value: tid * PER_THREAD + i,
                            next: MarkedPtr::null(),
                        }))
                    })
                    .collect();
                barrier.wait();
                // Prepend in descending value order, so a front-to-back walk
                // sees this thread's values ascending.
                for &node in nodes.iter().rev() {
                    loop {
                        let (old, _) = head.load();
                        // Safety: node is unpublished until the CAS lands.
                        unsafe { &*node }.next.store(old);
                        if head.cas(old, node) {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut walked = Vec::new();
    let (mut cur, _) = head.load();
    while !cur.is_null() {
        // Safety: all threads joined; the list is ours.
        let node = unsafe { Box::from_raw(cur) };
        walked.push(node.value);
        cur = node.next.load().0;
    }
    assert_eq!(walked.len(), THREADS * PER_THREAD);

    let mut last_per_thread = vec![None::<usize>; THREADS];
    for value in walked {
        let tid = value / PER_THREAD;
        if let Some(prev) = last_per_thread[tid] {
            assert!(prev < value, "thread {tid} nodes out of order");
        }
        last_per_thread[tid] = Some(value);
    }
}

/// 8 threads each insert 1024 distinct hashes and then delete their own keys.
/// Afterwards the map is empty, finds miss, and reclamation accounts for
/// every value.
#[test]
fn stress_insert_then_delete_own_keys() {
    const THREADS: u32 = 8;
    const PER_THREAD: usize = 1024;

    let drops = Arc::new(AtomicUsize::new(0));
    let map = Arc::new(SplitOrderedMap::new(8, 4));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let map = Arc::clone(&map);
            let barrier = Arc::clone(&barrier);
            let drops = Arc::clone(&drops);
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(0xC0FFEE + u64::from(tid));
                // Tag the low bits with the thread id so hashes never collide
                // across threads.
                let mut keys = HashSet::with_capacity(PER_THREAD);
                while keys.len() < PER_THREAD {
                    // Top bit clear: the reversed-key scheme folds h and
                    // h | 0x8000_0000 onto the same list key.
                    keys.insert(((rng.gen::<u32>() & 0x0FFF_FFFF) << 3) | tid);
                }
                let keys: Vec<u32> = keys.into_iter().collect();

                let mut ctx = map.context::<3, 16>();
                for &key in &keys {
                    assert!(map.insert(key, CountDrops(Arc::clone(&drops)), &mut ctx));
                }
                barrier.wait();
                for &key in &keys {
                    assert!(map.remove(key, &mut ctx));
                    assert!(map.find(key, &mut ctx).is_none());
                }
                keys
            })
        })
        .collect();

    let mut all_keys = Vec::new();
    for handle in handles {
        all_keys.extend(handle.join().unwrap());
    }

    assert_eq!(map.len(), 0);
    let mut ctx = map.context::<3, 0>();
    for &key in all_keys.iter().step_by(37) {
        assert!(map.find(key, &mut ctx).is_none());
    }
    drop(ctx);

    map.domain().collect();
    let (_, data) = map.check_integrity();
    assert_eq!(data, 0);

    drop(map);
    assert_eq!(drops.load(Ordering::SeqCst), THREADS as usize * PER_THREAD);
}

/// A tiny local retired array overflows constantly without ever growing the
/// backlog: unprotected entries are reclaimed on each overflow and the
/// domain's threshold keeps draining the rest.
#[test]
fn retire_overflow_stays_bounded() {
    let drops = Arc::new(AtomicUsize::new(0));
    let domain = HazardDomain::<CountDrops>::new();
    let mut ctx = HazardContext::<CountDrops, 3, 2>::new(Arc::clone(&domain));

    for i in 1..=1000usize {
        let p = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
        // Safety: fresh Box, unreachable elsewhere.
        unsafe { ctx.retire(p) };
        // Nothing is protected, so every overflow reclaims the whole local
        // array: at most R entries are ever pending.
        assert!(drops.load(Ordering::SeqCst) + 2 >= i);
    }
    assert!(drops.load(Ordering::SeqCst) >= 998);

    drop(ctx);
    drop(domain);
    assert_eq!(drops.load(Ordering::SeqCst), 1000);
}

/// Threads hammer a small shared key space with mixed operations; the final
/// item count must agree with the net number of successful inserts.
#[test]
fn mixed_workload_keeps_counters_consistent() {
    const THREADS: usize = 4;
    const OPS: usize = 4000;
    const KEY_SPACE: u32 = 128;

    let map = Arc::new(SplitOrderedMap::new(4, 4));
    let inserted = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let map = Arc::clone(&map);
            let inserted = Arc::clone(&inserted);
            let removed = Arc::clone(&removed);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut rng = rand::rngs::StdRng::seed_from_u64(tid as u64);
                let mut ctx = map.context::<3, 8>();
                barrier.wait();
                for _ in 0..OPS {
                    let key = rng.gen_range(0..KEY_SPACE);
                    match rng.gen_range(0..3) {
                        0 => {
                            if map.insert(key, u64::from(key), &mut ctx) {
                                inserted.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        1 => {
                            if let Some(guard) = map.find(key, &mut ctx) {
                                assert_eq!(*guard, u64::from(key));
                            }
                        }
                        _ => {
                            if map.remove(key, &mut ctx) {
                                removed.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let net = inserted.load(Ordering::SeqCst) - removed.load(Ordering::SeqCst);
    assert_eq!(map.len(), net);
    let (_, data) = map.check_integrity();
    assert_eq!(data, net);
}

/// Concurrent inserters racing into lazily initialized buckets must agree on
/// a single dummy per bucket.
#[test]
fn racing_bucket_initialization_converges() {
    const THREADS: u32 = 8;

    let map = Arc::new(SplitOrderedMap::new(64, 64));
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let map = Arc::clone(&map);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut ctx = map.context::<3, 8>();
                barrier.wait();
                // Every thread touches the same buckets in the same order.
                for bucket in 0u32..64 {
                    let hash = bucket + 64 * (tid + 1);
                    assert!(map.insert(hash, bucket, &mut ctx));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let (dummies, data) = map.check_integrity();
    assert_eq!(data, map.len());
    assert!(dummies <= 64, "at most one dummy per bucket, got {dummies}");
}
