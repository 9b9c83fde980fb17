use crate::chunk::HazardChunk;
use crate::sync::atomic::{AtomicIsize, AtomicPtr, AtomicUsize};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

/// Synchronization point between hazard pointers and the writers they guard
/// against: the unit of reclamation.
///
/// A domain owns the hazard-slot storage (a chain of chunks) and a lock-free
/// stack of retired objects. An object retired into a domain is destroyed
/// only once a snapshot of every hazard slot in the domain no longer contains
/// its address. Contexts created from other domains provide no protection
/// here; always retire through the same domain whose contexts readers use.
///
/// Domains are shared between contexts through [`Arc`]; the last holder's
/// drop reclaims everything still pending. There is no process-global domain:
/// each data structure creates its own, so dropping the structure (and its
/// contexts) bounds the lifetime of every node it ever allocated.
///
/// The engine underneath is untyped: chunks store `*mut u8` and each retire
/// record carries a reclaimer function that knows the concrete type. The `T`
/// parameter exists so the typed [`retire`](Self::retire) entry points can
/// attach the right reclaimer, and so a context cannot be pointed at a domain
/// that retires a different type.
pub struct HazardDomain<T> {
    chunks: AtomicPtr<HazardChunk>,
    retired: RetireStack,
    /// Approximate count of records on `retired`; release add, relaxed read.
    count: AtomicIsize,
    slot_total: AtomicUsize,
    _marker: PhantomData<fn(T)>,
}

// Safety: the domain hands out no references to T; retired objects may be
// destroyed on any thread, hence T: Send.
unsafe impl<T: Send> Send for HazardDomain<T> {}
unsafe impl<T: Send> Sync for HazardDomain<T> {}

impl<T> HazardDomain<T> {
    /// Create a new domain behind a shared handle.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            chunks: AtomicPtr::new(ptr::null_mut()),
            retired: RetireStack::new(),
            count: AtomicIsize::new(0),
            slot_total: AtomicUsize::new(0),
            _marker: PhantomData,
        })
    }

    /// Reserve a block of `block_len` hazard slots.
    ///
    /// Walks the chunk chain; if no chunk has a free block of that size, a
    /// fresh chunk sized for `block_len` is pushed and the walk retries.
    pub(crate) fn reserve(&self, block_len: usize) -> NonNull<AtomicPtr<u8>> {
        loop {
            let mut p = self.chunks.load(Ordering::Acquire);
            while !p.is_null() {
                // Safety: chunks are never unlinked or freed while the domain
                // is alive.
                let chunk = unsafe { &*p };
                if let Some(block) = chunk.reserve(block_len) {
                    return block;
                }
                p = chunk.next.load(Ordering::Acquire);
            }
            self.push_chunk(block_len);
        }
    }

    fn push_chunk(&self, block_size: usize) {
        let chunk = Box::into_raw(Box::new(HazardChunk::new(block_size)));
        // Safety: not shared until the CAS below; freed only by our Drop.
        let slots = unsafe { &*chunk }.slot_count();
        let mut head = self.chunks.load(Ordering::Acquire);
        loop {
            unsafe { &*chunk }.next.store(head, Ordering::Relaxed);
            match self
                .chunks
                .compare_exchange_weak(head, chunk, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.slot_total.fetch_add(slots, Ordering::Release);
                    break;
                }
                Err(now) => head = now,
            }
        }
    }

    /// Return a block obtained from [`reserve`](Self::reserve).
    ///
    /// Releasing a block no chunk owns is a programming error.
    pub(crate) fn release(&self, block: NonNull<AtomicPtr<u8>>) {
        let mut p = self.chunks.load(Ordering::Acquire);
        while !p.is_null() {
            // Safety: chunk chain is stable for the domain's lifetime.
            let chunk = unsafe { &*p };
            if chunk.release(block) {
                return;
            }
            p = chunk.next.load(Ordering::Acquire);
        }
        panic!("released a hazard block that no chunk of this domain owns");
    }

    pub(crate) fn slot_total(&self) -> usize {
        self.slot_total.load(Ordering::Relaxed)
    }

    /// Retire `ptr`, deferring destruction until no hazard slot protects it.
    ///
    /// `T: Send` because the object may be destroyed by whichever thread runs
    /// the next collection.
    ///
    /// # Safety
    ///
    /// 1. `ptr` came from `Box::into_raw` and nothing else owns it.
    /// 2. `ptr` is unreachable to new readers (it has been unlinked).
    /// 3. `ptr` has not already been retired.
    pub unsafe fn retire(&self, ptr: *mut T)
    where
        T: Send,
    {
        self.retire_with(ptr.cast(), reclaim_box::<T>);
    }

    /// Retire every non-null pointer in `ptrs`, nulling the entries out.
    ///
    /// # Safety
    ///
    /// Each non-null entry must satisfy the [`retire`](Self::retire)
    /// contract.
    pub unsafe fn retire_many(&self, ptrs: &mut [*mut T])
    where
        T: Send,
    {
        for entry in ptrs {
            if !entry.is_null() {
                // Safety: forwarded from the caller.
                unsafe { self.retire(*entry) };
                *entry = ptr::null_mut();
            }
        }
    }

    pub(crate) fn retire_with(&self, ptr: *mut u8, reclaimer: unsafe fn(*mut u8)) {
        let record = Box::into_raw(Box::new(RetireRecord {
            next: AtomicPtr::new(ptr::null_mut()),
            ptr,
            reclaimer,
        }));
        self.retired.push(record);
        self.count.fetch_add(1, Ordering::Release);
        self.collect_if_required();
    }

    /// Capture the current value of every hazard slot in the domain.
    ///
    /// Values are sorted with the mark bit stripped, so an address published
    /// from a marked link still matches the raw retire address. The snapshot
    /// is reused for a whole collection pass, amortizing the sort across
    /// every record examined. Mostly internal; useful when layering custom
    /// reclamation on the domain.
    pub fn snapshot(&self) -> HazardSnapshot {
        crate::light_barrier();
        let mut expected = 0;
        let mut p = self.chunks.load(Ordering::Acquire);
        while !p.is_null() {
            // Safety: chunk chain is stable for the domain's lifetime.
            let chunk = unsafe { &*p };
            expected += chunk.slot_count();
            p = chunk.next.load(Ordering::Acquire);
        }
        let mut values = Vec::with_capacity(expected);
        let mut p = self.chunks.load(Ordering::Acquire);
        while !p.is_null() {
            // Safety: as above.
            let chunk = unsafe { &*p };
            chunk.copy_slots(&mut values);
            p = chunk.next.load(Ordering::Acquire);
        }
        for value in values.iter_mut() {
            *value = (*value as usize & !1) as *mut u8;
        }
        values.sort_unstable();
        HazardSnapshot { values }
    }

    /// Run one collection pass: destroy every retired object whose address is
    /// absent from the hazard snapshot. Returns how many were reclaimed.
    ///
    /// Multiple collectors may run in parallel; each steals a disjoint
    /// portion of the retire stack.
    pub fn collect(&self) -> usize {
        let mut node = self.retired.take_all();
        if node.is_null() {
            return 0;
        }
        let snapshot = self.snapshot();
        let mut survivors: *mut RetireRecord = ptr::null_mut();
        let mut reclaimed = 0;
        while !node.is_null() {
            // Safety: we own the stolen sublist exclusively.
            let record = unsafe { &*node };
            let next = record.next.load(Ordering::Relaxed);
            if snapshot.covers(record.ptr) {
                record.next.store(survivors, Ordering::Relaxed);
                survivors = node;
            } else {
                // Safety: no hazard slot covers ptr, and it was unlinked
                // before retirement, so this is the only reference left.
                let record = unsafe { Box::from_raw(node) };
                unsafe { (record.reclaimer)(record.ptr) };
                reclaimed += 1;
            }
            node = next;
        }
        while !survivors.is_null() {
            // Safety: survivors are ours until pushed back.
            let next = unsafe { &*survivors }.next.load(Ordering::Relaxed);
            self.retired.push(survivors);
            survivors = next;
        }
        reclaimed
    }

    /// Collect when the retire backlog exceeds the domain's hazard-slot
    /// count.
    ///
    /// Racing callers may each zero the counter and run a pass; that is
    /// redundant work, not a safety problem.
    pub fn collect_if_required(&self) {
        let threshold = self.slot_total.load(Ordering::Relaxed) as isize;
        let mut backlog = self.count.load(Ordering::Relaxed);
        while backlog > threshold {
            match self
                .count
                .compare_exchange_weak(backlog, 0, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.collect();
                    return;
                }
                Err(now) => backlog = now,
            }
        }
    }
}

impl<T> Drop for HazardDomain<T> {
    fn drop(&mut self) {
        // &mut self: every context is gone, so no hazard slot is live and
        // everything still retired is reclaimable.
        let mut node = self.retired.take_all();
        while !node.is_null() {
            // Safety: exclusive access; records were Box-allocated.
            let record = unsafe { Box::from_raw(node) };
            node = record.next.load(Ordering::Relaxed);
            unsafe { (record.reclaimer)(record.ptr) };
        }
        let mut chunk = self.chunks.load(Ordering::Relaxed);
        while !chunk.is_null() {
            // Safety: exclusive access; chunks were Box-allocated.
            let owned = unsafe { Box::from_raw(chunk) };
            debug_assert!(!owned.has_reservations(), "a context outlived its domain");
            chunk = owned.next.load(Ordering::Relaxed);
        }
    }
}

/// Destroys a `Box<T>` payload. Attached to each retire record so the
/// collection machinery never needs the concrete type.
unsafe fn reclaim_box<T>(ptr: *mut u8) {
    // Safety: the retire contract guarantees ptr came from Box::<T>::into_raw
    // and that we hold the only reference.
    drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
}

/// A sorted view of every hazard-slot value at one point in time.
pub struct HazardSnapshot {
    values: Vec<*mut u8>,
}

impl HazardSnapshot {
    /// Whether some slot protected `ptr` when the snapshot was taken.
    pub fn covers(&self, ptr: *mut u8) -> bool {
        self.values.binary_search(&ptr).is_ok()
    }
}

struct RetireRecord {
    next: AtomicPtr<RetireRecord>,
    ptr: *mut u8,
    /// Safe to call exactly once, with `ptr`, once nothing protects `ptr`.
    reclaimer: unsafe fn(*mut u8),
}

/// Treiber stack of retire records.
struct RetireStack {
    head: AtomicPtr<RetireRecord>,
}

impl RetireStack {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, record: *mut RetireRecord) {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // Safety: record is not visible to other threads until the CAS.
            unsafe { &*record }.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange_weak(head, record, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(now) => head = now,
            }
        }
    }

    /// Steal the whole stack; the caller owns the returned sublist.
    fn take_all(&self) -> *mut RetireRecord {
        self.head.swap(ptr::null_mut(), Ordering::Acquire)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::HazardDomain;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountDrops(Arc<AtomicUsize>);
    impl Drop for CountDrops {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn reserve_release_roundtrip() {
        let domain = HazardDomain::<u64>::new();
        let a = domain.reserve(3);
        let b = domain.reserve(3);
        assert_ne!(a, b);
        assert_eq!(domain.slot_total(), 3 * 32);
        domain.release(a);
        domain.release(b);
    }

    #[test]
    fn mismatched_block_sizes_get_their_own_chunks() {
        let domain = HazardDomain::<u64>::new();
        let a = domain.reserve(3);
        let b = domain.reserve(5);
        assert_eq!(domain.slot_total(), 3 * 32 + 5 * 32);
        domain.release(a);
        domain.release(b);
    }

    #[test]
    fn collect_spares_protected_pointers() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = HazardDomain::<CountDrops>::new();

        let guarded = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
        let unguarded = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));

        let block = domain.reserve(1);
        // Safety: block points at the first slot of a live chunk.
        unsafe { block.as_ref() }.store(guarded.cast(), Ordering::Release);

        // Safety: both pointers are Box-allocated and unreachable elsewhere.
        unsafe { domain.retire(guarded) };
        unsafe { domain.retire(unguarded) };

        assert_eq!(domain.collect(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        unsafe { block.as_ref() }.store(core::ptr::null_mut(), Ordering::Release);
        assert_eq!(domain.collect(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        domain.release(block);
    }

    #[test]
    fn snapshot_strips_mark_bit() {
        let domain = HazardDomain::<u64>::new();
        let x = Box::into_raw(Box::new(9u64));
        let block = domain.reserve(1);
        // Publish a marked address, as a traversal might from a marked link.
        let marked = (x as usize | 1) as *mut u8;
        unsafe { block.as_ref() }.store(marked, Ordering::Release);

        let snapshot = domain.snapshot();
        assert!(snapshot.covers(x.cast()));

        unsafe { block.as_ref() }.store(core::ptr::null_mut(), Ordering::Release);
        domain.release(block);
        let _ = unsafe { Box::from_raw(x) };
    }

    #[test]
    fn drop_reclaims_outstanding_records() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = HazardDomain::<CountDrops>::new();
        for _ in 0..10 {
            let p = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
            // Safety: p is Box-allocated and unreachable elsewhere.
            unsafe { domain.retire(p) };
        }
        drop(domain);
        assert_eq!(drops.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn retire_backlog_triggers_collection() {
        let drops = Arc::new(AtomicUsize::new(0));
        let domain = HazardDomain::<CountDrops>::new();
        // One chunk of one-slot blocks: the backlog threshold is 32.
        let block = domain.reserve(1);
        for _ in 0..100 {
            let p = Box::into_raw(Box::new(CountDrops(Arc::clone(&drops))));
            // Safety: p is Box-allocated and unreachable elsewhere.
            unsafe { domain.retire(p) };
        }
        // With nothing protected, the backlog check must have drained most of
        // the stack well before 100 retires.
        assert!(drops.load(Ordering::SeqCst) >= 100 - 33);
        domain.release(block);
    }
}
