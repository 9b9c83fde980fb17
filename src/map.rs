use crate::context::HazardContext;
use crate::domain::HazardDomain;
use crate::list::{self, ListNode, HP_CUR, HP_NEXT, HP_PREV};
use crate::sync::atomic::{AtomicPtr, AtomicUsize};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr;
use core::sync::atomic::Ordering;

/// A bucket table published as one immutable unit.
///
/// Readers load the shape pointer once and see a `(buckets, bucket_count)`
/// pair that always matches. Expansion builds a doubled shape, copies the old
/// anchors, and CAS-publishes it; the superseded shape stays chained through
/// `prev` (anchors it handed out must remain valid) and is freed when the map
/// drops. Shapes grow geometrically, so the dead chain totals less than the
/// live table.
struct Shape<V> {
    bucket_count: u32,
    buckets: Box<[AtomicPtr<ListNode<V>>]>,
    prev: *mut Shape<V>,
}

impl<V> Shape<V> {
    fn new(bucket_count: u32, prev: *mut Shape<V>) -> Box<Self> {
        let buckets = (0..bucket_count)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Box::new(Self {
            bucket_count,
            buckets,
            prev,
        })
    }

    fn anchor(&self, slot: u32) -> &AtomicPtr<ListNode<V>> {
        &self.buckets[slot as usize]
    }
}

/// A lock-free hash map over 32-bit hashes: a split-ordered list with a
/// lazily materialized bucket table.
///
/// All entries live in one ordered list keyed by the bit-reversed hash;
/// bucket anchors are dummy nodes inserted at stable list positions, so
/// doubling the table never moves an entry (Shalev-Shavit). Key equality is
/// hash equality: callers own the hash function and its distribution.
///
/// Every operation takes a [`HazardContext`] with at least three hazard
/// slots, created from [`context`](Self::context) or from the map's
/// [`domain`](Self::domain). Contexts are per-thread; the map itself is
/// `Sync` and operates through `&self`.
pub struct SplitOrderedMap<V: Send> {
    shape: AtomicPtr<Shape<V>>,
    max_bucket_len: u32,
    item_count: AtomicUsize,
    domain: Arc<HazardDomain<ListNode<V>>>,
}

// Safety: the map shares values across threads through &V guards (Sync needs
// V: Sync) and destroys them on arbitrary threads (Send).
unsafe impl<V: Send> Send for SplitOrderedMap<V> {}
unsafe impl<V: Send + Sync> Sync for SplitOrderedMap<V> {}

impl<V: Send> SplitOrderedMap<V> {
    /// Create a map with `initial_buckets` anchors (a power of two), doubling
    /// whenever a bucket's length passes `max_bucket_len`.
    pub fn new(initial_buckets: u32, max_bucket_len: u32) -> Self {
        assert!(
            initial_buckets.is_power_of_two(),
            "initial_buckets must be a power of two"
        );
        assert!(max_bucket_len >= 1, "max_bucket_len must be at least 1");
        let shape = Shape::new(initial_buckets, ptr::null_mut());
        // Bucket 0's dummy permanently heads the list; every traversal and
        // the parent search bottom out here.
        let head = Box::into_raw(Box::new(ListNode::dummy(0)));
        shape.anchor(0).store(head, Ordering::Relaxed);
        Self {
            shape: AtomicPtr::new(Box::into_raw(shape)),
            max_bucket_len,
            item_count: AtomicUsize::new(0),
            domain: HazardDomain::new(),
        }
    }

    /// The domain this map retires its nodes through. Contexts used with the
    /// map must come from here.
    pub fn domain(&self) -> &Arc<HazardDomain<ListNode<V>>> {
        &self.domain
    }

    /// A context bound to this map's domain.
    pub fn context<const S: usize, const R: usize>(&self) -> HazardContext<ListNode<V>, S, R> {
        HazardContext::new(Arc::clone(&self.domain))
    }

    /// Number of entries, counted at the insert/remove linearization points.
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> u32 {
        self.shape_ref().bucket_count
    }

    fn shape_ref(&self) -> &Shape<V> {
        // Safety: shapes are freed only in Drop.
        unsafe { &*self.shape.load(Ordering::Acquire) }
    }

    /// Look up `hash`. The guard keeps the entry protected for as long as it
    /// borrows the context.
    pub fn find<'g, const S: usize, const R: usize>(
        &self,
        hash: u32,
        ctx: &'g mut HazardContext<ListNode<V>, S, R>,
    ) -> Option<Guarded<'g, V>> {
        assert!(S >= 3, "map operations need three hazard slots");
        let shape = self.shape_ref();
        let slot = hash % shape.bucket_count;
        let dummy = self.bucket_dummy(shape, slot, ctx);
        // Safety: dummy is never retired; all reachable nodes belong to this
        // map's list and domain.
        let pos = unsafe { list::find(&(*dummy).next, list::data_key(hash), ctx) };
        if !pos.found {
            return None;
        }
        Some(Guarded {
            node: pos.cur,
            _ctx: PhantomData,
        })
    }

    /// Insert `value` under `hash`. False if the hash is already present.
    pub fn insert<const S: usize, const R: usize>(
        &self,
        hash: u32,
        value: V,
        ctx: &mut HazardContext<ListNode<V>, S, R>,
    ) -> bool {
        assert!(S >= 3, "map operations need three hazard slots");
        let node = Box::new(ListNode::data(hash, value));
        let shape = self.shape_ref();
        let buckets_at_start = shape.bucket_count;
        let slot = hash % buckets_at_start;
        let dummy = self.bucket_dummy(shape, slot, ctx);
        // Safety: as in find.
        let Some((raw, walked)) = (unsafe { list::insert(&(*dummy).next, node, ctx) }) else {
            return false;
        };
        self.item_count.fetch_add(1, Ordering::Release);

        // Insert pays for expansion: measure the bucket by extending the
        // traversal's step count over the data run from the new node.
        let steps = walked + self.count_run(raw, ctx);
        if steps > self.max_bucket_len {
            self.split_or_expand(slot, buckets_at_start, steps, ctx);
        }
        true
    }

    /// Remove the entry for `hash`. False if absent.
    pub fn remove<const S: usize, const R: usize>(
        &self,
        hash: u32,
        ctx: &mut HazardContext<ListNode<V>, S, R>,
    ) -> bool {
        assert!(S >= 3, "map operations need three hazard slots");
        let shape = self.shape_ref();
        let slot = hash % shape.bucket_count;
        let dummy = self.bucket_dummy(shape, slot, ctx);
        // Safety: as in find.
        if unsafe { list::remove(&(*dummy).next, list::data_key(hash), ctx) } {
            self.item_count.fetch_sub(1, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// The dummy anchoring `slot`, materializing it on first use.
    fn bucket_dummy<const S: usize, const R: usize>(
        &self,
        shape: &Shape<V>,
        slot: u32,
        ctx: &mut HazardContext<ListNode<V>, S, R>,
    ) -> *mut ListNode<V> {
        let dummy = shape.anchor(slot).load(Ordering::Acquire);
        if !dummy.is_null() {
            return dummy;
        }
        self.initialise_bucket(shape, slot, ctx)
    }

    /// Insert the dummy for `slot` at its ordered position and publish it in
    /// the anchor array.
    ///
    /// Raced initializations converge: whichever dummy lands in the list is
    /// adopted, and the anchor CAS tolerates an earlier publication. The
    /// anchor may also stay behind on a shape that loses an expansion race;
    /// that only costs the next accessor a re-discovery through the list.
    fn initialise_bucket<const S: usize, const R: usize>(
        &self,
        shape: &Shape<V>,
        slot: u32,
        ctx: &mut HazardContext<ListNode<V>, S, R>,
    ) -> *mut ListNode<V> {
        let anchor = shape.anchor(slot);
        let key = list::anchor_key(slot);
        let mut spare: Option<Box<ListNode<V>>> = None;
        loop {
            let existing = anchor.load(Ordering::Acquire);
            if !existing.is_null() {
                return existing;
            }
            let parent = self.parent_dummy(shape, slot);
            // Safety: parent is a dummy (never retired) in this map's list.
            let pos = unsafe { list::find(&(*parent).next, key, ctx) };
            if pos.found {
                // Another thread linked this bucket's dummy; adopt it.
                return match anchor.compare_exchange(
                    ptr::null_mut(),
                    pos.cur,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => pos.cur,
                    Err(published) => published,
                };
            }
            let node = spare
                .take()
                .unwrap_or_else(|| Box::new(ListNode::dummy(slot)));
            let raw = Box::into_raw(node);
            // Safety: raw is ours until the CAS publishes it.
            unsafe { &*raw }.next.store(pos.cur);
            // Safety: pos.prev is the parent dummy's link or protected by
            // the prev slot.
            if unsafe { &*pos.prev }.cas(pos.cur, raw) {
                return match anchor.compare_exchange(
                    ptr::null_mut(),
                    raw,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => raw,
                    Err(published) => published,
                };
            }
            // Lost the race; keep the allocation for the retry.
            // Safety: raw never became reachable.
            spare = Some(unsafe { Box::from_raw(raw) });
        }
    }

    /// The nearest initialized bucket preceding `slot` in key order, found by
    /// stepping the anchor key down in half-table strides.
    fn parent_dummy(&self, shape: &Shape<V>, slot: u32) -> *mut ListNode<V> {
        debug_assert!(slot > 0, "bucket 0 is initialized at construction");
        let key_step = list::anchor_key(shape.bucket_count / 2);
        let mut pb_key = list::anchor_key(slot);
        loop {
            pb_key = pb_key.wrapping_sub(key_step);
            let pb_slot = pb_key.reverse_bits();
            let dummy = shape.anchor(pb_slot).load(Ordering::Acquire);
            if !dummy.is_null() {
                return dummy;
            }
            debug_assert_ne!(pb_key, 0, "bucket 0 must terminate the search");
        }
    }

    /// Length of the contiguous data run starting at `node`, which must be
    /// protected by the context's next slot (as [`list::insert`] leaves it).
    /// Any mark, dummy or validation failure ends the walk early; the count
    /// only feeds the expansion heuristic.
    fn count_run<const S: usize, const R: usize>(
        &self,
        node: *mut ListNode<V>,
        ctx: &mut HazardContext<ListNode<V>, S, R>,
    ) -> u32 {
        let mut run = 1u32;
        let mut cursor = node;
        let mut cursor_slot = HP_NEXT;
        loop {
            // Safety: cursor is protected by cursor_slot.
            let cur_ref = unsafe { &*cursor };
            let (nxt, marked) = cur_ref.next.load();
            if marked || nxt.is_null() {
                break;
            }
            let scratch = if cursor_slot == HP_NEXT { HP_CUR } else { HP_NEXT };
            ctx.hazard(scratch).protect(nxt);
            crate::light_barrier();
            if cur_ref.next.load() != (nxt, false) {
                break;
            }
            // Safety: nxt was still linked after we published it.
            if !unsafe { &*nxt }.is_data() {
                break;
            }
            run += 1;
            cursor = nxt;
            cursor_slot = scratch;
        }
        // The walk repurposed the traversal slots; drop stale protections.
        ctx.hazard(HP_PREV).clear();
        ctx.hazard(HP_CUR).clear();
        ctx.hazard(HP_NEXT).clear();
        run
    }

    /// React to a long bucket: double the table when the bucket overflowed
    /// pathologically or the global load factor is exceeded, otherwise split
    /// just this bucket under the current table.
    fn split_or_expand<const S: usize, const R: usize>(
        &self,
        slot: u32,
        buckets_at_start: u32,
        steps: u32,
        ctx: &mut HazardContext<ListNode<V>, S, R>,
    ) {
        let load_exceeded = self.item_count.load(Ordering::Relaxed)
            >= self.max_bucket_len as usize * self.bucket_count() as usize;
        if steps >= 2 * self.max_bucket_len || load_exceeded {
            self.expand(buckets_at_start);
            let shape = self.shape_ref();
            let split = slot + buckets_at_start;
            if split < shape.bucket_count {
                self.bucket_dummy(shape, split, ctx);
            }
        } else {
            let shape = self.shape_ref();
            let split = slot + buckets_at_start / 2;
            if split < shape.bucket_count {
                self.bucket_dummy(shape, split, ctx);
            }
        }
    }

    /// Double the bucket table from `from_count`. A no-op when another thread
    /// already published a larger shape.
    fn expand(&self, from_count: u32) {
        let old_ptr = self.shape.load(Ordering::Acquire);
        // Safety: shapes are freed only in Drop.
        let old = unsafe { &*old_ptr };
        if old.bucket_count != from_count {
            return;
        }
        let Some(new_count) = from_count.checked_mul(2) else {
            return;
        };
        let fresh = Shape::new(new_count, old_ptr);
        for i in 0..from_count {
            let anchor = old.anchor(i).load(Ordering::Acquire);
            fresh.anchor(i).store(anchor, Ordering::Relaxed);
        }
        let fresh = Box::into_raw(fresh);
        if self
            .shape
            .compare_exchange(old_ptr, fresh, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Lost the publish race; the winner's shape carries the anchors.
            // Safety: fresh never became visible.
            drop(unsafe { Box::from_raw(fresh) });
        }
    }

    /// Walk the list at a quiescent point, checking strict key order and the
    /// anchor invariant. Returns `(dummy, data)` node counts; data counts
    /// skip nodes whose next link is marked (logically deleted but not yet
    /// unlinked).
    ///
    /// Only sound while no other thread touches the map.
    #[doc(hidden)]
    pub fn check_integrity(&self) -> (usize, usize) {
        let shape = self.shape_ref();
        let mut cur = shape.anchor(0).load(Ordering::Acquire);
        let mut last_key: Option<u32> = None;
        let mut dummies = 0;
        let mut data = 0;
        while !cur.is_null() {
            // Safety: quiescent; every reachable node is alive.
            let node = unsafe { &*cur };
            if let Some(prev_key) = last_key {
                assert!(node.key > prev_key, "list keys must strictly increase");
            }
            last_key = Some(node.key);
            let (nxt, marked) = node.next.load();
            if node.is_data() {
                assert_eq!(node.key, list::data_key(node.hash));
                if !marked {
                    data += 1;
                }
            } else {
                assert!(!marked, "dummies are never deleted");
                dummies += 1;
            }
            cur = nxt;
        }
        for i in 0..shape.bucket_count {
            let anchor = shape.anchor(i).load(Ordering::Acquire);
            if !anchor.is_null() {
                // Safety: anchors point at live dummies.
                let dummy = unsafe { &*anchor };
                assert!(!dummy.is_data(), "anchors must reference dummies");
                assert_eq!(dummy.key, list::anchor_key(i));
            }
        }
        assert_eq!(data, self.len(), "item count must match live data nodes");
        (dummies, data)
    }
}

impl<V: Send> Drop for SplitOrderedMap<V> {
    fn drop(&mut self) {
        let shape_ptr = self.shape.load(Ordering::Relaxed);
        // Safety: &mut self, so no concurrent access; every node reachable
        // from the bucket-0 dummy is owned by the list (retired nodes were
        // unlinked first and belong to the domain).
        let shape = unsafe { &*shape_ptr };
        let mut cur = shape.anchor(0).load(Ordering::Relaxed);
        while !cur.is_null() {
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next.load().0;
        }
        let mut sp = shape_ptr;
        while !sp.is_null() {
            // Safety: shapes were Box-allocated and are freed exactly here.
            let shape = unsafe { Box::from_raw(sp) };
            sp = shape.prev;
        }
        // Nodes still on the retire stack go down with the domain's last Arc.
    }
}

/// A value reference protected by one of the owning context's hazard slots.
///
/// Holding the guard keeps the context mutably borrowed, so no further map
/// operation can recycle the protecting slot until the guard is gone.
pub struct Guarded<'g, V> {
    node: *mut ListNode<V>,
    _ctx: PhantomData<&'g ()>,
}

impl<V> Guarded<'_, V> {
    /// The hash this entry was inserted under.
    pub fn hash(&self) -> u32 {
        // Safety: the node is hazard-protected for the guard's lifetime.
        unsafe { &*self.node }.hash
    }
}

impl<V> Deref for Guarded<'_, V> {
    type Target = V;

    fn deref(&self) -> &V {
        // Safety: the node is hazard-protected for the guard's lifetime, and
        // found nodes are data nodes.
        unsafe { &*self.node }
            .value()
            .expect("found nodes carry a payload")
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::SplitOrderedMap;

    #[test]
    fn lazy_buckets_materialize_on_use() {
        let map = SplitOrderedMap::new(8, 16);
        let mut ctx = map.context::<3, 0>();
        let (dummies, _) = map.check_integrity();
        assert_eq!(dummies, 1);

        // Hash 5 lands in bucket 5, whose dummy (and only it) appears.
        assert!(map.insert(5, 50, &mut ctx));
        let (dummies, data) = map.check_integrity();
        assert_eq!((dummies, data), (2, 1));
    }

    #[test]
    fn parent_search_steps_through_uninitialized_slots() {
        let map = SplitOrderedMap::new(16, 16);
        let mut ctx = map.context::<3, 0>();
        // Every bucket preceding 15 in key order is uninitialized, so the
        // parent search must fall all the way through to bucket 0.
        assert!(map.insert(15, 150, &mut ctx));
        assert!(map.find(15, &mut ctx).is_some());
        let (dummies, data) = map.check_integrity();
        assert_eq!((dummies, data), (2, 1));
    }

    #[test]
    fn expansion_preserves_reachability() {
        let map = SplitOrderedMap::new(2, 1);
        let mut ctx = map.context::<3, 0>();
        for hash in 0u32..64 {
            assert!(map.insert(hash, u64::from(hash), &mut ctx));
        }
        assert!(map.bucket_count() > 2);
        for hash in 0u32..64 {
            assert_eq!(*map.find(hash, &mut ctx).expect("present"), u64::from(hash));
        }
        map.check_integrity();
    }
}
