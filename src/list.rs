use crate::context::HazardContext;
use crate::marked::MarkedPtr;
use alloc::boxed::Box;

/// Hazard-slot roles for a list traversal.
pub(crate) const HP_PREV: usize = 0;
pub(crate) const HP_CUR: usize = 1;
pub(crate) const HP_NEXT: usize = 2;

const DATA_BIT: u32 = 1;

/// Ordering key for the data node of `hash`.
///
/// Bit-reversal puts hashes that agree on their low bits next to each other,
/// which is what lets a bucket split by inserting one dummy; the forced low
/// bit keeps every data key strictly after its bucket's anchor key.
pub(crate) fn data_key(hash: u32) -> u32 {
    hash.reverse_bits() | DATA_BIT
}

/// Ordering key for the dummy anchoring `bucket`.
pub(crate) fn anchor_key(bucket: u32) -> u32 {
    let key = bucket.reverse_bits();
    debug_assert_eq!(key & DATA_BIT, 0, "bucket index too large to key");
    key
}

/// A node in the split-ordered list: a bucket dummy (`payload: None`, even
/// key) or a data node (`payload: Some`, odd key).
///
/// Nodes are allocated by insert, logically deleted by marking their next
/// link, physically unlinked by the first traversal that sees the mark, and
/// destroyed only after a hazard snapshot clears them.
pub struct ListNode<V> {
    pub(crate) key: u32,
    pub(crate) hash: u32,
    pub(crate) next: MarkedPtr<ListNode<V>>,
    payload: Option<V>,
}

// Safety: nodes are shared through the list; access to the payload is either
// read-only (through hazard protection) or exclusive (drop after reclaim).
unsafe impl<V: Send> Send for ListNode<V> {}
unsafe impl<V: Send + Sync> Sync for ListNode<V> {}

impl<V> ListNode<V> {
    pub(crate) fn data(hash: u32, value: V) -> Self {
        Self {
            key: data_key(hash),
            hash,
            next: MarkedPtr::null(),
            payload: Some(value),
        }
    }

    pub(crate) fn dummy(bucket: u32) -> Self {
        Self {
            key: anchor_key(bucket),
            hash: bucket,
            next: MarkedPtr::null(),
            payload: None,
        }
    }

    pub(crate) fn is_data(&self) -> bool {
        self.key & DATA_BIT != 0
    }

    pub(crate) fn value(&self) -> Option<&V> {
        self.payload.as_ref()
    }
}

/// Where a traversal stopped.
pub(crate) struct Position<V> {
    /// The stopping node's key equals the target key.
    pub(crate) found: bool,
    /// The link whose unmarked target is `cur`. Points into a node protected
    /// by the prev slot, or into the start dummy.
    pub(crate) prev: *const MarkedPtr<ListNode<V>>,
    /// First node with `key >= target`; null at end of list. Protected by the
    /// cur slot.
    pub(crate) cur: *mut ListNode<V>,
    /// Data nodes stepped past on the way here.
    pub(crate) steps: u32,
}

/// Walk from `start` to the ordered position of `key`.
///
/// prev, cur and next are published into the context's hazard slots 0, 1 and
/// 2, each publication validated by reloading the link it came from. Any
/// marked node encountered is unlinked and retired on the spot, so the number
/// of marked nodes in the list is bounded by the in-flight deletions; a
/// failed unlink restarts the walk because the list changed shape under us.
///
/// # Safety
///
/// `start` must be the next link of a node that cannot be retired while the
/// caller runs (a bucket dummy), and every node reachable from it must have
/// been allocated by this list over the context's domain.
pub(crate) unsafe fn find<V: Send, const S: usize, const R: usize>(
    start: &MarkedPtr<ListNode<V>>,
    key: u32,
    ctx: &mut HazardContext<ListNode<V>, S, R>,
) -> Position<V> {
    'restart: loop {
        let mut prev: *const MarkedPtr<ListNode<V>> = start;
        let mut steps = 0u32;
        // Safety: prev points into the start dummy here, and below only into
        // nodes protected by the prev slot.
        let (mut cur, _) = unsafe { &*prev }.load();
        loop {
            if cur.is_null() {
                return Position {
                    found: false,
                    prev,
                    cur,
                    steps,
                };
            }
            ctx.hazard(HP_CUR).protect(cur);
            crate::light_barrier();
            // Safety: as above.
            if unsafe { &*prev }.load().0 != cur {
                continue 'restart;
            }
            // cur was still linked after we published it, so it cannot have
            // been retired before the publication: safe to dereference.
            let cur_ref = unsafe { &*cur };
            let (nxt, marked) = cur_ref.next.load();
            ctx.hazard(HP_NEXT).protect(nxt);
            crate::light_barrier();
            if marked {
                // cur is logically deleted; help with the physical unlink.
                // Safety: prev is valid as above; the CAS publishes nxt,
                // which we just read from a live link.
                if unsafe { &*prev }.cas(cur, nxt) {
                    // Safety: the CAS unlinked cur; no new traversal can
                    // reach it.
                    unsafe { ctx.retire(cur) };
                    cur = nxt;
                    continue;
                }
                continue 'restart;
            }
            if cur_ref.next.load() != (nxt, false) {
                // next moved while we published it; re-examine cur.
                continue;
            }
            if cur_ref.key >= key {
                return Position {
                    found: cur_ref.key == key,
                    prev,
                    cur,
                    steps,
                };
            }
            if cur_ref.is_data() {
                steps += 1;
            }
            // Advance: cur is already protected, so shifting it into the
            // prev slot cannot lose coverage; likewise nxt into cur.
            ctx.hazard(HP_PREV).protect(cur);
            prev = &cur_ref.next;
            cur = nxt;
        }
    }
}

/// Insert a pre-built data node at its ordered position.
///
/// Returns the raw node and the traversal's data-node step count, or `None`
/// (freeing the node) if the key was already present. On return the node is
/// still protected by the context's next slot, so the caller may keep walking
/// from it.
///
/// # Safety
///
/// Same contract on `start` as [`find`].
pub(crate) unsafe fn insert<V: Send, const S: usize, const R: usize>(
    start: &MarkedPtr<ListNode<V>>,
    node: Box<ListNode<V>>,
    ctx: &mut HazardContext<ListNode<V>, S, R>,
) -> Option<(*mut ListNode<V>, u32)> {
    let key = node.key;
    let node = Box::into_raw(node);
    loop {
        // Safety: forwarded from the caller.
        let pos = unsafe { find(start, key, ctx) };
        if pos.found {
            // Safety: the node never became reachable; we still own it.
            drop(unsafe { Box::from_raw(node) });
            return None;
        }
        // Safety: we own node until the CAS below publishes it.
        unsafe { &*node }.next.store(pos.cur);
        // Publish the node into the next slot (whose current occupant is not
        // needed for the CAS) so it stays protected once it becomes
        // reachable.
        ctx.hazard(HP_NEXT).protect(node);
        crate::light_barrier();
        // Safety: pos.prev is the start dummy's link or protected by the
        // prev slot.
        if unsafe { &*pos.prev }.cas(pos.cur, node) {
            return Some((node, pos.steps));
        }
    }
}

/// Remove the data node with `key`.
///
/// The mark CAS is the linearization point; the unlink afterwards is
/// best-effort, left to a later traversal when it fails.
///
/// # Safety
///
/// Same contract on `start` as [`find`].
pub(crate) unsafe fn remove<V: Send, const S: usize, const R: usize>(
    start: &MarkedPtr<ListNode<V>>,
    key: u32,
    ctx: &mut HazardContext<ListNode<V>, S, R>,
) -> bool {
    loop {
        // Safety: forwarded from the caller.
        let pos = unsafe { find(start, key, ctx) };
        if !pos.found {
            return false;
        }
        // Safety: pos.cur is protected by the cur slot.
        let cur_ref = unsafe { &*pos.cur };
        let (nxt, marked) = cur_ref.next.load();
        if marked {
            // Someone else is deleting this node; re-traverse, which will
            // help unlink it, and report whatever the list then says.
            continue;
        }
        if !cur_ref.next.cas_pair(nxt, false, nxt, true) {
            continue;
        }
        // Once marked, cur.next is frozen (inserters CAS against an unmarked
        // link), so nxt is the node's final successor.
        // Safety: pos.prev is the start dummy's link or protected by the
        // prev slot.
        if unsafe { &*pos.prev }.cas(pos.cur, nxt) {
            // Safety: unlinked by the CAS; unreachable to new traversals.
            unsafe { ctx.retire(pos.cur) };
        }
        return true;
    }
}
