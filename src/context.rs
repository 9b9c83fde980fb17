use crate::domain::HazardDomain;
use crate::sync::atomic::AtomicPtr;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};
use core::sync::atomic::Ordering;

/// A per-thread handle over a [`HazardDomain`]: a reserved block of `S`
/// hazard slots plus a local array of up to `R` retired pointers.
///
/// `S` is the number of pointers the owning thread can protect at once
/// (a list traversal needs three: prev, cur, next). `R` batches retirements
/// locally so most of them never touch the shared retire stack; `R == 0`
/// sends every retirement straight to the domain.
///
/// A context is move-only and owned by exactly one thread at a time. Cloning
/// one would alias the slot block, so there is no `Clone`.
pub struct HazardContext<T: Send, const S: usize, const R: usize> {
    domain: Arc<HazardDomain<T>>,
    block: NonNull<AtomicPtr<u8>>,
    retired: [*mut T; R],
    del_index: usize,
}

// Safety: the context may move between threads wholesale, but is never shared;
// retired pointers may be freed on the destination thread, hence T: Send.
unsafe impl<T: Send, const S: usize, const R: usize> Send for HazardContext<T, S, R> {}

impl<T: Send, const S: usize, const R: usize> HazardContext<T, S, R> {
    /// Reserve a block of `S` slots in `domain` and an empty local retired
    /// array.
    pub fn new(domain: Arc<HazardDomain<T>>) -> Self {
        assert!(S >= 1, "a context needs at least one hazard slot");
        let block = domain.reserve(S);
        Self {
            domain,
            block,
            retired: [ptr::null_mut(); R],
            del_index: 0,
        }
    }

    pub fn domain(&self) -> &Arc<HazardDomain<T>> {
        &self.domain
    }

    /// Handle to hazard slot `i`. An out-of-range index is a programming
    /// error and panics.
    pub fn hazard(&self, i: usize) -> HazardSlot<'_, T> {
        assert!(i < S, "hazard index {i} out of range for a block of {S}");
        // Safety: the block holds S contiguous slots reserved for this
        // context, and chunk storage is never freed while the domain lives.
        let slot = unsafe { &*self.block.as_ptr().add(i) };
        HazardSlot {
            slot,
            _marker: PhantomData,
        }
    }

    /// Hand `ptr` over for deferred destruction.
    ///
    /// Lands in the local array when `R > 0`; a full array triggers
    /// [`reclaim`](Self::reclaim). With `R == 0` the pointer goes straight to
    /// the domain's retire stack.
    ///
    /// # Safety
    ///
    /// Same contract as [`HazardDomain::retire`].
    pub unsafe fn retire(&mut self, ptr: *mut T) {
        if R == 0 {
            // Safety: forwarded from the caller.
            unsafe { self.domain.retire(ptr) };
            return;
        }
        self.retired[self.del_index] = ptr;
        self.del_index += 1;
        if self.del_index == R {
            self.reclaim();
        }
    }

    /// Destroy every locally retired pointer that no hazard slot protects,
    /// then compact the survivors to the front of the array. If nothing was
    /// reclaimable, the whole array is pushed to the domain instead.
    pub fn reclaim(&mut self) {
        let snapshot = self.domain.snapshot();
        for entry in self.retired.iter_mut() {
            if !entry.is_null() && !snapshot.covers(entry.cast()) {
                // Safety: the entry satisfies the retire contract (it was
                // handed to `retire`) and the snapshot shows it unprotected.
                drop(unsafe { Box::from_raw(*entry) });
                *entry = ptr::null_mut();
                self.del_index -= 1;
            }
        }
        if self.del_index == R {
            // Every entry is still protected; delegate to the domain stack.
            // Safety: forwarded retire contract.
            unsafe { self.domain.retire_many(&mut self.retired) };
            self.del_index = 0;
        } else {
            let mut write = 0;
            for read in 0..R {
                if !self.retired[read].is_null() {
                    self.retired.swap(read, write);
                    write += 1;
                }
            }
            debug_assert_eq!(write, self.del_index);
        }
    }
}

impl<T: Send, const S: usize, const R: usize> Drop for HazardContext<T, S, R> {
    fn drop(&mut self) {
        // Releasing nulls the slots, so nothing we retired below can be
        // considered protected by our own block.
        self.domain.release(self.block);
        // Safety: entries were handed to `retire` under its contract.
        unsafe { self.domain.retire_many(&mut self.retired) };
        self.domain.collect();
    }
}

/// A typed view over one hazard slot owned by the domain's chunk storage.
///
/// The slot itself is just an atomic word; this handle adds the element type
/// and the publication protocol.
#[derive(Clone, Copy)]
pub struct HazardSlot<'ctx, T> {
    slot: &'ctx AtomicPtr<u8>,
    _marker: PhantomData<*mut T>,
}

impl<T> HazardSlot<'_, T> {
    /// Publish `ptr`: no collection that observes the slot afterwards will
    /// destroy the referent.
    ///
    /// Publication alone does not make dereferencing safe. The referent may
    /// already have been retired; callers must validate after publishing, by
    /// reloading the link the pointer was read from and checking it has not
    /// changed.
    pub fn protect(&self, ptr: *mut T) {
        self.slot.store(ptr.cast(), Ordering::Release);
    }

    /// Withdraw the slot's current publication, if any.
    pub fn clear(&self) {
        self.slot.store(ptr::null_mut(), Ordering::Release);
    }

    pub fn load(&self) -> *mut T {
        self.slot.load(Ordering::Acquire).cast()
    }
}
