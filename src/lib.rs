//! Lock-free concurrency toolkit: hazard-pointer memory reclamation and a
//! split-ordered hash map built on top of it.
//!
//! The reclamation side follows Michael's hazard-pointer scheme. A
//! [`HazardDomain`] owns slot storage and a stack of retired objects; each
//! thread drives it through a [`HazardContext`], which reserves a fixed block
//! of slots and batches retirements locally. The map side is a Shalev-Shavit
//! split-ordered list: one ordered lock-free list of data nodes and bucket
//! dummies, keyed by bit-reversed hashes so the bucket table can double
//! without moving a single entry.
//!
//! ```
//! use hazmap::SplitOrderedMap;
//!
//! let map = SplitOrderedMap::new(8, 4);
//! let mut ctx = map.context::<3, 8>();
//!
//! assert!(map.insert(42, "answer", &mut ctx));
//! assert_eq!(map.find(42, &mut ctx).as_deref(), Some(&"answer"));
//! assert!(map.remove(42, &mut ctx));
//! assert!(map.find(42, &mut ctx).is_none());
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod chunk;
mod context;
mod domain;
mod list;
mod map;
mod marked;
mod sync;

/// Make a hazard-slot publication visible to reclaimers before the caller's
/// subsequent validation load.
fn light_barrier() {
    crate::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

pub use context::{HazardContext, HazardSlot};
pub use domain::{HazardDomain, HazardSnapshot};
pub use list::ListNode;
pub use map::{Guarded, SplitOrderedMap};
pub use marked::MarkedPtr;
