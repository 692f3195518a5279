//! The reclamation seam: epoch based allocate/retire/deallocate.
//!
//! The protocol does not implement reclamation itself - crossbeam-epoch
//! does. Every traversal of the live tree (read or mutating attempt) holds
//! a pinned guard so that a node it may be reading is never freed under
//! it. A node that lost a commit race and was never published can be freed
//! immediately; a node that was replaced in the live tree is only retired,
//! and crossbeam frees it once no pinned thread can still observe it.
//! Long-held guards delay reclamation crate-wide, which is the usual
//! epoch space/time trade.

use crossbeam_epoch::{Guard, Owned, Shared};

/// Pin the current thread's epoch. Hold the returned guard for the whole
/// of any live-tree traversal.
#[inline(always)]
pub(crate) fn pin() -> Guard {
    crossbeam_epoch::pin()
}

/// Allocate a node on the heap and hand it back as an epoch pointer tied
/// to this attempt's guard. The node is unpublished and exclusively owned
/// by the caller until a successful close links it in.
#[inline(always)]
pub(crate) fn alloc<'g, T>(node: T, guard: &'g Guard) -> Shared<'g, T> {
    Owned::new(node).into_shared(guard)
}

/// Defer freeing a replaced node until no thread can still be reading it.
///
/// # Safety
/// The node must be unreachable from the live root from this moment on,
/// and must not be retired twice.
#[inline(always)]
pub(crate) unsafe fn retire<T>(node: Shared<'_, T>, guard: &Guard) {
    guard.defer_destroy(node);
}

/// Free a node immediately.
///
/// # Safety
/// Only legal for nodes that were never published: no other thread can
/// hold a reference to something that was never reachable.
#[inline(always)]
pub(crate) unsafe fn dealloc<T>(node: Shared<'_, T>) {
    drop(node.into_owned());
}
