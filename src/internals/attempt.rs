//! Attempt-local state for one optimistic try of a public operation.
//!
//! Everything in here lives exactly as long as one attempt. An attempt that
//! cannot proceed (failed try-lock, failed validation) is *doomed*: its
//! locks are released, its speculative nodes are thrown away, and the whole
//! operation restarts with a fresh context. The context is an explicit
//! struct passed by reference through the tree algorithms - there is no
//! ambient thread-local state.

use crossbeam_epoch::{Guard, Shared};
use foldhash::fast::RandomState;
use std::collections::HashMap;
use tracing::trace;

use super::node::ProtoNode;
use super::reclaim;

/// Attempt-local maps are keyed by node address.
pub(super) type AddrMap<V> = HashMap<usize, V, RandomState>;

#[inline(always)]
pub(super) fn addr<T>(s: Shared<'_, T>) -> usize {
    s.as_raw() as usize
}

#[inline(always)]
pub(super) fn same<T>(a: Shared<'_, T>, b: Shared<'_, T>) -> bool {
    a.as_raw() == b.as_raw()
}

/// One entry of the duplication map: the original, its duplicate, and the
/// parent slot the original was hanging off when it was discovered. The
/// parent may itself be a shadow node, in which case this entry is internal
/// to the shadow subtree and needs no validation at close.
pub(super) struct DupEntry<'g, T> {
    pub(super) orig: Shared<'g, T>,
    pub(super) dup: Shared<'g, T>,
    pub(super) parent: Shared<'g, T>,
    pub(super) idx: usize,
}

/// One entry of the lineage map, recorded opportunistically on every child
/// read: who we read the node from, at which slot, and how deep. Only nodes
/// actually visited this attempt appear here.
#[derive(Clone, Copy)]
pub(super) struct Lineage<'g, T> {
    pub(super) parent: Shared<'g, T>,
    pub(super) idx: usize,
    pub(super) depth: usize,
}

/// The state of one attempt: duplication map, lineage map, lock set, fresh
/// allocation set, unlink set, and the root snapshots taken at open.
///
/// Dropping a context that has not committed rolls the attempt back:
/// every held lock is released exactly once and every never-published node
/// is deallocated immediately.
pub(crate) struct AttemptCtx<'g, T: ProtoNode> {
    pub(super) guard: &'g Guard,
    pub(super) dups: AddrMap<DupEntry<'g, T>>,
    pub(super) dup_rev: AddrMap<Shared<'g, T>>,
    pub(super) lineage: AddrMap<Lineage<'g, T>>,
    pub(super) locks: Vec<Shared<'g, T>>,
    pub(super) fresh: AddrMap<Shared<'g, T>>,
    pub(super) unlinked: Vec<Shared<'g, T>>,
    pub(super) discarded: Vec<Shared<'g, T>>,
    pub(super) orig_root: Shared<'g, T>,
    pub(super) new_root: Shared<'g, T>,
    pub(super) doomed: bool,
    pub(super) committed: bool,
}

impl<'g, T: ProtoNode> AttemptCtx<'g, T> {
    /// True for nodes this attempt allocated or duplicated itself: they are
    /// exclusively owned until publication and need no locking at all.
    #[inline(always)]
    pub(super) fn is_private(&self, n: Shared<'g, T>) -> bool {
        self.fresh.contains_key(&addr(n)) || self.dup_rev.contains_key(&addr(n))
    }

    /// Map a shadow duplicate back to its original; identity for anything
    /// else.
    #[inline(always)]
    pub(super) fn orig_of(&self, n: Shared<'g, T>) -> Shared<'g, T> {
        self.dup_rev.get(&addr(n)).copied().unwrap_or(n)
    }

    /// Redirect an original through its duplicate when one exists, so that
    /// reads made after a duplication observe the pending mutations.
    #[inline(always)]
    pub(super) fn current_of(&self, n: Shared<'g, T>) -> Shared<'g, T> {
        match self.dups.get(&addr(n)) {
            Some(e) => e.dup,
            None => n,
        }
    }

    /// Depth as recorded during this attempt's walk. Only meaningful for
    /// nodes reached through live originals; private parents report the
    /// depth of the original they mirror.
    pub(super) fn depth_of(&self, n: Shared<'g, T>) -> usize {
        let n = self.orig_of(n);
        match self.lineage.get(&addr(n)) {
            Some(l) => l.depth,
            None => 0,
        }
    }

    /// Non-blocking lock acquisition with lock-set membership: re-acquiring
    /// a mutex this attempt already holds is a no-op, never a deadlock.
    pub(super) fn acquire(&mut self, n: Shared<'g, T>) -> bool {
        if self.locks.iter().any(|l| same(*l, n)) {
            return true;
        }
        if unsafe { n.deref() }.meta().try_lock() {
            self.locks.push(n);
            true
        } else {
            false
        }
    }

    /// Release every held lock, exactly once, in reverse acquisition order.
    pub(super) fn release_locks(&mut self) {
        while let Some(n) = self.locks.pop() {
            unsafe { n.deref().meta().unlock() };
        }
    }

    /// Doom this attempt: drop all locks now so other writers can proceed,
    /// and record that every later protocol call must refuse to continue.
    pub(crate) fn fail(&mut self) {
        trace!("attempt doomed");
        self.release_locks();
        self.doomed = true;
    }

    /// Record a live node this attempt excises without duplicating it (for
    /// example a spliced-out successor). The caller must hold its lock. On
    /// a successful close it is tombstoned and retired with the replaced
    /// originals.
    pub(crate) fn mark_unlinked(&mut self, n: Shared<'g, T>) {
        debug_assert!(self.locks.iter().any(|l| same(*l, n)));
        self.unlinked.push(n);
    }

    /// Throw away every speculative node this attempt created. Only legal
    /// before publication.
    fn scrap_shadow(&mut self) {
        for (_, e) in self.dups.drain() {
            unsafe { reclaim::dealloc(e.dup) };
        }
        for (_, f) in self.fresh.drain() {
            unsafe { reclaim::dealloc(f) };
        }
        for d in std::mem::take(&mut self.discarded) {
            unsafe { reclaim::dealloc(d) };
        }
        self.dup_rev.clear();
    }

    pub(super) fn rollback(&mut self) {
        self.release_locks();
        self.scrap_shadow();
    }
}

impl<'g, T: ProtoNode> Drop for AttemptCtx<'g, T> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
        debug_assert!(self.locks.is_empty());
    }
}
