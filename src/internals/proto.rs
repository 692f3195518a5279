//! The optimistic node-duplication commit protocol.
//!
//! One attempt moves through `open -> mutating -> close`. During the
//! mutating phase the tree algorithm reads children only through
//! [`AttemptCtx::get_child`] (which records lineage) and mutates nodes only
//! after [`AttemptCtx::duplicate`] hands it a shadow copy. `close` then
//! makes the accumulated shadow edits visible atomically, or makes none of
//! them visible.
//!
//! The rules that keep this sound:
//!
//! * A live node's child slots only ever change while its commit mutex is
//!   held. Duplication takes that mutex before field-copying, so a copy is
//!   never torn, and a held mutex freezes the subtree hanging off the node.
//! * Locks are acquired parent-before-child, uniformly, and only ever with
//!   a try-lock. A failed acquisition dooms the attempt instead of
//!   waiting, so threads can never wait on each other.
//! * A committed attempt tombstones every node it replaced before
//!   releasing its locks. A later attempt that locks a stale node sees the
//!   tombstone and dooms itself - this is what makes validation against a
//!   since-replaced parent impossible.

use crossbeam_epoch::{Atomic, Guard, Shared};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use tracing::trace;

use super::attempt::{addr, same, AttemptCtx, DupEntry, Lineage};
use super::node::ProtoNode;
use super::reclaim;

/// The restart policy a map applies between failed optimistic attempts.
///
/// The base protocol never bounds its retries; under extreme contention an
/// immediate-retry policy can livelock a workload into pure wasted work.
/// The policy is an explicit, testable parameter rather than something
/// baked in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Backoff {
    /// Restart immediately after a failed attempt.
    None,
    /// Exponential spin-then-yield between failed attempts (the default).
    #[default]
    Spin,
}

impl Backoff {
    pub(crate) fn wait(&self, waiter: &crossbeam_utils::Backoff) {
        if matches!(self, Backoff::Spin) {
            waiter.snooze();
        }
    }
}

impl<'g, T: ProtoNode> AttemptCtx<'g, T> {
    /// Open a fresh attempt against the current live root. Records the root
    /// snapshot that `close` will later compare-and-swap against.
    pub(crate) fn open(root_cell: &Atomic<T>, guard: &'g Guard) -> Self {
        let root = root_cell.load(Acquire, guard);
        let mut ctx = AttemptCtx {
            guard,
            dups: Default::default(),
            dup_rev: Default::default(),
            lineage: Default::default(),
            locks: Vec::new(),
            fresh: Default::default(),
            unlinked: Vec::new(),
            discarded: Vec::new(),
            orig_root: root,
            new_root: root,
            doomed: false,
            committed: false,
        };
        if !root.is_null() {
            ctx.lineage.insert(
                addr(root),
                Lineage {
                    parent: Shared::null(),
                    idx: 0,
                    depth: 0,
                },
            );
        }
        ctx
    }

    /// The root snapshot this attempt runs against.
    #[inline(always)]
    pub(crate) fn root(&self) -> Shared<'g, T> {
        self.orig_root
    }

    #[cfg(test)]
    pub(crate) fn is_doomed(&self) -> bool {
        self.doomed
    }

    /// Allocate a brand-new node for this attempt. It needs no duplication
    /// and no locks: nothing else can reach it until close publishes it.
    pub(crate) fn alloc(&mut self, node: T) -> Shared<'g, T> {
        let n = reclaim::alloc(node, self.guard);
        self.fresh.insert(addr(n), n);
        n
    }

    /// Replace the root this attempt will publish. Used when the root node
    /// itself is created, removed, or bypassed (tree height change).
    pub(crate) fn set_new_root(&mut self, n: Shared<'g, T>) {
        self.new_root = n;
    }

    /// Read a child slot, recording lineage, and redirecting through a
    /// shadow duplicate when one exists so pending mutations are observed.
    pub(crate) fn get_child(&mut self, node: Shared<'g, T>, idx: usize) -> Shared<'g, T> {
        debug_assert!(!node.is_null());
        let src = self.current_of(node);
        let child = unsafe { src.deref() }.children()[idx].load(Acquire, self.guard);
        if !child.is_null()
            && !self.is_private(child)
            && !self.lineage.contains_key(&addr(child))
        {
            let depth = self.depth_of(node) + 1;
            self.lineage.insert(
                addr(child),
                Lineage {
                    parent: src,
                    idx,
                    depth,
                },
            );
        }
        child
    }

    /// The root this attempt will publish if close succeeds.
    #[inline(always)]
    pub(crate) fn staged_root(&self) -> Shared<'g, T> {
        self.new_root
    }

    /// Point a shadow node's child slot at `child`, keeping the lineage
    /// map in step. Shadow surgery (rotations, splits, merges) moves live
    /// children between private parents; a later duplication of such a
    /// child must patch the slot it currently sits in, not the one it was
    /// first read from.
    pub(crate) fn relink(&mut self, parent: Shared<'g, T>, idx: usize, child: Shared<'g, T>) {
        debug_assert!(self.is_private(parent));
        unsafe { parent.deref() }.children()[idx].store(child, Relaxed);
        if !child.is_null() && !self.is_private(child) {
            let depth = self.depth_of(parent) + 1;
            self.lineage.insert(
                addr(child),
                Lineage {
                    parent,
                    idx,
                    depth,
                },
            );
        }
    }

    /// Lock a node without duplicating it, parent first. Needed when a node
    /// is about to be spliced out: its child slots must be frozen before
    /// they are read for the splice. Dooms the attempt on contention or on
    /// a tombstoned node.
    pub(crate) fn acquire_for_unlink(&mut self, n: Shared<'g, T>) -> Option<()> {
        if self.doomed {
            return None;
        }
        if !self.acquire(n) {
            trace!("unlink acquisition contended");
            self.fail();
            return None;
        }
        if unsafe { n.deref() }.meta().is_tombstoned() {
            self.fail();
            return None;
        }
        Some(())
    }

    /// Return a node the caller may freely mutate which will, if and only
    /// if `close` succeeds, become reachable in `orig`'s place.
    ///
    /// Fresh nodes and existing duplicates come back unchanged; anything
    /// else is locked (parent before self), field-copied, and stitched into
    /// the shadow subtree in both directions. `None` means the attempt is
    /// doomed and the operation must unwind and restart.
    pub(crate) fn duplicate(&mut self, orig: Shared<'g, T>) -> Option<Shared<'g, T>> {
        if self.doomed {
            return None;
        }
        debug_assert!(!orig.is_null());
        // Already ours: nothing to do.
        if self.is_private(orig) {
            return Some(orig);
        }
        if let Some(e) = self.dups.get(&addr(orig)) {
            return Some(e.dup);
        }

        let (parent, idx) = match self.lineage.get(&addr(orig)) {
            Some(l) => (l.parent, l.idx),
            None => {
                debug_assert!(same(orig, self.orig_root));
                (Shared::null(), 0)
            }
        };

        // Parent before child. A private parent is already exclusively
        // ours; an original that we duplicated earlier is already in the
        // lock set, so acquire() is a no-op for it.
        if !parent.is_null() && !self.is_private(parent) {
            if !self.acquire(parent) {
                trace!("parent lock contended");
                self.fail();
                return None;
            }
            if unsafe { parent.deref() }.meta().is_tombstoned() {
                trace!("parent tombstoned");
                self.fail();
                return None;
            }
        }
        if !self.acquire(orig) {
            trace!("node lock contended");
            self.fail();
            return None;
        }
        if unsafe { orig.deref() }.meta().is_tombstoned() {
            trace!("node tombstoned");
            self.fail();
            return None;
        }

        // With both locks held, re-check that the recorded slot still
        // holds the original. When the parent is already duplicated, its
        // shadow copy reflects the post-lock truth and would otherwise be
        // patched at a stale index. For live parents close re-validates,
        // but a doomed attempt may as well find out now.
        if !parent.is_null() && !self.is_private(parent) {
            let p_cur = self.current_of(parent);
            let slot = unsafe { p_cur.deref() }.children()[idx].load(Acquire, self.guard);
            if !same(slot, orig) {
                trace!("slot moved before duplication");
                self.fail();
                return None;
            }
        }

        // The lock is held: the original's child slots are frozen, so the
        // field-copy cannot tear.
        let dup = reclaim::alloc(unsafe { orig.deref() }.replicate(), self.guard);

        // A sibling or child duplicated before us must be adopted: the copy
        // inherited stale pointers to their originals.
        for slot in unsafe { dup.deref() }.children() {
            let c = slot.load(Relaxed, self.guard);
            if c.is_null() {
                continue;
            }
            if let Some(ce) = self.dups.get(&addr(c)) {
                slot.store(ce.dup, Relaxed);
            }
        }

        // And the parent side: a shadow parent adopts the new duplicate
        // right away. A live parent stays untouched until close validates
        // and splices it.
        if parent.is_null() {
            debug_assert!(same(orig, self.orig_root));
            self.new_root = dup;
        } else if self.is_private(parent) {
            unsafe { parent.deref() }.children()[idx].store(dup, Relaxed);
        } else if let Some(pe) = self.dups.get(&addr(parent)) {
            unsafe { pe.dup.deref() }.children()[idx].store(dup, Relaxed);
        }

        self.dups.insert(
            addr(orig),
            DupEntry {
                orig,
                dup,
                parent,
                idx,
            },
        );
        self.dup_rev.insert(addr(dup), orig);
        Some(dup)
    }

    /// Duplicate every node on the paths from `a` and `b` up to and
    /// including their lowest common ancestor, so that one contiguous
    /// shadow subtree - not two disconnected ones - is what close
    /// validates and swaps in.
    ///
    /// Walks both paths upward in lock-step using the depths recorded in
    /// the lineage map, duplicating the deeper node first.
    pub(crate) fn link_to_lca(&mut self, a: Shared<'g, T>, b: Shared<'g, T>) -> Option<()> {
        let mut x = self.orig_of(a);
        let mut y = self.orig_of(b);
        loop {
            if self.doomed {
                return None;
            }
            if same(x, y) {
                // Converged: the LCA itself is part of the shadow.
                self.duplicate(x)?;
                return Some(());
            }
            if self.depth_of(x) >= self.depth_of(y) {
                self.duplicate(x)?;
                x = self.step_up(x)?;
            } else {
                self.duplicate(y)?;
                y = self.step_up(y)?;
            }
        }
    }

    fn step_up(&mut self, n: Shared<'g, T>) -> Option<Shared<'g, T>> {
        let p = match self.lineage.get(&addr(n)) {
            Some(l) => l.parent,
            None => Shared::null(),
        };
        if p.is_null() {
            // Walked past the root without converging: the recorded paths
            // no longer describe the same tree. Restart.
            self.fail();
            return None;
        }
        Some(self.orig_of(p))
    }

    /// Make the accumulated shadow edits visible atomically, or none of
    /// them. Returns false when a concurrent attempt interfered; the
    /// context's drop then rolls everything back for a restart.
    pub(crate) fn close(mut self, root_cell: &Atomic<T>) -> bool {
        if self.doomed {
            return false;
        }

        // Pure read: nothing speculated, nothing to publish.
        if self.dups.is_empty()
            && self.unlinked.is_empty()
            && self.fresh.is_empty()
            && same(self.new_root, self.orig_root)
        {
            self.committed = true;
            return true;
        }

        // Validate every true attachment point into the live tree. Each
        // such parent has been locked since discovery, so a slot that
        // still holds the original now will keep holding it until we
        // splice.
        for e in self.dups.values() {
            if e.parent.is_null()
                || self.is_private(e.parent)
                || self.dups.contains_key(&addr(e.parent))
            {
                continue;
            }
            let p = unsafe { e.parent.deref() };
            debug_assert!(!p.meta().is_tombstoned());
            let cur = p.children()[e.idx].load(Acquire, self.guard);
            if !same(cur, e.orig) {
                trace!("close: attachment validation failed");
                return false;
            }
        }

        // The root swap goes first: it is the one update that can still be
        // refused, and nothing may have been spliced when it is.
        if !same(self.new_root, self.orig_root)
            && root_cell
                .compare_exchange(self.orig_root, self.new_root, Release, Relaxed, self.guard)
                .is_err()
        {
            trace!("close: root cas failed");
            return false;
        }

        // Splice the validated attachment points. Safe as plain stores:
        // this thread holds both the parent's and the original's mutex.
        for e in self.dups.values() {
            if e.parent.is_null()
                || self.is_private(e.parent)
                || self.dups.contains_key(&addr(e.parent))
            {
                continue;
            }
            unsafe { e.parent.deref() }.children()[e.idx].store(e.dup, Release);
        }

        // Published. Tombstone the replaced originals before any lock is
        // released, then hand them to the reclaimer.
        for e in self.dups.values() {
            let o = unsafe { e.orig.deref() };
            o.meta().tombstone();
            unsafe { reclaim::retire(e.orig, self.guard) };
        }
        for n in std::mem::take(&mut self.unlinked) {
            unsafe { n.deref() }.meta().tombstone();
            unsafe { reclaim::retire(n, self.guard) };
        }
        // Shadow nodes that were superseded within this very attempt were
        // never published and can be freed outright.
        for d in std::mem::take(&mut self.discarded) {
            unsafe { reclaim::dealloc(d) };
        }

        self.release_locks();
        self.committed = true;
        trace!("close: committed");
        true
    }

    /// Drop a duplicate that this attempt made and then routed around
    /// (e.g. a root bypassed by a height decrease, or a sibling emptied by
    /// a merge). The original is still replaced - it joins the unlink set -
    /// but the duplicate itself will never be published.
    pub(crate) fn bypass_dup(&mut self, orig: Shared<'g, T>) {
        let orig = self.orig_of(orig);
        if let Some(e) = self.dups.remove(&addr(orig)) {
            // The reverse mapping stays: other entries may have recorded
            // this duplicate as their shadow parent, and close must keep
            // treating them as internal.
            self.discarded.push(e.dup);
            self.unlinked.push(e.orig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internals::node::BinNode;
    use crossbeam_epoch::Owned;

    type N = BinNode<u64, u64, parking_lot::RawMutex>;

    fn new_cell(key: u64, value: u64) -> Atomic<N> {
        Atomic::from(Owned::new(N::new(key, value, false)))
    }

    fn free_cell(cell: &Atomic<N>) {
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut stack = vec![cell.load(Relaxed, guard)];
        while let Some(n) = stack.pop() {
            if n.is_null() {
                continue;
            }
            for c in unsafe { n.deref() }.children() {
                stack.push(c.load(Relaxed, guard));
            }
            unsafe { reclaim::dealloc(n) };
        }
    }

    #[test]
    fn test_open_close_pure_read() {
        let cell = new_cell(5, 50);
        let guard = reclaim::pin();
        let ctx = AttemptCtx::open(&cell, &guard);
        assert!(!ctx.root().is_null());
        assert!(ctx.close(&cell));
        drop(guard);
        free_cell(&cell);
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let cell = new_cell(5, 50);
        let guard = reclaim::pin();
        let mut ctx = AttemptCtx::open(&cell, &guard);
        let root = ctx.root();
        let d1 = ctx.duplicate(root).unwrap();
        let d2 = ctx.duplicate(root).unwrap();
        assert!(same(d1, d2));
        // The duplicate of a duplicate is itself.
        let d3 = ctx.duplicate(d1).unwrap();
        assert!(same(d1, d3));
        assert!(ctx.close(&cell));
        drop(guard);
        free_cell(&cell);
    }

    #[test]
    fn test_root_duplicate_publishes_via_cas() {
        let cell = new_cell(5, 50);
        let guard = reclaim::pin();
        let mut ctx = AttemptCtx::open(&cell, &guard);
        let root = ctx.root();
        let d = ctx.duplicate(root).unwrap();
        unsafe { &mut *(d.as_raw() as *mut N) }.value = 51;
        assert!(ctx.close(&cell));
        let now = cell.load(Acquire, &guard);
        assert!(same(now, d));
        assert_eq!(unsafe { now.deref() }.value, 51);
        // The replaced original is tombstoned.
        assert!(unsafe { root.deref() }.meta().is_tombstoned());
        drop(guard);
        free_cell(&cell);
    }

    #[test]
    fn test_contended_lock_dooms_attempt_and_releases() {
        let cell = new_cell(5, 50);
        let guard = reclaim::pin();
        let mut ctx = AttemptCtx::open(&cell, &guard);
        let root = ctx.root();
        // Another thread holds the root's mutex.
        assert!(unsafe { root.deref() }.meta().try_lock());
        assert!(ctx.duplicate(root).is_none());
        assert!(ctx.is_doomed());
        assert!(!ctx.close(&cell));
        // The attempt held nothing: our foreign lock is still in place.
        assert!(!unsafe { root.deref() }.meta().try_lock());
        unsafe { root.deref().meta().unlock() };
        drop(guard);
        free_cell(&cell);
    }

    #[test]
    fn test_stale_root_cas_fails() {
        let cell = new_cell(5, 50);
        let guard = reclaim::pin();

        // Attempt A opens first.
        let mut ctx_a = AttemptCtx::open(&cell, &guard);
        let root_a = ctx_a.root();

        // Attempt B opens, duplicates the root and commits.
        {
            let mut ctx_b = AttemptCtx::open(&cell, &guard);
            let root_b = ctx_b.root();
            let d = ctx_b.duplicate(root_b).unwrap();
            unsafe { &mut *(d.as_raw() as *mut N) }.value = 99;
            assert!(ctx_b.close(&cell));
        }

        // A's root snapshot is now stale: its duplication sees the
        // tombstone and dooms the attempt.
        assert!(ctx_a.duplicate(root_a).is_none());
        assert!(!ctx_a.close(&cell));
        assert_eq!(
            unsafe { cell.load(Acquire, &guard).deref() }.value,
            99
        );
        drop(guard);
        // root_a was retired by B's commit; only the live tree remains to
        // free here.
        free_cell(&cell);
    }

    #[test]
    fn test_fresh_root_insert_into_empty_cell() {
        let cell: Atomic<N> = Atomic::null();
        let guard = reclaim::pin();
        let mut ctx = AttemptCtx::open(&cell, &guard);
        assert!(ctx.root().is_null());
        let f = ctx.alloc(N::new(7, 70, false));
        ctx.set_new_root(f);
        assert!(ctx.close(&cell));
        assert_eq!(unsafe { cell.load(Acquire, &guard).deref() }.key, 7);
        drop(guard);
        free_cell(&cell);
    }

    #[test]
    fn test_abort_frees_shadow_and_locks() {
        let cell = new_cell(5, 50);
        let guard = reclaim::pin();
        {
            let mut ctx = AttemptCtx::open(&cell, &guard);
            let root = ctx.root();
            let _d = ctx.duplicate(root).unwrap();
            let _f = ctx.alloc(N::new(9, 90, false));
            // Dropped without close: rollback path.
        }
        // Lock set must be empty again: the root can be locked.
        let root = cell.load(Acquire, &guard);
        assert!(unsafe { root.deref() }.meta().try_lock());
        unsafe { root.deref().meta().unlock() };
        assert!(!unsafe { root.deref() }.meta().is_tombstoned());
        drop(guard);
        free_cell(&cell);
    }
}
