//! See the documentation for [BstMap]

use crossbeam_epoch::{Atomic, Guard, Shared};
use crossbeam_utils::CachePadded;
use lock_api::RawMutex;
use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::Debug;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed};

use crate::internals::attempt::AttemptCtx;
use crate::internals::node::{BinNode, LEFT, RIGHT};
use crate::internals::proto::Backoff;
use crate::internals::reclaim;

/// A concurrent, ordered map based on an unbalanced binary search tree.
///
/// Any number of threads may call [`insert`](BstMap::insert),
/// [`remove`](BstMap::remove) and [`get`](BstMap::get) concurrently; every
/// individual call is linearizable. Mutations commit through the
/// optimistic node-duplication protocol: the smallest possible set of
/// nodes around the change is duplicated, mutated privately, and spliced
/// into the live tree in one validated step. Readers take no locks and
/// never retry.
///
/// Because the tree does not rebalance, worst-case depth is linear in the
/// case of sorted insertion. If your keys arrive in order, prefer
/// [`RbTreeMap`](crate::rbtree::RbTreeMap) or
/// [`BtreeMap`](crate::btree::BtreeMap) - same surface, same protocol,
/// bounded depth.
pub struct BstMap<K, V, M = parking_lot::RawMutex>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    root: CachePadded<Atomic<BinNode<K, V, M>>>,
    size: AtomicUsize,
    policy: Backoff,
}

unsafe impl<K, V, M> Send for BstMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
}
unsafe impl<K, V, M> Sync for BstMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
}

impl<K, V, M> Default for BstMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::with_backoff(Backoff::default())
    }
}

impl<K, V, M> Debug for BstMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BstMap").field("len", &self.len()).finish()
    }
}

impl<K, V> BstMap<K, V>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Construct a new, empty concurrent tree with the default restart
    /// policy.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K, V, M> BstMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    /// Construct a new, empty concurrent tree with an explicit restart
    /// policy for contended attempts.
    pub fn with_backoff(policy: Backoff) -> Self {
        BstMap {
            root: CachePadded::new(Atomic::null()),
            size: AtomicUsize::new(0),
            policy,
        }
    }

    /// The number of entries currently in the map. Under concurrent
    /// mutation this is a snapshot, accurate the instant it was taken.
    pub fn len(&self) -> usize {
        self.size.load(Relaxed)
    }

    /// True when the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve the value associated with `k`, if present. Lock-free:
    /// this never blocks and never retries, and observes either the pre-
    /// or post-state of any concurrent mutation, never a torn one.
    pub fn get<Q>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = reclaim::pin();
        let mut cur = self.root.load(Acquire, &guard);
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            match k.cmp(n.key.borrow()) {
                CmpOrdering::Equal => return Some(n.value.clone()),
                CmpOrdering::Less => cur = n.children[LEFT].load(Acquire, &guard),
                CmpOrdering::Greater => cur = n.children[RIGHT].load(Acquire, &guard),
            }
        }
        None
    }

    /// True if `k` is present.
    pub fn contains_key<Q>(&self, k: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.get(k).is_some()
    }

    /// Insert a value, returning the previous value held under this key
    /// if there was one.
    pub fn insert(&self, k: K, v: V) -> Option<V> {
        let waiter = crossbeam_utils::Backoff::new();
        loop {
            let guard = reclaim::pin();
            {
                let mut ctx = AttemptCtx::open(&self.root, &guard);
                if let Some(prev) = Self::try_insert(&mut ctx, &k, &v) {
                    if ctx.close(&self.root) {
                        if prev.is_none() {
                            self.size.fetch_add(1, Relaxed);
                        }
                        return prev;
                    }
                }
            }
            drop(guard);
            self.policy.wait(&waiter);
        }
    }

    /// Remove a key, returning the value it held if it was present.
    pub fn remove<Q>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let waiter = crossbeam_utils::Backoff::new();
        loop {
            let guard = reclaim::pin();
            {
                let mut ctx = AttemptCtx::open(&self.root, &guard);
                if let Some(prev) = Self::try_remove(&mut ctx, k) {
                    if ctx.close(&self.root) {
                        if prev.is_some() {
                            self.size.fetch_sub(1, Relaxed);
                        }
                        return prev;
                    }
                }
            }
            drop(guard);
            self.policy.wait(&waiter);
        }
    }

    /// One optimistic attempt. `None` means the attempt is doomed and must
    /// be restarted; `Some(prev)` means the shadow is staged and ready for
    /// close.
    fn try_insert<'g>(
        ctx: &mut AttemptCtx<'g, BinNode<K, V, M>>,
        k: &K,
        v: &V,
    ) -> Option<Option<V>> {
        let mut cur = ctx.root();
        if cur.is_null() {
            let f = ctx.alloc(BinNode::new(k.clone(), v.clone(), false));
            ctx.set_new_root(f);
            return Some(None);
        }
        loop {
            let n = unsafe { cur.deref() };
            let dir = match k.cmp(&n.key) {
                CmpOrdering::Equal => {
                    let prev = n.value.clone();
                    let d = ctx.duplicate(cur)?;
                    unsafe { &mut *(d.as_raw() as *mut BinNode<K, V, M>) }.value = v.clone();
                    return Some(Some(prev));
                }
                CmpOrdering::Less => LEFT,
                CmpOrdering::Greater => RIGHT,
            };
            let child = ctx.get_child(cur, dir);
            if child.is_null() {
                let d = ctx.duplicate(cur)?;
                // Re-read through the duplicate: the slot was observed
                // empty before the lock was taken, and may have been
                // filled by a commit that beat us to it.
                if !ctx.get_child(cur, dir).is_null() {
                    ctx.fail();
                    return None;
                }
                let f = ctx.alloc(BinNode::new(k.clone(), v.clone(), false));
                ctx.relink(d, dir, f);
                return Some(None);
            }
            cur = child;
        }
    }

    fn try_remove<'g, Q>(
        ctx: &mut AttemptCtx<'g, BinNode<K, V, M>>,
        k: &Q,
    ) -> Option<Option<V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut parent: Shared<'g, BinNode<K, V, M>> = Shared::null();
        let mut pdir = LEFT;
        let mut cur = ctx.root();
        loop {
            if cur.is_null() {
                return Some(None);
            }
            let n = unsafe { cur.deref() };
            match k.cmp(n.key.borrow()) {
                CmpOrdering::Equal => break,
                CmpOrdering::Less => {
                    parent = cur;
                    pdir = LEFT;
                    cur = ctx.get_child(cur, LEFT);
                }
                CmpOrdering::Greater => {
                    parent = cur;
                    pdir = RIGHT;
                    cur = ctx.get_child(cur, RIGHT);
                }
            }
        }

        let prev = unsafe { cur.deref() }.value.clone();

        if !parent.is_null() {
            // Lock order is uniform parent-before-child: duplicate the
            // parent (which locks it) before freezing the victim.
            let pd = ctx.duplicate(parent)?;
            // The slot was last read before the lock: re-check it.
            if ctx.get_child(parent, pdir).as_raw() != cur.as_raw() {
                ctx.fail();
                return None;
            }
            ctx.acquire_for_unlink(cur)?;
            let l = ctx.get_child(cur, LEFT);
            let r = ctx.get_child(cur, RIGHT);
            if l.is_null() || r.is_null() {
                // Leaf or single child: bypass the victim in the shadow
                // parent. The victim is frozen, so the surviving child
                // read above cannot go stale under us.
                let next = if l.is_null() { r } else { l };
                ctx.relink(pd, pdir, next);
                ctx.mark_unlinked(cur);
            } else {
                Self::remove_two_children(ctx, cur)?;
            }
        } else {
            // The victim is the root.
            ctx.acquire_for_unlink(cur)?;
            let l = ctx.get_child(cur, LEFT);
            let r = ctx.get_child(cur, RIGHT);
            if l.is_null() || r.is_null() {
                let next = if l.is_null() { r } else { l };
                ctx.set_new_root(next);
                ctx.mark_unlinked(cur);
            } else {
                Self::remove_two_children(ctx, cur)?;
            }
        }
        Some(Some(prev))
    }

    /// Remove a node that has two children: splice its in-order successor
    /// out, and move the successor's entry into the victim's duplicate.
    /// The victim and the successor's parent are made one contiguous
    /// shadow subtree first, so a single attachment point is validated at
    /// close.
    fn remove_two_children<'g>(
        ctx: &mut AttemptCtx<'g, BinNode<K, V, M>>,
        victim: Shared<'g, BinNode<K, V, M>>,
    ) -> Option<()> {
        let mut sp = victim;
        let mut sdir = RIGHT;
        let mut s = ctx.get_child(victim, RIGHT);
        loop {
            let l = ctx.get_child(s, LEFT);
            if l.is_null() {
                break;
            }
            sp = s;
            sdir = LEFT;
            s = l;
        }

        ctx.link_to_lca(victim, sp)?;
        // The successor chain was walked without locks; now that the path
        // is locked, confirm the successor link held.
        if ctx.get_child(sp, sdir).as_raw() != s.as_raw() {
            ctx.fail();
            return None;
        }
        ctx.acquire_for_unlink(s)?;
        if !ctx.get_child(s, LEFT).is_null() {
            // Someone hung a smaller node under the successor: it is no
            // longer the successor.
            ctx.fail();
            return None;
        }
        let sr = ctx.get_child(s, RIGHT);
        let sref = unsafe { s.deref() };

        let vd = ctx.duplicate(victim)?;
        let vd_mut = unsafe { &mut *(vd.as_raw() as *mut BinNode<K, V, M>) };
        vd_mut.key = sref.key.clone();
        vd_mut.value = sref.value.clone();

        let spd = ctx.duplicate(sp)?;
        ctx.relink(spd, sdir, sr);
        ctx.mark_unlinked(s);
        Some(())
    }

    /// Walk the whole tree and assert its structural invariants: strict
    /// key ordering and no reachable tombstoned node. Intended for tests
    /// and debugging; takes a point-in-time snapshot of the root.
    pub fn verify(&self) -> bool {
        let guard = reclaim::pin();
        let root = self.root.load(Acquire, &guard);
        Self::verify_node(root, None, None, &guard)
    }

    fn verify_node(
        n: Shared<'_, BinNode<K, V, M>>,
        min: Option<&K>,
        max: Option<&K>,
        guard: &Guard,
    ) -> bool {
        if n.is_null() {
            return true;
        }
        let node = unsafe { n.deref() };
        if node.meta.is_tombstoned() {
            return false;
        }
        if let Some(lo) = min {
            if node.key <= *lo {
                return false;
            }
        }
        if let Some(hi) = max {
            if node.key >= *hi {
                return false;
            }
        }
        let l = node.children[LEFT].load(Acquire, guard);
        let r = node.children[RIGHT].load(Acquire, guard);
        Self::verify_node(l, min, Some(&node.key), guard)
            && Self::verify_node(r, Some(&node.key), max, guard)
    }
}

impl<K, V, M> Drop for BstMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Exclusive access: free the live tree eagerly. Retired nodes are
        // already queued with the epoch reclaimer and free themselves.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        let mut stack = vec![self.root.load(Relaxed, guard)];
        while let Some(n) = stack.pop() {
            if n.is_null() {
                continue;
            }
            for c in unsafe { n.deref() }.children.iter() {
                stack.push(c.load(Relaxed, guard));
            }
            unsafe { reclaim::dealloc(n) };
        }
    }
}

impl<K, V, M> FromIterator<(K, V)> for BstMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let map = Self::with_backoff(Backoff::default());
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}
