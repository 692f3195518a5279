//! See the documentation for [BtreeMap]

use crossbeam_epoch::{Atomic, Guard, Shared};
use crossbeam_utils::CachePadded;
use lock_api::RawMutex;
use std::borrow::Borrow;
use std::cmp::Ordering as CmpOrdering;
use std::fmt::Debug;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed};

use crate::internals::attempt::AttemptCtx;
use crate::internals::node::{BtNode, BT_MIN_KEYS, BV_CAPACITY, L_CAPACITY};
use crate::internals::proto::Backoff;
use crate::internals::reclaim;
use crate::utils::{child_move_range, child_shift_left, child_shift_right};

/// A concurrent, ordered map based on a B-tree.
///
/// The surface and the guarantees match [`BstMap`](crate::bst::BstMap):
/// linearizable mutations through the optimistic node-duplication
/// protocol, lock-free reads. Every node carries several entries in
/// flat arrays, so the tree is shallow and cache-dense. Mutations descend
/// once, splitting full nodes (inserts) or refilling minimal ones
/// (removes) preemptively on the way down; the duplicated search path
/// commits through the single root exchange.
pub struct BtreeMap<K, V, M = parking_lot::RawMutex>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    root: CachePadded<Atomic<BtNode<K, V, M>>>,
    size: AtomicUsize,
    policy: Backoff,
}

unsafe impl<K, V, M> Send for BtreeMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
}
unsafe impl<K, V, M> Sync for BtreeMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
}

impl<K, V, M> Default for BtreeMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::with_backoff(Backoff::default())
    }
}

impl<K, V, M> Debug for BtreeMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeMap")
            .field("len", &self.len())
            .finish()
    }
}

impl<K, V> BtreeMap<K, V>
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

impl<K, V, M> BtreeMap<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    /// Construct a new, empty concurrent tree with an explicit restart
    /// policy for contended attempts.
    pub fn with_backoff(policy: Backoff) -> Self {
        BtreeMap {
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
    /// this never blocks and never retries.
    pub fn get<Q>(&self, k: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let guard = reclaim::pin();
        let mut cur = self.root.load(Acquire, &guard);
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            match n.keys.binary_search_by(|key| key.borrow().cmp(k)) {
                Ok(i) => return Some(n.values[i].clone()),
                Err(i) => {
                    if n.leaf {
                        return None;
                    }
                    cur = n.children[i].load(Acquire, &guard);
                }
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

    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    fn node_mut(n: Shared<'_, BtNode<K, V, M>>) -> &mut BtNode<K, V, M> {
        // Only ever called on nodes private to the attempt.
        unsafe { &mut *(n.as_raw() as *mut BtNode<K, V, M>) }
    }

    /// One optimistic attempt. `None` means the attempt is doomed and
    /// must be restarted; `Some(prev)` means the shadow is staged.
    fn try_insert<'g>(
        ctx: &mut AttemptCtx<'g, BtNode<K, V, M>>,
        k: &K,
        v: &V,
    ) -> Option<Option<V>> {
        let root = ctx.root();
        if root.is_null() {
            let mut f = BtNode::new_leaf();
            f.keys.push(k.clone());
            f.values.push(v.clone());
            let fs = ctx.alloc(f);
            ctx.set_new_root(fs);
            return Some(None);
        }
        let rd = ctx.duplicate(root)?;
        let mut cur = rd;
        if unsafe { rd.deref() }.is_full() {
            // Preemptive root split: the tree grows by one level.
            let nb = ctx.alloc(BtNode::new_branch());
            ctx.relink(nb, 0, rd);
            ctx.set_new_root(nb);
            Self::split_child(ctx, nb, 0)?;
            cur = nb;
        }
        // Descend; every node entered is private and non-full, so the
        // leaf insert below can never overflow.
        loop {
            let n = unsafe { cur.deref() };
            let mut i = match n.keys.binary_search_by(|key| key.cmp(k)) {
                Ok(i) => {
                    let prev = std::mem::replace(&mut Self::node_mut(cur).values[i], v.clone());
                    return Some(Some(prev));
                }
                Err(i) => i,
            };
            if n.leaf {
                let n_mut = Self::node_mut(cur);
                n_mut.keys.insert(i, k.clone());
                n_mut.values.insert(i, v.clone());
                return Some(None);
            }
            let ch = ctx.get_child(cur, i);
            let cd = ctx.duplicate(ch)?;
            if unsafe { cd.deref() }.is_full() {
                Self::split_child(ctx, cur, i)?;
                // The median that moved up decides the side.
                match k.cmp(&unsafe { cur.deref() }.keys[i]) {
                    CmpOrdering::Equal => {
                        let prev =
                            std::mem::replace(&mut Self::node_mut(cur).values[i], v.clone());
                        return Some(Some(prev));
                    }
                    CmpOrdering::Greater => i += 1,
                    CmpOrdering::Less => {}
                }
                cur = ctx.get_child(cur, i);
            } else {
                cur = cd;
            }
        }
    }

    /// Split the full child at `parent.children[idx]` around its median.
    /// The median moves up into the parent; the upper half moves into a
    /// fresh right sibling. Both halves end up private.
    fn split_child<'g>(
        ctx: &mut AttemptCtx<'g, BtNode<K, V, M>>,
        parent: Shared<'g, BtNode<K, V, M>>,
        idx: usize,
    ) -> Option<()> {
        let craw = ctx.get_child(parent, idx);
        let cd = ctx.duplicate(craw)?;
        let leaf = unsafe { cd.deref() }.leaf;
        let mid = BT_MIN_KEYS;
        let (mk, mv, right) = {
            let c = Self::node_mut(cd);
            debug_assert!(c.is_full());
            let mut right = if leaf {
                BtNode::new_leaf()
            } else {
                BtNode::new_branch()
            };
            right.keys.extend(c.keys.drain(mid + 1..));
            right.values.extend(c.values.drain(mid + 1..));
            (c.keys.remove(mid), c.values.remove(mid), right)
        };
        let rs = ctx.alloc(right);
        if !leaf {
            child_move_range(ctx, rs, 0, cd, mid + 1, L_CAPACITY - mid);
        }
        let pcnt = unsafe { parent.deref() }.count();
        child_shift_right(ctx, parent, idx + 1, pcnt + 1);
        ctx.relink(parent, idx + 1, rs);
        let p_mut = Self::node_mut(parent);
        p_mut.keys.insert(idx, mk);
        p_mut.values.insert(idx, mv);
        Some(())
    }

    fn try_remove<'g, Q>(
        ctx: &mut AttemptCtx<'g, BtNode<K, V, M>>,
        k: &Q,
    ) -> Option<Option<V>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        // Unlocked probe first, so an absent key stays a pure read and
        // commits without duplicating anything. Published nodes never
        // change their keys in place, only their child slots, so the
        // probe reads are stable.
        let root = ctx.root();
        let mut cur = root;
        let mut present = false;
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            match n.keys.binary_search_by(|key| key.borrow().cmp(k)) {
                Ok(_) => {
                    present = true;
                    break;
                }
                Err(i) => {
                    if n.leaf {
                        break;
                    }
                    cur = ctx.get_child(cur, i);
                }
            }
        }
        if !present {
            return Some(None);
        }

        // Present: descend again, duplicating, refilling every minimal
        // node on the way down so the removal itself cannot underflow.
        let rd = ctx.duplicate(root)?;
        let mut cur = rd;
        let mut at_root = true;
        let prev = loop {
            let n = unsafe { cur.deref() };
            match n.keys.binary_search_by(|key| key.borrow().cmp(k)) {
                Ok(i) => {
                    let p = n.values[i].clone();
                    if n.leaf {
                        let n_mut = Self::node_mut(cur);
                        n_mut.keys.remove(i);
                        n_mut.values.remove(i);
                        if at_root && n_mut.keys.is_empty() {
                            ctx.set_new_root(Shared::null());
                            ctx.bypass_dup(root);
                        }
                        break p;
                    }
                    // The key sits in a branch: replace it with the
                    // predecessor or successor if a neighbouring child
                    // can spare one, else merge the two children around
                    // it and keep searching inside the merged node.
                    let lraw = ctx.get_child(cur, i);
                    if unsafe { lraw.deref() }.count() > BT_MIN_KEYS {
                        let ld = ctx.duplicate(lraw)?;
                        Self::take_edge(ctx, ld, true, cur, i)?;
                        break p;
                    }
                    let rraw = ctx.get_child(cur, i + 1);
                    if unsafe { rraw.deref() }.count() > BT_MIN_KEYS {
                        let sd = ctx.duplicate(rraw)?;
                        Self::take_edge(ctx, sd, false, cur, i)?;
                        break p;
                    }
                    let ld = ctx.duplicate(lraw)?;
                    let sd = ctx.duplicate(rraw)?;
                    let m = Self::merge_children(ctx, cur, i, ld, sd, rraw)?;
                    if at_root && unsafe { cur.deref() }.count() == 0 {
                        ctx.set_new_root(m);
                        ctx.bypass_dup(root);
                    }
                    at_root = false;
                    cur = m;
                }
                Err(i) => {
                    if n.leaf {
                        // The key vanished between the probe and the
                        // locked descent.
                        ctx.fail();
                        return None;
                    }
                    let ch = ctx.get_child(cur, i);
                    let cd = ctx.duplicate(ch)?;
                    let next = if unsafe { cd.deref() }.count() == BT_MIN_KEYS {
                        let m = Self::refill(ctx, cur, i, cd, ch)?;
                        if at_root && unsafe { cur.deref() }.count() == 0 {
                            ctx.set_new_root(m);
                            ctx.bypass_dup(root);
                        }
                        m
                    } else {
                        cd
                    };
                    at_root = false;
                    cur = next;
                }
            }
        };
        Some(Some(prev))
    }

    /// Walk to the maximum (or minimum) entry under `start`, remove it
    /// from its leaf, and write it over `dst.keys[dst_idx]`. `start` is
    /// private and holds more than the minimum, and the walk keeps that
    /// true level by level, so the leaf removal cannot underflow.
    fn take_edge<'g>(
        ctx: &mut AttemptCtx<'g, BtNode<K, V, M>>,
        start: Shared<'g, BtNode<K, V, M>>,
        take_max: bool,
        dst: Shared<'g, BtNode<K, V, M>>,
        dst_idx: usize,
    ) -> Option<()> {
        let mut cur = start;
        loop {
            let n = unsafe { cur.deref() };
            if n.leaf {
                let n_mut = Self::node_mut(cur);
                let i = if take_max { n_mut.keys.len() - 1 } else { 0 };
                let ek = n_mut.keys.remove(i);
                let ev = n_mut.values.remove(i);
                let dst_mut = Self::node_mut(dst);
                dst_mut.keys[dst_idx] = ek;
                dst_mut.values[dst_idx] = ev;
                return Some(());
            }
            let i = if take_max { n.count() } else { 0 };
            let ch = ctx.get_child(cur, i);
            let cd = ctx.duplicate(ch)?;
            cur = if unsafe { cd.deref() }.count() == BT_MIN_KEYS {
                Self::refill(ctx, cur, i, cd, ch)?
            } else {
                cd
            };
        }
    }

    /// Bring the minimal child at `parent.children[idx]` above the
    /// minimum before descending into it: borrow an entry through the
    /// separator from a sibling that can spare one, else merge with a
    /// sibling. Returns the private node to descend into; the searched
    /// key always routes into it.
    fn refill<'g>(
        ctx: &mut AttemptCtx<'g, BtNode<K, V, M>>,
        parent: Shared<'g, BtNode<K, V, M>>,
        idx: usize,
        cd: Shared<'g, BtNode<K, V, M>>,
        corig: Shared<'g, BtNode<K, V, M>>,
    ) -> Option<Shared<'g, BtNode<K, V, M>>> {
        let leaf = unsafe { cd.deref() }.leaf;
        if idx > 0 {
            let lraw = ctx.get_child(parent, idx - 1);
            let lcnt = unsafe { lraw.deref() }.count();
            if lcnt > BT_MIN_KEYS {
                // Rotate right through the separator.
                let ld = ctx.duplicate(lraw)?;
                {
                    let p_mut = Self::node_mut(parent);
                    let l_mut = Self::node_mut(ld);
                    let c_mut = Self::node_mut(cd);
                    let sk = std::mem::replace(&mut p_mut.keys[idx - 1], l_mut.keys.remove(lcnt - 1));
                    let sv =
                        std::mem::replace(&mut p_mut.values[idx - 1], l_mut.values.remove(lcnt - 1));
                    c_mut.keys.insert(0, sk);
                    c_mut.values.insert(0, sv);
                }
                if !leaf {
                    let gc = ctx.get_child(ld, lcnt);
                    ctx.relink(ld, lcnt, Shared::null());
                    child_shift_right(ctx, cd, 0, BT_MIN_KEYS + 1);
                    ctx.relink(cd, 0, gc);
                }
                return Some(cd);
            }
        }
        let pcnt = unsafe { parent.deref() }.count();
        if idx < pcnt {
            let rraw = ctx.get_child(parent, idx + 1);
            let rcnt = unsafe { rraw.deref() }.count();
            if rcnt > BT_MIN_KEYS {
                // Rotate left through the separator.
                let sd = ctx.duplicate(rraw)?;
                {
                    let p_mut = Self::node_mut(parent);
                    let r_mut = Self::node_mut(sd);
                    let c_mut = Self::node_mut(cd);
                    c_mut
                        .keys
                        .push(std::mem::replace(&mut p_mut.keys[idx], r_mut.keys.remove(0)));
                    c_mut
                        .values
                        .push(std::mem::replace(&mut p_mut.values[idx], r_mut.values.remove(0)));
                }
                if !leaf {
                    let gc = ctx.get_child(sd, 0);
                    child_shift_left(ctx, sd, 0, rcnt + 1);
                    ctx.relink(cd, BT_MIN_KEYS + 1, gc);
                }
                return Some(cd);
            }
        }
        // Both siblings minimal (or absent): merge around a separator.
        if idx > 0 {
            let lraw = ctx.get_child(parent, idx - 1);
            let ld = ctx.duplicate(lraw)?;
            return Self::merge_children(ctx, parent, idx - 1, ld, cd, corig);
        }
        let rraw = ctx.get_child(parent, idx + 1);
        let sd = ctx.duplicate(rraw)?;
        Self::merge_children(ctx, parent, idx, cd, sd, rraw)
    }

    /// Merge `parent.children[idx + 1]` into `parent.children[idx]`
    /// around the separator at `idx`, which moves down between them. The
    /// absorbed right node never appears in the committed tree; its
    /// original is unlinked outright. Returns the surviving node.
    fn merge_children<'g>(
        ctx: &mut AttemptCtx<'g, BtNode<K, V, M>>,
        parent: Shared<'g, BtNode<K, V, M>>,
        idx: usize,
        ld: Shared<'g, BtNode<K, V, M>>,
        sd: Shared<'g, BtNode<K, V, M>>,
        sorig: Shared<'g, BtNode<K, V, M>>,
    ) -> Option<Shared<'g, BtNode<K, V, M>>> {
        let lcnt = unsafe { ld.deref() }.count();
        let rcnt = unsafe { sd.deref() }.count();
        let leaf = unsafe { ld.deref() }.leaf;
        {
            let p_mut = Self::node_mut(parent);
            let l_mut = Self::node_mut(ld);
            let r_mut = Self::node_mut(sd);
            l_mut.keys.push(p_mut.keys.remove(idx));
            l_mut.values.push(p_mut.values.remove(idx));
            l_mut.keys.extend(r_mut.keys.drain(..));
            l_mut.values.extend(r_mut.values.drain(..));
        }
        if !leaf {
            child_move_range(ctx, ld, lcnt + 1, sd, 0, rcnt + 1);
        }
        // The parent already lost the separator key; close the child gap.
        let pcnt = unsafe { parent.deref() }.count();
        child_shift_left(ctx, parent, idx + 1, pcnt + 2);
        ctx.bypass_dup(sorig);
        Some(ld)
    }

    /// Walk the whole tree and assert its structural invariants: sorted
    /// keys within bounds, slot counts within `BT_MIN_KEYS..=L_CAPACITY`
    /// (root exempt from the minimum), uniform leaf depth and no
    /// reachable tombstoned node. Intended for tests and debugging.
    pub fn verify(&self) -> bool {
        let guard = reclaim::pin();
        let root = self.root.load(Acquire, &guard);
        if root.is_null() {
            return true;
        }
        Self::verify_node(root, None, None, true, &guard).is_some()
    }

    /// Returns the height of the subtree, or `None` on any violation.
    fn verify_node(
        n: Shared<'_, BtNode<K, V, M>>,
        min: Option<&K>,
        max: Option<&K>,
        is_root: bool,
        guard: &Guard,
    ) -> Option<usize> {
        let node = unsafe { n.deref() };
        if node.meta.is_tombstoned() {
            return None;
        }
        let cnt = node.count();
        if cnt == 0 || cnt > L_CAPACITY || node.values.len() != cnt {
            return None;
        }
        if !is_root && cnt < BT_MIN_KEYS {
            return None;
        }
        for w in node.keys.windows(2) {
            if w[0] >= w[1] {
                return None;
            }
        }
        if let Some(lo) = min {
            if node.keys[0] <= *lo {
                return None;
            }
        }
        if let Some(hi) = max {
            if node.keys[cnt - 1] >= *hi {
                return None;
            }
        }
        if node.leaf {
            for c in node.children.iter() {
                if !c.load(Acquire, guard).is_null() {
                    return None;
                }
            }
            return Some(1);
        }
        let mut height = None;
        for j in 0..=cnt {
            let c = node.children[j].load(Acquire, guard);
            if c.is_null() {
                return None;
            }
            let lo = if j == 0 { min } else { Some(&node.keys[j - 1]) };
            let hi = if j == cnt { max } else { Some(&node.keys[j]) };
            let h = Self::verify_node(c, lo, hi, false, guard)?;
            match height {
                None => height = Some(h),
                Some(x) if x != h => return None,
                _ => {}
            }
        }
        for j in cnt + 1..BV_CAPACITY {
            if !node.children[j].load(Acquire, guard).is_null() {
                return None;
            }
        }
        height.map(|h| h + 1)
    }
}

impl<K, V, M> Drop for BtreeMap<K, V, M>
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

impl<K, V, M> FromIterator<(K, V)> for BtreeMap<K, V, M>
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
