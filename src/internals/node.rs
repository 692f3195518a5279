//! Node metadata shared by every tree flavour.
//!
//! A node carries its payload (keys, values, colour), a fixed-size array of
//! child slots, and a small metadata block: a packed atomic flag word and
//! an exclusive low-level mutex that is only ever try-locked, and only ever
//! held for the duration of one commit window.

use crossbeam_epoch::Atomic;
use lock_api::RawMutex;
use smallvec::SmallVec;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU8, Ordering};

/// Set on a node the instant a successful commit unlinks it from the live
/// tree, just before it is handed to the reclaimer. A locked node that
/// turns out to be tombstoned belongs to a dead snapshot and must not be
/// built upon.
pub(crate) const FLAG_TOMBSTONE: u8 = 0b0000_0001;
/// Red-black colour bit. Immutable once a node is published; only shadow
/// nodes are ever recoloured.
pub(crate) const FLAG_RED: u8 = 0b0000_0010;

#[cfg(feature = "skinny")]
pub(crate) const L_CAPACITY: usize = 3;
#[cfg(not(feature = "skinny"))]
pub(crate) const L_CAPACITY: usize = 7;

pub(crate) const BV_CAPACITY: usize = L_CAPACITY + 1;
pub(crate) const BT_MIN_KEYS: usize = L_CAPACITY / 2;

pub(crate) const LEFT: usize = 0;
pub(crate) const RIGHT: usize = 1;

/// The per-node metadata block: flag word plus commit mutex.
pub(crate) struct NodeMeta<M: RawMutex> {
    flags: AtomicU8,
    lock: M,
}

impl<M: RawMutex> NodeMeta<M> {
    pub(crate) fn new(flags: u8) -> Self {
        NodeMeta {
            flags: AtomicU8::new(flags),
            lock: M::INIT,
        }
    }

    /// Non-blocking acquisition of the commit mutex. Failure is an ordinary
    /// outcome - the caller dooms its attempt rather than waiting.
    #[inline(always)]
    pub(crate) fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    /// # Safety
    /// The caller must hold the lock from a previous successful `try_lock`.
    #[inline(always)]
    pub(crate) unsafe fn unlock(&self) {
        self.lock.unlock()
    }

    #[inline(always)]
    pub(crate) fn is_tombstoned(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_TOMBSTONE != 0
    }

    #[inline(always)]
    pub(crate) fn tombstone(&self) {
        self.flags.fetch_or(FLAG_TOMBSTONE, Ordering::Release);
    }

    #[inline(always)]
    pub(crate) fn is_red(&self) -> bool {
        self.flags.load(Ordering::Acquire) & FLAG_RED != 0
    }

    #[inline(always)]
    pub(crate) fn set_red(&self, red: bool) {
        if red {
            self.flags.fetch_or(FLAG_RED, Ordering::Release);
        } else {
            self.flags.fetch_and(!FLAG_RED, Ordering::Release);
        }
    }

    /// Flags a duplicate should start from: colour carries over, tombstone
    /// never does.
    #[inline(always)]
    pub(crate) fn replicate_flags(&self) -> u8 {
        self.flags.load(Ordering::Acquire) & FLAG_RED
    }
}

/// The seam between the duplication protocol and a concrete node layout.
///
/// The protocol only ever needs three things from a node: its child slots,
/// its metadata block, and the ability to field-copy it. The caller of
/// `replicate` must hold the node's commit mutex so that the child slots
/// are quiescent for the copy.
pub(crate) trait ProtoNode: Sized + Send + Sync {
    type Mutex: RawMutex;

    fn children(&self) -> &[Atomic<Self>];

    fn meta(&self) -> &NodeMeta<Self::Mutex>;

    fn replicate(&self) -> Self;
}

/// A binary node: one key, one value, two child slots. Shared by the plain
/// BST and the red-black tree (which additionally uses the colour bit).
pub(crate) struct BinNode<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    pub(crate) meta: NodeMeta<M>,
    pub(crate) key: K,
    pub(crate) value: V,
    pub(crate) children: [Atomic<BinNode<K, V, M>>; 2],
}

impl<K, V, M> BinNode<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    pub(crate) fn new(key: K, value: V, red: bool) -> Self {
        BinNode {
            meta: NodeMeta::new(if red { FLAG_RED } else { 0 }),
            key,
            value,
            children: [Atomic::null(), Atomic::null()],
        }
    }
}

impl<K, V, M> ProtoNode for BinNode<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    type Mutex = M;

    #[inline(always)]
    fn children(&self) -> &[Atomic<Self>] {
        &self.children
    }

    #[inline(always)]
    fn meta(&self) -> &NodeMeta<M> {
        &self.meta
    }

    fn replicate(&self) -> Self {
        BinNode {
            meta: NodeMeta::new(self.meta.replicate_flags()),
            key: self.key.clone(),
            value: self.value.clone(),
            children: [self.children[0].clone(), self.children[1].clone()],
        }
    }
}

/// A B-tree node of order [`BV_CAPACITY`]. Keys and values travel together
/// at every level (a B-tree proper, not a B+tree); `keys.len()` keys imply
/// `keys.len() + 1` populated child slots on a branch, and none on a leaf.
pub(crate) struct BtNode<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    pub(crate) meta: NodeMeta<M>,
    pub(crate) keys: SmallVec<[K; L_CAPACITY]>,
    pub(crate) values: SmallVec<[V; L_CAPACITY]>,
    pub(crate) children: [Atomic<BtNode<K, V, M>>; BV_CAPACITY],
    pub(crate) leaf: bool,
}

impl<K, V, M> BtNode<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    pub(crate) fn new_leaf() -> Self {
        BtNode {
            meta: NodeMeta::new(0),
            keys: SmallVec::new(),
            values: SmallVec::new(),
            children: std::array::from_fn(|_| Atomic::null()),
            leaf: true,
        }
    }

    pub(crate) fn new_branch() -> Self {
        BtNode {
            meta: NodeMeta::new(0),
            keys: SmallVec::new(),
            values: SmallVec::new(),
            children: std::array::from_fn(|_| Atomic::null()),
            leaf: false,
        }
    }

    #[inline(always)]
    pub(crate) fn count(&self) -> usize {
        self.keys.len()
    }

    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.keys.len() == L_CAPACITY
    }
}

impl<K, V, M> ProtoNode for BtNode<K, V, M>
where
    K: Ord + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    M: RawMutex + Send + Sync + 'static,
{
    type Mutex = M;

    #[inline(always)]
    fn children(&self) -> &[Atomic<Self>] {
        &self.children
    }

    #[inline(always)]
    fn meta(&self) -> &NodeMeta<M> {
        &self.meta
    }

    fn replicate(&self) -> Self {
        BtNode {
            meta: NodeMeta::new(self.meta.replicate_flags()),
            keys: self.keys.clone(),
            values: self.values.clone(),
            children: std::array::from_fn(|i| self.children[i].clone()),
            leaf: self.leaf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestBinNode = BinNode<u64, u64, parking_lot::RawMutex>;

    #[test]
    fn test_meta_flags() {
        let meta: NodeMeta<parking_lot::RawMutex> = NodeMeta::new(FLAG_RED);
        assert!(meta.is_red());
        assert!(!meta.is_tombstoned());
        meta.set_red(false);
        assert!(!meta.is_red());
        meta.tombstone();
        assert!(meta.is_tombstoned());
        // The tombstone must never survive into a duplicate.
        assert_eq!(meta.replicate_flags() & FLAG_TOMBSTONE, 0);
    }

    #[test]
    fn test_meta_try_lock() {
        let meta: NodeMeta<parking_lot::RawMutex> = NodeMeta::new(0);
        assert!(meta.try_lock());
        assert!(!meta.try_lock());
        unsafe { meta.unlock() };
        assert!(meta.try_lock());
        unsafe { meta.unlock() };
    }

    #[test]
    fn test_bin_replicate_clears_tombstone() {
        let n = TestBinNode::new(1, 10, true);
        n.meta.tombstone();
        let d = n.replicate();
        assert!(d.meta.is_red());
        assert!(!d.meta.is_tombstoned());
        assert_eq!(d.key, 1);
        assert_eq!(d.value, 10);
    }
}
