//! Condup - Concurrent Ordered Maps via Optimistic Node Duplication
//!
//! This crate provides a family of concurrent, ordered, key-addressable
//! maps - an unbalanced binary search tree, a red-black tree and a B-tree -
//! that stay correct and scale under many threads performing interleaved
//! insert/remove/get.
//!
//! All three trees share one commit mechanism: the *optimistic node
//! duplication* protocol. A mutating thread never takes a tree-wide lock.
//! Instead it computes its structural change against the live tree,
//! materialises the change as a small detached set of duplicate nodes (a
//! "shadow" subtree), and then splices that shadow into the live tree in a
//! single validated step. If another thread interfered in the meantime, the
//! splice is refused, the shadow is discarded, and the whole attempt
//! restarts from scratch.
//!
//! The important consequences of this design:
//!
//! * Readers ([`get`](bst::BstMap::get), `contains_key`) take no locks and
//!   never retry. They may observe the tree just before or just after a
//!   concurrent mutation, but never a torn intermediate state, because a
//!   node is always fully formed before it becomes reachable.
//! * Writers block on nothing. Every lock acquisition in the protocol is a
//!   non-blocking try-lock; a writer that cannot proceed releases
//!   everything it holds and retries, which rules out deadlock by
//!   construction.
//! * Each individual operation is linearizable. There are no multi-key
//!   transactions, range scans or cross-operation snapshots here - if you
//!   want transactional trees with stable read snapshots, you want a
//!   serialised-writer copy-on-write structure instead.
//!
//! Superseded nodes are reclaimed through epoch based reclamation
//! (crossbeam-epoch), so the memory of a replaced node is only freed once
//! no thread can still be reading it.

#![deny(warnings)]
#![warn(unused_extern_crates)]
#![warn(missing_docs)]
#![allow(clippy::needless_lifetimes)]

// This is where the scary rust lives.
pub mod internals;
// This is where the gud rust lives.
mod utils;

pub mod bst;
pub mod btree;
pub mod rbtree;

pub use crate::internals::proto::Backoff;
