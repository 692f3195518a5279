//! This module contains the internals of the optimistic node-duplication
//! commit protocol. You should turn back now. Nothing of value is here.
//! Everything in this module juggles raw shared pointers whose lifetimes
//! are only guaranteed by epoch pins and per-node commit locks, so every
//! element of this module is unsafe in every meaning of the word.
//!
//! ⚠️   ⚠️   ⚠️

pub mod attempt;
pub mod node;
pub mod proto;
pub mod reclaim;
