//! # KNV Node Engine
//!
//! A KNV tree is an ordinary protobuf tree with one structural convention:
//! every node is identified by the pair (tag, key), where the tag is the
//! protobuf field number and the key is the value of a distinguished
//! sub-field with tag 1. Tags 1..=10 of a node are reserved for metadata
//! (the key included); data children start at tag 11.
//!
//! ## Folded vs expanded
//!
//! A node is *folded* when its authoritative state is a serialized buffer,
//! and *expanded* when it is the parsed children and metas. Transitions
//! are implicit: the first structural read expands, serialization folds.
//! A folded buffer stays authoritative until some descendant mutates, at
//! which point the buffer is invalidated and dirtiness propagates to the
//! root.
//!
//! ## Size cache
//!
//! Every node caches its serialized byte count (`eval_size`) and the byte
//! count of its value portion. Mutations adjust these incrementally on
//! the path to the root, re-deriving each ancestor's length prefix so
//! varint-boundary growth is accounted exactly. Serialization therefore
//! sizes its output without a dry-run encode, and self-checks the cache
//! against the bytes actually written.
//!
//! ## Arena
//!
//! Nodes live as slots in a [`KnvArena`] and are addressed by [`NodeId`].
//! Parent links are slot indices, never references, so mutation walks are
//! borrow-free. One arena can host any number of independent roots; a
//! detached node simply becomes a new root in its arena. Every operation
//! (reads included, since they may expand lazily) takes the arena by
//! `&mut`, so a tree is effectively owned by one thread at a time; hand a
//! tree to another thread by serializing and reparsing.

mod arena;
mod index;
mod key;
mod ops;

pub use arena::{KnvArena, Value};
pub use key::Key;
pub use ops::DeleteOutcome;

/// Tags 1..=10 are reserved for node metadata; the key is meta tag 1.
pub const RESERVED_META_TAGS: u32 = 10;

/// Linear-scan threshold before a node's child index promotes to a hash
/// table.
pub const INLINE_SCAN_MAX: usize = 8;

/// Slot address of a node inside its [`KnvArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}
