//! # knvtree — Key-N-Value Tree Engine
//!
//! A library for manipulating **Key-N-Value (KNV) trees**: a structural
//! overlay on the protobuf wire format in which every node is addressed
//! by the pair (tag, key). The tag is the protobuf field number; the key
//! is the value of a distinguished sub-field with tag 1. A KNV tree is a
//! hierarchical, addressable record whose subtrees can be located,
//! extracted, merged, and deleted by structural patterns that are
//! themselves expressed as trees.
//!
//! ## Quick start
//!
//! ```
//! use knvtree::{Key, KnvArena};
//!
//! let mut arena = KnvArena::new();
//! let user = arena.new_tree(3501, Key::from_int(12345678)).unwrap();
//! let info = arena.insert_subnode(user, 11, Key::none()).unwrap();
//! arena.insert_str_leaf(info, 101, b"Shaneyu").unwrap();
//! arena.insert_int_leaf(info, 102, 19801010).unwrap();
//!
//! let bytes = arena.serialize(user, true).unwrap();
//! let parsed = arena.parse(&bytes).unwrap();
//! let info = arena.find_child_by_tag(parsed, 11).unwrap();
//! assert_eq!(arena.child_int(info, 102), 19801010);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │   Protocol Envelope (packet framing)  │  protocol
//! ├───────────────────────────────────────┤
//! │   Tree Algebra (get/delete/update/…)  │  node::ops
//! ├───────────────────────────────────────┤
//! │   Node Engine (expand/fold, indexes,  │  node
//! │   eval-size cache, dirty tracking)    │
//! ├───────────────────────────────────────┤
//! │   Buffer Pool (size classes, shared   │  memory
//! │   zero-copy views)                    │
//! ├───────────────────────────────────────┤
//! │   Wire Codec (varint/fixed/bytes)     │  encoding
//! └───────────────────────────────────────┘
//! ```
//!
//! Trees live in a [`KnvArena`] and are addressed by [`NodeId`]. Arenas
//! are single-thread structures; transfer a tree between threads by
//! serializing and reparsing.

pub mod encoding;
pub mod error;
pub mod memory;
pub mod node;
pub mod protocol;

pub use encoding::{Tag, WireType};
pub use error::{KnvError, Result};
pub use memory::{ByteBuf, MemPool};
pub use node::{DeleteOutcome, Key, KnvArena, NodeId, Value, RESERVED_META_TAGS};
pub use protocol::KnvProtocol;
