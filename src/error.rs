//! Error types for KNV tree operations.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KnvError {
    /// Malformed wire data: truncated buffer, oversized varint, length
    /// prefix past the end of input, or an unknown wire type.
    #[error("invalid format: {0}")]
    InvalidFormat(&'static str),

    /// A structurally invalid argument: zero tag, meta tag out of the
    /// reserved range, bad part index.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Value kind does not match the node's wire type.
    #[error("node type mismatch")]
    TypeMismatch,

    /// A new value buffer implies a different key than the node already
    /// carries.
    #[error("key differs from existing data")]
    KeyConflict,

    /// Attempted to insert a child into a non-composite node.
    #[error("leaf cannot have child")]
    LeafCannotHaveChild,

    /// Removal or lookup target is absent.
    #[error("not found")]
    NotFound,

    /// The buffer pool is exhausted even after shrinking free lists.
    #[error("out of memory")]
    OutOfMemory,

    /// Self-checked invariant violation during serialization. This is a
    /// bug in the size cache, not a user error; the tree is left intact.
    #[error("size mismatch: {0}")]
    SizeMismatch(&'static str),

    /// Packet reassembly saw the same part twice.
    #[error("duplicate packet part")]
    PartialDuplicate,

    /// Legacy frame violation: bad token bytes or inconsistent lengths.
    #[error("bad frame: {0}")]
    BadFrame(&'static str),
}

pub type Result<T> = std::result::Result<T, KnvError>;
