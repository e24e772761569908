//! Node keys.
//!
//! A key is a wire type plus a byte string. Integer keys are materialized
//! as their little-endian bytes (4 for fixed32, 8 for varint/fixed64) so
//! that hashing and comparison treat every key uniformly as bytes.

use smallvec::SmallVec;

use crate::encoding::{FieldVal, WireType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    wire_type: WireType,
    bytes: SmallVec<[u8; 8]>,
}

impl Key {
    /// The absent key. A node with an empty key matches only requests
    /// that also carry no key.
    pub fn none() -> Key {
        Key {
            wire_type: WireType::Bytes,
            bytes: SmallVec::new(),
        }
    }

    /// A varint-typed integer key.
    pub fn from_int(v: u64) -> Key {
        Key::from_typed_int(WireType::Varint, v)
    }

    /// An integer key with an explicit wire type.
    pub fn from_typed_int(wire_type: WireType, v: u64) -> Key {
        let mut bytes = SmallVec::new();
        match wire_type {
            WireType::Fixed32 => bytes.extend_from_slice(&(v as u32).to_le_bytes()),
            _ => bytes.extend_from_slice(&v.to_le_bytes()),
        }
        Key { wire_type, bytes }
    }

    /// A byte-string key.
    pub fn from_bytes(data: &[u8]) -> Key {
        Key {
            wire_type: WireType::Bytes,
            bytes: SmallVec::from_slice(data),
        }
    }

    /// Materialize a key from a decoded tag-1 field.
    pub fn from_field(wire_type: WireType, val: &FieldVal<'_>) -> Key {
        match val {
            FieldVal::Bytes(b) => Key {
                wire_type,
                bytes: SmallVec::from_slice(b),
            },
            FieldVal::Int(v) => Key::from_typed_int(wire_type, *v),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn wire_type(&self) -> WireType {
        self.wire_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The key as an integer, reading up to 8 little-endian bytes. May
    /// truncate byte-string keys; use with care.
    pub fn int_val(&self) -> u64 {
        let mut b = [0u8; 8];
        let n = self.bytes.len().min(8);
        b[..n].copy_from_slice(&self.bytes[..n]);
        u64::from_le_bytes(b)
    }

    /// Byte-level match, ignoring the wire type. This is the comparison
    /// the child index uses.
    pub fn matches_bytes(&self, other: &[u8]) -> bool {
        self.bytes.as_slice() == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_keys_are_little_endian_bytes() {
        let k = Key::from_int(0x0102);
        assert_eq!(k.bytes(), &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(k.int_val(), 0x0102);

        let k32 = Key::from_typed_int(WireType::Fixed32, 7);
        assert_eq!(k32.len(), 4);
        assert_eq!(k32.int_val(), 7);
    }

    #[test]
    fn equality_includes_wire_type() {
        let a = Key::from_typed_int(WireType::Varint, 5);
        let b = Key::from_typed_int(WireType::Fixed64, 5);
        assert_ne!(a, b);
        assert!(a.matches_bytes(b.bytes()));
    }

    #[test]
    fn string_keys_match_verbatim() {
        let k = Key::from_bytes(b"user:42");
        assert!(!k.is_empty());
        assert!(k.matches_bytes(b"user:42"));
        assert!(!k.matches_bytes(b"user:43"));
        assert!(Key::none().matches_bytes(&[]));
    }
}
