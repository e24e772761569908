//! Per-node child index.
//!
//! Children are looked up by (tag, key bytes). A node starts in inline
//! mode — the child list itself is scanned, which beats any table for a
//! handful of children and costs nothing to set up — and promotes to a
//! hash table keyed by [`key_hash`] once the list outgrows
//! [`INLINE_SCAN_MAX`](super::INLINE_SCAN_MAX). Metas are never indexed.
//!
//! The hash folds the key bytes four at a time into the tag, so for
//! keyless children it degenerates to a hash of the tag alone — which is
//! exactly what makes by-tag lookup work on nodes whose children carry no
//! keys. Buckets chain duplicates in insertion order.
//!
//! The index holds no key material of its own: a candidate from a bucket
//! is always verified against the node's actual tag and key. Callers must
//! remove a child before mutating its tag or key and reinsert it after.

use hashbrown::HashMap;
use smallvec::SmallVec;

use super::NodeId;
use crate::encoding::Tag;

/// Fold `key` four bytes at a time into `tag`; leftover bytes fold in
/// with the earlier byte in the higher bits.
pub(crate) fn key_hash(tag: Tag, key: &[u8]) -> u32 {
    let mut h = tag;
    let mut rest = key;
    while let [a, b, c, d, tail @ ..] = rest {
        h = h.wrapping_add(u32::from_le_bytes([*a, *b, *c, *d]));
        rest = tail;
    }
    let mut shift = rest.len();
    for &b in rest {
        shift -= 1;
        h = h.wrapping_add((b as u32) << (shift * 8));
    }
    h
}

#[derive(Debug, Default)]
pub(crate) enum ChildIndex {
    /// No table; lookups scan the child list.
    #[default]
    Inline,
    Table(HashMap<u32, SmallVec<[NodeId; 2]>>),
}

impl ChildIndex {
    pub(crate) fn clear(&mut self) {
        *self = ChildIndex::Inline;
    }

    pub(crate) fn is_table(&self) -> bool {
        matches!(self, ChildIndex::Table(_))
    }

    pub(crate) fn insert(&mut self, hash: u32, id: NodeId) {
        if let ChildIndex::Table(map) = self {
            map.entry(hash).or_default().push(id);
        }
    }

    pub(crate) fn remove(&mut self, hash: u32, id: NodeId) {
        if let ChildIndex::Table(map) = self {
            if let Some(bucket) = map.get_mut(&hash) {
                bucket.retain(|c| *c != id);
                if bucket.is_empty() {
                    map.remove(&hash);
                }
            }
        }
    }

    /// Candidates sharing `hash`, in insertion order. The caller verifies
    /// each candidate against the real tag and key.
    pub(crate) fn candidates(&self, hash: u32) -> &[NodeId] {
        match self {
            ChildIndex::Inline => &[],
            ChildIndex::Table(map) => map.get(&hash).map_or(&[], |b| b.as_slice()),
        }
    }

    /// Replace the index with a table built from `entries`.
    pub(crate) fn rebuild(&mut self, entries: impl Iterator<Item = (u32, NodeId)>) {
        let mut map: HashMap<u32, SmallVec<[NodeId; 2]>> = HashMap::new();
        for (hash, id) in entries {
            map.entry(hash).or_default().push(id);
        }
        *self = ChildIndex::Table(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyless_hash_is_the_tag() {
        assert_eq!(key_hash(42, &[]), 42);
        assert_eq!(key_hash(0xdad, &[]), 0xdad);
    }

    #[test]
    fn hash_folds_four_byte_chunks() {
        let h = key_hash(1, &[0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
        assert_eq!(h, 1 + 1 + 2);
    }

    #[test]
    fn trailing_bytes_are_shifted() {
        // Leftover bytes after the 4-byte chunks fold in big-endian-ish
        // order: the earlier byte lands in the higher bits.
        assert_eq!(key_hash(0, &[1, 2]), (1 << 8) + 2);
        assert_eq!(key_hash(0, &[1, 2, 3]), (1 << 16) + (2 << 8) + 3);
    }

    #[test]
    fn table_chains_duplicates_in_order() {
        let mut idx = ChildIndex::default();
        idx.rebuild([(7, NodeId(1)), (7, NodeId(2))].into_iter());
        assert_eq!(idx.candidates(7), &[NodeId(1), NodeId(2)]);
        idx.insert(7, NodeId(3));
        assert_eq!(idx.candidates(7), &[NodeId(1), NodeId(2), NodeId(3)]);
        idx.remove(7, NodeId(2));
        assert_eq!(idx.candidates(7), &[NodeId(1), NodeId(3)]);
        idx.remove(7, NodeId(1));
        idx.remove(7, NodeId(3));
        assert!(idx.candidates(7).is_empty());
    }
}
