//! The node arena: slot storage, lazy expand/fold, the eval-size cache,
//! and the public node operation surface.

use std::fmt::Write as _;

use smallvec::SmallVec;

use super::index::{key_hash, ChildIndex};
use super::{Key, NodeId, INLINE_SCAN_MAX, RESERVED_META_TAGS};
use crate::encoding::{field_len, FieldReader, FieldVal, FieldWriter, Tag, WireType};
use crate::error::{KnvError, Result};
use crate::memory::{ByteBuf, MemPool};

/// A node's value portion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    /// No value: an empty composite, or a composite whose buffer was
    /// invalidated by a descendant mutation.
    #[default]
    None,
    /// Varint/fixed64 payload, or fixed32 zero-extended.
    Int(u64),
    /// Byte payload. For a folded composite this is the serialized
    /// message; for a leaf it is the raw string.
    Bytes(ByteBuf),
}

impl Value {
    pub(crate) fn byte_len(&self) -> u32 {
        match self {
            Value::Bytes(b) => b.len() as u32,
            _ => 0,
        }
    }

    /// The integer payload; 0 for byte values.
    pub fn int(&self) -> u64 {
        match self {
            Value::Int(v) => *v,
            _ => 0,
        }
    }
}

const META_SLOTS: usize = RESERVED_META_TAGS as usize + 1;

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) tag: Tag,
    pub(crate) wire_type: WireType,
    pub(crate) key: Key,
    pub(crate) value: Value,
    pub(crate) parent: Option<NodeId>,
    /// Data children in insertion order. Only meaningful when `expanded`.
    pub(crate) children: Vec<NodeId>,
    /// Metas in serialization order; the key meta (tag 1) is kept first.
    pub(crate) metas: Vec<NodeId>,
    /// Direct index over meta tags 1..=10; slot 0 unused.
    pub(crate) metas_by_tag: [Option<NodeId>; META_SLOTS],
    pub(crate) index: ChildIndex,
    /// False means the buffer has not been parsed into children yet.
    pub(crate) expanded: bool,
    /// Some descendant's serialization differs from the cached buffer.
    pub(crate) subnode_dirty: bool,
    /// At least one direct child carries a non-empty key.
    pub(crate) child_has_key: bool,
    /// This node never interprets a tag-1 sub-field as its key.
    pub(crate) no_key: bool,
    /// Cached serialized size including the field header; None = stale.
    pub(crate) eval_size: Option<u32>,
    /// Cached size of the value portion (composites only).
    pub(crate) eval_value_size: u32,
}

impl Node {
    pub(crate) fn buffer_valid(&self) -> bool {
        matches!(&self.value, Value::Bytes(b) if !b.is_empty())
    }

    /// Leaf-shaped for serialization purposes: not a composite, not yet
    /// expanded, or expanded with nothing inside.
    pub(crate) fn leafish(&self) -> bool {
        self.wire_type != WireType::Bytes
            || !self.expanded
            || (self.children.is_empty() && self.metas.is_empty())
    }

    fn matches(&self, tag: Tag, key_bytes: &[u8]) -> bool {
        self.tag == tag && self.key.matches_bytes(key_bytes)
    }
}

/// Slot arena hosting one or more KNV trees. See the module docs for the
/// data model; every operation is addressed by [`NodeId`].
pub struct KnvArena {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    pool: MemPool,
}

impl Default for KnvArena {
    fn default() -> Self {
        KnvArena::new()
    }
}

impl KnvArena {
    pub fn new() -> KnvArena {
        KnvArena::with_pool(MemPool::global())
    }

    /// An arena drawing its buffers from an explicit pool.
    pub fn with_pool(pool: MemPool) -> KnvArena {
        KnvArena {
            nodes: Vec::new(),
            free: Vec::new(),
            pool,
        }
    }

    pub fn pool(&self) -> &MemPool {
        &self.pool
    }

    /// Number of live nodes across all roots in this arena.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn n(&self, id: NodeId) -> &Node {
        // INVARIANT: NodeIds are only handed out for live slots.
        self.nodes[id.idx()].as_ref().expect("stale node id")
    }

    pub(crate) fn n_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes[id.idx()].as_mut().expect("stale node id")
    }

    fn alloc_slot(&mut self, node: Node) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            NodeId(idx)
        } else {
            self.nodes.push(Some(node));
            NodeId((self.nodes.len() - 1) as u32)
        }
    }

    /// Free a whole subtree's slots. Iterative so that deep or wide trees
    /// cannot blow the stack.
    pub(crate) fn free_subtree(&mut self, id: NodeId) {
        let mut stack: SmallVec<[NodeId; 16]> = SmallVec::new();
        stack.push(id);
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes[cur.idx()].take() {
                stack.extend(node.children.iter().copied());
                stack.extend(node.metas.iter().copied());
                self.free.push(cur.0);
            }
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    pub(crate) fn new_node(
        &mut self,
        tag: Tag,
        wire_type: WireType,
        value: Value,
        field_size: Option<u32>,
        force_no_key: bool,
    ) -> NodeId {
        let byte_len = value.byte_len();
        let mut key = Key::none();
        let mut expanded = wire_type != WireType::Bytes;
        if wire_type == WireType::Bytes {
            if byte_len == 0 {
                expanded = true;
            } else if !force_no_key {
                if let Value::Bytes(b) = &value {
                    let mut r = FieldReader::new(b.as_slice());
                    match r.next_field() {
                        Ok(Some(f)) if f.tag == 1 => {
                            key = Key::from_field(f.wire_type, &f.val);
                        }
                        Ok(Some(_)) => {}
                        // Not a parsable message: treat as an opaque leaf.
                        _ => expanded = true,
                    }
                }
            }
        }
        let eval_size =
            field_size.unwrap_or_else(|| field_len(tag, wire_type, value.int(), byte_len));
        let eval_value_size = if wire_type == WireType::Bytes {
            byte_len
        } else {
            0
        };
        self.alloc_slot(Node {
            tag,
            wire_type,
            key,
            value,
            parent: None,
            children: Vec::new(),
            metas: Vec::new(),
            metas_by_tag: [None; META_SLOTS],
            index: ChildIndex::default(),
            expanded,
            subnode_dirty: false,
            child_has_key: false,
            no_key: force_no_key || wire_type != WireType::Bytes,
            eval_size: Some(eval_size),
            eval_value_size,
        })
    }

    /// Parse a serialized KNV node (a single tagged field; trailing bytes
    /// are ignored). The input is copied into a pooled buffer once;
    /// expansion then slices it without further copies.
    pub fn parse(&mut self, data: &[u8]) -> Result<NodeId> {
        let buf = ByteBuf::copy_from(&self.pool, data)?;
        self.parse_buf(buf)
    }

    /// [`parse`](Self::parse) over an existing shared buffer.
    pub fn parse_buf(&mut self, buf: ByteBuf) -> Result<NodeId> {
        let (tag, wire_type, value, field_size) = {
            let mut r = FieldReader::new(buf.as_slice());
            let f = r
                .next_field()?
                .ok_or(KnvError::InvalidFormat("invalid bin format"))?;
            if f.tag == 0 {
                return Err(KnvError::InvalidFormat("invalid bin format"));
            }
            let value = match f.val {
                FieldVal::Int(v) => Value::Int(v),
                FieldVal::Bytes(_) => {
                    Value::Bytes(buf.slice(f.val_span.0, f.val_span.1 - f.val_span.0))
                }
            };
            (f.tag, f.wire_type, value, f.encoded_len() as u32)
        };
        Ok(self.new_node(tag, wire_type, value, Some(field_size), false))
    }

    /// Wrap a bare protobuf message (no enclosing tag) as a node with the
    /// given tag. Reading the node's value yields the message back;
    /// serializing adds the tag header.
    pub fn from_message(&mut self, msg: &[u8], tag: Tag) -> Result<NodeId> {
        if tag == 0 {
            return Err(KnvError::InvalidArgument("tag must not be 0"));
        }
        let buf = ByteBuf::copy_from(&self.pool, msg)?;
        Ok(self.new_node(tag, WireType::Bytes, Value::Bytes(buf), None, false))
    }

    /// An empty composite node, optionally keyed. The usual way to start
    /// a tree.
    pub fn new_tree(&mut self, tag: Tag, key: Key) -> Result<NodeId> {
        if tag == 0 {
            return Err(KnvError::InvalidArgument("tag must not be 0"));
        }
        let id = self.new_node(tag, WireType::Bytes, Value::None, None, false);
        if !key.is_empty() {
            self.set_key(id, key)?;
        }
        Ok(id)
    }

    /// An integer leaf node.
    pub fn build_int(&mut self, tag: Tag, wire_type: WireType, v: u64) -> Result<NodeId> {
        if tag == 0 {
            return Err(KnvError::InvalidArgument("tag must not be 0"));
        }
        if !wire_type.is_int() {
            return Err(KnvError::TypeMismatch);
        }
        Ok(self.new_node(tag, wire_type, Value::Int(v), None, false))
    }

    /// A bytes node; whether it behaves as a leaf string or a composite
    /// is determined structurally on first expansion.
    pub fn build_bytes(&mut self, tag: Tag, data: &[u8]) -> Result<NodeId> {
        if tag == 0 {
            return Err(KnvError::InvalidArgument("tag must not be 0"));
        }
        let buf = ByteBuf::copy_from(&self.pool, data)?;
        Ok(self.new_node(tag, WireType::Bytes, Value::Bytes(buf), None, false))
    }

    /// [`build_bytes`](Self::build_bytes) over an existing shared buffer.
    pub fn build_bytes_buf(&mut self, tag: Tag, buf: ByteBuf) -> Result<NodeId> {
        if tag == 0 {
            return Err(KnvError::InvalidArgument("tag must not be 0"));
        }
        Ok(self.new_node(tag, WireType::Bytes, Value::Bytes(buf), None, false))
    }

    /// Release a root and its whole subtree. A node still attached to a
    /// parent is detached first.
    pub fn release(&mut self, id: NodeId) {
        if self.n(id).parent.is_some() {
            let _ = self.detach(id);
        }
        self.free_subtree(id);
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn tag(&self, id: NodeId) -> Tag {
        self.n(id).tag
    }

    pub fn wire_type(&self, id: NodeId) -> WireType {
        self.n(id).wire_type
    }

    pub fn key(&self, id: NodeId) -> &Key {
        &self.n(id).key
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.n(id).parent
    }

    /// The node's raw value. For a dirty composite this is
    /// [`Value::None`]; use [`str_val`](Self::str_val) to fold first.
    pub fn value(&self, id: NodeId) -> &Value {
        &self.n(id).value
    }

    pub fn is_expanded(&self, id: NodeId) -> bool {
        self.n(id).expanded
    }

    /// A leaf is a node that cannot hold structure: a non-composite, or a
    /// composite that expands to nothing.
    pub fn is_leaf(&mut self, id: NodeId) -> bool {
        if self.n(id).wire_type != WireType::Bytes {
            return true;
        }
        if self.inner_expand(id, false).is_err() {
            return true;
        }
        let node = self.n(id);
        node.children.is_empty() && node.metas.is_empty()
    }

    /// The node's integer value; 0 for byte-typed nodes.
    pub fn int_val(&self, id: NodeId) -> u64 {
        let node = self.n(id);
        if node.wire_type.is_int() {
            node.value.int()
        } else {
            0
        }
    }

    /// The node's byte value, folding first so the buffer reflects any
    /// structural mutations. Empty for integer-typed nodes.
    pub fn str_val(&mut self, id: NodeId) -> Result<ByteBuf> {
        self.fold(id)?;
        let node = self.n(id);
        if node.wire_type != WireType::Bytes {
            return Ok(ByteBuf::empty());
        }
        match &node.value {
            Value::Bytes(b) => Ok(b.clone()),
            _ => Ok(ByteBuf::empty()),
        }
    }

    /// Number of direct children, expanding if needed.
    pub fn child_count(&mut self, id: NodeId) -> usize {
        if self.inner_expand(id, false).is_err() {
            return 0;
        }
        self.n(id).children.len()
    }

    /// Direct children in insertion order, expanding if needed.
    pub fn children(&mut self, id: NodeId) -> Vec<NodeId> {
        if self.inner_expand(id, false).is_err() {
            return Vec::new();
        }
        self.n(id).children.clone()
    }

    pub fn first_child(&mut self, id: NodeId) -> Option<NodeId> {
        self.children(id).first().copied()
    }

    /// Metas in serialization order (key first), expanding if needed.
    pub fn metas(&mut self, id: NodeId) -> Vec<NodeId> {
        if self.inner_expand(id, false).is_err() {
            return Vec::new();
        }
        self.n(id).metas.clone()
    }

    // ------------------------------------------------------------------
    // Expand / fold / eval / serialize
    // ------------------------------------------------------------------

    /// Parse the node's buffer into children and metas. No-op when
    /// already expanded or not a composite.
    pub fn expand(&mut self, id: NodeId) -> Result<()> {
        self.inner_expand(id, false)
    }

    pub(crate) fn inner_expand(&mut self, id: NodeId, force_no_key: bool) -> Result<()> {
        if self.n(id).expanded {
            return Ok(());
        }
        {
            let node = self.n_mut(id);
            node.expanded = true;
            node.children.clear();
            node.metas.clear();
            node.metas_by_tag = [None; META_SLOTS];
            node.index.clear();
            node.child_has_key = false;
        }
        if self.n(id).wire_type != WireType::Bytes {
            return Ok(());
        }
        // A tag-1 field under a keyed parent is almost certainly that
        // parent's key; never try to expand it into structure.
        if self.n(id).tag == 1 {
            if let Some(p) = self.n(id).parent {
                if !self.n(p).key.is_empty() {
                    return Ok(());
                }
            }
        }
        let buf = match &self.n(id).value {
            Value::Bytes(b) if !b.is_empty() => b.clone(),
            _ => return Ok(()),
        };

        let mut reader = FieldReader::new(buf.as_slice());
        let mut clean = true;
        loop {
            let field = match reader.next_field() {
                Ok(Some(f)) => f,
                Ok(None) => break,
                Err(_) => {
                    clean = false;
                    break;
                }
            };
            let value = match field.val {
                FieldVal::Int(v) => Value::Int(v),
                FieldVal::Bytes(_) => Value::Bytes(
                    buf.slice(field.val_span.0, field.val_span.1 - field.val_span.0),
                ),
            };
            let field_size = field.encoded_len() as u32;
            if field.tag <= RESERVED_META_TAGS {
                // Metas never interpret keys of their own.
                let m = self.new_node(field.tag, field.wire_type, value, Some(field_size), true);
                self.n_mut(m).parent = Some(id);
                let node = self.n_mut(id);
                node.metas.push(m);
                node.metas_by_tag[field.tag as usize] = Some(m);
            } else {
                let c = self.new_node(
                    field.tag,
                    field.wire_type,
                    value,
                    Some(field_size),
                    force_no_key,
                );
                self.n_mut(c).parent = Some(id);
                let has_key = !self.n(c).key.is_empty();
                let node = self.n_mut(id);
                node.children.push(c);
                if has_key {
                    node.child_has_key = true;
                }
                self.index_insert(id, c);
            }
        }

        self.n_mut(id).subnode_dirty = false;
        if !clean {
            // Trailing garbage: roll the expansion back to an empty node.
            self.rollback_expand(id);
        }
        Ok(())
    }

    fn rollback_expand(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.n_mut(id).children);
        let metas = std::mem::take(&mut self.n_mut(id).metas);
        for c in children.into_iter().chain(metas) {
            self.free_subtree(c);
        }
        let node = self.n_mut(id);
        node.metas_by_tag = [None; META_SLOTS];
        node.index.clear();
        node.child_has_key = false;
    }

    /// Serialized size of this node including its header, from the cache
    /// when fresh, recomputed (and re-cached) otherwise.
    pub fn evaluate_size(&mut self, id: NodeId) -> u32 {
        if let Some(s) = self.n(id).eval_size {
            return s;
        }
        let node = self.n(id);
        if node.leafish() || (node.buffer_valid() && !node.subnode_dirty) {
            let node = self.n_mut(id);
            node.eval_value_size = if node.wire_type == WireType::Bytes {
                node.value.byte_len()
            } else {
                0
            };
            let s = field_len(
                node.tag,
                node.wire_type,
                node.value.int(),
                node.eval_value_size,
            );
            node.eval_size = Some(s);
            return s;
        }

        let mut val_sz = 0u32;
        let has_key = !node.no_key && !node.key.is_empty();
        if has_key {
            let key = &node.key;
            val_sz += field_len(1, key.wire_type(), key.int_val(), key.len() as u32);
        }
        let metas = node.metas.clone();
        let children = node.children.clone();
        for (i, m) in metas.iter().enumerate() {
            if i == 0 && has_key && self.n(*m).tag == 1 {
                continue; // the key meta is already counted
            }
            val_sz += self.evaluate_size(*m);
        }
        for c in children {
            val_sz += self.evaluate_size(c);
        }
        let node = self.n_mut(id);
        node.eval_value_size = val_sz;
        let s = field_len(node.tag, WireType::Bytes, 0, val_sz);
        node.eval_size = Some(s);
        s
    }

    /// Re-serialize an expanded dirty composite back into a buffer and
    /// drop the expansion; the buffer becomes authoritative again. No-op
    /// when the buffer is already valid or the node is leaf-shaped.
    pub fn fold(&mut self, id: NodeId) -> Result<()> {
        let node = self.n(id);
        if node.leafish() || (node.buffer_valid() && !node.subnode_dirty) {
            return Ok(());
        }
        self.evaluate_size(id);
        let val_sz = self.n(id).eval_value_size as usize;
        let mut pb = self.pool.alloc(val_sz)?;
        let written = self.serialize_node(id, &mut pb[..val_sz], false)?;
        if written != val_sz {
            return Err(KnvError::SizeMismatch("eval size differs from pack size"));
        }
        let buf = ByteBuf::from_pool_buf(pb, val_sz);
        let children = std::mem::take(&mut self.n_mut(id).children);
        let metas = std::mem::take(&mut self.n_mut(id).metas);
        for c in children.into_iter().chain(metas) {
            self.free_subtree(c);
        }
        let node = self.n_mut(id);
        node.value = Value::Bytes(buf);
        node.subnode_dirty = false;
        node.expanded = false;
        node.metas_by_tag = [None; META_SLOTS];
        node.index.clear();
        node.child_has_key = false;
        Ok(())
    }

    /// Serialize the subtree into a fresh vector. With `with_header` the
    /// output starts with the node's own tag header; without it, only the
    /// value portion is emitted.
    pub fn serialize(&mut self, id: NodeId, with_header: bool) -> Result<Vec<u8>> {
        let total = self.evaluate_size(id);
        let size = if with_header {
            total as usize
        } else {
            self.n(id).eval_value_size as usize
        };
        let mut out = vec![0u8; size];
        let written = self.serialize_into(id, &mut out, with_header)?;
        if written != size {
            return Err(KnvError::SizeMismatch("eval size differs from pack size"));
        }
        Ok(out)
    }

    /// Serialize into a caller buffer, returning the bytes written.
    pub fn serialize_into(
        &mut self,
        id: NodeId,
        buf: &mut [u8],
        with_header: bool,
    ) -> Result<usize> {
        self.serialize_node(id, buf, with_header)
    }

    pub(crate) fn serialize_node(
        &mut self,
        id: NodeId,
        out: &mut [u8],
        with_header: bool,
    ) -> Result<usize> {
        let node = self.n(id);
        if node.leafish() || (node.buffer_valid() && !node.subnode_dirty) {
            if with_header {
                let mut w = FieldWriter::new(out);
                match (&node.value, node.wire_type) {
                    (Value::Bytes(b), WireType::Bytes) => {
                        let b = b.clone();
                        w.put_bytes(node.tag, b.as_slice())?;
                    }
                    (_, WireType::Bytes) => w.put_bytes(node.tag, &[])?,
                    (v, wt) => {
                        let (tag, int) = (node.tag, v.int());
                        w.put_int_field(tag, wt, int)?;
                    }
                }
                return Ok(w.written());
            }
            // Value-only serialization is defined for byte payloads only.
            if node.wire_type != WireType::Bytes {
                return Err(KnvError::InvalidArgument(
                    "cannot serialize value of a non-message node",
                ));
            }
            let payload = match &node.value {
                Value::Bytes(b) => b.clone(),
                _ => ByteBuf::empty(),
            };
            if out.len() < payload.len() {
                return Err(KnvError::SizeMismatch("not enough space for value"));
            }
            out[..payload.len()].copy_from_slice(payload.as_slice());
            return Ok(payload.len());
        }

        self.evaluate_size(id);
        let node = self.n(id);
        let eval_total = node.eval_size.unwrap_or(0) as usize;
        let eval_val = node.eval_value_size as usize;
        let tag = node.tag;

        let mut pos = 0usize;
        if with_header {
            let mut w = FieldWriter::new(out);
            w.put_bytes_head(tag, eval_val as u32)?;
            pos = w.written();
        }

        let mut finished_key = false;
        let node = self.n(id);
        if !node.no_key && !node.key.is_empty() {
            let key = node.key.clone();
            let mut w = FieldWriter::new(&mut out[pos..]);
            match key.wire_type() {
                WireType::Bytes => w.put_bytes(1, key.bytes())?,
                wt => w.put_int_field(1, wt, key.int_val())?,
            }
            pos += w.written();
            finished_key = true;
        }

        let metas = self.n(id).metas.clone();
        let children = self.n(id).children.clone();
        for (i, m) in metas.iter().enumerate() {
            if i == 0 && finished_key && self.n(*m).tag == 1 {
                continue; // key already emitted above
            }
            pos += self.serialize_node(*m, &mut out[pos..], true)?;
        }
        for c in children {
            pos += self.serialize_node(c, &mut out[pos..], true)?;
        }

        let expect = if with_header { eval_total } else { eval_val };
        if pos != expect {
            return Err(KnvError::SizeMismatch("eval size incorrect"));
        }
        Ok(pos)
    }

    // ------------------------------------------------------------------
    // Eval-size and dirtiness propagation
    // ------------------------------------------------------------------

    /// Apply `delta` bytes to this node's cached value size and re-derive
    /// its total size; `delta` becomes the change in total size, which
    /// may differ when the length prefix crosses a varint boundary.
    fn update_eval(&mut self, id: NodeId, delta: &mut i64) {
        if *delta == 0 {
            return;
        }
        let node = self.n_mut(id);
        let old = node.eval_size.unwrap_or(0) as i64;
        node.eval_value_size = (node.eval_value_size as i64 + *delta) as u32;
        let new = field_len(node.tag, node.wire_type, node.value.int(), node.eval_value_size);
        node.eval_size = Some(new);
        *delta = new as i64 - old;
    }

    /// Invalidate the cached buffer and mark the node dirty.
    fn mark_value_dirty(&mut self, id: NodeId) {
        let node = self.n_mut(id);
        if node.wire_type == WireType::Bytes {
            node.value = Value::None;
        }
        node.subnode_dirty = true;
    }

    /// Walk from `start`'s parent to the root, applying the size delta to
    /// every cached ancestor and dirtying every clean one. Size updates
    /// stop at the first uncached ancestor or once the delta reaches
    /// zero; dirtying stops at the first already-dirty ancestor.
    fn propagate(&mut self, start: NodeId, mut delta: i64) {
        let mut update_dirty = true;
        let mut update_eval = delta != 0;
        let mut cur = self.n(start).parent;
        while let Some(p) = cur {
            if !update_dirty && !update_eval {
                break;
            }
            if update_eval {
                if self.n(p).eval_size.is_none() || delta == 0 {
                    update_eval = false;
                } else {
                    self.update_eval(p, &mut delta);
                }
            }
            if update_dirty {
                if self.n(p).subnode_dirty {
                    update_dirty = false;
                } else {
                    self.mark_value_dirty(p);
                }
            }
            cur = self.n(p).parent;
        }
    }

    // ------------------------------------------------------------------
    // Child index maintenance
    // ------------------------------------------------------------------

    fn child_hash(&self, child: NodeId) -> u32 {
        let node = self.n(child);
        key_hash(node.tag, node.key.bytes())
    }

    fn index_insert(&mut self, parent: NodeId, child: NodeId) {
        if !self.n(parent).index.is_table() {
            if self.n(parent).children.len() <= INLINE_SCAN_MAX {
                return;
            }
            let entries: Vec<(u32, NodeId)> = self
                .n(parent)
                .children
                .iter()
                .map(|&c| (self.child_hash(c), c))
                .collect();
            self.n_mut(parent).index.rebuild(entries.into_iter());
            return;
        }
        let h = self.child_hash(child);
        self.n_mut(parent).index.insert(h, child);
    }

    fn index_remove(&mut self, parent: NodeId, child: NodeId) {
        if self.n(parent).index.is_table() {
            let h = self.child_hash(child);
            self.n_mut(parent).index.remove(h, child);
        }
    }

    fn index_lookup(&self, parent: NodeId, tag: Tag, key_bytes: &[u8]) -> Option<NodeId> {
        let pnode = self.n(parent);
        match &pnode.index {
            ChildIndex::Inline => pnode
                .children
                .iter()
                .copied()
                .find(|&c| self.n(c).matches(tag, key_bytes)),
            _ => {
                let h = key_hash(tag, key_bytes);
                pnode
                    .index
                    .candidates(h)
                    .iter()
                    .copied()
                    .find(|&c| self.n(c).matches(tag, key_bytes))
            }
        }
    }

    // ------------------------------------------------------------------
    // Child operations
    // ------------------------------------------------------------------

    /// Find a child by (tag, key). An empty key on a node whose children
    /// carry no keys degenerates to a by-tag lookup.
    pub fn find_child(&mut self, parent: NodeId, tag: Tag, key: &Key) -> Option<NodeId> {
        if self.inner_expand(parent, false).is_err() {
            return None;
        }
        if self.n(parent).children.is_empty() {
            return None;
        }
        self.index_lookup(parent, tag, key.bytes())
    }

    /// First child with the given tag regardless of key. Falls back to a
    /// linear scan when children carry keys, since their hashes include
    /// key bytes.
    pub fn find_child_by_tag(&mut self, parent: NodeId, tag: Tag) -> Option<NodeId> {
        if self.inner_expand(parent, false).is_err() {
            return None;
        }
        let pnode = self.n(parent);
        if pnode.children.is_empty() {
            return None;
        }
        if pnode.child_has_key {
            return pnode.children.iter().copied().find(|&c| self.n(c).tag == tag);
        }
        self.index_lookup(parent, tag, &[])
    }

    /// Move a root node of this arena under `parent`. The child keeps its
    /// identity; ownership transfers to the parent tree.
    pub fn insert_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if self.n(parent).wire_type != WireType::Bytes {
            return Err(KnvError::LeafCannotHaveChild);
        }
        if self.n(child).parent.is_some() {
            return Err(KnvError::InvalidArgument("child already has a parent"));
        }
        self.inner_expand(parent, false)?;
        self.inner_insert_child(parent, child, true, false);
        Ok(())
    }

    /// [`insert_child`](Self::insert_child), but placing the child ahead
    /// of its siblings instead of after them.
    pub(crate) fn insert_child_front(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        if self.n(parent).wire_type != WireType::Bytes {
            return Err(KnvError::LeafCannotHaveChild);
        }
        if self.n(child).parent.is_some() {
            return Err(KnvError::InvalidArgument("child already has a parent"));
        }
        self.inner_expand(parent, false)?;
        self.inner_insert_child(parent, child, true, true);
        Ok(())
    }

    /// Insert a copy of `child` (which may belong to any tree in this
    /// arena) under `parent`, returning the copy.
    pub fn insert_child_dup(&mut self, parent: NodeId, child: NodeId) -> Result<NodeId> {
        if self.n(parent).wire_type != WireType::Bytes {
            return Err(KnvError::LeafCannotHaveChild);
        }
        self.inner_expand(parent, false)?;
        let dup = self.inner_duplicate(child, false)?;
        self.inner_insert_child(parent, dup, true, false);
        Ok(dup)
    }

    pub(crate) fn inner_insert_child(
        &mut self,
        parent: NodeId,
        child: NodeId,
        update_parent: bool,
        at_front: bool,
    ) {
        self.n_mut(child).parent = Some(parent);
        if at_front {
            self.n_mut(parent).children.insert(0, child);
        } else {
            self.n_mut(parent).children.push(child);
        }
        self.index_insert(parent, child);
        if !self.n(child).key.is_empty() {
            self.n_mut(parent).child_has_key = true;
        }
        let child_sz = self.evaluate_size(child);
        if !update_parent {
            self.n_mut(parent).eval_value_size += child_sz;
            return;
        }
        let mut delta = 0i64;
        if self.n(parent).eval_size.is_some() {
            delta = child_sz as i64;
            self.update_eval(parent, &mut delta);
        }
        self.mark_value_dirty(parent);
        self.propagate(parent, delta);
    }

    /// Create and insert an empty composite child.
    pub fn insert_subnode(&mut self, parent: NodeId, tag: Tag, key: Key) -> Result<NodeId> {
        let c = self.new_tree(tag, key)?;
        match self.insert_child(parent, c) {
            Ok(()) => Ok(c),
            Err(e) => {
                self.free_subtree(c);
                Err(e)
            }
        }
    }

    /// Create and insert an integer leaf child.
    pub fn insert_int_leaf(&mut self, parent: NodeId, tag: Tag, v: u64) -> Result<NodeId> {
        let c = self.build_int(tag, WireType::Varint, v)?;
        match self.insert_child(parent, c) {
            Ok(()) => Ok(c),
            Err(e) => {
                self.free_subtree(c);
                Err(e)
            }
        }
    }

    /// Create and insert a byte-string leaf child.
    pub fn insert_str_leaf(&mut self, parent: NodeId, tag: Tag, data: &[u8]) -> Result<NodeId> {
        let c = self.build_bytes(tag, data)?;
        match self.insert_child(parent, c) {
            Ok(()) => Ok(c),
            Err(e) => {
                self.free_subtree(c);
                Err(e)
            }
        }
    }

    /// Remove and free the child matching (tag, key). Returns whether a
    /// child was removed.
    pub fn remove_child(&mut self, parent: NodeId, tag: Tag, key: &Key) -> bool {
        match self.find_child(parent, tag, key) {
            Some(c) => {
                self.remove_child_node(parent, c);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_child_node(&mut self, parent: NodeId, child: NodeId) {
        let cached = self.n(parent).eval_size.is_some();
        let child_sz = if cached {
            self.evaluate_size(child) as i64
        } else {
            0
        };
        self.index_remove(parent, child);
        self.n_mut(parent).children.retain(|&c| c != child);
        self.free_subtree(child);
        let mut delta = -child_sz;
        if cached {
            self.update_eval(parent, &mut delta);
        } else {
            delta = 0;
        }
        self.mark_value_dirty(parent);
        self.propagate(parent, delta);
    }

    /// Remove and free every child with the given tag, returning how many
    /// were removed.
    pub fn remove_children_by_tag(&mut self, parent: NodeId, tag: Tag) -> usize {
        if self.inner_expand(parent, false).is_err() {
            return 0;
        }
        let matches: Vec<NodeId> = self
            .n(parent)
            .children
            .iter()
            .copied()
            .filter(|&c| self.n(c).tag == tag)
            .collect();
        if matches.is_empty() {
            return 0;
        }
        let cached = self.n(parent).eval_size.is_some();
        let mut removed = 0i64;
        for &c in &matches {
            if cached {
                removed += self.evaluate_size(c) as i64;
            }
            self.index_remove(parent, c);
        }
        let keep: Vec<NodeId> = self
            .n(parent)
            .children
            .iter()
            .copied()
            .filter(|&c| self.n(c).tag != tag)
            .collect();
        self.n_mut(parent).children = keep;
        for c in matches.iter() {
            self.free_subtree(*c);
        }
        let mut delta = -removed;
        if cached {
            self.update_eval(parent, &mut delta);
        } else {
            delta = 0;
        }
        self.mark_value_dirty(parent);
        self.propagate(parent, delta);
        matches.len()
    }

    /// Detach a child from its parent; the node stays in the arena as an
    /// independent root.
    pub fn detach(&mut self, id: NodeId) -> Result<()> {
        let Some(parent) = self.n(id).parent else {
            return Ok(());
        };
        let cached = self.n(parent).eval_size.is_some();
        let child_sz = if cached {
            self.evaluate_size(id) as i64
        } else {
            0
        };
        self.index_remove(parent, id);
        self.n_mut(parent).children.retain(|&c| c != id);
        self.n_mut(id).parent = None;
        let mut delta = -child_sz;
        if cached {
            self.update_eval(parent, &mut delta);
        } else {
            delta = 0;
        }
        self.mark_value_dirty(parent);
        self.propagate(parent, delta);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Value and identity mutation
    // ------------------------------------------------------------------

    /// Replace a byte-typed node's value. Any expanded structure is
    /// discarded; the new buffer becomes authoritative. If the node
    /// carries a key, the buffer's tag-1 field must agree with it.
    pub fn set_value_bytes(&mut self, id: NodeId, data: &[u8]) -> Result<()> {
        let buf = ByteBuf::copy_from(&self.pool, data)?;
        self.set_value_buf(id, buf)
    }

    /// [`set_value_bytes`](Self::set_value_bytes) over a shared buffer.
    pub fn set_value_buf(&mut self, id: NodeId, buf: ByteBuf) -> Result<()> {
        let node = self.n(id);
        if node.wire_type != WireType::Bytes {
            return Err(KnvError::TypeMismatch);
        }
        if !node.no_key && !node.key.is_empty() {
            let mut r = FieldReader::new(buf.as_slice());
            let new_key = match r.next_field() {
                Ok(Some(f)) if f.tag == 1 => Key::from_field(f.wire_type, &f.val),
                _ => Key::none(),
            };
            if new_key != self.n(id).key {
                return Err(KnvError::KeyConflict);
            }
        }
        if self.n(id).expanded {
            let children = std::mem::take(&mut self.n_mut(id).children);
            let metas = std::mem::take(&mut self.n_mut(id).metas);
            for c in children.into_iter().chain(metas) {
                self.free_subtree(c);
            }
            let node = self.n_mut(id);
            node.expanded = false;
            node.metas_by_tag = [None; META_SLOTS];
            node.index.clear();
            node.child_has_key = false;
        }
        let new_len = buf.len() as u32;
        let (cached, old_val_sz) = {
            let node = self.n_mut(id);
            node.value = Value::Bytes(buf);
            node.subnode_dirty = true;
            (node.eval_size.is_some(), node.eval_value_size)
        };
        let mut delta = 0i64;
        if cached {
            delta = new_len as i64 - old_val_sz as i64;
            self.update_eval(id, &mut delta);
        }
        self.propagate(id, delta);
        Ok(())
    }

    /// Replace an integer-typed node's value.
    pub fn set_value_int(&mut self, id: NodeId, v: u64) -> Result<()> {
        let node = self.n(id);
        if !node.wire_type.is_int() {
            return Err(KnvError::TypeMismatch);
        }
        let node = self.n_mut(id);
        let old = node.eval_size;
        node.value = Value::Int(v);
        let new = field_len(node.tag, node.wire_type, v, 0);
        node.eval_size = Some(new);
        node.eval_value_size = 0;
        node.subnode_dirty = true;
        let delta = match old {
            Some(o) => new as i64 - o as i64,
            None => 0,
        };
        self.propagate(id, delta);
        Ok(())
    }

    /// Change the node's tag. The parent index is updated; the node's
    /// position among its siblings is not.
    pub fn set_tag(&mut self, id: NodeId, tag: Tag) -> Result<()> {
        if tag == 0 {
            return Err(KnvError::InvalidArgument("tag must not be 0"));
        }
        let parent = self.n(id).parent;
        if let Some(p) = parent {
            self.index_remove(p, id);
        }
        self.n_mut(id).tag = tag;
        if let Some(p) = parent {
            self.index_insert(p, id);
        }
        let mut delta = 0i64;
        if let Some(old) = self.n(id).eval_size {
            let node = self.n_mut(id);
            let new = if node.wire_type == WireType::Bytes {
                field_len(tag, WireType::Bytes, 0, node.eval_value_size)
            } else {
                field_len(tag, node.wire_type, node.value.int(), 0)
            };
            node.eval_size = Some(new);
            delta = new as i64 - old as i64;
        }
        self.n_mut(id).subnode_dirty = true;
        self.propagate(id, delta);
        Ok(())
    }

    /// Set or clear the node's key, keeping the tag-1 meta in sync and
    /// re-indexing in the parent.
    pub fn set_key(&mut self, id: NodeId, key: Key) -> Result<()> {
        let parent = self.n(id).parent;
        if let Some(p) = parent {
            self.index_remove(p, id);
        }
        self.n_mut(id).key = key.clone();
        let result = if !key.is_empty() {
            let value = self.key_meta_value(&key)?;
            self.set_meta_raw(id, 1, key.wire_type(), value, true)
        } else {
            self.inner_remove_meta(id, 1)
        };
        self.n_mut(id).no_key = false;
        if let Some(p) = parent {
            self.index_insert(p, id);
            if !key.is_empty() {
                self.n_mut(p).child_has_key = true;
            }
        }
        result
    }

    fn key_meta_value(&mut self, key: &Key) -> Result<Value> {
        Ok(match key.wire_type() {
            WireType::Bytes => Value::Bytes(ByteBuf::copy_from(&self.pool, key.bytes())?),
            _ => Value::Int(key.int_val()),
        })
    }

    // ------------------------------------------------------------------
    // Metas
    // ------------------------------------------------------------------

    /// The node's meta with the given tag, if any.
    pub fn meta(&mut self, id: NodeId, tag: Tag) -> Option<NodeId> {
        if tag == 0 || tag > RESERVED_META_TAGS {
            return None;
        }
        if self.inner_expand(id, false).is_err() {
            return None;
        }
        self.n(id).metas_by_tag[tag as usize]
    }

    pub fn meta_int(&mut self, id: NodeId, tag: Tag) -> u64 {
        self.meta(id, tag).map_or(0, |m| self.int_val(m))
    }

    pub fn meta_str(&mut self, id: NodeId, tag: Tag) -> ByteBuf {
        match self.meta(id, tag) {
            Some(m) => self.str_val(m).unwrap_or_else(|_| ByteBuf::empty()),
            None => ByteBuf::empty(),
        }
    }

    /// Set a meta field from an explicit wire type and value. Setting
    /// tag 1 goes through the key path so the key and its meta stay in
    /// sync.
    pub fn set_meta(&mut self, id: NodeId, tag: Tag, wire_type: WireType, value: Value) -> Result<()> {
        if tag == 1 && !self.n(id).no_key {
            let key = match &value {
                Value::Int(v) => Key::from_typed_int(wire_type, *v),
                Value::Bytes(b) => Key::from_bytes(b.as_slice()),
                Value::None => Key::none(),
            };
            return self.set_key(id, key);
        }
        self.set_meta_raw(id, tag, wire_type, value, true)
    }

    /// Set a meta field. Setting tag 1 goes through the key path so the
    /// key and its meta stay in sync.
    pub fn set_meta_int(&mut self, id: NodeId, tag: Tag, v: u64) -> Result<()> {
        if tag == 1 && !self.n(id).no_key {
            return self.set_key(id, Key::from_int(v));
        }
        self.set_meta_raw(id, tag, WireType::Varint, Value::Int(v), true)
    }

    pub fn set_meta_str(&mut self, id: NodeId, tag: Tag, data: &[u8]) -> Result<()> {
        if tag == 1 && !self.n(id).no_key {
            return self.set_key(id, Key::from_bytes(data));
        }
        let value = Value::Bytes(ByteBuf::copy_from(&self.pool, data)?);
        self.set_meta_raw(id, tag, WireType::Bytes, value, true)
    }

    pub(crate) fn set_meta_raw(
        &mut self,
        id: NodeId,
        tag: Tag,
        wire_type: WireType,
        value: Value,
        update_parent: bool,
    ) -> Result<()> {
        if self.n(id).wire_type != WireType::Bytes {
            return Err(KnvError::TypeMismatch);
        }
        if tag == 0 || tag > RESERVED_META_TAGS {
            return Err(KnvError::InvalidArgument("meta tag out of range"));
        }
        self.inner_expand(id, false)?;

        let byte_len = value.byte_len();
        let int_val = value.int();
        let existing = self.n(id).metas_by_tag[tag as usize];
        let (m, old_sz) = match existing {
            Some(m) => {
                let old = self.evaluate_size(m) as i64;
                // Any stale expansion of the meta dies with the old value.
                let children = std::mem::take(&mut self.n_mut(m).children);
                let metas = std::mem::take(&mut self.n_mut(m).metas);
                for c in children.into_iter().chain(metas) {
                    self.free_subtree(c);
                }
                let is_key = tag == 1 && !self.n(id).no_key;
                let mnode = self.n_mut(m);
                mnode.wire_type = wire_type;
                mnode.value = value;
                mnode.expanded = is_key;
                mnode.metas_by_tag = [None; META_SLOTS];
                mnode.index.clear();
                mnode.child_has_key = false;
                (m, old)
            }
            None => {
                let m = self.new_node(tag, wire_type, value, None, true);
                self.n_mut(m).parent = Some(id);
                let node = self.n_mut(id);
                if tag == 1 {
                    node.metas.insert(0, m);
                } else {
                    node.metas.push(m);
                }
                node.metas_by_tag[tag as usize] = Some(m);
                (m, 0)
            }
        };

        let mnode = self.n_mut(m);
        mnode.eval_value_size = if wire_type == WireType::Bytes {
            byte_len
        } else {
            0
        };
        let m_eval = field_len(tag, wire_type, int_val, byte_len);
        mnode.eval_size = Some(m_eval);

        if !update_parent {
            let node = self.n_mut(id);
            node.eval_value_size =
                (node.eval_value_size as i64 + m_eval as i64 - old_sz) as u32;
            return Ok(());
        }

        let mut delta = 0i64;
        if self.n(id).eval_size.is_some() {
            delta = m_eval as i64 - old_sz;
            self.update_eval(id, &mut delta);
        }
        self.mark_value_dirty(id);
        self.propagate(id, delta);
        Ok(())
    }

    /// Remove the single meta slot for `tag` (the direct-indexed one).
    pub(crate) fn inner_remove_meta(&mut self, id: NodeId, tag: Tag) -> Result<()> {
        if tag == 0 || tag > RESERVED_META_TAGS {
            return Err(KnvError::InvalidArgument("meta tag out of range"));
        }
        self.inner_expand(id, false)?;
        let Some(m) = self.n(id).metas_by_tag[tag as usize] else {
            return Ok(());
        };
        let cached = self.n(id).eval_size.is_some();
        let mut delta = if cached {
            -(self.evaluate_size(m) as i64)
        } else {
            0
        };
        self.n_mut(id).metas.retain(|&x| x != m);
        self.n_mut(id).metas_by_tag[tag as usize] = None;
        self.free_subtree(m);
        if cached {
            self.update_eval(id, &mut delta);
        }
        self.mark_value_dirty(id);
        self.propagate(id, delta);
        Ok(())
    }

    /// Append a meta without replacing existing ones with the same tag.
    /// Repetition of metas is allowed at this level; the direct index
    /// keeps pointing at the first-set instance.
    pub fn add_meta_int(&mut self, id: NodeId, tag: Tag, v: u64) -> Result<()> {
        self.add_meta_raw(id, tag, WireType::Varint, Value::Int(v))
    }

    pub fn add_meta_str(&mut self, id: NodeId, tag: Tag, data: &[u8]) -> Result<()> {
        let value = Value::Bytes(ByteBuf::copy_from(&self.pool, data)?);
        self.add_meta_raw(id, tag, WireType::Bytes, value)
    }

    fn add_meta_raw(&mut self, id: NodeId, tag: Tag, wire_type: WireType, value: Value) -> Result<()> {
        if self.meta(id, tag).is_none() {
            return match (tag, wire_type, value) {
                (1, _, v) if !self.n(id).no_key => {
                    let key = match v {
                        Value::Int(i) => Key::from_typed_int(wire_type, i),
                        Value::Bytes(b) => Key::from_bytes(b.as_slice()),
                        Value::None => Key::none(),
                    };
                    self.set_key(id, key)
                }
                (t, wt, v) => self.set_meta_raw(id, t, wt, v, true),
            };
        }
        let m = self.new_node(tag, wire_type, value, None, true);
        self.n_mut(m).parent = Some(id);
        self.n_mut(id).metas.push(m);
        let m_eval = self.evaluate_size(m);
        let mut delta = 0i64;
        if self.n(id).eval_size.is_some() {
            delta = m_eval as i64;
            self.update_eval(id, &mut delta);
        }
        self.mark_value_dirty(id);
        self.propagate(id, delta);
        Ok(())
    }

    /// Remove every meta carrying `tag`. For tag 1 this also clears the
    /// node's key.
    pub fn remove_meta(&mut self, id: NodeId, tag: Tag) -> Result<()> {
        if tag == 0 || tag > RESERVED_META_TAGS {
            return Err(KnvError::InvalidArgument("meta tag out of range"));
        }
        self.inner_expand(id, false)?;
        if tag == 1 && !self.n(id).no_key {
            self.set_key(id, Key::none())?;
        }
        let matches: Vec<NodeId> = self
            .n(id)
            .metas
            .iter()
            .copied()
            .filter(|&m| self.n(m).tag == tag)
            .collect();
        if matches.is_empty() {
            return Ok(());
        }
        let cached = self.n(id).eval_size.is_some();
        let mut removed = 0i64;
        for &m in &matches {
            if cached {
                removed += self.evaluate_size(m) as i64;
            }
        }
        self.n_mut(id)
            .metas
            .retain(|m| !matches.contains(m));
        self.n_mut(id).metas_by_tag[tag as usize] = None;
        for m in matches {
            self.free_subtree(m);
        }
        let mut delta = -removed;
        if cached {
            self.update_eval(id, &mut delta);
        } else {
            delta = 0;
        }
        self.mark_value_dirty(id);
        self.propagate(id, delta);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Duplication
    // ------------------------------------------------------------------

    /// An independent structural copy of the subtree, as a new root in
    /// this arena. Folded payloads are shared, not copied.
    pub fn duplicate(&mut self, id: NodeId) -> Result<NodeId> {
        self.inner_duplicate(id, false)
    }

    pub(crate) fn inner_duplicate(&mut self, id: NodeId, force_no_key: bool) -> Result<NodeId> {
        let node = self.n(id);
        let field_size = node.eval_size;
        let needs_fold =
            node.wire_type == WireType::Bytes && !node.buffer_valid() && node.expanded;
        let value = if needs_fold {
            self.evaluate_size(id);
            let val_sz = self.n(id).eval_value_size as usize;
            let mut pb = self.pool.alloc(val_sz)?;
            let written = self.serialize_node(id, &mut pb[..val_sz], false)?;
            if written != val_sz {
                return Err(KnvError::SizeMismatch("eval size differs from pack size"));
            }
            Value::Bytes(ByteBuf::from_pool_buf(pb, val_sz))
        } else {
            self.n(id).value.clone()
        };
        let (tag, wt) = {
            let node = self.n(id);
            (node.tag, node.wire_type)
        };
        let dup = self.new_node(tag, wt, value, field_size, force_no_key);
        if force_no_key {
            // The copy skips key parsing for speed; carry the key over so
            // (tag, key) addressing still works on it.
            let key = self.n(id).key.clone();
            if !key.is_empty() {
                self.n_mut(dup).key = key;
            }
        }
        Ok(dup)
    }

    /// A childless copy carrying only identity: tag, wire type, and key.
    /// Used as the container when assembling projections.
    pub(crate) fn dup_empty_node(&mut self, id: NodeId) -> NodeId {
        let node = self.n(id);
        let tag = node.tag;
        let wire_type = node.wire_type;
        let key = node.key.clone();
        let eval_value_size = if key.is_empty() {
            0
        } else {
            field_len(1, key.wire_type(), key.int_val(), key.len() as u32)
        };
        self.alloc_slot(Node {
            tag,
            wire_type,
            key,
            value: Value::None,
            parent: None,
            children: Vec::new(),
            metas: Vec::new(),
            metas_by_tag: [None; META_SLOTS],
            index: ChildIndex::default(),
            expanded: true,
            subnode_dirty: false,
            child_has_key: false,
            no_key: wire_type != WireType::Bytes,
            eval_size: None,
            eval_value_size,
        })
    }

    /// Recompute a projection container's total size from its accumulated
    /// value size.
    pub(crate) fn finish_projection_eval(&mut self, id: NodeId) {
        let node = self.n_mut(id);
        node.eval_size = Some(field_len(node.tag, WireType::Bytes, 0, node.eval_value_size));
    }

    // ------------------------------------------------------------------
    // Field helpers: metas for tags 1..=10, children above
    // ------------------------------------------------------------------

    pub fn child_int(&mut self, id: NodeId, tag: Tag) -> u64 {
        self.find_child_by_tag(id, tag)
            .map_or(0, |c| self.int_val(c))
    }

    pub fn child_str(&mut self, id: NodeId, tag: Tag) -> ByteBuf {
        match self.find_child_by_tag(id, tag) {
            Some(c) => self.str_val(c).unwrap_or_else(|_| ByteBuf::empty()),
            None => ByteBuf::empty(),
        }
    }

    /// Set (or insert) the single child with `tag` to an integer value.
    pub fn set_child_int(&mut self, id: NodeId, tag: Tag, v: u64) -> Result<()> {
        match self.find_child_by_tag(id, tag) {
            Some(c) => {
                if self.n(c).wire_type == WireType::Bytes {
                    return Err(KnvError::TypeMismatch);
                }
                self.set_value_int(c, v)
            }
            None => self.insert_int_leaf(id, tag, v).map(|_| ()),
        }
    }

    /// Set (or insert) the single child with `tag` to a byte value.
    pub fn set_child_str(&mut self, id: NodeId, tag: Tag, data: &[u8]) -> Result<()> {
        match self.find_child_by_tag(id, tag) {
            Some(c) => {
                if self.n(c).wire_type != WireType::Bytes {
                    return Err(KnvError::TypeMismatch);
                }
                self.set_value_bytes(c, data)
            }
            None => self.insert_str_leaf(id, tag, data).map(|_| ()),
        }
    }

    pub fn field_int(&mut self, id: NodeId, tag: Tag) -> u64 {
        if tag <= RESERVED_META_TAGS {
            self.meta_int(id, tag)
        } else {
            self.child_int(id, tag)
        }
    }

    /// Zigzag-decoded signed view of [`field_int`](Self::field_int).
    pub fn field_sint(&mut self, id: NodeId, tag: Tag) -> i64 {
        crate::encoding::zigzag_decode(self.field_int(id, tag))
    }

    pub fn field_str(&mut self, id: NodeId, tag: Tag) -> ByteBuf {
        if tag <= RESERVED_META_TAGS {
            self.meta_str(id, tag)
        } else {
            self.child_str(id, tag)
        }
    }

    pub fn set_field_int(&mut self, id: NodeId, tag: Tag, v: u64) -> Result<()> {
        if tag <= RESERVED_META_TAGS {
            self.set_meta_int(id, tag, v)
        } else {
            self.set_child_int(id, tag, v)
        }
    }

    pub fn set_field_sint(&mut self, id: NodeId, tag: Tag, v: i64) -> Result<()> {
        self.set_field_int(id, tag, crate::encoding::zigzag_encode(v))
    }

    pub fn set_field_str(&mut self, id: NodeId, tag: Tag, data: &[u8]) -> Result<()> {
        if tag <= RESERVED_META_TAGS {
            self.set_meta_str(id, tag, data)
        } else {
            self.set_child_str(id, tag, data)
        }
    }

    pub fn add_field_int(&mut self, id: NodeId, tag: Tag, v: u64) -> Result<()> {
        if tag <= RESERVED_META_TAGS {
            self.add_meta_int(id, tag, v)
        } else {
            self.insert_int_leaf(id, tag, v).map(|_| ())
        }
    }

    pub fn add_field_str(&mut self, id: NodeId, tag: Tag, data: &[u8]) -> Result<()> {
        if tag <= RESERVED_META_TAGS {
            self.add_meta_str(id, tag, data)
        } else {
            self.insert_str_leaf(id, tag, data).map(|_| ())
        }
    }

    /// Remove every field (meta or child) carrying `tag`.
    pub fn remove_field(&mut self, id: NodeId, tag: Tag) -> Result<()> {
        if tag <= RESERVED_META_TAGS {
            self.remove_meta(id, tag)
        } else {
            self.remove_children_by_tag(id, tag);
            Ok(())
        }
    }

    /// All fields (metas and children) carrying `tag`, in order.
    pub fn fields(&mut self, id: NodeId, tag: Tag) -> Vec<NodeId> {
        let list = if tag <= RESERVED_META_TAGS {
            self.metas(id)
        } else {
            self.children(id)
        };
        list.into_iter().filter(|&f| self.n(f).tag == tag).collect()
    }

    // ------------------------------------------------------------------
    // Debugging
    // ------------------------------------------------------------------

    /// Multi-line structural dump of the subtree, for debugging.
    pub fn dump(&mut self, id: NodeId) -> String {
        let mut out = String::new();
        self.dump_into(id, "", &mut out);
        out
    }

    fn dump_into(&mut self, id: NodeId, prefix: &str, out: &mut String) {
        let _ = self.expand(id);
        let node = self.n(id);
        if !node.children.is_empty() || !node.metas.is_empty() {
            let _ = writeln!(
                out,
                "{prefix}[+] tag={}, size={}, key={:?}",
                node.tag,
                node.eval_size.map(|s| s as i64).unwrap_or(-1),
                node.key.bytes(),
            );
            let metas = node.metas.clone();
            let children = node.children.clone();
            for m in metas {
                self.dump_leaf_line(m, &format!("{prefix}    [m] "), out);
            }
            for c in children {
                self.dump_into(c, &format!("{prefix}    "), out);
            }
        } else {
            self.dump_leaf_line(id, prefix, out);
        }
    }

    fn dump_leaf_line(&mut self, id: NodeId, prefix: &str, out: &mut String) {
        let node = self.n(id);
        match (&node.value, node.wire_type) {
            (Value::Bytes(b), _) => {
                let s = b.as_slice();
                if !s.is_empty() && s.iter().all(|c| c.is_ascii_graphic() || *c == b' ') {
                    let _ = writeln!(
                        out,
                        "{prefix}tag={}, type=str, len={}, val={}",
                        node.tag,
                        s.len(),
                        String::from_utf8_lossy(s)
                    );
                } else {
                    let _ = write!(out, "{prefix}tag={}, type=str, len={}, val=", node.tag, s.len());
                    for byte in s {
                        let _ = write!(out, "{byte:02X}");
                    }
                    let _ = writeln!(out);
                }
            }
            (v, wt) => {
                let _ = writeln!(
                    out,
                    "{prefix}tag={}, type={wt:?}, val={}",
                    node.tag,
                    v.int()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree(arena: &mut KnvArena) -> NodeId {
        let root = arena.new_tree(3501, Key::from_int(12345678)).unwrap();
        let info = arena.insert_subnode(root, 11, Key::none()).unwrap();
        arena.insert_str_leaf(info, 101, b"Shaneyu").unwrap();
        arena.insert_int_leaf(info, 102, 19801010).unwrap();
        arena.insert_str_leaf(info, 103, b"Boy").unwrap();
        root
    }

    #[test]
    fn build_serialize_parse_roundtrip() {
        let mut arena = KnvArena::new();
        let root = sample_tree(&mut arena);
        let bytes = arena.serialize(root, true).unwrap();
        assert_eq!(bytes.len() as u32, arena.evaluate_size(root));

        let parsed = arena.parse(&bytes).unwrap();
        assert_eq!(arena.tag(parsed), 3501);
        assert_eq!(arena.key(parsed).int_val(), 12345678);
        let info = arena.find_child_by_tag(parsed, 11).unwrap();
        assert_eq!(arena.child_int(info, 102), 19801010);
        assert_eq!(arena.child_str(info, 101).as_slice(), b"Shaneyu");

        // Round-tripping again yields identical bytes.
        let again = arena.serialize(parsed, true).unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn expand_then_fold_preserves_buffer() {
        let mut arena = KnvArena::new();
        let root = sample_tree(&mut arena);
        let bytes = arena.serialize(root, true).unwrap();
        let parsed = arena.parse(&bytes).unwrap();

        let before = arena.str_val(parsed).unwrap().as_slice().to_vec();
        arena.expand(parsed).unwrap();
        // No mutation happened; fold must be a no-op on the buffer.
        arena.fold(parsed).unwrap();
        let after = arena.str_val(parsed).unwrap().as_slice().to_vec();
        assert_eq!(before, after);
    }

    #[test]
    fn eval_size_tracks_mutations() {
        let mut arena = KnvArena::new();
        let root = sample_tree(&mut arena);
        let info = arena.find_child_by_tag(root, 11).unwrap();
        let c = arena.find_child_by_tag(info, 102).unwrap();

        arena.set_value_int(c, u64::MAX).unwrap();
        let bytes = arena.serialize(root, true).unwrap();
        assert_eq!(bytes.len() as u32, arena.evaluate_size(root));

        arena.remove_children_by_tag(info, 103);
        let bytes = arena.serialize(root, true).unwrap();
        assert_eq!(bytes.len() as u32, arena.evaluate_size(root));
    }

    #[test]
    fn eval_size_tracks_varint_boundary_growth() {
        let mut arena = KnvArena::new();
        let root = arena.new_tree(20, Key::none()).unwrap();
        let leaf = arena.insert_str_leaf(root, 11, &[0u8; 100]).unwrap();
        let sized = arena.evaluate_size(root);
        assert_eq!(sized as usize, arena.serialize(root, true).unwrap().len());

        // Growing the leaf pushes the root's value length past 127, so
        // the root's own length prefix gains a byte on top of the delta.
        arena.set_value_bytes(leaf, &[0u8; 150]).unwrap();
        let grown = arena.evaluate_size(root);
        assert_eq!(grown as usize, arena.serialize(root, true).unwrap().len());
        assert_eq!(grown - sized, 50 + 1 + 1); // payload + leaf prefix + root prefix
    }

    #[test]
    fn index_promotes_and_still_finds_everyone() {
        let mut arena = KnvArena::new();
        let root = arena.new_tree(99, Key::none()).unwrap();
        let mut ids = Vec::new();
        for i in 0..40u64 {
            let c = arena
                .insert_subnode(root, 20, Key::from_int(i))
                .unwrap();
            ids.push(c);
        }
        for (i, &expect) in ids.iter().enumerate() {
            let found = arena
                .find_child(root, 20, &Key::from_int(i as u64))
                .unwrap();
            assert_eq!(found, expect);
        }
        assert!(arena.find_child(root, 20, &Key::from_int(999)).is_none());
        assert!(arena.find_child(root, 21, &Key::from_int(0)).is_none());
    }

    #[test]
    fn find_by_tag_scans_when_children_are_keyed() {
        let mut arena = KnvArena::new();
        let root = arena.new_tree(99, Key::none()).unwrap();
        arena.insert_subnode(root, 20, Key::from_int(5)).unwrap();
        let second = arena.insert_subnode(root, 21, Key::from_int(6)).unwrap();
        assert_eq!(arena.find_child_by_tag(root, 21), Some(second));
        assert!(arena.find_child_by_tag(root, 22).is_none());
    }

    #[test]
    fn set_value_rejects_key_conflict() {
        let mut arena = KnvArena::new();
        let root = sample_tree(&mut arena);
        let bytes = arena.serialize(root, true).unwrap();
        let parsed = arena.parse(&bytes).unwrap();

        // A buffer whose tag-1 differs from the node's key is refused.
        let other = arena.new_tree(3501, Key::from_int(777)).unwrap();
        let other_payload = arena.str_val(other).unwrap();
        let err = arena.set_value_buf(parsed, other_payload).unwrap_err();
        assert_eq!(err, KnvError::KeyConflict);

        // The same key is accepted.
        let same = arena.new_tree(3501, Key::from_int(12345678)).unwrap();
        let same_payload = arena.str_val(same).unwrap();
        arena.set_value_buf(parsed, same_payload).unwrap();
    }

    #[test]
    fn set_value_type_checks() {
        let mut arena = KnvArena::new();
        let i = arena.build_int(11, WireType::Varint, 7).unwrap();
        assert_eq!(arena.set_value_bytes(i, b"x").unwrap_err(), KnvError::TypeMismatch);
        let s = arena.build_bytes(11, b"x").unwrap();
        assert_eq!(arena.set_value_int(s, 7).unwrap_err(), KnvError::TypeMismatch);
    }

    #[test]
    fn leaf_cannot_have_child() {
        let mut arena = KnvArena::new();
        let i = arena.build_int(11, WireType::Varint, 7).unwrap();
        let c = arena.build_int(12, WireType::Varint, 8).unwrap();
        assert_eq!(
            arena.insert_child(i, c).unwrap_err(),
            KnvError::LeafCannotHaveChild
        );
    }

    #[test]
    fn detach_makes_an_independent_root() {
        let mut arena = KnvArena::new();
        let root = sample_tree(&mut arena);
        let info = arena.find_child_by_tag(root, 11).unwrap();
        arena.detach(info).unwrap();
        assert!(arena.parent(info).is_none());
        assert!(arena.find_child_by_tag(root, 11).is_none());

        // Both serialize independently and consistently.
        let r = arena.serialize(root, true).unwrap();
        assert_eq!(r.len() as u32, arena.evaluate_size(root));
        let i = arena.serialize(info, true).unwrap();
        assert_eq!(i.len() as u32, arena.evaluate_size(info));
    }

    #[test]
    fn metas_and_key_stay_in_sync() {
        let mut arena = KnvArena::new();
        let root = arena.new_tree(50, Key::none()).unwrap();
        arena.set_meta_int(root, 1, 42).unwrap();
        assert_eq!(arena.key(root).int_val(), 42);
        assert_eq!(arena.meta_int(root, 1), 42);

        arena.set_meta_str(root, 5, b"note").unwrap();
        let bytes = arena.serialize(root, true).unwrap();
        let parsed = arena.parse(&bytes).unwrap();
        assert_eq!(arena.key(parsed).int_val(), 42);
        assert_eq!(arena.meta_str(parsed, 5).as_slice(), b"note");

        // The key serializes ahead of other metas.
        arena.expand(parsed).unwrap();
        let metas = arena.metas(parsed);
        assert_eq!(arena.tag(metas[0]), 1);

        arena.remove_meta(parsed, 1).unwrap();
        assert!(arena.key(parsed).is_empty());
        assert!(arena.meta(parsed, 1).is_none());
    }

    #[test]
    fn remove_meta_drops_repetitions() {
        let mut arena = KnvArena::new();
        let root = arena.new_tree(50, Key::none()).unwrap();
        arena.add_meta_int(root, 6, 1).unwrap();
        arena.add_meta_int(root, 6, 2).unwrap();
        assert_eq!(arena.fields(root, 6).len(), 2);
        arena.remove_meta(root, 6).unwrap();
        assert!(arena.fields(root, 6).is_empty());
        let bytes = arena.serialize(root, true).unwrap();
        assert_eq!(bytes.len() as u32, arena.evaluate_size(root));
    }

    #[test]
    fn duplicate_is_deep_and_detached() {
        let mut arena = KnvArena::new();
        let root = sample_tree(&mut arena);
        let dup = arena.duplicate(root).unwrap();
        assert!(arena.parent(dup).is_none());
        assert_eq!(arena.key(dup).int_val(), 12345678);

        // Mutating the copy leaves the original untouched.
        let info = arena.find_child_by_tag(dup, 11).unwrap();
        let c = arena.find_child_by_tag(info, 102).unwrap();
        arena.set_value_int(c, 1).unwrap();
        let orig_info = arena.find_child_by_tag(root, 11).unwrap();
        assert_eq!(arena.child_int(orig_info, 102), 19801010);

        let a = arena.serialize(root, true).unwrap();
        let b = arena.serialize(dup, true).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_payload_expands_to_nothing() {
        let mut arena = KnvArena::new();
        // tag 11, bytes, payload that starts like a field but truncates
        let node = arena.build_bytes(11, &[0x5A, 0x08, 0x96]).unwrap();
        assert_eq!(arena.child_count(node), 0);
        // The buffer itself is untouched.
        assert_eq!(arena.str_val(node).unwrap().as_slice(), &[0x5A, 0x08, 0x96]);
    }

    #[test]
    fn parse_rejects_garbage() {
        let mut arena = KnvArena::new();
        assert!(arena.parse(&[]).is_err());
        assert!(arena.parse(&[0x00]).is_err());
        // bytes field claiming more than the buffer holds
        assert!(arena.parse(&[0x12, 0x7F, 0x01]).is_err());
    }

    #[test]
    fn release_reuses_slots() {
        let mut arena = KnvArena::new();
        let root = sample_tree(&mut arena);
        let n = arena.len();
        arena.release(root);
        assert_eq!(arena.len(), 0);
        let root = sample_tree(&mut arena);
        assert_eq!(arena.len(), n);
        assert!(arena.find_child_by_tag(root, 11).is_some());
    }

    #[test]
    fn set_tag_reindexes_without_reordering() {
        let mut arena = KnvArena::new();
        let root = arena.new_tree(99, Key::none()).unwrap();
        let a = arena.insert_int_leaf(root, 11, 1).unwrap();
        let _b = arena.insert_int_leaf(root, 12, 2).unwrap();
        arena.set_tag(a, 13).unwrap();
        assert_eq!(arena.find_child_by_tag(root, 13), Some(a));
        assert!(arena.find_child_by_tag(root, 11).is_none());
        // Sibling order is unchanged: a still serializes first.
        let children = arena.children(root);
        assert_eq!(children[0], a);
        let bytes = arena.serialize(root, true).unwrap();
        assert_eq!(bytes.len() as u32, arena.evaluate_size(root));
    }
}
