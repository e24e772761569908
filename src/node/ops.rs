//! Tree algebra: projection, pruning, structural merge, request
//! derivation, and comparison.
//!
//! All five operations take a *request tree* (or *update tree*) argument
//! interpreted structurally:
//!
//! - A request node matches data by (tag, key); an absent key matches
//!   every sibling with the same tag.
//! - An integer request leaf with value 0 means "do not request this".
//! - A composite request node with no children requests the entire data
//!   subtree at that position.
//! - A composite request node with children refines the projection
//!   recursively.
//!
//! Both trees must live in the same arena; results are new roots in that
//! arena. Projections share folded payloads with the source instead of
//! copying them.

use hashbrown::HashSet;

use super::arena::{KnvArena, Value};
use super::NodeId;
use crate::encoding::WireType;
use crate::error::{KnvError, Result};

/// What [`KnvArena::delete_subtree`] did to the data tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The whole data tree matched; the caller removes it.
    Whole,
    /// Some children were removed in place (possibly none).
    Partial,
}

impl KnvArena {
    // ------------------------------------------------------------------
    // GetSubTree
    // ------------------------------------------------------------------

    /// Project `data` through `req`. Returns the projection and, unless
    /// `no_empty`, the sub-request describing what found no match (for
    /// the caller to backfill). Either may be `None`.
    pub fn get_subtree(
        &mut self,
        data: NodeId,
        req: NodeId,
        no_empty: bool,
    ) -> Result<(Option<NodeId>, Option<NodeId>)> {
        if self.tag(req) == 0 {
            return Err(KnvError::InvalidArgument("bad request tree"));
        }
        if self.tag(data) != self.tag(req)
            || (!self.key(req).is_empty() && self.key(data) != self.key(req))
        {
            return Ok((None, None));
        }
        let mut out = None;
        let mut empty = None;
        match self.inner_get_subtree(data, req, no_empty, &mut out, &mut empty) {
            Ok(()) => Ok((out, empty)),
            Err(e) => {
                if let Some(o) = out {
                    self.free_subtree(o);
                }
                if let Some(m) = empty {
                    self.free_subtree(m);
                }
                Err(e)
            }
        }
    }

    fn inner_get_subtree(
        &mut self,
        data: NodeId,
        req: NodeId,
        no_empty: bool,
        out: &mut Option<NodeId>,
        empty: &mut Option<NodeId>,
    ) -> Result<()> {
        // An integer request leaf with value 0 opts out of this node.
        if self.wire_type(req) != WireType::Bytes && self.int_val(req) == 0 {
            return Ok(());
        }

        self.inner_expand(req, false)?;
        if self.n(req).children.is_empty() {
            // Requesting the whole subtree: a shallow structural copy
            // whose payload is shared with the data tree.
            let dup = self.inner_duplicate(data, true)?;
            *out = Some(dup);
            return Ok(());
        }

        let req_child_has_key = self.n(req).child_has_key;
        self.inner_expand(data, !req_child_has_key)?;
        if self.n(data).children.is_empty() {
            // The data is a leaf but the request wants structure below:
            // the entire request goes unmatched.
            if no_empty {
                return Ok(());
            }
            let dup = self.inner_duplicate(req, true)?;
            *empty = Some(dup);
            return Ok(());
        }

        // Integer-valued request metas select the matching data metas.
        let req_metas = self.n(req).metas.clone();
        for m in req_metas {
            let mnode = self.n(m);
            if mnode.tag == 1 || mnode.wire_type != WireType::Varint || mnode.value.int() == 0 {
                continue;
            }
            let mtag = mnode.tag;
            if let Some(md) = self.n(data).metas_by_tag[mtag as usize] {
                if out.is_none() {
                    *out = Some(self.dup_empty_node(data));
                }
                self.fold(md)?;
                let (wt, value) = {
                    let mdn = self.n(md);
                    (mdn.wire_type, mdn.value.clone())
                };
                self.set_meta_raw(out.unwrap_or(data), mtag, wt, value, false)?;
            }
        }

        let req_children = self.n(req).children.clone();
        for sub_req in req_children {
            let sub_key = self.n(sub_req).key.clone();
            let sub_tag = self.n(sub_req).tag;
            let mut matched = false;
            if !sub_key.is_empty() {
                // A keyed sub-request matches exactly one data child.
                if let Some(sub_data) = self.find_child(data, sub_tag, &sub_key) {
                    self.collect_subtree_match(data, req, sub_data, sub_req, no_empty, out, empty)?;
                    matched = true;
                }
            } else {
                // Keyless: every data child with the same tag matches.
                let data_children = self.n(data).children.clone();
                for sub_data in data_children {
                    if self.n(sub_data).tag == sub_tag {
                        self.collect_subtree_match(
                            data, req, sub_data, sub_req, no_empty, out, empty,
                        )?;
                        matched = true;
                    }
                }
            }
            if !matched && !no_empty {
                if empty.is_none() {
                    *empty = Some(self.dup_empty_node(req));
                }
                let container = empty.unwrap_or(req);
                let dup = self.inner_duplicate(sub_req, true)?;
                self.inner_insert_child(container, dup, false, false);
            }
        }

        if let Some(e) = *empty {
            self.finish_projection_eval(e);
        }
        if let Some(o) = *out {
            self.finish_projection_eval(o);
        }
        Ok(())
    }

    /// Recurse into one matched (data child, request child) pair and hang
    /// the results off the accumulating projection/empty containers.
    #[allow(clippy::too_many_arguments)]
    fn collect_subtree_match(
        &mut self,
        data: NodeId,
        req: NodeId,
        sub_data: NodeId,
        sub_req: NodeId,
        no_empty: bool,
        out: &mut Option<NodeId>,
        empty: &mut Option<NodeId>,
    ) -> Result<()> {
        let mut o = None;
        let mut e = None;
        if let Err(err) = self.inner_get_subtree(sub_data, sub_req, no_empty, &mut o, &mut e) {
            if let Some(o) = o {
                self.free_subtree(o);
            }
            if let Some(e) = e {
                self.free_subtree(e);
            }
            return Err(err);
        }
        if let Some(o) = o {
            if out.is_none() {
                *out = Some(self.dup_empty_node(data));
            }
            let container = out.unwrap_or(data);
            self.inner_insert_child(container, o, false, false);
        }
        if !no_empty {
            if let Some(e) = e {
                if empty.is_none() {
                    *empty = Some(self.dup_empty_node(req));
                }
                let container = empty.unwrap_or(req);
                self.inner_insert_child(container, e, false, false);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DeleteSubTree
    // ------------------------------------------------------------------

    /// Prune `data` by `req` in place. Returns the outcome plus a
    /// "matched request" tree describing what was actually deleted (for
    /// invalidation callbacks). On [`DeleteOutcome::Whole`] the data tree
    /// itself was matched and the caller is expected to remove it.
    pub fn delete_subtree(
        &mut self,
        data: NodeId,
        req: NodeId,
    ) -> Result<(DeleteOutcome, Option<NodeId>)> {
        if self.tag(req) == 0 {
            return Err(KnvError::InvalidArgument("bad request tree"));
        }
        if self.tag(data) != self.tag(req)
            || (!self.key(req).is_empty() && self.key(data) != self.key(req))
        {
            return Ok((DeleteOutcome::Partial, None));
        }

        self.inner_expand(req, false)?;
        if self.n(req).children.is_empty() {
            // The request is a stub: the entire data subtree goes. The
            // matched request records it as a stub of the same identity.
            let req_key = self.n(req).key.clone();
            let req_tag = self.n(req).tag;
            let matched = if !req_key.is_empty() {
                self.new_tree(req_tag, req_key)?
            } else {
                self.build_int(req_tag, WireType::Varint, 1)?
            };
            return Ok((DeleteOutcome::Whole, Some(matched)));
        }

        let req_child_has_key = self.n(req).child_has_key;
        self.inner_expand(data, !req_child_has_key)?;
        if self.n(data).children.is_empty() {
            return Ok((DeleteOutcome::Partial, None));
        }

        let mut matched: Option<NodeId> = None;
        let result = self.delete_children(data, req, &mut matched);
        if let Err(e) = result {
            if let Some(m) = matched.take() {
                self.free_subtree(m);
            }
            return Err(e);
        }

        if self.child_count(data) == 0 {
            // What was removed stays recorded in the matched tree.
            return Ok((DeleteOutcome::Whole, matched));
        }
        Ok((DeleteOutcome::Partial, matched))
    }

    fn delete_children(
        &mut self,
        data: NodeId,
        req: NodeId,
        matched: &mut Option<NodeId>,
    ) -> Result<()> {
        let req_children = self.n(req).children.clone();
        for sub_req in req_children {
            let sub_key = self.n(sub_req).key.clone();
            let sub_tag = self.n(sub_req).tag;
            if !sub_key.is_empty() {
                let Some(sub_data) = self.find_child(data, sub_tag, &sub_key) else {
                    continue;
                };
                let (outcome, sub_match) = self.delete_subtree(sub_data, sub_req)?;
                self.record_match(req, matched, sub_match)?;
                if outcome == DeleteOutcome::Whole || self.child_count(sub_data) == 0 {
                    self.remove_child_node(data, sub_data);
                }
            } else {
                self.inner_expand(sub_req, false)?;
                if self.n(sub_req).children.is_empty() {
                    // Keyless stub: remove every child with this tag.
                    let requests_node = self.n(sub_req).wire_type == WireType::Bytes
                        || (self.n(sub_req).wire_type == WireType::Varint
                            && self.value_int(sub_req) != 0);
                    if requests_node {
                        self.remove_children_by_tag(data, sub_tag);
                        let dup = self.inner_duplicate(sub_req, false)?;
                        self.record_match(req, matched, Some(dup))?;
                    }
                } else {
                    let data_children = self.n(data).children.clone();
                    for sub_data in data_children {
                        if self.n(sub_data).tag != sub_tag {
                            continue;
                        }
                        let (outcome, sub_match) = self.delete_subtree(sub_data, sub_req)?;
                        self.record_match(req, matched, sub_match)?;
                        if outcome == DeleteOutcome::Whole || self.child_count(sub_data) == 0 {
                            self.remove_child_node(data, sub_data);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn record_match(
        &mut self,
        req: NodeId,
        matched: &mut Option<NodeId>,
        sub_match: Option<NodeId>,
    ) -> Result<()> {
        let Some(sub_match) = sub_match else {
            return Ok(());
        };
        if matched.is_none() {
            let req_key = self.n(req).key.clone();
            let req_tag = self.n(req).tag;
            match self.new_tree(req_tag, req_key) {
                Ok(t) => *matched = Some(t),
                Err(e) => {
                    self.free_subtree(sub_match);
                    return Err(e);
                }
            }
        }
        let container = matched.unwrap_or(req);
        self.inner_insert_child(container, sub_match, true, false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // UpdateSubTree
    // ------------------------------------------------------------------

    /// Structural upsert of `upd` into `data`. Matching (tag, key)
    /// children merge recursively down to `max_level`; unmatched children
    /// are inserted. At level 0 every tag present in the update is first
    /// removed wholesale, so repeated fields replace as a set rather
    /// than merging per element. Metas above tag 1 copy unconditionally;
    /// the key is never overwritten through this path.
    pub fn update_subtree(&mut self, data: NodeId, upd: NodeId, max_level: i32) -> Result<()> {
        if self.tag(upd) == 0 {
            return Err(KnvError::InvalidArgument("bad update tree"));
        }
        if self.tag(data) != self.tag(upd) || self.key(data) != self.key(upd) {
            return Ok(());
        }

        if max_level == 0 {
            // The last level is plain fields; key handling is moot.
            self.inner_expand(data, true)?;
            self.inner_expand(upd, true)?;
        }

        if max_level < 0 || self.child_count(upd) == 0 || self.child_count(data) == 0 {
            // Leaf-to-leaf (or depth exhausted): overwrite the value.
            self.fold(upd)?;
            let (wt, value) = {
                let u = self.n(upd);
                (u.wire_type, u.value.clone())
            };
            return match (wt, value) {
                (WireType::Bytes, Value::Bytes(b)) => self.set_value_buf(data, b),
                (WireType::Bytes, _) => self.set_value_buf(data, crate::memory::ByteBuf::empty()),
                (_, v) => self.set_value_int(data, v.int()),
            };
        }

        let upd_metas = self.n(upd).metas.clone();
        for m in upd_metas {
            let (mtag, mwt, mval) = {
                let mn = self.n(m);
                (mn.tag, mn.wire_type, mn.value.clone())
            };
            if mtag > 1 {
                self.set_meta_raw(data, mtag, mwt, mval, true)?;
            }
        }

        let max_level = max_level - 1;

        if max_level < 0 {
            // Replace-as-a-set: old repeated fields must not survive next
            // to new ones.
            let tags: HashSet<u32> = self
                .n(upd)
                .children
                .iter()
                .map(|&c| self.n(c).tag)
                .collect();
            for t in tags {
                self.remove_children_by_tag(data, t);
            }
        }

        let upd_children = self.n(upd).children.clone();
        for sub_upd in upd_children {
            let sub_tag = self.n(sub_upd).tag;
            let sub_key = self.n(sub_upd).key.clone();
            let existing = if max_level >= 0 {
                self.find_child(data, sub_tag, &sub_key)
            } else {
                None
            };
            match existing {
                Some(sub_data) => self.update_subtree(sub_data, sub_upd, max_level)?,
                None => {
                    let dup = self.inner_duplicate(sub_upd, false)?;
                    self.inner_insert_child(data, dup, true, false);
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // MakeRequestTree
    // ------------------------------------------------------------------

    /// Derive a request tree from this data tree: composite internal
    /// nodes are reproduced with their keys but no values; below
    /// `max_level` (and for value-less leaves) an integer-1 stub stands
    /// in for the subtree.
    pub fn make_request_tree(&mut self, data: NodeId, max_level: i32) -> Result<NodeId> {
        if self.tag(data) == 0 {
            return Err(KnvError::InvalidArgument("bad data tree"));
        }
        if max_level < 0 || self.child_count(data) == 0 {
            let (tag, key, has_ident) = {
                let node = self.n(data);
                (
                    node.tag,
                    node.key.clone(),
                    node.expanded && !node.metas.is_empty(),
                )
            };
            if !has_ident {
                // A value-less leaf: an integer-1 stub requests it whole.
                return self.build_int(tag, WireType::Varint, 1);
            }
            return self.new_tree(tag, key);
        }

        let mut new_tree: Option<NodeId> = None;
        let children = self.n(data).children.clone();
        for sub in children {
            if new_tree.is_none() {
                let (tag, key) = {
                    let node = self.n(data);
                    (node.tag, node.key.clone())
                };
                new_tree = Some(self.new_tree(tag, key)?);
            }
            let sub_req = match self.make_request_tree(sub, max_level - 1) {
                Ok(r) => r,
                Err(e) => {
                    if let Some(t) = new_tree {
                        self.free_subtree(t);
                    }
                    return Err(e);
                }
            };
            let container = new_tree.unwrap_or(data);
            self.inner_insert_child(container, sub_req, true, false);
        }
        // children was non-empty, so the container exists
        Ok(new_tree.unwrap_or(data))
    }

    // ------------------------------------------------------------------
    // Compare
    // ------------------------------------------------------------------

    /// Compare `a` against `b` by (tag, key), recursing into composites
    /// and comparing bytes at leaves. Returns a tree of `a`'s children
    /// absent or unequal in `b`, or `None` when everything matches.
    pub fn compare(&mut self, a: NodeId, b: Option<NodeId>) -> Result<Option<NodeId>> {
        let differs_at_root = match b {
            None => true,
            Some(b) => self.key(a) != self.key(b),
        };
        if differs_at_root {
            return self.duplicate(a).map(Some);
        }
        let b = b.unwrap_or(a);

        if self.child_count(a) == 0 {
            // Leaf comparison is byte comparison of the serialized values.
            let equal = self.leaf_values_equal(a, b)?;
            return if equal {
                Ok(None)
            } else {
                self.duplicate(a).map(Some)
            };
        }

        let mut ret: Option<NodeId> = None;
        let a_children = self.n(a).children.clone();
        for child in a_children {
            let (ctag, ckey) = {
                let c = self.n(child);
                (c.tag, c.key.clone())
            };
            let counterpart = self.find_child(b, ctag, &ckey);
            let diff = match counterpart {
                None => Some(self.duplicate(child)?),
                Some(cmp_child) => match self.compare(child, Some(cmp_child)) {
                    Ok(d) => d,
                    Err(e) => {
                        if let Some(r) = ret.take() {
                            self.free_subtree(r);
                        }
                        return Err(e);
                    }
                },
            };
            if let Some(diff) = diff {
                if ret.is_none() {
                    let (tag, key) = {
                        let node = self.n(a);
                        (node.tag, node.key.clone())
                    };
                    match self.new_tree(tag, key) {
                        Ok(t) => ret = Some(t),
                        Err(e) => {
                            self.free_subtree(diff);
                            return Err(e);
                        }
                    }
                }
                let container = ret.unwrap_or(a);
                self.inner_insert_child(container, diff, true, false);
            }
        }
        Ok(ret)
    }

    fn leaf_values_equal(&mut self, a: NodeId, b: NodeId) -> Result<bool> {
        if self.wire_type(a) != self.wire_type(b) {
            return Ok(false);
        }
        if self.wire_type(a) == WireType::Bytes {
            let va = self.str_val(a)?;
            let vb = self.str_val(b)?;
            Ok(va == vb)
        } else {
            Ok(self.int_val(a) == self.int_val(b))
        }
    }

    pub(crate) fn value_int(&self, id: NodeId) -> u64 {
        self.n(id).value.int()
    }
}
