//! The packet type: decode, header access, batch bodies, encoding in
//! both framings, and split/reassembly.

use super::{
    is_part_tag, tags, DEFAULT_MAX_PKG_SIZE, FRAME_ETX, FRAME_STX, KNV_BODY_MARK, MIN_PKG_SIZE,
};
use crate::encoding::{field_len, FieldWriter, Tag, WireType};
use crate::error::{KnvError, Result};
use crate::memory::ByteBuf;
use crate::node::{Key, KnvArena, NodeId};

/// One packet: a KNV tree plus a decoded view of its header fields.
///
/// The protocol owns its arena; body and domain structure is manipulated
/// through [`arena_mut`](Self::arena_mut) with the node ids the accessors
/// return.
pub struct KnvProtocol {
    arena: KnvArena,
    tree: Option<NodeId>,
    header: Option<NodeId>,
    /// Current body cursor; decode positions it on the first body.
    body: Option<NodeId>,

    cmd: u32,
    subcmd: u32,
    seq: u64,
    retcode: u32,
    retmsg: Vec<u8>,
    rsp_addr: Vec<u8>,
    allow_split: bool,
    max_pkg_size: u32,
    total_split_count: u32,
    curr_split_index: u32,
}

impl KnvProtocol {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// A fresh packet with only a header carrying command, subcommand,
    /// and sequence.
    pub fn new(cmd: u32, subcmd: u32, seq: u64) -> Result<KnvProtocol> {
        let mut arena = KnvArena::new();
        let tree = arena.new_tree(tags::PKG_TAG, Key::none())?;
        let header = arena.insert_subnode(tree, tags::HDR_TAG, Key::none())?;
        let mut p = KnvProtocol::empty(arena);
        p.tree = Some(tree);
        p.header = Some(header);
        p.set_command(cmd)?;
        p.set_subcommand(subcmd)?;
        p.set_sequence(seq)?;
        Ok(p)
    }

    /// Decode a packet from the wire, auto-detecting the legacy frame by
    /// its `0x28` start token.
    pub fn decode(data: &[u8]) -> Result<KnvProtocol> {
        let mut arena = KnvArena::new();
        if data.first() == Some(&FRAME_STX) {
            return Self::decode_legacy(arena, data);
        }
        let tree = arena.parse(data)?;
        Self::from_tree(arena, tree)
    }

    fn decode_buf(buf: ByteBuf) -> Result<KnvProtocol> {
        let mut arena = KnvArena::new();
        let tree = arena.parse_buf(buf)?;
        Self::from_tree(arena, tree)
    }

    /// Assemble a packet around pre-built header (and optional body)
    /// roots of `arena`.
    pub fn from_parts(
        mut arena: KnvArena,
        header: NodeId,
        body: Option<NodeId>,
    ) -> Result<KnvProtocol> {
        let tree = arena.new_tree(tags::PKG_TAG, Key::none())?;
        arena.insert_child(tree, header)?;
        if let Some(b) = body {
            arena.insert_child(tree, b)?;
        }
        Self::from_tree(arena, tree)
    }

    fn decode_legacy(mut arena: KnvArena, data: &[u8]) -> Result<KnvProtocol> {
        if data.len() < 10 {
            return Err(KnvError::BadFrame("insufficient length"));
        }
        let hlen = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let blen = u32::from_be_bytes([data[5], data[6], data[7], data[8]]) as usize;
        let total = hlen
            .checked_add(blen)
            .and_then(|v| v.checked_add(10))
            .ok_or(KnvError::BadFrame("insufficient length"))?;
        if total > data.len() {
            return Err(KnvError::BadFrame("insufficient length"));
        }
        if data[total - 1] != FRAME_ETX {
            return Err(KnvError::BadFrame("etx token missing"));
        }
        let hdr_bytes = &data[9..9 + hlen];
        let body_bytes = &data[9 + hlen..9 + hlen + blen];

        let header = arena.build_bytes(tags::HDR_TAG, hdr_bytes)?;
        if body_bytes.len() >= 2 && body_bytes[..2] == KNV_BODY_MARK {
            // The legacy body is a concatenation of serialized KNV
            // bodies; wrap it directly and put the header ahead of them.
            let buf = ByteBuf::copy_from(arena.pool(), body_bytes)?;
            let tree = arena.build_bytes_buf(tags::PKG_TAG, buf)?;
            arena.insert_child_front(tree, header)?;
            Self::from_tree(arena, tree)
        } else {
            // Single bare body payload.
            let body = arena.build_bytes(tags::BDY_TAG, body_bytes)?;
            let tree = arena.new_tree(tags::PKG_TAG, Key::none())?;
            arena.insert_child(tree, header)?;
            arena.insert_child(tree, body)?;
            Self::from_tree(arena, tree)
        }
    }

    fn empty(arena: KnvArena) -> KnvProtocol {
        KnvProtocol {
            arena,
            tree: None,
            header: None,
            body: None,
            cmd: 0,
            subcmd: 0,
            seq: 0,
            retcode: 0,
            retmsg: Vec::new(),
            rsp_addr: Vec::new(),
            allow_split: false,
            max_pkg_size: 0,
            total_split_count: 0,
            curr_split_index: 0,
        }
    }

    fn from_tree(mut arena: KnvArena, tree: NodeId) -> Result<KnvProtocol> {
        if arena.tag(tree) != tags::PKG_TAG {
            return Err(KnvError::InvalidFormat("not a knv packet"));
        }
        let header = arena
            .find_child_by_tag(tree, tags::HDR_TAG)
            .ok_or(KnvError::InvalidFormat("protocol has no header"))?;
        let body = arena
            .children(tree)
            .into_iter()
            .find(|&c| arena.tag(c) == tags::BDY_TAG);
        let mut p = KnvProtocol::empty(arena);
        p.tree = Some(tree);
        p.header = Some(header);
        p.body = body;
        p.load_header_info();
        Ok(p)
    }

    fn load_header_info(&mut self) {
        let Some(h) = self.header else { return };
        self.cmd = self.arena.meta_int(h, tags::HDR_CMD) as u32;
        self.subcmd = self.arena.meta_int(h, tags::HDR_SUBCMD) as u32;
        self.seq = self.arena.meta_int(h, tags::HDR_SEQ);
        self.retcode = self.arena.meta_int(h, tags::HDR_RET) as u32;
        self.retmsg = self.arena.meta_str(h, tags::HDR_ERR).as_slice().to_vec();
        self.rsp_addr = self.arena.child_str(h, tags::HDR_RSP_ADDR).as_slice().to_vec();
        self.allow_split = self.arena.child_int(h, tags::HDR_ALLOW_SPLIT) != 0;
        self.max_pkg_size = self.arena.child_int(h, tags::HDR_MAX_PKG_SIZE) as u32;
        self.total_split_count = self.arena.child_int(h, tags::HDR_TOTAL_SPLIT) as u32;
        self.curr_split_index = self.arena.child_int(h, tags::HDR_CURR_INDEX) as u32;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn is_valid(&self) -> bool {
        self.tree.is_some()
    }

    pub fn arena(&self) -> &KnvArena {
        &self.arena
    }

    /// The arena hosting this packet's tree, for direct body and domain
    /// manipulation.
    pub fn arena_mut(&mut self) -> &mut KnvArena {
        &mut self.arena
    }

    pub fn root(&self) -> Option<NodeId> {
        self.tree
    }

    pub fn header(&self) -> Option<NodeId> {
        self.header
    }

    /// The current body, positioned on the first one after decode.
    pub fn body(&self) -> Option<NodeId> {
        self.body
    }

    /// The current body's key, the packet's addressing key.
    pub fn key(&self) -> Option<&Key> {
        self.body.map(|b| self.arena.key(b))
    }

    pub fn command(&self) -> u32 {
        self.cmd
    }

    pub fn subcommand(&self) -> u32 {
        self.subcmd
    }

    pub fn sequence(&self) -> u64 {
        self.seq
    }

    pub fn retcode(&self) -> u32 {
        self.retcode
    }

    pub fn error_msg(&self) -> &[u8] {
        &self.retmsg
    }

    pub fn rsp_addr(&self) -> &[u8] {
        &self.rsp_addr
    }

    pub fn allow_split(&self) -> bool {
        self.allow_split
    }

    /// The effective packet ceiling: the header-supplied value clamped
    /// into [[`MIN_PKG_SIZE`], [`DEFAULT_MAX_PKG_SIZE`]].
    pub fn max_pkg_size(&self) -> u32 {
        if self.max_pkg_size < MIN_PKG_SIZE || self.max_pkg_size > DEFAULT_MAX_PKG_SIZE {
            DEFAULT_MAX_PKG_SIZE
        } else {
            self.max_pkg_size
        }
    }

    pub fn part_count(&self) -> u32 {
        self.total_split_count
    }

    pub fn curr_part_index(&self) -> u32 {
        self.curr_split_index
    }

    /// Serialized size of the whole packet tree.
    pub fn eval_size(&mut self) -> Result<u32> {
        let tree = self.tree_id()?;
        Ok(self.arena.evaluate_size(tree))
    }

    fn tree_id(&self) -> Result<NodeId> {
        self.tree
            .ok_or(KnvError::InvalidArgument("protocol is not initialized"))
    }

    fn header_id(&self) -> Result<NodeId> {
        self.header
            .ok_or(KnvError::InvalidArgument("protocol is not initialized"))
    }

    // ------------------------------------------------------------------
    // Header fields
    // ------------------------------------------------------------------

    /// Read any integer header field (meta for tags 1..=10, child above).
    pub fn header_int_field(&mut self, tag: Tag) -> u64 {
        match self.header {
            Some(h) => self.arena.field_int(h, tag),
            None => 0,
        }
    }

    pub fn header_str_field(&mut self, tag: Tag) -> Vec<u8> {
        match self.header {
            Some(h) => self.arena.field_str(h, tag).as_slice().to_vec(),
            None => Vec::new(),
        }
    }

    /// Write an integer header field, keeping the decoded view in sync.
    pub fn set_header_int_field(&mut self, tag: Tag, v: u64) -> Result<()> {
        let h = self.header_id()?;
        self.arena.set_field_int(h, tag, v)?;
        match tag {
            tags::HDR_CMD => self.cmd = v as u32,
            tags::HDR_SUBCMD => self.subcmd = v as u32,
            tags::HDR_SEQ => self.seq = v,
            tags::HDR_RET => self.retcode = v as u32,
            tags::HDR_ALLOW_SPLIT => self.allow_split = v != 0,
            tags::HDR_MAX_PKG_SIZE => self.max_pkg_size = v as u32,
            tags::HDR_TOTAL_SPLIT => self.total_split_count = v as u32,
            tags::HDR_CURR_INDEX => self.curr_split_index = v as u32,
            _ => {}
        }
        Ok(())
    }

    /// Write (or, with empty data, remove) a byte header field.
    pub fn set_header_str_field(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        let h = self.header_id()?;
        if data.is_empty() {
            self.arena.remove_field(h, tag)?;
        } else {
            self.arena.set_field_str(h, tag, data)?;
        }
        if tag == tags::HDR_ERR {
            self.retmsg = data.to_vec();
        }
        Ok(())
    }

    pub fn set_command(&mut self, cmd: u32) -> Result<()> {
        self.set_header_int_field(tags::HDR_CMD, cmd as u64)
    }

    pub fn set_subcommand(&mut self, subcmd: u32) -> Result<()> {
        self.set_header_int_field(tags::HDR_SUBCMD, subcmd as u64)
    }

    pub fn set_sequence(&mut self, seq: u64) -> Result<()> {
        self.set_header_int_field(tags::HDR_SEQ, seq)
    }

    /// A non-zero result code switches encoding to the error form:
    /// header and error message only, no body.
    pub fn set_retcode(&mut self, retcode: u32) -> Result<()> {
        self.set_header_int_field(tags::HDR_RET, retcode as u64)
    }

    pub fn set_error_msg(&mut self, msg: &[u8]) -> Result<()> {
        self.set_header_str_field(tags::HDR_ERR, msg)
    }

    /// Record the reply address (opaque socket-address bytes).
    pub fn set_rsp_addr(&mut self, addr: &[u8]) -> Result<()> {
        let h = self.header_id()?;
        self.arena.set_child_str(h, tags::HDR_RSP_ADDR, addr)?;
        self.rsp_addr = addr.to_vec();
        Ok(())
    }

    /// Allow (or forbid) splitting when this packet is encoded.
    pub fn set_allow_split(&mut self, allow: bool, pkg_size: u32) {
        self.allow_split = allow;
        if pkg_size != 0 {
            self.max_pkg_size = pkg_size;
        }
    }

    /// Ask the peer to split (or not split) its reply.
    pub fn set_req_split(&mut self, allow: bool, pkg_size: u32) -> Result<()> {
        let h = self.header_id()?;
        if allow {
            self.arena.set_child_int(h, tags::HDR_ALLOW_SPLIT, 1)?;
        } else {
            self.arena.remove_children_by_tag(h, tags::HDR_ALLOW_SPLIT);
        }
        if pkg_size != 0 {
            self.arena.set_child_int(h, tags::HDR_MAX_PKG_SIZE, pkg_size as u64)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bodies (batch) and domains
    // ------------------------------------------------------------------

    /// Append a new keyed body and make it current.
    pub fn add_body(&mut self, key: Key) -> Result<NodeId> {
        let tree = self.tree_id()?;
        let b = self.arena.new_tree(tags::BDY_TAG, key)?;
        self.arena.insert_child(tree, b)?;
        self.body = Some(b);
        Ok(b)
    }

    /// Append a pre-built body root and make it current.
    pub fn add_body_tree(&mut self, body: NodeId) -> Result<()> {
        let tree = self.tree_id()?;
        if self.arena.tag(body) != tags::BDY_TAG {
            return Err(KnvError::InvalidArgument("request body is invalid"));
        }
        self.arena.insert_child(tree, body)?;
        self.body = Some(body);
        Ok(())
    }

    /// All bodies in order.
    pub fn bodies(&mut self) -> Vec<NodeId> {
        match self.tree {
            Some(tree) => self
                .arena
                .children(tree)
                .into_iter()
                .filter(|&c| self.arena.tag(c) == tags::BDY_TAG)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Rewind the body cursor to the first body.
    pub fn first_request(&mut self) -> Option<NodeId> {
        let first = self.bodies().into_iter().next();
        if first.is_some() {
            self.body = first;
        }
        first
    }

    /// Advance the body cursor to the next body.
    pub fn next_request(&mut self) -> Option<NodeId> {
        let cur = self.body?;
        let bodies = self.bodies();
        let pos = bodies.iter().position(|&b| b == cur)?;
        let next = bodies.get(pos + 1).copied();
        if next.is_some() {
            self.body = next;
        }
        next
    }

    /// Drop every body, leaving only the header (reuse for a reply).
    pub fn remove_all_bodies(&mut self) -> Result<()> {
        let tree = self.tree_id()?;
        self.arena.remove_children_by_tag(tree, tags::BDY_TAG);
        self.body = None;
        Ok(())
    }

    /// Replace all bodies with one (or none).
    pub fn reassign_body(&mut self, body: Option<NodeId>) -> Result<()> {
        self.remove_all_bodies()?;
        if let Some(b) = body {
            self.add_body_tree(b)?;
        }
        Ok(())
    }

    /// Number of domains under the current body.
    pub fn domain_count(&mut self) -> usize {
        match self.body {
            Some(b) => self.arena.child_count(b),
            None => 0,
        }
    }

    /// Domains of the current body, in order.
    pub fn domains(&mut self) -> Vec<NodeId> {
        match self.body {
            Some(b) => self.arena.children(b),
            None => Vec::new(),
        }
    }

    /// The current body's domain with the given id, if present.
    pub fn domain(&mut self, domain_id: Tag) -> Option<NodeId> {
        let b = self.body?;
        self.arena.find_child(b, domain_id, &Key::none())
    }

    /// Get-or-create a domain under the current body.
    pub fn add_domain(&mut self, domain_id: Tag) -> Result<NodeId> {
        let b = self
            .body
            .ok_or(KnvError::InvalidArgument("protocol has no body"))?;
        if let Some(d) = self.arena.find_child(b, domain_id, &Key::none()) {
            return Ok(d);
        }
        self.arena.insert_subnode(b, domain_id, Key::none())
    }

    /// Insert a pre-built domain root under the current body. Fails when
    /// a domain with the same id already exists.
    pub fn insert_domain(&mut self, domain: NodeId) -> Result<()> {
        let b = self
            .body
            .ok_or(KnvError::InvalidArgument("protocol has no body"))?;
        let id = self.arena.tag(domain);
        if self.arena.find_child(b, id, &Key::none()).is_some() {
            return Err(KnvError::InvalidArgument("domain id already present"));
        }
        self.arena.insert_child(b, domain)
    }

    pub fn remove_domain(&mut self, domain_id: Tag) -> Result<()> {
        let b = self
            .body
            .ok_or(KnvError::InvalidArgument("protocol has no body"))?;
        self.arena.remove_children_by_tag(b, domain_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    /// Encode in KNV-native framing. A non-zero result code produces the
    /// error form: header (with error message) only.
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        if self.retcode != 0 {
            return self.encode_header_with(None);
        }
        let tree = self.tree_id()?;
        self.arena.serialize(tree, true)
    }

    /// Encode header plus exactly one externally chosen body tree.
    pub fn encode_with_body(&mut self, body: NodeId) -> Result<Vec<u8>> {
        self.encode_header_with(Some(body))
    }

    /// Encode with an error result; the body is dropped from the output.
    pub fn encode_with_error(&mut self, retcode: u32, msg: &[u8]) -> Result<Vec<u8>> {
        self.set_retcode(retcode)?;
        self.set_error_msg(msg)?;
        self.encode_header_with(None)
    }

    fn encode_header_with(&mut self, body: Option<NodeId>) -> Result<Vec<u8>> {
        let header = self.header_id()?;
        let hdr_sz = self.arena.evaluate_size(header);
        let bdy_sz = match body {
            Some(b) => self.arena.evaluate_size(b),
            None => 0,
        };
        let total_val = hdr_sz + bdy_sz;
        let total = field_len(tags::PKG_TAG, WireType::Bytes, 0, total_val) as usize;
        let mut out = vec![0u8; total];
        let mut pos = {
            let mut w = FieldWriter::new(&mut out);
            w.put_bytes_head(tags::PKG_TAG, total_val)?;
            w.written()
        };
        pos += self.arena.serialize_into(header, &mut out[pos..], true)?;
        if let Some(b) = body {
            pos += self.arena.serialize_into(b, &mut out[pos..], true)?;
        }
        if pos != total {
            return Err(KnvError::SizeMismatch("eval size incorrect"));
        }
        Ok(out)
    }

    /// Encode in legacy framing with every body embedded in serialized
    /// KNV form (the multi-body variant; the default).
    pub fn encode_legacy(&mut self) -> Result<Vec<u8>> {
        if self.retcode != 0 {
            return self.legacy_frame_single(None);
        }
        self.legacy_frame_multi()
    }

    /// Encode in the single-body legacy variant: only the current body,
    /// embedded as its bare payload.
    pub fn encode_legacy_compat(&mut self) -> Result<Vec<u8>> {
        if self.retcode != 0 {
            return self.legacy_frame_single(None);
        }
        self.legacy_frame_single(self.body)
    }

    fn legacy_frame_single(&mut self, body: Option<NodeId>) -> Result<Vec<u8>> {
        let header = self.header_id()?;
        let hdr = self.arena.str_val(header)?;
        let bdy = match body {
            Some(b) => self.arena.str_val(b)?,
            None => ByteBuf::empty(),
        };
        Ok(build_frame(hdr.as_slice(), bdy.as_slice()))
    }

    fn legacy_frame_multi(&mut self) -> Result<Vec<u8>> {
        let tree = self.tree_id()?;
        let header = self.header_id()?;
        let hdr = self.arena.str_val(header)?;
        let mut body_bytes = Vec::new();
        for c in self.arena.children(tree) {
            if self.arena.tag(c) == tags::HDR_TAG {
                continue;
            }
            body_bytes.extend_from_slice(&self.arena.serialize(c, true)?);
        }
        Ok(build_frame(hdr.as_slice(), &body_bytes))
    }

    // ------------------------------------------------------------------
    // Splitting and reassembly
    // ------------------------------------------------------------------

    /// Partition the packet into part children when it exceeds the size
    /// ceiling and splitting is allowed; otherwise leave it whole. After
    /// a split, [`encode_part`](Self::encode_part) emits each part as an
    /// independent packet.
    pub fn split(&mut self) -> Result<()> {
        let tree = self.tree_id()?;
        let header = self.header_id()?;

        // Split bookkeeping never travels inside the payload being split.
        self.total_split_count = 1;
        self.arena.remove_children_by_tag(header, tags::HDR_TOTAL_SPLIT);
        self.arena.remove_children_by_tag(header, tags::HDR_CURR_INDEX);

        let rough_sz = self.arena.evaluate_size(tree) + 32;
        let max_sz = self.max_pkg_size();
        if !self.allow_split || self.body.is_none() || rough_sz <= max_sz {
            return Ok(());
        }

        let encoded = self.encode()?;
        if encoded.len() as u32 <= max_sz {
            // The estimate overshot; one wasted encode, nothing to split.
            return Ok(());
        }

        let hdr_sz = self.arena.evaluate_size(header) + 16;
        if hdr_sz >= max_sz {
            return Err(KnvError::InvalidArgument(
                "header is larger than max package size",
            ));
        }
        let part_sz = (max_sz - hdr_sz) as usize;
        let n = encoded.len().div_ceil(part_sz);
        if n <= 1 {
            return Ok(());
        }

        self.total_split_count = n as u32;
        self.arena
            .set_child_int(header, tags::HDR_TOTAL_SPLIT, n as u64)?;

        let pool = self.arena.pool().clone();
        let shared = ByteBuf::copy_from(&pool, &encoded)?;
        for k in 0..n {
            let off = k * part_sz;
            let len = part_sz.min(encoded.len() - off);
            let tag = tags::PART_TAG_BASE + k as Tag;
            self.arena.remove_children_by_tag(tree, tag);
            let part = self.arena.build_bytes_buf(tag, shared.slice(off, len))?;
            self.arena.insert_child(tree, part)?;
        }
        Ok(())
    }

    /// Encode the k-th part packet (header plus one part body), stamping
    /// the current index into the header.
    pub fn encode_part(&mut self, index: u32) -> Result<Vec<u8>> {
        let tree = self.tree_id()?;
        let header = self.header_id()?;
        if self.total_split_count <= 1 {
            if index != 0 {
                return Err(KnvError::InvalidArgument("bad part index"));
            }
            // An unsplit packet that still carries a lone part child is
            // encoded with that part restored to a body.
            if let Some(b) = self.arena.find_child_by_tag(tree, tags::PART_TAG_BASE) {
                self.arena.set_tag(b, tags::BDY_TAG)?;
                let result = self.encode_with_body(b);
                self.arena.set_tag(b, tags::PART_TAG_BASE)?;
                return result;
            }
            return self.encode();
        }
        if index >= self.total_split_count {
            return Err(KnvError::InvalidArgument("bad part index"));
        }
        let part = self
            .arena
            .find_child_by_tag(tree, tags::PART_TAG_BASE + index)
            .ok_or(KnvError::NotFound)?;
        self.arena
            .set_child_int(header, tags::HDR_CURR_INDEX, index as u64)?;
        self.encode_with_body(part)
    }

    /// True when this packet needs no further parts: it carries an error
    /// code, was never split, or has its body.
    pub fn is_complete(&self) -> bool {
        self.tree.is_some()
            && (self.retcode != 0 || self.total_split_count == 0 || self.body.is_some())
    }

    /// Feed one arriving part packet into this accumulator. The first
    /// part (or any part that invalidates the accumulated state —
    /// complete packet, split-count mismatch, index out of range)
    /// replaces the accumulator wholesale. A repeated index is
    /// [`KnvError::PartialDuplicate`]. When the last missing part
    /// arrives, the parts are concatenated and reparsed, leaving `self`
    /// as the reassembled original.
    pub fn add_partial(&mut self, part: KnvProtocol) -> Result<()> {
        if !part.is_valid() {
            return Err(KnvError::InvalidArgument("part is invalid"));
        }
        if self.tree.is_none() {
            *self = part;
            return Ok(());
        }
        if self.is_complete()
            || part.is_complete()
            || self.total_split_count != part.total_split_count
            || part.curr_split_index >= self.total_split_count
        {
            *self = part;
            return Ok(());
        }

        let mut part = part;
        let part_tag = tags::PART_TAG_BASE + part.curr_split_index;
        debug_assert!(is_part_tag(part_tag));
        let ptree = part.tree_id()?;
        let pnode = part
            .arena
            .find_child_by_tag(ptree, part_tag)
            .ok_or(KnvError::InvalidFormat("protocol has no corresponding part"))?;
        if part.arena.wire_type(pnode) != WireType::Bytes {
            return Err(KnvError::InvalidFormat("part is not a buffer"));
        }

        let tree = self.tree_id()?;
        if self.arena.find_child_by_tag(tree, part_tag).is_some() {
            return Err(KnvError::PartialDuplicate);
        }
        // The payload buffer is shared, not copied, across arenas.
        let payload = part.arena.str_val(pnode)?;
        let node = self.arena.build_bytes_buf(part_tag, payload)?;
        self.arena.insert_child(tree, node)?;

        // Completion check: every index present and non-empty.
        let mut parts = Vec::with_capacity(self.total_split_count as usize);
        let mut total_len = 0usize;
        for i in 0..self.total_split_count {
            let Some(p) = self.arena.find_child_by_tag(tree, tags::PART_TAG_BASE + i) else {
                return Ok(()); // not yet complete
            };
            let v = self.arena.str_val(p)?;
            if v.is_empty() {
                return Err(KnvError::InvalidFormat("protocol part is empty"));
            }
            total_len += v.len();
            parts.push(v);
        }

        let pool = self.arena.pool().clone();
        let mut merged = pool.alloc(total_len)?;
        let mut pos = 0;
        for v in &parts {
            merged[pos..pos + v.len()].copy_from_slice(v.as_slice());
            pos += v.len();
        }
        *self = KnvProtocol::decode_buf(ByteBuf::from_pool_buf(merged, total_len))?;
        Ok(())
    }

    /// Multi-line structural dump for debugging.
    pub fn dump(&mut self) -> String {
        match self.tree {
            Some(t) => {
                let head = format!(
                    "[#] cmd={:#x}, subcmd={:#x}, seq={}, retcode={}\n",
                    self.cmd, self.subcmd, self.seq, self.retcode
                );
                head + &self.arena.dump(t)
            }
            None => "(invalid protocol)\n".to_owned(),
        }
    }
}

fn build_frame(hdr: &[u8], bdy: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + hdr.len() + bdy.len());
    out.push(FRAME_STX);
    out.extend_from_slice(&(hdr.len() as u32).to_be_bytes());
    out.extend_from_slice(&(bdy.len() as u32).to_be_bytes());
    out.extend_from_slice(hdr);
    out.extend_from_slice(bdy);
    out.push(FRAME_ETX);
    out
}
