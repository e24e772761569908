//! # Protocol Envelope
//!
//! A packet is itself a KNV tree with fixed tags: an outer wrapper
//! ([`tags::PKG_TAG`]) holding one header subtree ([`tags::HDR_TAG`]) and
//! any number of body subtrees ([`tags::BDY_TAG`] — a packet with several
//! bodies is a batch). The header carries command, subcommand, sequence,
//! result code and error message as metas, plus split-control fields as
//! children in the 2001..=2005 range.
//!
//! ## Framing
//!
//! Two wire forms are supported and auto-detected on decode:
//!
//! 1. *KNV-native*: the wrapper tree serialized in full.
//! 2. *Legacy*: `[0x28][u32 header_len BE][u32 body_len BE][header bytes]
//!    [body bytes][0x29]`. The legacy body either embeds the serialized
//!    KNV bodies (detected by their `0xEA 0xDA` field marker — the
//!    default on encode) or a single bare body payload (the compat
//!    variant).
//!
//! ## Splitting
//!
//! When an encoded packet exceeds the maximum packet size and splitting
//! is allowed, the full encoding is sliced into parts carried as
//! `PART_TAG_BASE + k` children, each transmitted as its own packet with
//! the split count and index stamped into the header. A receiver feeds
//! arriving parts to [`KnvProtocol::add_partial`]; when every index is
//! present the concatenation is reparsed into the original packet.

mod proto;

pub use proto::KnvProtocol;

use crate::encoding::Tag;

/// Fixed tags of the packet envelope.
pub mod tags {
    use crate::encoding::Tag;

    /// Outer packet wrapper.
    pub const PKG_TAG: Tag = 0xdb3;
    /// Header subtree.
    pub const HDR_TAG: Tag = 0xbad;
    /// Request/response body subtree; repeatable for batches.
    pub const BDY_TAG: Tag = 0xdad;
    /// Keys not completed, in batch responses.
    pub const UNFINISHED_TAG: Tag = 0xddd;
    /// The k-th part of a split packet has tag `PART_TAG_BASE + k`.
    pub const PART_TAG_BASE: Tag = 0x1ee;
    /// Tags up to here are reserved for parts.
    pub const PART_TAG_LIMIT: Tag = 0x2ee;

    // Header metas.
    pub const HDR_KEY: Tag = 1;
    pub const HDR_CMD: Tag = 2;
    pub const HDR_SUBCMD: Tag = 3;
    pub const HDR_SEQ: Tag = 4;
    pub const HDR_RET: Tag = 7;
    pub const HDR_ERR: Tag = 8;

    // Header children (tags 2001..=2999 are reserved for the envelope).
    pub const HDR_RSP_ADDR: Tag = 2001;
    pub const HDR_ALLOW_SPLIT: Tag = 2002;
    pub const HDR_MAX_PKG_SIZE: Tag = 2003;
    pub const HDR_TOTAL_SPLIT: Tag = 2004;
    pub const HDR_CURR_INDEX: Tag = 2005;
}

/// Default ceiling for one encoded packet.
pub const DEFAULT_MAX_PKG_SIZE: u32 = 64_000;
/// Smallest accepted packet-size override.
pub const MIN_PKG_SIZE: u32 = 128;

/// Legacy frame start/end tokens.
pub(crate) const FRAME_STX: u8 = 0x28;
pub(crate) const FRAME_ETX: u8 = 0x29;

/// First two bytes of a serialized body field (`(BDY_TAG << 3) | 2` as a
/// varint); used to detect the multi-body legacy variant.
pub(crate) const KNV_BODY_MARK: [u8; 2] = [0xEA, 0xDA];

pub(crate) fn is_part_tag(tag: Tag) -> bool {
    (tags::PART_TAG_BASE..=tags::PART_TAG_LIMIT).contains(&tag)
}
