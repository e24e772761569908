//! # Protobuf Wire Codec
//!
//! Allocation-free encode/decode of the protobuf wire format, operating
//! directly on byte slices without any `.proto` schema. This is the layer
//! everything else in the crate is built on: the node engine layers
//! structure and ownership on top, the protocol envelope layers framing.
//!
//! The codec recognizes the four wire types:
//!
//! | Wire type | Raw | Payload                         |
//! |-----------|-----|---------------------------------|
//! | Varint    | 0   | base-128 little-endian integer  |
//! | Fixed64   | 1   | 8 bytes little-endian           |
//! | Bytes     | 2   | varint length + payload         |
//! | Fixed32   | 5   | 4 bytes little-endian           |
//!
//! A field header encodes `(tag << 3) | wire_type` as a varint. Decoding a
//! zero header is treated as a permissive end-of-message. Signed integers
//! use zigzag; float/double borrow the fixed32/fixed64 slots.
//!
//! Every function here is pure slice-in/slice-out; no heap allocation is
//! performed anywhere in this module.

mod reader;
mod wire;
mod writer;

pub use reader::{Field, FieldReader, FieldVal};
pub use wire::{
    decode_varint, field_len, tag_len, varint_len, zigzag_decode, zigzag_encode, Tag, WireType,
};
pub use writer::FieldWriter;
