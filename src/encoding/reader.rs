//! Stateful field iteration over a serialized message.
//!
//! [`FieldReader`] walks the top-level fields of a message buffer one at a
//! time. Each decoded [`Field`] carries the byte span it occupies so that
//! callers building structure on top (the node engine) can slice the
//! original buffer instead of copying, and can seed size caches from the
//! raw field width without re-evaluating.

use super::wire::{decode_varint, Tag, WireType};
use crate::error::{KnvError, Result};

/// Decoded payload of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldVal<'a> {
    /// Varint, fixed64, or fixed32 payload (fixed32 zero-extended).
    Int(u64),
    Bytes(&'a [u8]),
}

impl<'a> FieldVal<'a> {
    pub fn int(&self) -> u64 {
        match *self {
            FieldVal::Int(v) => v,
            FieldVal::Bytes(_) => 0,
        }
    }

    pub fn bytes(&self) -> &'a [u8] {
        match *self {
            FieldVal::Int(_) => &[],
            FieldVal::Bytes(b) => b,
        }
    }
}

/// One decoded field with its position inside the reader's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field<'a> {
    pub tag: Tag,
    pub wire_type: WireType,
    pub val: FieldVal<'a>,
    /// Span of the whole field (header included) in the source buffer.
    pub span: (usize, usize),
    /// Span of the payload alone; equals `span` end for integer types.
    pub val_span: (usize, usize),
}

impl Field<'_> {
    /// Encoded width of the field, header included.
    pub fn encoded_len(&self) -> usize {
        self.span.1 - self.span.0
    }
}

/// Iterator over the top-level fields of a message buffer.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    end: usize,
    eom: bool,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FieldReader {
            buf,
            pos: 0,
            end: buf.len(),
            eom: false,
        }
    }

    /// The buffer itself starts with a varint length prefix; iteration
    /// covers only the prefixed span. Used for framed sub-messages.
    pub fn new_delimited(buf: &'a [u8]) -> Result<Self> {
        let (len, read) = decode_varint(buf)?;
        let end = read
            .checked_add(len as usize)
            .filter(|&e| e <= buf.len())
            .ok_or(KnvError::InvalidFormat("delimited overflow"))?;
        Ok(FieldReader {
            buf,
            pos: read,
            end,
            eom: false,
        })
    }

    /// True once the buffer has been consumed cleanly (or a zero header
    /// terminated the message early, which is allowed).
    pub fn eom(&self) -> bool {
        self.eom
    }

    /// Current read offset into the source buffer.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    fn take_varint(&mut self) -> Result<u64> {
        let (v, read) = decode_varint(&self.buf[self.pos..self.end])?;
        self.pos += read;
        Ok(v)
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.end - self.pos < count {
            return Err(KnvError::InvalidFormat("end of buffer"));
        }
        let s = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(s)
    }

    /// Decode the next field. `Ok(None)` signals end-of-message, either by
    /// clean buffer exhaustion or by a zero tag header.
    pub fn next_field(&mut self) -> Result<Option<Field<'a>>> {
        if self.pos >= self.end {
            self.eom = true;
            return Ok(None);
        }
        let start = self.pos;
        let header = self.take_varint()?;
        if header == 0 {
            // Allow 0-terminated messages.
            self.eom = true;
            return Ok(None);
        }
        let tag = (header >> 3) as Tag;
        let wire_type = WireType::from_raw((header & 7) as u8)
            .ok_or(KnvError::InvalidFormat("invalid wire type"))?;

        let (val, val_span) = match wire_type {
            WireType::Varint => {
                let vs = self.pos;
                let v = self.take_varint()?;
                (FieldVal::Int(v), (vs, self.pos))
            }
            WireType::Fixed64 => {
                let vs = self.pos;
                let b = self.take(8)?;
                let v = u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
                (FieldVal::Int(v), (vs, self.pos))
            }
            WireType::Fixed32 => {
                let vs = self.pos;
                let b = self.take(4)?;
                let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                (FieldVal::Int(v as u64), (vs, self.pos))
            }
            WireType::Bytes => {
                let len = self.take_varint()?;
                if len > self.remaining() as u64 {
                    return Err(KnvError::InvalidFormat("string overflow"));
                }
                let vs = self.pos;
                let b = self.take(len as usize)?;
                (FieldVal::Bytes(b), (vs, self.pos))
            }
        };

        if self.pos >= self.end {
            self.eom = true;
        }
        Ok(Some(Field {
            tag,
            wire_type,
            val,
            span: (start, self.pos),
            val_span,
        }))
    }

    /// Skip one field of the given wire type without decoding its payload.
    pub fn skip(&mut self, wire_type: WireType) -> Result<()> {
        match wire_type {
            WireType::Varint => {
                self.take_varint()?;
            }
            WireType::Fixed64 => {
                self.take(8)?;
            }
            WireType::Fixed32 => {
                self.take(4)?;
            }
            WireType::Bytes => {
                let len = self.take_varint()?;
                if len > self.remaining() as u64 {
                    return Err(KnvError::InvalidFormat("string overflow"));
                }
                self.take(len as usize)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_mixed_fields() {
        // tag 1 varint 150, tag 2 bytes "hi", tag 3 fixed32, tag 4 fixed64
        let mut buf = vec![0x08, 0x96, 0x01, 0x12, 0x02, b'h', b'i', 0x1D];
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.push(0x21);
        buf.extend_from_slice(&9u64.to_le_bytes());

        let mut r = FieldReader::new(&buf);
        let f = r.next_field().unwrap().unwrap();
        assert_eq!((f.tag, f.val.int()), (1, 150));
        assert_eq!(f.span, (0, 3));
        let f = r.next_field().unwrap().unwrap();
        assert_eq!((f.tag, f.val.bytes()), (2, &b"hi"[..]));
        assert_eq!(f.val_span, (5, 7));
        let f = r.next_field().unwrap().unwrap();
        assert_eq!((f.tag, f.wire_type), (3, WireType::Fixed32));
        assert_eq!(f.val.int(), 7);
        let f = r.next_field().unwrap().unwrap();
        assert_eq!((f.tag, f.wire_type), (4, WireType::Fixed64));
        assert_eq!(f.val.int(), 9);
        assert!(r.next_field().unwrap().is_none());
        assert!(r.eom());
    }

    #[test]
    fn zero_header_ends_message() {
        let buf = [0x08, 0x01, 0x00, 0xFF, 0xFF];
        let mut r = FieldReader::new(&buf);
        assert!(r.next_field().unwrap().is_some());
        assert!(r.next_field().unwrap().is_none());
        assert!(r.eom());
    }

    #[test]
    fn truncated_payload_is_error() {
        // tag 2 bytes claiming 10 bytes with only 2 present
        let buf = [0x12, 0x0A, b'h', b'i'];
        let mut r = FieldReader::new(&buf);
        assert_eq!(
            r.next_field(),
            Err(KnvError::InvalidFormat("string overflow"))
        );
        assert!(!r.eom());
    }

    #[test]
    fn unknown_wire_type_is_error() {
        // header (1 << 3) | 3
        let buf = [0x0B, 0x00];
        let mut r = FieldReader::new(&buf);
        assert!(r.next_field().is_err());
    }

    #[test]
    fn delimited_reader_bounds_iteration() {
        // length 3, then tag 1 varint 5, then trailing garbage
        let buf = [0x03, 0x08, 0x05, 0x00, 0xFF, 0xFF];
        let mut r = FieldReader::new_delimited(&buf).unwrap();
        let f = r.next_field().unwrap().unwrap();
        assert_eq!((f.tag, f.val.int()), (1, 5));
        // third byte (0x00) is inside the delimited span; ends cleanly
        assert!(r.next_field().unwrap().is_none());
        assert!(r.eom());
    }

    #[test]
    fn delimited_overflow_rejected() {
        let buf = [0x09, 0x08, 0x05];
        assert!(FieldReader::new_delimited(&buf).is_err());
    }
}
