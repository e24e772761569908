//! Field writer over a caller-provided slice.
//!
//! The writer never grows its buffer: the node engine sizes output exactly
//! from the eval cache before serializing, so an overflow here means the
//! cache disagrees with reality and must surface as an error, not a
//! reallocation.

use super::wire::{encode_varint, varint_len, Tag, WireType};
use crate::error::{KnvError, Result};

pub struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        FieldWriter { buf, pos: 0 }
    }

    /// Bytes written so far.
    pub fn written(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn put_varint_raw(&mut self, value: u64) -> Result<()> {
        if self.remaining() < varint_len(value) as usize {
            return Err(KnvError::SizeMismatch("buffer overflow"));
        }
        self.pos += encode_varint(value, &mut self.buf[self.pos..]);
        Ok(())
    }

    fn put_slice(&mut self, data: &[u8]) -> Result<()> {
        if self.remaining() < data.len() {
            return Err(KnvError::SizeMismatch("buffer overflow"));
        }
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        Ok(())
    }

    fn put_tag(&mut self, tag: Tag, wire_type: WireType) -> Result<()> {
        self.put_varint_raw(((tag as u64) << 3) | wire_type.raw() as u64)
    }

    pub fn put_varint(&mut self, tag: Tag, value: u64) -> Result<()> {
        self.put_tag(tag, WireType::Varint)?;
        self.put_varint_raw(value)
    }

    pub fn put_fixed32(&mut self, tag: Tag, value: u32) -> Result<()> {
        self.put_tag(tag, WireType::Fixed32)?;
        self.put_slice(&value.to_le_bytes())
    }

    pub fn put_fixed64(&mut self, tag: Tag, value: u64) -> Result<()> {
        self.put_tag(tag, WireType::Fixed64)?;
        self.put_slice(&value.to_le_bytes())
    }

    pub fn put_bytes(&mut self, tag: Tag, data: &[u8]) -> Result<()> {
        self.put_tag(tag, WireType::Bytes)?;
        self.put_varint_raw(data.len() as u64)?;
        self.put_slice(data)
    }

    /// Emit only the header and length prefix of a bytes field; the caller
    /// serializes the payload in place afterwards.
    pub fn put_bytes_head(&mut self, tag: Tag, payload_len: u32) -> Result<()> {
        self.put_tag(tag, WireType::Bytes)?;
        self.put_varint_raw(payload_len as u64)
    }

    /// Emit an already-encoded span verbatim.
    pub fn put_raw(&mut self, data: &[u8]) -> Result<()> {
        self.put_slice(data)
    }

    /// Emit a complete integer-typed field.
    pub fn put_int_field(&mut self, tag: Tag, wire_type: WireType, value: u64) -> Result<()> {
        match wire_type {
            WireType::Varint => self.put_varint(tag, value),
            WireType::Fixed64 => self.put_fixed64(tag, value),
            WireType::Fixed32 => self.put_fixed32(tag, value as u32),
            WireType::Bytes => Err(KnvError::TypeMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{field_len, FieldReader, FieldVal};

    #[test]
    fn writes_match_reader() {
        let mut buf = [0u8; 64];
        let mut w = FieldWriter::new(&mut buf);
        w.put_varint(1, 150).unwrap();
        w.put_bytes(2, b"hi").unwrap();
        w.put_fixed32(3, 7).unwrap();
        w.put_fixed64(4, 9).unwrap();
        let len = w.written();

        let mut r = FieldReader::new(&buf[..len]);
        assert_eq!(r.next_field().unwrap().unwrap().val, FieldVal::Int(150));
        assert_eq!(
            r.next_field().unwrap().unwrap().val,
            FieldVal::Bytes(b"hi")
        );
        assert_eq!(r.next_field().unwrap().unwrap().val, FieldVal::Int(7));
        assert_eq!(r.next_field().unwrap().unwrap().val, FieldVal::Int(9));
        assert!(r.next_field().unwrap().is_none());
    }

    #[test]
    fn written_lengths_match_eval() {
        let mut buf = [0u8; 64];
        let mut w = FieldWriter::new(&mut buf);
        w.put_varint(3501, 19801010).unwrap();
        assert_eq!(
            w.written() as u32,
            field_len(3501, WireType::Varint, 19801010, 0)
        );

        let mut buf = [0u8; 64];
        let mut w = FieldWriter::new(&mut buf);
        w.put_bytes(101, b"Shaneyu").unwrap();
        assert_eq!(w.written() as u32, field_len(101, WireType::Bytes, 0, 7));
    }

    #[test]
    fn overflow_is_reported_not_panicked() {
        let mut buf = [0u8; 3];
        let mut w = FieldWriter::new(&mut buf);
        assert!(w.put_bytes(1, b"too long for three").is_err());
    }

    #[test]
    fn bytes_head_then_raw_equals_put_bytes() {
        let mut a = [0u8; 16];
        let mut w = FieldWriter::new(&mut a);
        w.put_bytes(9, b"abc").unwrap();
        let la = w.written();

        let mut b = [0u8; 16];
        let mut w = FieldWriter::new(&mut b);
        w.put_bytes_head(9, 3).unwrap();
        w.put_raw(b"abc").unwrap();
        let lb = w.written();

        assert_eq!(&a[..la], &b[..lb]);
    }
}
