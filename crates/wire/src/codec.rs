//! Length-prefixed, field-tagged encoding primitives.
//!
//! The format is deliberately small: a field key is `(tag << 3) | wire_type`
//! as a varint, followed by either a varint value or a length-prefixed byte
//! string. Writers emit fields in ascending tag order and skip defaults;
//! readers enforce the same order, so `decode(encode(m)) == m` and any two
//! encodings of the same value are byte-identical.

use thiserror::Error;

/// Varint-encoded unsigned integer.
const WIRE_VARINT: u64 = 0;
/// Length-prefixed byte string.
const WIRE_BYTES: u64 = 2;

/// Errors raised while decoding wire data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input")]
    Truncated,

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("unsupported wire type {0}")]
    InvalidWireType(u64),

    #[error("unknown field tag {0}")]
    UnknownField(u32),

    #[error("field tag {0} repeated")]
    DuplicateField(u32),

    #[error("field tag {0} out of order")]
    OutOfOrderField(u32),

    #[error("field tag {0} not valid for {1} messages")]
    UnexpectedField(u32, &'static str),

    #[error("field tag {tag} must be exactly {expected} bytes, got {actual}")]
    BadFieldLength {
        tag: u32,
        expected: usize,
        actual: usize,
    },

    #[error("unknown message type {0}")]
    UnknownMessageType(u64),
}

/// Append a varint to `buf`.
fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Canonical field writer. Callers must emit fields in ascending tag order.
#[derive(Default)]
pub(crate) struct FieldWriter {
    buf: Vec<u8>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a varint field. Zero is the default and is omitted.
    pub fn uint(&mut self, tag: u32, value: u64) {
        if value == 0 {
            return;
        }
        put_varint(&mut self.buf, (u64::from(tag) << 3) | WIRE_VARINT);
        put_varint(&mut self.buf, value);
    }

    /// Write a byte-string field. Empty strings are the default and omitted.
    pub fn bytes(&mut self, tag: u32, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        self.bytes_raw(tag, value);
    }

    /// Write a byte-string field unconditionally, even when empty.
    ///
    /// Used for fixed-width fields whose presence is structural.
    pub fn bytes_raw(&mut self, tag: u32, value: &[u8]) {
        put_varint(&mut self.buf, (u64::from(tag) << 3) | WIRE_BYTES);
        put_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// A decoded field value.
#[derive(Debug)]
pub(crate) enum FieldValue<'a> {
    Uint(u64),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub fn uint(&self) -> Result<u64, WireError> {
        match self {
            FieldValue::Uint(v) => Ok(*v),
            FieldValue::Bytes(_) => Err(WireError::InvalidWireType(WIRE_BYTES)),
        }
    }

    pub fn bytes(&self) -> Result<&'a [u8], WireError> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            FieldValue::Uint(_) => Err(WireError::InvalidWireType(WIRE_VARINT)),
        }
    }
}

/// Field reader enforcing non-decreasing tag order.
///
/// Repetition of the same tag is surfaced to the caller, which decides
/// whether the field is repeatable.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    last_tag: u32,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        FieldReader {
            buf,
            pos: 0,
            last_tag: 0,
        }
    }

    fn varint(&mut self) -> Result<u64, WireError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(WireError::Truncated)?;
            self.pos += 1;
            if shift >= 64 || (shift == 63 && byte > 1) {
                return Err(WireError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read the next field, or `None` at end of input.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, WireError> {
        if self.pos == self.buf.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        let tag = (key >> 3) as u32;
        let wire_type = key & 0x7;
        if tag == 0 {
            return Err(WireError::UnknownField(0));
        }
        if tag < self.last_tag {
            return Err(WireError::OutOfOrderField(tag));
        }
        self.last_tag = tag;

        let value = match wire_type {
            WIRE_VARINT => FieldValue::Uint(self.varint()?),
            WIRE_BYTES => {
                let len = self.varint()? as usize;
                let end = self.pos.checked_add(len).ok_or(WireError::Truncated)?;
                if end > self.buf.len() {
                    return Err(WireError::Truncated);
                }
                let slice = &self.buf[self.pos..end];
                self.pos = end;
                FieldValue::Bytes(slice)
            }
            other => return Err(WireError::InvalidWireType(other)),
        };
        Ok(Some((tag, value)))
    }
}
