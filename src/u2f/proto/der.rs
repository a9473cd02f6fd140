//! Minimal ASN.1 DER reader and writer.
//!
//! Only the element kinds needed to walk and emit attestation certificates
//! are supported. http://en.wikipedia.org/wiki/X.690

use crate::u2f::proto::constants::{ASN1_DEFINITE_LONG_FOLLOWING_MASK, ASN1_DEFINITE_SHORT_MASK, ASN1_MAX_FOLLOWING_LEN_BYTES};

/// Identifier octets of the element kinds this codec understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    Boolean = 0x01,
    Integer = 0x02,
    BitString = 0x03,
    OctetString = 0x04,
    ObjectIdentifier = 0x06,
    PrintableString = 0x13,
    UtcTime = 0x17,
    Sequence = 0x30,
    Set = 0x31,
    Context0 = 0xa0,
    Context1 = 0xa1,
    Context2 = 0xa2,
    Context3 = 0xa3,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DerError {
    #[error("truncated input")]
    TruncatedInput,
    #[error("unexpected tag, expected {expected:#04x} found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("invalid length")]
    InvalidLength,
    #[error("invalid object identifier")]
    InvalidObjectIdentifier,
}

/// Read position over an immutable buffer.
///
/// A failed read leaves the offset where it was.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        ByteCursor { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unread bytes, without consuming them.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.offset..]
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.offset).copied()
    }

    pub fn read(&mut self, n: usize) -> Result<&'a [u8], DerError> {
        let end = self
            .offset
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(DerError::TruncatedInput)?;

        let bytes = &self.data[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8, DerError> {
        Ok(self.read(1)?[0])
    }

    /// Returns `(header_len, content_len)` of the element at the current offset.
    fn element_header(&self, tag: Tag) -> Result<(usize, usize), DerError> {
        let mut probe = self.clone();

        let found = probe.read_u8()?;
        if found != tag as u8 {
            return Err(DerError::UnexpectedTag {
                expected: tag as u8,
                found,
            });
        }

        let first = probe.read_u8()?;
        let len = if first & ASN1_DEFINITE_SHORT_MASK == 0 {
            first as usize
        } else {
            let following_bytes = (first & ASN1_DEFINITE_LONG_FOLLOWING_MASK) as usize;

            // Zero following bytes is the BER indefinite form, never valid DER
            if following_bytes == 0 || following_bytes > ASN1_MAX_FOLLOWING_LEN_BYTES {
                return Err(DerError::InvalidLength);
            }

            let mut len: usize = 0;
            for byte in probe.read(following_bytes)? {
                len = len
                    .checked_mul(256)
                    .and_then(|l| l.checked_add(*byte as usize))
                    .ok_or(DerError::InvalidLength)?;
            }
            len
        };

        if probe.remaining() < len {
            return Err(DerError::TruncatedInput);
        }

        Ok((probe.offset - self.offset, len))
    }

    /// Reads one element with the given tag and returns a cursor over its content.
    pub fn read_element(&mut self, tag: Tag) -> Result<ByteCursor<'a>, DerError> {
        let (header_len, content_len) = self.element_header(tag)?;
        let start = self.offset + header_len;
        let end = start + content_len;

        self.offset = end;
        Ok(ByteCursor::new(&self.data[start..end]))
    }

    /// Reads one element with the given tag and returns it whole, header included.
    pub fn read_raw_element(&mut self, tag: Tag) -> Result<&'a [u8], DerError> {
        let (header_len, content_len) = self.element_header(tag)?;
        self.read(header_len + content_len)
    }

    pub fn read_optional_element(&mut self, tag: Tag) -> Result<Option<ByteCursor<'a>>, DerError> {
        if self.peek() != Some(tag as u8) {
            return Ok(None);
        }

        self.read_element(tag).map(Some)
    }

    pub fn skip_element(&mut self, tag: Tag) -> Result<(), DerError> {
        self.read_element(tag).map(|_| ())
    }

    pub fn read_object_identifier(&mut self) -> Result<Vec<u64>, DerError> {
        let mut probe = self.clone();
        let content = probe.read_element(Tag::ObjectIdentifier)?;
        let arcs = decode_arcs(content.rest())?;

        *self = probe;
        Ok(arcs)
    }

    /// Reads an INTEGER and returns its magnitude without leading zero bytes.
    pub fn read_big_int(&mut self) -> Result<&'a [u8], DerError> {
        let mut probe = self.clone();
        let content = probe.read_element(Tag::Integer)?.rest();

        if content.is_empty() {
            return Err(DerError::InvalidLength);
        }

        let start = content.iter().position(|b| *b != 0).unwrap_or(content.len());

        *self = probe;
        Ok(&content[start..])
    }

    pub fn read_octet_string(&mut self) -> Result<&'a [u8], DerError> {
        Ok(self.read_element(Tag::OctetString)?.rest())
    }

    /// Returns the unused-bit count and the payload of a BIT STRING.
    pub fn read_bit_string(&mut self) -> Result<(u8, &'a [u8]), DerError> {
        let mut probe = self.clone();
        let mut content = probe.read_element(Tag::BitString)?;
        let unused_bits = content.read_u8().map_err(|_| DerError::InvalidLength)?;

        *self = probe;
        Ok((unused_bits, content.rest()))
    }
}

fn decode_arcs(bytes: &[u8]) -> Result<Vec<u64>, DerError> {
    if bytes.is_empty() {
        return Err(DerError::InvalidObjectIdentifier);
    }

    let mut groups = Vec::new();
    let mut value: u64 = 0;
    let mut pending = false;

    for byte in bytes {
        if value > (u64::MAX >> 7) {
            return Err(DerError::InvalidObjectIdentifier);
        }

        value = (value << 7) | (byte & 0x7f) as u64;
        pending = byte & 0x80 != 0;

        if !pending {
            groups.push(value);
            value = 0;
        }
    }

    if pending {
        return Err(DerError::TruncatedInput);
    }

    let first = groups[0];
    let mut arcs = Vec::with_capacity(groups.len() + 1);
    match first {
        0..=39 => arcs.extend_from_slice(&[0, first]),
        40..=79 => arcs.extend_from_slice(&[1, first - 40]),
        _ => arcs.extend_from_slice(&[2, first - 80]),
    }
    arcs.extend_from_slice(&groups[1..]);

    Ok(arcs)
}

/// Append-only DER output buffer.
#[derive(Debug, Clone, Default)]
pub struct ByteBuilder {
    buf: Vec<u8>,
}

/// Closes a nested element into its parent when dropped, whatever the
/// nested writer returned.
struct ElementScope<'p> {
    parent: &'p mut ByteBuilder,
    tag: Tag,
    child: ByteBuilder,
}

impl Drop for ElementScope<'_> {
    fn drop(&mut self) {
        let content = std::mem::take(&mut self.child.buf);

        self.parent.write_u8(self.tag as u8);
        self.parent.write_length(content.len());
        self.parent.write_raw_bytes(&content);
    }
}

impl ByteBuilder {
    pub fn new() -> Self {
        ByteBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    pub fn write_raw_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_length(&mut self, len: usize) {
        if len <= ASN1_DEFINITE_LONG_FOLLOWING_MASK as usize {
            self.write_u8(len as u8);
            return;
        }

        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();

        self.write_u8(ASN1_DEFINITE_SHORT_MASK | (bytes.len() - skip) as u8);
        self.write_raw_bytes(&bytes[skip..]);
    }

    /// Writes `f`'s output as the content of a `tag` element.
    pub fn write_element<F>(&mut self, tag: Tag, f: F) -> Result<(), DerError>
    where
        F: FnOnce(&mut ByteBuilder) -> Result<(), DerError>,
    {
        let mut scope = ElementScope {
            parent: self,
            tag,
            child: ByteBuilder::new(),
        };

        f(&mut scope.child)
    }

    pub fn write_integer(&mut self, value: u64) -> Result<(), DerError> {
        self.write_big_int_from_bytes(&value.to_be_bytes())
    }

    /// Writes an unsigned big-endian magnitude as a non-negative INTEGER.
    pub fn write_big_int_from_bytes(&mut self, bytes: &[u8]) -> Result<(), DerError> {
        let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        let magnitude = &bytes[start..];

        self.write_element(Tag::Integer, |b| {
            if magnitude.first().map_or(true, |high| high & 0x80 != 0) {
                b.write_u8(0x00);
            }
            b.write_raw_bytes(magnitude);
            Ok(())
        })
    }

    pub fn write_object_identifier(&mut self, arcs: &[u64]) -> Result<(), DerError> {
        let (first, second) = match arcs {
            [first, second, ..] if *first <= 2 && (*first == 2 || *second < 40) => (*first, *second),
            _ => return Err(DerError::InvalidObjectIdentifier),
        };
        let head = (first * 40).checked_add(second).ok_or(DerError::InvalidObjectIdentifier)?;

        self.write_element(Tag::ObjectIdentifier, |b| {
            b.write_base128(head);
            for arc in &arcs[2..] {
                b.write_base128(*arc);
            }
            Ok(())
        })
    }

    fn write_base128(&mut self, mut value: u64) {
        let mut groups = [0u8; 10];
        let mut i = groups.len();

        loop {
            i -= 1;
            groups[i] = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                break;
            }
        }

        let last = groups.len() - 1;
        for group in &mut groups[i..last] {
            *group |= 0x80;
        }

        self.write_raw_bytes(&groups[i..]);
    }

    pub fn write_printable_string(&mut self, s: &str) -> Result<(), DerError> {
        self.write_element(Tag::PrintableString, |b| {
            b.write_raw_bytes(s.as_bytes());
            Ok(())
        })
    }

    pub fn write_utc_time(&mut self, s: &str) -> Result<(), DerError> {
        self.write_element(Tag::UtcTime, |b| {
            b.write_raw_bytes(s.as_bytes());
            Ok(())
        })
    }

    pub fn write_octet_string(&mut self, bytes: &[u8]) -> Result<(), DerError> {
        self.write_element(Tag::OctetString, |b| {
            b.write_raw_bytes(bytes);
            Ok(())
        })
    }

    /// Writes a BIT STRING with no unused bits.
    pub fn write_bit_string(&mut self, bytes: &[u8]) -> Result<(), DerError> {
        self.write_element(Tag::BitString, |b| {
            b.write_u8(0x00);
            b.write_raw_bytes(bytes);
            Ok(())
        })
    }
}

/// Encodes an ECDSA signature as `SEQUENCE { INTEGER r, INTEGER s }`.
pub fn encode_ecdsa_signature(r: &[u8], s: &[u8]) -> Result<Vec<u8>, DerError> {
    let mut b = ByteBuilder::new();
    b.write_element(Tag::Sequence, |seq| {
        seq.write_big_int_from_bytes(r)?;
        seq.write_big_int_from_bytes(s)
    })?;
    Ok(b.into_bytes())
}
