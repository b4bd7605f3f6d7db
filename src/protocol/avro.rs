//! Avro binary encoding primitives.
//!
//! Headers and bodies on the wire are Avro binary records:
//!
//! ```text
//! int / long   zig-zag varint
//! boolean      1 byte (0 or 1)
//! float        4 bytes little endian
//! double       8 bytes little endian
//! bytes/string long length + raw bytes
//! array / map  blocks of (long count, items...) terminated by a 0 count
//! union        long branch index + value
//! fixed(N)     N raw bytes
//! ```
//!
//! Records are written field by field in schema order through [`AvroEncode`]
//! and read back through [`AvroDecode`].

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{EtpError, Result};

/// Maximum number of bytes a zig-zag encoded long can occupy.
const MAX_VARINT_LEN: usize = 10;

/// Upper bound on a single collection block, guards against hostile counts.
const MAX_BLOCK_ITEMS: i64 = 1 << 24;

/// A value that can write itself as an Avro record.
///
/// Object safe so that version adapters can hand out boxed control messages.
pub trait AvroEncode: Send + Sync {
    /// Write all fields in schema order.
    fn encode(&self, writer: &mut AvroWriter);
}

/// A value that can be read back from an Avro record.
pub trait AvroDecode: Sized {
    /// Read all fields in schema order.
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self>;
}

/// Encode a record into a fresh buffer.
pub fn to_bytes<T: AvroEncode + ?Sized>(value: &T) -> Bytes {
    let mut writer = AvroWriter::new();
    value.encode(&mut writer);
    writer.into_bytes()
}

/// Decode a record that must span the whole slice.
pub fn from_slice<T: AvroDecode>(data: &[u8]) -> Result<T> {
    let mut reader = AvroReader::new(data);
    let value = T::decode(&mut reader)?;
    if reader.remaining() != 0 {
        return Err(EtpError::Decode(format!(
            "{} trailing bytes after record",
            reader.remaining()
        )));
    }
    Ok(value)
}

/// Append-only Avro binary writer.
#[derive(Debug, Default)]
pub struct AvroWriter {
    buf: BytesMut,
}

impl AvroWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(128),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and take the buffer.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_int(&mut self, value: i32) {
        self.write_long(i64::from(value));
    }

    pub fn write_long(&mut self, value: i64) {
        let mut n = ((value << 1) ^ (value >> 63)) as u64;
        while n >= 0x80 {
            self.buf.put_u8((n as u8) | 0x80);
            n >>= 7;
        }
        self.buf.put_u8(n as u8);
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    pub fn write_float(&mut self, value: f32) {
        self.buf.put_f32_le(value);
    }

    pub fn write_double(&mut self, value: f64) {
        self.buf.put_f64_le(value);
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_long(value.len() as i64);
        self.buf.put_slice(value);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_fixed(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn write_uuid(&mut self, value: &Uuid) {
        self.write_fixed(value.as_bytes());
    }

    /// Write the branch index of a union.
    pub fn write_union_index(&mut self, index: i64) {
        self.write_long(index);
    }

    /// Write an optional value as the union `[null, T]`.
    pub fn write_optional<T>(&mut self, value: Option<&T>, mut write: impl FnMut(&mut Self, &T)) {
        match value {
            None => self.write_union_index(0),
            Some(v) => {
                self.write_union_index(1);
                write(self, v);
            }
        }
    }

    /// Write an array as a single block.
    pub fn write_array<T>(&mut self, items: &[T], mut write: impl FnMut(&mut Self, &T)) {
        if !items.is_empty() {
            self.write_long(items.len() as i64);
            for item in items {
                write(self, item);
            }
        }
        self.write_long(0);
    }

    /// Write a string-keyed map as a single block.
    pub fn write_map<T>(&mut self, map: &BTreeMap<String, T>, mut write: impl FnMut(&mut Self, &T)) {
        if !map.is_empty() {
            self.write_long(map.len() as i64);
            for (key, value) in map {
                self.write_string(key);
                write(self, value);
            }
        }
        self.write_long(0);
    }

    /// Write a nested record.
    pub fn write_record<T: AvroEncode + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }
}

/// Cursor-style Avro binary reader over a borrowed slice.
#[derive(Debug)]
pub struct AvroReader<'a> {
    buf: &'a [u8],
}

impl<'a> AvroReader<'a> {
    /// Create a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// The unread tail of the input.
    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(EtpError::Decode(format!(
                "unexpected end of input reading {} ({} of {} bytes available)",
                what,
                self.buf.remaining(),
                n
            )));
        }
        Ok(())
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let mut n: u64 = 0;
        for i in 0..MAX_VARINT_LEN {
            self.need(1, "varint")?;
            let byte = self.buf.get_u8();
            n |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(((n >> 1) as i64) ^ -((n & 1) as i64));
            }
        }
        Err(EtpError::Decode("varint longer than 10 bytes".to_string()))
    }

    pub fn read_int(&mut self) -> Result<i32> {
        let value = self.read_long()?;
        i32::try_from(value).map_err(|_| EtpError::Decode(format!("int out of range: {}", value)))
    }

    pub fn read_boolean(&mut self) -> Result<bool> {
        self.need(1, "boolean")?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(EtpError::Decode(format!("invalid boolean byte {:#04x}", other))),
        }
    }

    pub fn read_float(&mut self) -> Result<f32> {
        self.need(4, "float")?;
        Ok(self.buf.get_f32_le())
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.need(8, "double")?;
        Ok(self.buf.get_f64_le())
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_long()?;
        let len = usize::try_from(len)
            .map_err(|_| EtpError::Decode(format!("negative length {}", len)))?;
        self.need(len, "bytes")?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        String::from_utf8(raw).map_err(|e| EtpError::Decode(format!("invalid UTF-8 string: {}", e)))
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.need(N, "fixed")?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn read_uuid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.read_fixed::<16>()?))
    }

    pub fn read_union_index(&mut self) -> Result<i64> {
        self.read_long()
    }

    /// Read the union `[null, T]`.
    pub fn read_optional<T>(
        &mut self,
        mut read: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<Option<T>> {
        match self.read_union_index()? {
            0 => Ok(None),
            1 => Ok(Some(read(self)?)),
            other => Err(EtpError::Decode(format!("invalid optional branch {}", other))),
        }
    }

    /// Block count, skipping the byte-size hint that follows a negative count.
    fn read_block_count(&mut self) -> Result<usize> {
        let mut count = self.read_long()?;
        if count < 0 {
            count = count
                .checked_neg()
                .ok_or_else(|| EtpError::Decode(format!("invalid block count {}", count)))?;
            let _block_size = self.read_long()?;
        }
        if count > MAX_BLOCK_ITEMS {
            return Err(EtpError::Decode(format!("collection block too large: {}", count)));
        }
        Ok(count as usize)
    }

    pub fn read_array<T>(&mut self, mut read: impl FnMut(&mut Self) -> Result<T>) -> Result<Vec<T>> {
        let mut items = Vec::new();
        loop {
            let count = self.read_block_count()?;
            if count == 0 {
                return Ok(items);
            }
            items.reserve(count.min(1024));
            for _ in 0..count {
                items.push(read(self)?);
            }
        }
    }

    pub fn read_map<T>(
        &mut self,
        mut read: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<BTreeMap<String, T>> {
        let mut map = BTreeMap::new();
        loop {
            let count = self.read_block_count()?;
            if count == 0 {
                return Ok(map);
            }
            for _ in 0..count {
                let key = self.read_string()?;
                let value = read(self)?;
                map.insert(key, value);
            }
        }
    }

    pub fn read_record<T: AvroDecode>(&mut self) -> Result<T> {
        T::decode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_long(value: i64) -> Vec<u8> {
        let mut w = AvroWriter::new();
        w.write_long(value);
        w.into_bytes().to_vec()
    }

    #[test]
    fn test_zigzag_reference_values() {
        // Values from the Avro specification.
        assert_eq!(encode_long(0), vec![0x00]);
        assert_eq!(encode_long(-1), vec![0x01]);
        assert_eq!(encode_long(1), vec![0x02]);
        assert_eq!(encode_long(-2), vec![0x03]);
        assert_eq!(encode_long(2), vec![0x04]);
        assert_eq!(encode_long(-64), vec![0x7f]);
        assert_eq!(encode_long(64), vec![0x80, 0x01]);
    }

    #[test]
    fn test_long_extremes() {
        for value in [i64::MIN, i64::MAX, i64::from(i32::MIN), 1_000_000_007] {
            let bytes = encode_long(value);
            let mut r = AvroReader::new(&bytes);
            assert_eq!(r.read_long().unwrap(), value);
            assert_eq!(r.remaining(), 0);
        }
    }

    #[test]
    fn test_int_out_of_range() {
        let bytes = encode_long(i64::from(i32::MAX) + 1);
        let mut r = AvroReader::new(&bytes);
        assert!(r.read_int().is_err());
    }

    #[test]
    fn test_truncated_string() {
        let mut w = AvroWriter::new();
        w.write_string("hello");
        let bytes = w.into_bytes();
        let mut r = AvroReader::new(&bytes[..4]);
        let err = r.read_string().unwrap_err();
        assert!(err.to_string().contains("unexpected end of input"));
    }

    #[test]
    fn test_overlong_varint() {
        let bytes = [0xffu8; 11];
        let mut r = AvroReader::new(&bytes);
        assert!(r.read_long().is_err());
    }

    #[test]
    fn test_array_and_map_blocks() {
        let mut w = AvroWriter::new();
        w.write_array(&["a".to_string(), "b".to_string()], |w, s| w.write_string(s));
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), 7i32);
        w.write_map(&map, |w, v| w.write_int(*v));
        w.write_array::<i32>(&[], |w, v| w.write_int(*v));
        let bytes = w.into_bytes();

        let mut r = AvroReader::new(&bytes);
        assert_eq!(r.read_array(|r| r.read_string()).unwrap(), vec!["a", "b"]);
        assert_eq!(r.read_map(|r| r.read_int()).unwrap(), map);
        assert!(r.read_array(|r| r.read_int()).unwrap().is_empty());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_negative_block_count_with_size() {
        // Block of 2 ints written with the optional byte-size form.
        let mut w = AvroWriter::new();
        w.write_long(-2);
        w.write_long(2);
        w.write_int(5);
        w.write_int(6);
        w.write_long(0);
        let bytes = w.into_bytes();

        let mut r = AvroReader::new(&bytes);
        assert_eq!(r.read_array(|r| r.read_int()).unwrap(), vec![5, 6]);
    }

    #[test]
    fn test_min_block_count_is_rejected() {
        // zig-zag encoding of i64::MIN
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        let mut r = AvroReader::new(&bytes);
        assert!(matches!(r.read_array(|r| r.read_int()), Err(EtpError::Decode(_))));

        let mut r = AvroReader::new(&bytes);
        assert!(matches!(r.read_map(|r| r.read_int()), Err(EtpError::Decode(_))));
    }

    #[test]
    fn test_optional_and_uuid() {
        let id = Uuid::new_v4();
        let mut w = AvroWriter::new();
        w.write_optional(Some(&id), |w, v| w.write_uuid(v));
        w.write_optional::<Uuid>(None, |w, v| w.write_uuid(v));
        let bytes = w.into_bytes();

        let mut r = AvroReader::new(&bytes);
        assert_eq!(r.read_optional(|r| r.read_uuid()).unwrap(), Some(id));
        assert_eq!(r.read_optional(|r| r.read_uuid()).unwrap(), None);
    }

    #[test]
    fn test_invalid_boolean() {
        let bytes = [2u8];
        let mut r = AvroReader::new(&bytes);
        assert!(r.read_boolean().is_err());
    }
}
