//! Codec module - frame encoding/decoding with optional body compression.
//!
//! A frame is an Avro-encoded [`MessageHeader`] immediately followed by the
//! Avro-encoded body. The body may be gzip-compressed independently of the
//! header, in which case the header carries the `Compressed` flag.
//!
//! # Example
//!
//! ```
//! use etp_session::codec::{decode_frame, decode_body, encode_message};
//! use etp_session::protocol::{flags, MessageHeader};
//! use etp_session::v12::store::GetDataObjects;
//!
//! let body = GetDataObjects::new(vec!["eml:///well(1)".to_string()], "xml");
//! let mut header = MessageHeader::new(4, 1, 0, flags::NONE);
//! header.message_id = 2;
//!
//! let bytes = encode_message(&body, &mut header, Some("gzip")).unwrap();
//! assert!(header.is_compressed());
//!
//! let (decoded_header, raw_body) = decode_frame(&bytes).unwrap();
//! let decoded: GetDataObjects = decode_body(&decoded_header, &raw_body).unwrap();
//! assert_eq!(decoded, body);
//! ```

mod compression;
mod json;

pub use compression::{
    can_compress_message_body, decode_content, decode_content_string, encode_content,
    encode_content_string, gunzip, gunzip_limited, gzip, is_gzip, DEFAULT_MAX_INFLATED_SIZE,
    GZIP_ENCODING,
};
pub use json::{to_json, JsonConfig};

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::Result;
use crate::protocol::avro::{self, AvroDecode, AvroEncode, AvroReader, AvroWriter};
use crate::protocol::{flags, MessageHeader};

/// Encode `header` followed by `body` into one frame.
///
/// When the header is eligible and `compression` names gzip, the
/// `Compressed` flag is set on `header` before it is written, so the caller's
/// header always matches what went on the wire.
pub fn encode_message<T: AvroEncode + ?Sized>(
    body: &T,
    header: &mut MessageHeader,
    compression: Option<&str>,
) -> Result<Bytes> {
    let compress = can_compress_message_body(header, false) && compression.is_some_and(is_gzip);
    if compress {
        header.set_flag(flags::COMPRESSED);
    }

    let mut header_writer = AvroWriter::new();
    header.encode(&mut header_writer);

    let header_bytes = header_writer.into_bytes();
    let encoded_body = avro::to_bytes(body);
    let wire_body: Cow<'_, [u8]> = if compress {
        Cow::Owned(gzip(&encoded_body)?)
    } else {
        Cow::Borrowed(&encoded_body)
    };

    let mut frame = BytesMut::with_capacity(header_bytes.len() + wire_body.len());
    frame.put_slice(&header_bytes);
    frame.put_slice(&wire_body);
    Ok(frame.freeze())
}

/// Split a frame into its decoded header and the raw (possibly compressed)
/// body bytes.
pub fn decode_frame(data: &[u8]) -> Result<(MessageHeader, Bytes)> {
    let mut reader = AvroReader::new(data);
    let header = MessageHeader::decode(&mut reader)?;
    Ok((header, Bytes::copy_from_slice(reader.rest())))
}

/// Return the plain body bytes, decompressing when the header says so.
pub fn body_bytes<'a>(header: &MessageHeader, body: &'a [u8]) -> Result<Cow<'a, [u8]>> {
    body_bytes_limited(header, body, DEFAULT_MAX_INFLATED_SIZE)
}

/// Like [`body_bytes`], with a ceiling on the decompressed size.
pub fn body_bytes_limited<'a>(
    header: &MessageHeader,
    body: &'a [u8],
    limit: usize,
) -> Result<Cow<'a, [u8]>> {
    if can_compress_message_body(header, true) {
        Ok(Cow::Owned(gunzip_limited(body, limit)?))
    } else {
        Ok(Cow::Borrowed(body))
    }
}

/// Decode a body of type `T` that belongs to `header`.
pub fn decode_body<T: AvroDecode>(header: &MessageHeader, body: &[u8]) -> Result<T> {
    decode_body_limited(header, body, DEFAULT_MAX_INFLATED_SIZE)
}

/// Decode a body of type `T`, refusing compressed bodies that inflate past
/// `limit` bytes.
pub fn decode_body_limited<T: AvroDecode>(
    header: &MessageHeader,
    body: &[u8],
    limit: usize,
) -> Result<T> {
    let plain = body_bytes_limited(header, body, limit)?;
    avro::from_slice(&plain)
}

/// Decode a full frame into header and typed body.
pub fn decode_message<T: AvroDecode>(data: &[u8]) -> Result<(MessageHeader, T)> {
    let (header, body) = decode_frame(data)?;
    let message = decode_body(&header, &body)?;
    Ok((header, message))
}
