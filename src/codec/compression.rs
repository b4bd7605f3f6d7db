//! Compression eligibility and gzip helpers.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{EtpError, Result};
use crate::protocol::{core_message_types, MessageHeader, CORE_PROTOCOL};

/// The only body/content encoding understood by this crate.
pub const GZIP_ENCODING: &str = "gzip";

/// Ceiling on inflated output when the caller sets none.
pub const DEFAULT_MAX_INFLATED_SIZE: usize = 256 * 1024 * 1024;

/// Whether `encoding` names gzip (case-insensitive).
pub fn is_gzip(encoding: &str) -> bool {
    encoding.eq_ignore_ascii_case(GZIP_ENCODING)
}

/// Decide whether the body described by `header` may be compressed.
///
/// RequestSession and OpenSession on the core protocol are never compressed,
/// nor are Acknowledge and ProtocolException on any protocol. Otherwise, with
/// `check_flags` the answer is the header's `Compressed` bit (decode side);
/// without it the answer is `true` (encode side, the negotiated setting
/// decides).
pub fn can_compress_message_body(header: &MessageHeader, check_flags: bool) -> bool {
    if header.protocol == CORE_PROTOCOL
        && (header.message_type == core_message_types::REQUEST_SESSION
            || header.message_type == core_message_types::OPEN_SESSION)
    {
        return false;
    }

    if header.message_type == core_message_types::ACKNOWLEDGE
        || header.message_type == core_message_types::PROTOCOL_EXCEPTION
    {
        return false;
    }

    !check_flags || header.is_compressed()
}

/// Gzip `data` into a new buffer.
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 32), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Gunzip `data` into a new buffer, up to [`DEFAULT_MAX_INFLATED_SIZE`].
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    gunzip_limited(data, DEFAULT_MAX_INFLATED_SIZE)
}

/// Gunzip `data`, failing once the output would exceed `limit` bytes.
///
/// Corrupt or oversized input is a decode error, not an I/O failure of the
/// session.
pub fn gunzip_limited(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    GzDecoder::new(data)
        .take((limit as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| EtpError::Decode(format!("gzip body: {}", e)))?;
    if out.len() > limit {
        return Err(EtpError::Decode(format!(
            "gzip body inflates beyond {} bytes",
            limit
        )));
    }
    Ok(out)
}

/// Encode object content, optionally compressing it.
///
/// Returns the bytes to store and the content encoding to advertise
/// (`"gzip"` or empty).
pub fn encode_content(data: &[u8], compress: bool) -> Result<(Vec<u8>, String)> {
    if compress {
        Ok((gzip(data)?, GZIP_ENCODING.to_string()))
    } else {
        Ok((data.to_vec(), String::new()))
    }
}

/// Decode object content according to its advertised encoding.
pub fn decode_content(data: &[u8], encoding: &str) -> Result<Vec<u8>> {
    if encoding.trim().is_empty() {
        return Ok(data.to_vec());
    }
    if !is_gzip(encoding) {
        return Err(EtpError::UnsupportedEncoding(encoding.to_string()));
    }
    gunzip(data)
}

/// Encode a string as object content (UTF-8, optionally gzipped).
pub fn encode_content_string(text: &str, compress: bool) -> Result<(Vec<u8>, String)> {
    if text.trim().is_empty() {
        return encode_content(&[], compress);
    }
    encode_content(text.as_bytes(), compress)
}

/// Decode object content as a string, trimming control characters.
pub fn decode_content_string(data: &[u8], encoding: &str) -> Result<String> {
    let raw = decode_content(data, encoding)?;
    let text = String::from_utf8_lossy(&raw);
    Ok(text.trim_matches(|c: char| (c as u32) < 20).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    fn header(protocol: i32, message_type: i32, message_flags: i32) -> MessageHeader {
        MessageHeader::new(protocol, message_type, 0, message_flags)
    }

    #[test]
    fn test_session_establishment_never_compressed() {
        for message_type in [core_message_types::REQUEST_SESSION, core_message_types::OPEN_SESSION] {
            assert!(!can_compress_message_body(&header(0, message_type, flags::NONE), false));
            assert!(!can_compress_message_body(&header(0, message_type, flags::COMPRESSED), true));
        }
    }

    #[test]
    fn test_establishment_types_on_other_protocols_are_eligible() {
        // Message type 1 on Store is GetDataObjects, not RequestSession.
        assert!(can_compress_message_body(&header(4, 1, flags::NONE), false));
    }

    #[test]
    fn test_universal_control_messages_never_compressed() {
        for protocol in [0, 1, 4, 14] {
            for message_type in [core_message_types::ACKNOWLEDGE, core_message_types::PROTOCOL_EXCEPTION] {
                assert!(!can_compress_message_body(&header(protocol, message_type, flags::NONE), false));
                assert!(!can_compress_message_body(
                    &header(protocol, message_type, flags::COMPRESSED),
                    true
                ));
            }
        }
    }

    #[test]
    fn test_check_flags_returns_compressed_bit() {
        assert!(can_compress_message_body(&header(4, 4, flags::COMPRESSED), true));
        assert!(can_compress_message_body(
            &header(4, 4, flags::COMPRESSED | flags::MULTI_PART),
            true
        ));
        assert!(!can_compress_message_body(&header(4, 4, flags::MULTI_PART_AND_FINAL_PART), true));
        assert!(can_compress_message_body(&header(4, 4, flags::NONE), false));
        assert!(can_compress_message_body(&header(0, core_message_types::CLOSE_SESSION, flags::NONE), false));
    }

    #[test]
    fn test_gzip_roundtrip() {
        let data = b"<well uid='w1'>".repeat(100);
        let compressed = gzip(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(gunzip(&compressed).unwrap(), data);
    }

    #[test]
    fn test_gunzip_stops_at_limit() {
        let compressed = gzip(&vec![0u8; 1 << 20]).unwrap();
        assert!(compressed.len() < 4096);

        let err = gunzip_limited(&compressed, 64 * 1024).unwrap_err();
        assert!(matches!(err, EtpError::Decode(_)));
        assert_eq!(gunzip_limited(&compressed, 1 << 20).unwrap().len(), 1 << 20);
    }

    #[test]
    fn test_gunzip_garbage_is_decode_error() {
        let err = gunzip(b"definitely not gzip").unwrap_err();
        assert!(matches!(err, EtpError::Decode(_)));
    }

    #[test]
    fn test_content_string_gzip() {
        let (data, encoding) = encode_content_string("<well/>", true).unwrap();
        assert_eq!(encoding, "gzip");
        assert_eq!(decode_content_string(&data, "GZIP").unwrap(), "<well/>");
    }

    #[test]
    fn test_content_string_plain_trims_control_chars() {
        let (data, encoding) = encode_content_string("\u{1}<well/>\n", false).unwrap();
        assert!(encoding.is_empty());
        assert_eq!(decode_content_string(&data, "").unwrap(), "<well/>");
    }

    #[test]
    fn test_content_blank_string_is_empty() {
        let (data, encoding) = encode_content_string("   ", false).unwrap();
        assert!(data.is_empty());
        assert!(encoding.is_empty());
    }

    #[test]
    fn test_unsupported_content_encoding() {
        let err = decode_content(b"abc", "br").unwrap_err();
        assert!(matches!(err, EtpError::UnsupportedEncoding(ref e) if e == "br"));
    }
}
