//! Message header and flag semantics.
//!
//! Every frame starts with an Avro-encoded header:
//! ```text
//! ┌──────────┬─────────────┬───────────────┬────────────┬──────────────┐
//! │ protocol │ messageType │ correlationId │ messageId  │ messageFlags │
//! │ int      │ int         │ long          │ long       │ int          │
//! └──────────┴─────────────┴───────────────┴────────────┴──────────────┘
//! ```
//!
//! The header is never compressed; the `Compressed` flag describes the body
//! that follows it.

use serde::Serialize;

use super::avro::{AvroDecode, AvroEncode, AvroReader, AvroWriter};
use crate::error::Result;

/// Protocol number of the control protocol.
pub const CORE_PROTOCOL: i32 = 0;

/// Message types of the control protocol shared by every version.
pub mod core_message_types {
    /// Client asks to open a session.
    pub const REQUEST_SESSION: i32 = 1;
    /// Server accepts the session.
    pub const OPEN_SESSION: i32 = 2;
    /// Either side closes the session.
    pub const CLOSE_SESSION: i32 = 5;
    /// Error notification, valid on any protocol.
    pub const PROTOCOL_EXCEPTION: i32 = 1000;
    /// Generic acknowledgement, valid on any protocol.
    pub const ACKNOWLEDGE: i32 = 1001;
}

/// Message flag bits.
pub mod flags {
    /// No flags.
    pub const NONE: i32 = 0x00;
    /// The logical message spans several frames.
    pub const MULTI_PART: i32 = 0x01;
    /// Last frame of a multi-part message (or a complete single message).
    pub const FINAL_PART: i32 = 0x02;
    /// Shorthand for a single-frame multi-part answer.
    pub const MULTI_PART_AND_FINAL_PART: i32 = MULTI_PART | FINAL_PART;
    /// The request produced no data.
    pub const NO_DATA: i32 = 0x04;
    /// The body following the header is gzip compressed.
    pub const COMPRESSED: i32 = 0x08;
    /// The sender asks for an Acknowledge reply.
    pub const ACKNOWLEDGE: i32 = 0x10;
    /// A header extension record follows the header.
    pub const HAS_HEADER_EXTENSION: i32 = 0x20;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: i32, flag: i32) -> bool {
        flags & flag == flag
    }
}

/// Decoded message envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    /// Protocol number.
    pub protocol: i32,
    /// Message type within the protocol.
    pub message_type: i32,
    /// Message id of the request this message answers (0 = none).
    pub correlation_id: i64,
    /// Session-unique message id assigned by the sender.
    pub message_id: i64,
    /// Flag bits (see [`flags`]).
    pub message_flags: i32,
}

impl MessageHeader {
    /// Create a header template; the session assigns `message_id` on send.
    pub fn new(protocol: i32, message_type: i32, correlation_id: i64, message_flags: i32) -> Self {
        Self {
            protocol,
            message_type,
            correlation_id,
            message_id: 0,
            message_flags,
        }
    }

    #[inline]
    pub fn has_flag(&self, flag: i32) -> bool {
        flags::has_flag(self.message_flags, flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: i32) {
        self.message_flags |= flag;
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: i32) {
        self.message_flags &= !flag;
    }

    #[inline]
    pub fn is_multi_part(&self) -> bool {
        self.has_flag(flags::MULTI_PART)
    }

    #[inline]
    pub fn is_final_part(&self) -> bool {
        self.has_flag(flags::FINAL_PART)
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.has_flag(flags::COMPRESSED)
    }

    #[inline]
    pub fn is_no_data(&self) -> bool {
        self.has_flag(flags::NO_DATA)
    }

    #[inline]
    pub fn wants_acknowledge(&self) -> bool {
        self.has_flag(flags::ACKNOWLEDGE)
    }

    /// Whether this message completes the exchange it belongs to.
    ///
    /// A multi-part message is complete only on its final part.
    #[inline]
    pub fn completes_exchange(&self) -> bool {
        !self.is_multi_part() || self.is_final_part()
    }

    /// Whether this is a message of the control protocol.
    #[inline]
    pub fn is_core(&self) -> bool {
        self.protocol == CORE_PROTOCOL
    }

    /// Whether this is a protocol exception (any protocol).
    #[inline]
    pub fn is_protocol_exception(&self) -> bool {
        self.message_type == core_message_types::PROTOCOL_EXCEPTION
    }

    /// Whether this is an acknowledge (any protocol).
    #[inline]
    pub fn is_acknowledge(&self) -> bool {
        self.message_type == core_message_types::ACKNOWLEDGE
    }
}

impl AvroEncode for MessageHeader {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_int(self.protocol);
        writer.write_int(self.message_type);
        writer.write_long(self.correlation_id);
        writer.write_long(self.message_id);
        writer.write_int(self.message_flags);
    }
}

impl AvroDecode for MessageHeader {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            protocol: reader.read_int()?,
            message_type: reader.read_int()?,
            correlation_id: reader.read_long()?,
            message_id: reader.read_long()?,
            message_flags: reader.read_int()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::avro::{from_slice, to_bytes};

    #[test]
    fn test_header_wire_bytes() {
        let header = MessageHeader {
            protocol: 4,
            message_type: 8,
            correlation_id: 3,
            message_id: 64,
            message_flags: flags::MULTI_PART_AND_FINAL_PART,
        };
        let bytes = to_bytes(&header);
        // 4 -> 0x08, 8 -> 0x10, 3 -> 0x06, 64 -> 0x80 0x01, 3 -> 0x06
        assert_eq!(bytes.as_ref(), &[0x08, 0x10, 0x06, 0x80, 0x01, 0x06]);
        assert_eq!(from_slice::<MessageHeader>(&bytes).unwrap(), header);
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(flags::MULTI_PART, 0x01);
        assert_eq!(flags::FINAL_PART, 0x02);
        assert_eq!(flags::MULTI_PART_AND_FINAL_PART, 0x03);
        assert_eq!(flags::NO_DATA, 0x04);
        assert_eq!(flags::COMPRESSED, 0x08);
        assert_eq!(flags::ACKNOWLEDGE, 0x10);
    }

    #[test]
    fn test_has_flag_requires_all_bits() {
        assert!(flags::has_flag(flags::MULTI_PART_AND_FINAL_PART, flags::FINAL_PART));
        assert!(!flags::has_flag(flags::MULTI_PART, flags::MULTI_PART_AND_FINAL_PART));
    }

    #[test]
    fn test_set_and_clear_flags() {
        let mut header = MessageHeader::new(4, 1, 0, flags::NONE);
        header.set_flag(flags::COMPRESSED);
        assert!(header.is_compressed());
        header.clear_flag(flags::COMPRESSED);
        assert!(!header.is_compressed());
    }

    #[test]
    fn test_completes_exchange() {
        assert!(MessageHeader::new(4, 4, 1, flags::NONE).completes_exchange());
        assert!(!MessageHeader::new(4, 4, 1, flags::MULTI_PART).completes_exchange());
        assert!(MessageHeader::new(4, 8, 1, flags::MULTI_PART_AND_FINAL_PART).completes_exchange());
    }

    #[test]
    fn test_control_accessors() {
        let header = MessageHeader::new(14, core_message_types::ACKNOWLEDGE, 9, flags::NONE);
        assert!(header.is_acknowledge());
        assert!(!header.is_protocol_exception());
        assert!(!header.is_core());
    }
}
