//! Protocol module - wire primitives, message header and shared data types.
//!
//! This module implements the envelope layer of the session:
//! - Avro binary encoding primitives
//! - Message header with flag accessors
//! - Records common to every protocol version

pub mod avro;
mod datatypes;
mod header;

pub use avro::{AvroDecode, AvroEncode, AvroReader, AvroWriter};
pub use datatypes::{
    from_index_map, to_index_map, Capabilities, DataValue, DataValueLayout, ErrorDescriptor, ErrorInfo,
    SupportedProtocol, SupportedProtocolsExt, Version, CHANNEL_STREAMING_PROTOCOL,
    SIMPLE_STREAMER,
};
pub use header::{core_message_types, flags, MessageHeader, CORE_PROTOCOL};
