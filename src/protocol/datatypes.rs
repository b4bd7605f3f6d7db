//! Data types shared by every protocol version.
//!
//! The record shapes here are identical across versions except for the
//! branch layout of the `DataValue` union, which is supplied by the caller
//! as a [`DataValueLayout`].

use std::any::Any;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::avro::{AvroReader, AvroWriter};
use crate::error::{EtpError, Result};

/// Capability map attached to a supported protocol.
pub type Capabilities = BTreeMap<String, DataValue>;

/// Capability keyword marking a ChannelStreaming producer as a simple streamer.
pub const SIMPLE_STREAMER: &str = "SimpleStreamer";

/// Protocol number of ChannelStreaming.
pub const CHANNEL_STREAMING_PROTOCOL: i32 = 1;

/// Typed value of a capability or custom data entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl DataValue {
    /// Interpret the value as a boolean the way capability flags are read.
    pub fn as_bool(&self) -> bool {
        match self {
            DataValue::Boolean(b) => *b,
            DataValue::Int(i) => *i != 0,
            DataValue::Long(l) => *l != 0,
            DataValue::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

/// Union branch indices of `DataValue.item` for one protocol version.
///
/// Branches not listed (typed arrays, sparse arrays) are rejected on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataValueLayout {
    pub null: i64,
    pub boolean: i64,
    pub int: i64,
    pub long: i64,
    pub float: i64,
    pub double: i64,
    pub string: i64,
    pub bytes: i64,
}

impl DataValueLayout {
    /// Write a `DataValue` record (single union field).
    pub fn write(&self, writer: &mut AvroWriter, value: &DataValue) {
        match value {
            DataValue::Null => writer.write_union_index(self.null),
            DataValue::Boolean(v) => {
                writer.write_union_index(self.boolean);
                writer.write_boolean(*v);
            }
            DataValue::Int(v) => {
                writer.write_union_index(self.int);
                writer.write_int(*v);
            }
            DataValue::Long(v) => {
                writer.write_union_index(self.long);
                writer.write_long(*v);
            }
            DataValue::Float(v) => {
                writer.write_union_index(self.float);
                writer.write_float(*v);
            }
            DataValue::Double(v) => {
                writer.write_union_index(self.double);
                writer.write_double(*v);
            }
            DataValue::String(v) => {
                writer.write_union_index(self.string);
                writer.write_string(v);
            }
            DataValue::Bytes(v) => {
                writer.write_union_index(self.bytes);
                writer.write_bytes(v);
            }
        }
    }

    /// Read a `DataValue` record.
    pub fn read(&self, reader: &mut AvroReader<'_>) -> Result<DataValue> {
        let index = reader.read_union_index()?;
        let value = match index {
            i if i == self.null => DataValue::Null,
            i if i == self.boolean => DataValue::Boolean(reader.read_boolean()?),
            i if i == self.int => DataValue::Int(reader.read_int()?),
            i if i == self.long => DataValue::Long(reader.read_long()?),
            i if i == self.float => DataValue::Float(reader.read_float()?),
            i if i == self.double => DataValue::Double(reader.read_double()?),
            i if i == self.string => DataValue::String(reader.read_string()?),
            i if i == self.bytes => DataValue::Bytes(reader.read_bytes()?),
            other => {
                return Err(EtpError::Decode(format!(
                    "unsupported DataValue branch {}",
                    other
                )))
            }
        };
        Ok(value)
    }

    pub fn write_capabilities(&self, writer: &mut AvroWriter, map: &Capabilities) {
        writer.write_map(map, |w, v| self.write(w, v));
    }

    pub fn read_capabilities(&self, reader: &mut AvroReader<'_>) -> Result<Capabilities> {
        reader.read_map(|r| self.read(r))
    }
}

/// Protocol version record `{major, minor, revision, patch}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: i32,
    pub minor: i32,
    pub revision: i32,
    pub patch: i32,
}

impl Version {
    pub const fn new(major: i32, minor: i32, revision: i32, patch: i32) -> Self {
        Self {
            major,
            minor,
            revision,
            patch,
        }
    }

    pub fn write(&self, writer: &mut AvroWriter) {
        writer.write_int(self.major);
        writer.write_int(self.minor);
        writer.write_int(self.revision);
        writer.write_int(self.patch);
    }

    pub fn read(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            major: reader.read_int()?,
            minor: reader.read_int()?,
            revision: reader.read_int()?,
            patch: reader.read_int()?,
        })
    }
}

/// One (protocol, role, capabilities) entry exchanged during negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedProtocol {
    pub protocol: i32,
    pub protocol_version: Version,
    pub role: String,
    pub protocol_capabilities: Capabilities,
}

impl SupportedProtocol {
    pub fn new(protocol: i32, protocol_version: Version, role: impl Into<String>) -> Self {
        Self {
            protocol,
            protocol_version,
            role: role.into(),
            protocol_capabilities: Capabilities::new(),
        }
    }

    /// Protocol number matches and role matches case-insensitively.
    pub fn matches(&self, protocol: i32, role: &str) -> bool {
        self.protocol == protocol && self.role.eq_ignore_ascii_case(role)
    }

    pub fn write(&self, writer: &mut AvroWriter, layout: &DataValueLayout) {
        writer.write_int(self.protocol);
        self.protocol_version.write(writer);
        writer.write_string(&self.role);
        layout.write_capabilities(writer, &self.protocol_capabilities);
    }

    pub fn read(reader: &mut AvroReader<'_>, layout: &DataValueLayout) -> Result<Self> {
        Ok(Self {
            protocol: reader.read_int()?,
            protocol_version: Version::read(reader)?,
            role: reader.read_string()?,
            protocol_capabilities: layout.read_capabilities(reader)?,
        })
    }
}

/// Queries over a negotiated protocol list.
pub trait SupportedProtocolsExt {
    /// Whether the list contains the protocol and role combination.
    fn contains_role(&self, protocol: i32, role: &str) -> bool;

    /// Whether the producer advertises itself as a simple streamer.
    fn is_simple_streamer(&self) -> bool;
}

impl SupportedProtocolsExt for [SupportedProtocol] {
    fn contains_role(&self, protocol: i32, role: &str) -> bool {
        self.iter().any(|p| p.matches(protocol, role))
    }

    fn is_simple_streamer(&self) -> bool {
        self.iter()
            .filter(|p| p.protocol == CHANNEL_STREAMING_PROTOCOL)
            .flat_map(|p| p.protocol_capabilities.iter())
            .any(|(key, value)| key.eq_ignore_ascii_case(SIMPLE_STREAMER) && value.as_bool())
    }
}

/// Version-independent error descriptor (code + message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&EtpError> for ErrorInfo {
    fn from(err: &EtpError) -> Self {
        match err {
            EtpError::ProtocolViolation { code, message }
            | EtpError::RemoteException { code, message } => ErrorInfo::new(*code, message.clone()),
            other => ErrorInfo::new(other.error_code(), other.to_string()),
        }
    }
}

/// Anything that can describe an error as code + message.
///
/// Version adapters downcast through `as_any` to recognise their own native
/// exception messages and reuse them unchanged.
pub trait ErrorDescriptor: Send + Sync {
    fn code(&self) -> i32;
    fn message(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

impl ErrorDescriptor for ErrorInfo {
    fn code(&self) -> i32 {
        self.code
    }

    fn message(&self) -> &str {
        &self.message
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Convert a list into the index-keyed map form used by request messages.
pub fn to_index_map<T: Clone>(items: &[T]) -> BTreeMap<String, T> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| (i.to_string(), item.clone()))
        .collect()
}

/// Flatten an index-keyed map back into a list, ordered by numeric key.
///
/// Keys that are not numbers sort after the numbered ones, by name.
pub fn from_index_map<T>(map: BTreeMap<String, T>) -> Vec<T> {
    let mut entries: Vec<(Option<u64>, String, T)> = map
        .into_iter()
        .map(|(key, value)| (key.parse().ok(), key, value))
        .collect();
    entries.sort_by(|a, b| match (a.0, b.0) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.1.cmp(&b.1),
    });
    entries.into_iter().map(|(_, _, value)| value).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAYOUT: DataValueLayout = DataValueLayout {
        null: 0,
        boolean: 1,
        int: 2,
        long: 3,
        float: 4,
        double: 5,
        string: 6,
        bytes: 7,
    };

    #[test]
    fn test_data_value_union_index_written_first() {
        let mut w = AvroWriter::new();
        LAYOUT.write(&mut w, &DataValue::Boolean(true));
        assert_eq!(w.into_bytes().as_ref(), &[0x02, 0x01]);
    }

    #[test]
    fn test_unknown_branch_rejected() {
        let bytes = [0x20u8]; // branch 16
        let mut r = AvroReader::new(&bytes);
        assert!(LAYOUT.read(&mut r).is_err());
    }

    #[test]
    fn test_role_match_is_case_insensitive() {
        let p = SupportedProtocol::new(4, Version::new(1, 2, 0, 0), "Store");
        assert!(p.matches(4, "store"));
        assert!(p.matches(4, "STORE"));
        assert!(!p.matches(4, "customer"));
        assert!(!p.matches(3, "store"));

        let list = vec![p];
        assert!(list.contains_role(4, "sToRe"));
    }

    #[test]
    fn test_simple_streamer_capability() {
        let mut producer = SupportedProtocol::new(1, Version::new(1, 1, 0, 0), "producer");
        assert!(!vec![producer.clone()].is_simple_streamer());

        producer
            .protocol_capabilities
            .insert("simplestreamer".to_string(), DataValue::Boolean(true));
        assert!(vec![producer.clone()].is_simple_streamer());

        producer
            .protocol_capabilities
            .insert("simplestreamer".to_string(), DataValue::Boolean(false));
        assert!(!vec![producer].is_simple_streamer());
    }

    #[test]
    fn test_supported_protocol_record() {
        let mut p = SupportedProtocol::new(14, Version::new(1, 2, 0, 0), "store");
        p.protocol_capabilities
            .insert("MaxResponseCount".to_string(), DataValue::Long(1000));
        let mut w = AvroWriter::new();
        p.write(&mut w, &LAYOUT);
        let bytes = w.into_bytes();
        let mut r = AvroReader::new(&bytes);
        assert_eq!(SupportedProtocol::read(&mut r, &LAYOUT).unwrap(), p);
    }

    #[test]
    fn test_from_index_map_orders_numerically() {
        let mut map = BTreeMap::new();
        for (i, v) in ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k"].iter().enumerate() {
            map.insert(i.to_string(), v.to_string());
        }
        map.insert("extra".to_string(), "z".to_string());
        let items = from_index_map(map);
        assert_eq!(items[1], "b");
        assert_eq!(items[10], "k");
        assert_eq!(items[11], "z");
    }

    #[test]
    fn test_to_index_map() {
        let map = to_index_map(&["a".to_string(), "b".to_string()]);
        assert_eq!(map.get("0").map(String::as_str), Some("a"));
        assert_eq!(map.get("1").map(String::as_str), Some("b"));
    }

    #[test]
    fn test_error_info_from_error() {
        let info = ErrorInfo::from(&EtpError::Decode("bad".into()));
        assert_eq!(info.code, crate::error::error_codes::INVALID_MESSAGE);
    }
}
