//! ETP 1.1 records shared by several protocols.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::{decode_content_string, encode_content_string};
use crate::error::Result;
use crate::protocol::{
    AvroDecode, AvroEncode, AvroReader, AvroWriter, DataValueLayout, SupportedProtocol,
};

/// `DataValue.item` branch order in the 1.1 schema. Branch 6 is
/// `ArrayOfDouble`, which is not supported.
pub const DATA_VALUE_LAYOUT: DataValueLayout = DataValueLayout {
    null: 0,
    double: 1,
    float: 2,
    int: 3,
    long: 4,
    string: 5,
    boolean: 7,
    bytes: 8,
};

pub(crate) fn write_protocols(writer: &mut AvroWriter, protocols: &[SupportedProtocol]) {
    writer.write_array(protocols, |w, p| p.write(w, &DATA_VALUE_LAYOUT));
}

pub(crate) fn read_protocols(reader: &mut AvroReader<'_>) -> Result<Vec<SupportedProtocol>> {
    reader.read_array(|r| SupportedProtocol::read(r, &DATA_VALUE_LAYOUT))
}

pub(crate) fn write_strings(writer: &mut AvroWriter, items: &[String]) {
    writer.write_array(items, |w, s| w.write_string(s));
}

pub(crate) fn read_strings(reader: &mut AvroReader<'_>) -> Result<Vec<String>> {
    reader.read_array(|r| r.read_string())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub content_type: String,
    pub name: String,
    pub channel_subscribable: bool,
    pub custom_data: BTreeMap<String, String>,
    pub resource_type: String,
    /// Child count, -1 when unknown.
    pub has_children: i32,
    pub uuid: Option<String>,
    pub last_changed: i64,
    pub object_notifiable: bool,
}

impl Resource {
    pub fn new(uri: impl Into<String>, content_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_type: content_type.into(),
            name: name.into(),
            resource_type: "DataObject".to_string(),
            has_children: -1,
            ..Default::default()
        }
    }
}

impl AvroEncode for Resource {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.uri);
        writer.write_string(&self.content_type);
        writer.write_string(&self.name);
        writer.write_boolean(self.channel_subscribable);
        writer.write_map(&self.custom_data, |w, v| w.write_string(v));
        writer.write_string(&self.resource_type);
        writer.write_int(self.has_children);
        writer.write_optional(self.uuid.as_ref(), |w, v| w.write_string(v));
        writer.write_long(self.last_changed);
        writer.write_boolean(self.object_notifiable);
    }
}

impl AvroDecode for Resource {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            uri: reader.read_string()?,
            content_type: reader.read_string()?,
            name: reader.read_string()?,
            channel_subscribable: reader.read_boolean()?,
            custom_data: reader.read_map(|r| r.read_string())?,
            resource_type: reader.read_string()?,
            has_children: reader.read_int()?,
            uuid: reader.read_optional(|r| r.read_string())?,
            last_changed: reader.read_long()?,
            object_notifiable: reader.read_boolean()?,
        })
    }
}

/// A data object with its (optionally gzipped) content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataObject {
    pub resource: Resource,
    /// `"gzip"` or empty.
    pub content_encoding: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl DataObject {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            ..Default::default()
        }
    }

    /// Content as text, decompressed according to `content_encoding`.
    ///
    /// Leading and trailing control characters are trimmed. Any encoding
    /// other than gzip fails with `UnsupportedEncoding`.
    pub fn get_string(&self) -> Result<String> {
        decode_content_string(&self.data, &self.content_encoding)
    }

    /// Store `text` as UTF-8 content, gzipped when `compress` is set.
    pub fn set_string(&mut self, text: &str, compress: bool) -> Result<()> {
        let (data, encoding) = encode_content_string(text, compress)?;
        self.data = data;
        self.content_encoding = encoding;
        Ok(())
    }
}

impl AvroEncode for DataObject {
    fn encode(&self, writer: &mut AvroWriter) {
        self.resource.encode(writer);
        writer.write_string(&self.content_encoding);
        writer.write_bytes(&self.data);
    }
}

impl AvroDecode for DataObject {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            resource: reader.read_record()?,
            content_encoding: reader.read_string()?,
            data: reader.read_bytes()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EtpError;
    use crate::protocol::avro::{from_slice, to_bytes};
    use crate::protocol::{DataValue, Version};

    #[test]
    fn test_capability_uses_v11_branches() {
        let mut protocol = SupportedProtocol::new(1, Version::new(1, 1, 0, 0), "producer");
        protocol
            .protocol_capabilities
            .insert("SimpleStreamer".to_string(), DataValue::Boolean(true));

        let mut w = AvroWriter::new();
        write_protocols(&mut w, &[protocol.clone()]);
        let bytes = w.into_bytes();
        // boolean is branch 7 (zig-zag 14), then the map and array terminators
        assert_eq!(&bytes[bytes.len() - 4..], &[14, 1, 0, 0]);

        let decoded = read_protocols(&mut AvroReader::new(&bytes)).unwrap();
        assert_eq!(decoded, vec![protocol]);
    }

    #[test]
    fn test_set_string_compressed() {
        let mut object = DataObject::new(Resource::new(
            "eml://witsml14/well(1)",
            "application/x-witsml+xml;version=1.4.1.1;type=well",
            "Well 1",
        ));
        object.set_string("<wells/>", true).unwrap();
        assert_eq!(object.content_encoding, "gzip");
        assert_ne!(object.data, b"<wells/>");
        assert_eq!(object.get_string().unwrap(), "<wells/>");

        let decoded: DataObject = from_slice(&to_bytes(&object)).unwrap();
        assert_eq!(decoded, object);
    }

    #[test]
    fn test_set_string_plain() {
        let mut object = DataObject::default();
        object.set_string("<wells/>", false).unwrap();
        assert!(object.content_encoding.is_empty());
        assert_eq!(object.data, b"<wells/>");
    }

    #[test]
    fn test_get_string_rejects_unknown_encoding() {
        let object = DataObject {
            content_encoding: "deflate".to_string(),
            data: b"x".to_vec(),
            ..Default::default()
        };
        assert!(matches!(object.get_string(), Err(EtpError::UnsupportedEncoding(_))));
    }
}
