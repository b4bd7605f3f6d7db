//! ETP 1.2 records shared by several protocols.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::{
    AvroDecode, AvroEncode, AvroReader, AvroWriter, DataValue, DataValueLayout, ErrorInfo,
    SupportedProtocol,
};

/// `DataValue.item` branch order in the 1.2 schema.
pub const DATA_VALUE_LAYOUT: DataValueLayout = DataValueLayout {
    null: 0,
    boolean: 1,
    int: 2,
    long: 3,
    float: 4,
    double: 5,
    bytes: 16,
    string: 17,
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

pub(crate) fn write_string_map(writer: &mut AvroWriter, map: &BTreeMap<String, String>) {
    writer.write_map(map, |w, s| w.write_string(s));
}

pub(crate) fn read_string_map(reader: &mut AvroReader<'_>) -> Result<BTreeMap<String, String>> {
    reader.read_map(|r| r.read_string())
}

/// `ErrorInfo` record: `{message, code}`.
pub(crate) fn write_error_info(writer: &mut AvroWriter, error: &ErrorInfo) {
    writer.write_string(&error.message);
    writer.write_int(error.code);
}

pub(crate) fn read_error_info(reader: &mut AvroReader<'_>) -> Result<ErrorInfo> {
    let message = reader.read_string()?;
    let code = reader.read_int()?;
    Ok(ErrorInfo { code, message })
}

/// Current time in microseconds since the Unix epoch.
pub(crate) fn now_micros() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or_default()
}

/// Description of a data object in a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub alternate_uris: Vec<String>,
    pub name: String,
    /// Microseconds since the epoch.
    pub last_changed: i64,
    pub store_last_write: i64,
    pub custom_data: BTreeMap<String, DataValue>,
}

impl Resource {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

impl AvroEncode for Resource {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.uri);
        write_strings(writer, &self.alternate_uris);
        writer.write_string(&self.name);
        writer.write_long(self.last_changed);
        writer.write_long(self.store_last_write);
        DATA_VALUE_LAYOUT.write_capabilities(writer, &self.custom_data);
    }
}

impl AvroDecode for Resource {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            uri: reader.read_string()?,
            alternate_uris: read_strings(reader)?,
            name: reader.read_string()?,
            last_changed: reader.read_long()?,
            store_last_write: reader.read_long()?,
            custom_data: DATA_VALUE_LAYOUT.read_capabilities(reader)?,
        })
    }
}

/// A data object with its content.
///
/// Content is either inline in `data` or, when `blob_id` is set, delivered
/// separately as Chunk messages carrying that blob id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataObject {
    pub resource: Resource,
    pub format: String,
    pub blob_id: Option<Uuid>,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl DataObject {
    pub fn new(resource: Resource, format: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            resource,
            format: format.into(),
            blob_id: None,
            data: data.into(),
        }
    }

    /// A data object whose content follows as the blob `blob_id`.
    pub fn with_blob(resource: Resource, format: impl Into<String>, blob_id: Uuid) -> Self {
        Self {
            resource,
            format: format.into(),
            blob_id: Some(blob_id),
            data: Vec::new(),
        }
    }

    /// Inline content as text.
    pub fn get_string(&self) -> String {
        String::from_utf8_lossy(&self.data)
            .trim_matches(|c: char| (c as u32) < 20)
            .to_string()
    }

    pub fn set_string(&mut self, text: &str) {
        self.data = text.as_bytes().to_vec();
    }
}

impl AvroEncode for DataObject {
    fn encode(&self, writer: &mut AvroWriter) {
        self.resource.encode(writer);
        writer.write_string(&self.format);
        writer.write_optional(self.blob_id.as_ref(), |w, id| w.write_uuid(id));
        writer.write_bytes(&self.data);
    }
}

impl AvroDecode for DataObject {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            resource: reader.read_record()?,
            format: reader.read_string()?,
            blob_id: reader.read_optional(|r| r.read_uuid())?,
            data: reader.read_bytes()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::avro::{from_slice, to_bytes};

    #[test]
    fn test_string_branch_index() {
        let mut w = AvroWriter::new();
        DATA_VALUE_LAYOUT.write(&mut w, &DataValue::String("a".into()));
        // branch 17 zig-zags to 34
        assert_eq!(w.into_bytes().as_ref(), &[34, 2, b'a']);
    }

    #[test]
    fn test_data_object_with_blob() {
        let mut resource = Resource::new("eml:///witsml20.Well(1)", "Well 1");
        resource
            .custom_data
            .insert("depth".to_string(), DataValue::Double(1520.5));
        let blob = Uuid::new_v4();
        let object = DataObject::with_blob(resource, "xml", blob);

        let decoded: DataObject = from_slice(&to_bytes(&object)).unwrap();
        assert_eq!(decoded, object);
        assert_eq!(decoded.blob_id, Some(blob));
    }

    #[test]
    fn test_error_info_field_order() {
        let mut w = AvroWriter::new();
        write_error_info(&mut w, &ErrorInfo::new(4, "x"));
        assert_eq!(w.into_bytes().as_ref(), &[2, b'x', 8]);
    }

    #[test]
    fn test_get_string_trims_control_chars() {
        let mut object = DataObject::default();
        object.set_string("\u{1}<well/>\n");
        assert_eq!(object.get_string(), "<well/>");
    }
}
