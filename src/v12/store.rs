//! ETP 1.2 Store protocol (4): object retrieval, update and deletion.
//!
//! Object content too large for one message is sent as a blob: the
//! response carries a [`DataObject`] with a `blob_id`, and the bytes follow
//! in Chunk messages correlated to the same request.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::datatypes::{read_string_map, write_string_map, DataObject};
use super::protocols;
use crate::error::{EtpError, Result};
use crate::handler::{
    BoxFuture, EventSubscribers, HandlerBase, MessageTable, ProtocolEvent, ProtocolHandler,
};
use crate::protocol::{
    flags, from_index_map, to_index_map, AvroDecode, AvroEncode, AvroReader, AvroWriter,
    MessageHeader,
};
use crate::session::{Blob, PendingResponse, Session};

pub mod message_types {
    pub const GET_DATA_OBJECTS: i32 = 1;
    pub const PUT_DATA_OBJECTS: i32 = 2;
    pub const DELETE_DATA_OBJECTS: i32 = 3;
    pub const GET_DATA_OBJECTS_RESPONSE: i32 = 4;
    pub const CHUNK: i32 = 8;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetDataObjects {
    pub uris: BTreeMap<String, String>,
    pub format: String,
}

impl GetDataObjects {
    pub fn new(uris: Vec<String>, format: impl Into<String>) -> Self {
        Self {
            uris: to_index_map(&uris),
            format: format.into(),
        }
    }
}

impl AvroEncode for GetDataObjects {
    fn encode(&self, writer: &mut AvroWriter) {
        write_string_map(writer, &self.uris);
        writer.write_string(&self.format);
    }
}

impl AvroDecode for GetDataObjects {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            uris: read_string_map(reader)?,
            format: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetDataObjectsResponse {
    pub data_objects: BTreeMap<String, DataObject>,
}

impl GetDataObjectsResponse {
    /// Objects in the order they were listed.
    pub fn objects(&self) -> Vec<DataObject> {
        from_index_map(self.data_objects.clone())
    }
}

impl AvroEncode for GetDataObjectsResponse {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_map(&self.data_objects, |w, o| o.encode(w));
    }
}

impl AvroDecode for GetDataObjectsResponse {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            data_objects: reader.read_map(|r| r.read_record())?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutDataObjects {
    pub data_objects: BTreeMap<String, DataObject>,
}

impl AvroEncode for PutDataObjects {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_map(&self.data_objects, |w, o| o.encode(w));
    }
}

impl AvroDecode for PutDataObjects {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            data_objects: reader.read_map(|r| r.read_record())?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteDataObjects {
    pub uris: BTreeMap<String, String>,
}

impl AvroEncode for DeleteDataObjects {
    fn encode(&self, writer: &mut AvroWriter) {
        write_string_map(writer, &self.uris);
    }
}

impl AvroDecode for DeleteDataObjects {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            uris: read_string_map(reader)?,
        })
    }
}

/// One slice of a blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub blob_id: Uuid,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl AvroEncode for Chunk {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_uuid(&self.blob_id);
        writer.write_bytes(&self.data);
    }
}

impl AvroDecode for Chunk {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            blob_id: reader.read_uuid()?,
            data: reader.read_bytes()?,
        })
    }
}

/// Store protocol, customer role.
pub struct StoreCustomerHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    pub on_get_data_objects_response: EventSubscribers<ProtocolEvent<GetDataObjectsResponse>>,
    pub on_chunk: EventSubscribers<ProtocolEvent<Chunk>>,
    /// A blob was fully reassembled from its chunks.
    pub on_blob: EventSubscribers<ProtocolEvent<Blob>>,
}

impl StoreCustomerHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new()
            .on::<GetDataObjectsResponse, _>(
                message_types::GET_DATA_OBJECTS_RESPONSE,
                "GetDataObjectsResponse",
                |handler, _session, header, message| {
                    Box::pin(handler.handle_get_data_objects_response(header, message))
                },
            )
            .on::<Chunk, _>(message_types::CHUNK, "Chunk", |handler, session, header, message| {
                Box::pin(handler.handle_chunk(session, header, message))
            });
        Self {
            base: HandlerBase::new(protocols::STORE, "customer", "store"),
            table,
            on_get_data_objects_response: EventSubscribers::new(),
            on_chunk: EventSubscribers::new(),
            on_blob: EventSubscribers::new(),
        }
    }

    /// Send GetDataObjects. Returns the message id or a negative status.
    pub async fn get_data_objects(&self, uris: Vec<String>, format: &str) -> Result<i64> {
        let header = self
            .base
            .create_header(message_types::GET_DATA_OBJECTS, 0, flags::FINAL_PART)?;
        self.base.send(header, &GetDataObjects::new(uris, format)).await
    }

    /// Send GetDataObjects and register for its response.
    ///
    /// The response resolves with the final GetDataObjectsResponse, or with
    /// the reassembled blob when the content follows as chunks.
    pub async fn request_data_objects(
        &self,
        uris: Vec<String>,
        format: &str,
    ) -> Result<PendingResponse> {
        let header = self
            .base
            .create_header(message_types::GET_DATA_OBJECTS, 0, flags::FINAL_PART)?;
        self.base
            .request(header, &GetDataObjects::new(uris, format))
            .await
    }

    pub async fn put_data_objects(&self, data_objects: Vec<DataObject>) -> Result<i64> {
        let header = self
            .base
            .create_header(message_types::PUT_DATA_OBJECTS, 0, flags::FINAL_PART)?;
        let message = PutDataObjects {
            data_objects: to_index_map(&data_objects),
        };
        self.base.send(header, &message).await
    }

    pub async fn delete_data_objects(&self, uris: Vec<String>) -> Result<i64> {
        let header = self
            .base
            .create_header(message_types::DELETE_DATA_OBJECTS, 0, flags::FINAL_PART)?;
        let message = DeleteDataObjects {
            uris: to_index_map(&uris),
        };
        self.base.send(header, &message).await
    }

    /// Send one Chunk correlated to `request`.
    ///
    /// `message_flags` defaults to MultiPart|FinalPart when `None`.
    pub async fn chunk(
        &self,
        request: &MessageHeader,
        blob_id: Uuid,
        data: Vec<u8>,
        message_flags: Option<i32>,
    ) -> Result<i64> {
        let header = self.base.create_header(
            message_types::CHUNK,
            request.message_id,
            message_flags.unwrap_or(flags::MULTI_PART_AND_FINAL_PART),
        )?;
        self.base.send(header, &Chunk { blob_id, data }).await
    }

    async fn handle_get_data_objects_response(
        &self,
        header: MessageHeader,
        message: GetDataObjectsResponse,
    ) -> Result<()> {
        self.on_get_data_objects_response
            .notify(&ProtocolEvent::new(header, message))
    }

    async fn handle_chunk(&self, session: &Session, header: MessageHeader, chunk: Chunk) -> Result<()> {
        let notified = self.on_chunk.notify(&ProtocolEvent::new(header, chunk.clone()));
        if let Some(blob) = session.reassemble_chunk(&header, chunk.blob_id, &chunk.data)? {
            tracing::debug!("Blob {} complete: {} bytes", blob.blob_id, blob.data.len());
            self.on_blob.notify(&ProtocolEvent::new(header, blob))?;
        }
        notified
    }
}

impl Default for StoreCustomerHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for StoreCustomerHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn handle_message<'a>(
        &'a self,
        session: &'a Session,
        header: MessageHeader,
        body: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        self.table.dispatch(self, session, header, body)
    }
}

/// Store protocol, store role.
///
/// Requests are surfaced as events; the application answers with
/// [`get_data_objects_response`](Self::get_data_objects_response) and
/// [`send_blob`](Self::send_blob).
pub struct StoreHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    pub on_get_data_objects: EventSubscribers<ProtocolEvent<GetDataObjects>>,
    pub on_put_data_objects: EventSubscribers<ProtocolEvent<PutDataObjects>>,
    pub on_delete_data_objects: EventSubscribers<ProtocolEvent<DeleteDataObjects>>,
}

impl StoreHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new()
            .on::<GetDataObjects, _>(
                message_types::GET_DATA_OBJECTS,
                "GetDataObjects",
                |handler, _session, header, message| {
                    Box::pin(async move {
                        handler
                            .on_get_data_objects
                            .notify(&ProtocolEvent::new(header, message))
                    })
                },
            )
            .on::<PutDataObjects, _>(
                message_types::PUT_DATA_OBJECTS,
                "PutDataObjects",
                |handler, _session, header, message| {
                    Box::pin(async move {
                        handler
                            .on_put_data_objects
                            .notify(&ProtocolEvent::new(header, message))
                    })
                },
            )
            .on::<DeleteDataObjects, _>(
                message_types::DELETE_DATA_OBJECTS,
                "DeleteDataObjects",
                |handler, _session, header, message| {
                    Box::pin(async move {
                        handler
                            .on_delete_data_objects
                            .notify(&ProtocolEvent::new(header, message))
                    })
                },
            );
        Self {
            base: HandlerBase::new(protocols::STORE, "store", "customer"),
            table,
            on_get_data_objects: EventSubscribers::new(),
            on_put_data_objects: EventSubscribers::new(),
            on_delete_data_objects: EventSubscribers::new(),
        }
    }

    /// Answer `request` with `data_objects`.
    ///
    /// Pass `flags::MULTI_PART` when blobs for these objects follow.
    pub async fn get_data_objects_response(
        &self,
        request: &MessageHeader,
        data_objects: Vec<DataObject>,
        message_flags: i32,
    ) -> Result<i64> {
        let header = self.base.create_header(
            message_types::GET_DATA_OBJECTS_RESPONSE,
            request.message_id,
            message_flags,
        )?;
        let message = GetDataObjectsResponse {
            data_objects: to_index_map(&data_objects),
        };
        self.base.send(header, &message).await
    }

    /// Send `data` as a blob in chunks of the configured size, correlated to
    /// `request`. Returns the blob id.
    pub async fn send_blob(&self, request: &MessageHeader, data: &[u8]) -> Result<Uuid> {
        let blob_id = Uuid::new_v4();
        self.send_blob_as(request, blob_id, data).await?;
        Ok(blob_id)
    }

    /// Send `data` as the blob `blob_id`.
    pub async fn send_blob_as(&self, request: &MessageHeader, blob_id: Uuid, data: &[u8]) -> Result<()> {
        let chunk_size = self.base.session()?.config().chunk_size.max(1);
        let parts: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(chunk_size).collect()
        };

        let last = parts.len() - 1;
        for (i, part) in parts.into_iter().enumerate() {
            let message_flags = if i == last {
                flags::MULTI_PART_AND_FINAL_PART
            } else {
                flags::MULTI_PART
            };
            let header = self
                .base
                .create_header(message_types::CHUNK, request.message_id, message_flags)?;
            let chunk = Chunk {
                blob_id,
                data: part.to_vec(),
            };
            let status = self.base.send(header, &chunk).await?;
            if status < 0 {
                return Err(EtpError::NotSent(status));
            }
        }
        tracing::debug!(
            "Sent blob {} ({} bytes) for request {}",
            blob_id,
            data.len(),
            request.message_id
        );
        Ok(())
    }
}

impl Default for StoreHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for StoreHandler {
    fn base(&self) -> &HandlerBase {
        &self.base
    }

    fn handle_message<'a>(
        &'a self,
        session: &'a Session,
        header: MessageHeader,
        body: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        self.table.dispatch(self, session, header, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_message, encode_message};
    use crate::v12::datatypes::Resource;

    #[test]
    fn test_uris_are_index_keyed() {
        let message = GetDataObjects::new(
            vec!["eml:///well(1)".to_string(), "eml:///well(2)".to_string()],
            "xml",
        );
        assert_eq!(message.uris.get("0").map(String::as_str), Some("eml:///well(1)"));
        assert_eq!(message.uris.get("1").map(String::as_str), Some("eml:///well(2)"));
    }

    #[test]
    fn test_response_objects_keep_order() {
        let objects: Vec<DataObject> = (0..12)
            .map(|i| DataObject::new(Resource::new(format!("eml:///well({})", i), "w"), "xml", vec![i as u8]))
            .collect();
        let response = GetDataObjectsResponse {
            data_objects: to_index_map(&objects),
        };
        assert_eq!(response.objects(), objects);
    }

    #[test]
    fn test_chunk_frame_compressed() {
        let chunk = Chunk {
            blob_id: Uuid::new_v4(),
            data: vec![7u8; 4096],
        };
        let mut header = MessageHeader::new(protocols::STORE, message_types::CHUNK, 3, flags::MULTI_PART);
        header.message_id = 9;
        let frame = encode_message(&chunk, &mut header, Some("gzip")).unwrap();
        assert!(frame.len() < 4096);

        let (decoded_header, decoded): (MessageHeader, Chunk) = decode_message(&frame).unwrap();
        assert!(decoded_header.is_compressed());
        assert_eq!(decoded_header.correlation_id, 3);
        assert_eq!(decoded, chunk);
    }

    #[test]
    fn test_handler_tables() {
        let customer = StoreCustomerHandler::new();
        assert_eq!(customer.role(), "customer");
        assert!(customer.table.handles(message_types::CHUNK));
        assert!(!customer.table.handles(message_types::GET_DATA_OBJECTS));

        let store = StoreHandler::new();
        assert_eq!(store.counterpart_role(), "customer");
        assert!(store.table.handles(message_types::GET_DATA_OBJECTS));
        assert!(store.table.handles(message_types::DELETE_DATA_OBJECTS));
    }
}
