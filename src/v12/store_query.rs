//! ETP 1.2 StoreQuery protocol (14): find data objects under a URI.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::datatypes::DataObject;
use super::protocols;
use super::store::Chunk;
use crate::error::Result;
use crate::handler::{
    BoxFuture, EventSubscribers, HandlerBase, MessageTable, ProtocolEvent, ProtocolHandler,
};
use crate::protocol::{
    flags, AvroDecode, AvroEncode, AvroReader, AvroWriter, ErrorInfo, MessageHeader,
};
use crate::session::{Blob, Session};

pub mod message_types {
    pub const FIND_OBJECTS: i32 = 1;
    pub const FIND_OBJECTS_RESPONSE: i32 = 2;
    pub const CHUNK: i32 = 3;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindObjects {
    pub uri: String,
    pub format: String,
}

impl AvroEncode for FindObjects {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.uri);
        writer.write_string(&self.format);
    }
}

impl AvroDecode for FindObjects {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            uri: reader.read_string()?,
            format: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindObjectsResponse {
    pub data_objects: Vec<DataObject>,
    pub server_sort_order: String,
}

impl AvroEncode for FindObjectsResponse {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_array(&self.data_objects, |w, o| o.encode(w));
        writer.write_string(&self.server_sort_order);
    }
}

impl AvroDecode for FindObjectsResponse {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            data_objects: reader.read_array(|r| r.read_record())?,
            server_sort_order: reader.read_string()?,
        })
    }
}

/// StoreQuery protocol, customer role.
///
/// Remembers each FindObjects it sent until the final response part
/// arrives, so response events carry the original request.
pub struct StoreQueryCustomerHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    requests: Mutex<HashMap<i64, FindObjects>>,
    pub on_find_objects_response:
        EventSubscribers<ProtocolEvent<FindObjectsResponse, FindObjects>>,
    pub on_chunk: EventSubscribers<ProtocolEvent<Chunk>>,
    /// Blobs reassembled from Chunk messages.
    pub on_blob: EventSubscribers<ProtocolEvent<Blob>>,
}

impl StoreQueryCustomerHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new()
            .on::<FindObjectsResponse, _>(
                message_types::FIND_OBJECTS_RESPONSE,
                "FindObjectsResponse",
                |handler, _session, header, message| {
                    Box::pin(async move { handler.handle_find_objects_response(header, message) })
                },
            )
            .on::<Chunk, _>(message_types::CHUNK, "Chunk", |handler, session, header, message| {
                Box::pin(async move {
                    let notified = handler
                        .on_chunk
                        .notify(&ProtocolEvent::new(header, message.clone()));
                    if let Some(blob) =
                        session.reassemble_chunk(&header, message.blob_id, &message.data)?
                    {
                        handler.on_blob.notify(&ProtocolEvent::new(header, blob))?;
                    }
                    notified
                })
            });
        Self {
            base: HandlerBase::new(protocols::STORE_QUERY, "customer", "store"),
            table,
            requests: Mutex::new(HashMap::new()),
            on_find_objects_response: EventSubscribers::new(),
            on_chunk: EventSubscribers::new(),
            on_blob: EventSubscribers::new(),
        }
    }

    /// Send FindObjects. Returns the message id or a negative status.
    pub async fn find_objects(&self, uri: &str, format: &str) -> Result<i64> {
        let header = self
            .base
            .create_header(message_types::FIND_OBJECTS, 0, flags::FINAL_PART)?;
        let message = FindObjects {
            uri: uri.to_string(),
            format: format.to_string(),
        };
        let message_id = self.base.send(header, &message).await?;
        if message_id > 0 {
            self.requests.lock().insert(message_id, message);
        }
        Ok(message_id)
    }

    /// Requests still awaiting their final response part.
    pub fn outstanding(&self) -> usize {
        self.requests.lock().len()
    }

    fn handle_find_objects_response(
        &self,
        header: MessageHeader,
        message: FindObjectsResponse,
    ) -> Result<()> {
        let request = {
            let mut requests = self.requests.lock();
            if header.completes_exchange() {
                requests.remove(&header.correlation_id)
            } else {
                requests.get(&header.correlation_id).cloned()
            }
        };
        self.on_find_objects_response
            .notify(&ProtocolEvent::with_request(header, message, request))
    }
}

impl Default for StoreQueryCustomerHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for StoreQueryCustomerHandler {
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

    fn protocol_exception_received(&self, header: &MessageHeader, _error: &ErrorInfo) {
        if self.requests.lock().remove(&header.correlation_id).is_some() {
            tracing::debug!("FindObjects {} rejected by peer", header.correlation_id);
        }
    }

    fn session_closed(&self) {
        self.requests.lock().clear();
    }
}

/// StoreQuery protocol, store role.
pub struct StoreQueryHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    pub on_find_objects: EventSubscribers<ProtocolEvent<FindObjects>>,
}

impl StoreQueryHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new().on::<FindObjects, _>(
            message_types::FIND_OBJECTS,
            "FindObjects",
            |handler, _session, header, message| {
                Box::pin(async move {
                    handler
                        .on_find_objects
                        .notify(&ProtocolEvent::new(header, message))
                })
            },
        );
        Self {
            base: HandlerBase::new(protocols::STORE_QUERY, "store", "customer"),
            table,
            on_find_objects: EventSubscribers::new(),
        }
    }

    /// Answer `request`. Pass `flags::MULTI_PART` for every part but the
    /// last, and `flags::MULTI_PART_AND_FINAL_PART` (or `FINAL_PART`) on it.
    pub async fn find_objects_response(
        &self,
        request: &MessageHeader,
        data_objects: Vec<DataObject>,
        server_sort_order: &str,
        message_flags: i32,
    ) -> Result<i64> {
        let header = self.base.create_header(
            message_types::FIND_OBJECTS_RESPONSE,
            request.message_id,
            message_flags,
        )?;
        let message = FindObjectsResponse {
            data_objects,
            server_sort_order: server_sort_order.to_string(),
        };
        self.base.send(header, &message).await
    }
}

impl Default for StoreQueryHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for StoreQueryHandler {
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
    use std::sync::Arc;

    #[test]
    fn test_response_carries_request_until_final_part() {
        let handler = StoreQueryCustomerHandler::new();
        let request = FindObjects {
            uri: "eml:///witsml20.Well".into(),
            format: "xml".into(),
        };
        handler.requests.lock().insert(7, request.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        handler.on_find_objects_response.subscribe(move |event| {
            sink.lock().push(event.request.clone());
            Ok(())
        });

        let partial = MessageHeader::new(protocols::STORE_QUERY, 2, 7, flags::MULTI_PART);
        handler
            .handle_find_objects_response(partial, FindObjectsResponse::default())
            .unwrap();
        assert_eq!(handler.outstanding(), 1);

        let last = MessageHeader::new(protocols::STORE_QUERY, 2, 7, flags::MULTI_PART_AND_FINAL_PART);
        handler
            .handle_find_objects_response(last, FindObjectsResponse::default())
            .unwrap();
        assert_eq!(handler.outstanding(), 0);

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_ref(), Some(&request));
        assert_eq!(seen[1].as_ref(), Some(&request));
    }

    #[test]
    fn test_rejected_and_closed_requests_are_forgotten() {
        let handler = StoreQueryCustomerHandler::new();
        for id in [3, 4] {
            handler.requests.lock().insert(id, FindObjects::default());
        }

        let exception = MessageHeader::new(protocols::STORE_QUERY, 1000, 3, flags::FINAL_PART);
        handler.protocol_exception_received(&exception, &ErrorInfo::new(5, "bad uri"));
        assert_eq!(handler.outstanding(), 1);

        handler.session_closed();
        assert_eq!(handler.outstanding(), 0);
    }

    #[test]
    fn test_unknown_correlation_has_no_request() {
        let handler = StoreQueryCustomerHandler::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        handler.on_find_objects_response.subscribe(move |event| {
            *sink.lock() = Some(event.request.is_none());
            Ok(())
        });
        let header = MessageHeader::new(protocols::STORE_QUERY, 2, 99, flags::FINAL_PART);
        handler
            .handle_find_objects_response(header, FindObjectsResponse::default())
            .unwrap();
        assert_eq!(*seen.lock(), Some(true));
    }
}
