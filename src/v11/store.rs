//! ETP 1.1 Store protocol (4): single-object get, put and delete.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::datatypes::DataObject;
use super::protocols;
use crate::error::Result;
use crate::handler::{
    BoxFuture, EventSubscribers, HandlerBase, MessageTable, ProtocolEvent, ProtocolHandler,
};
use crate::protocol::{flags, AvroDecode, AvroEncode, AvroReader, AvroWriter, MessageHeader};
use crate::session::{PendingResponse, Session};

pub mod message_types {
    pub const GET_OBJECT: i32 = 1;
    pub const PUT_OBJECT: i32 = 2;
    pub const DELETE_OBJECT: i32 = 3;
    pub const OBJECT: i32 = 4;
}

/// Request for the object at `uri`. Also the shape of DeleteObject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetObject {
    pub uri: String,
}

impl AvroEncode for GetObject {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.uri);
    }
}

impl AvroDecode for GetObject {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            uri: reader.read_string()?,
        })
    }
}

pub type DeleteObject = GetObject;

/// A data object in transit. Also the shape of PutObject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Object {
    pub data_object: DataObject,
}

impl AvroEncode for Object {
    fn encode(&self, writer: &mut AvroWriter) {
        self.data_object.encode(writer);
    }
}

impl AvroDecode for Object {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            data_object: reader.read_record()?,
        })
    }
}

pub type PutObject = Object;

/// Store protocol, customer role.
pub struct StoreCustomerHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    pub on_object: EventSubscribers<ProtocolEvent<Object>>,
}

impl StoreCustomerHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new().on::<Object, _>(
            message_types::OBJECT,
            "Object",
            |handler, _session, header, message| {
                Box::pin(async move { handler.on_object.notify(&ProtocolEvent::new(header, message)) })
            },
        );
        Self {
            base: HandlerBase::new(protocols::STORE, "customer", "store"),
            table,
            on_object: EventSubscribers::new(),
        }
    }

    /// Send GetObject. Returns the message id or a negative status.
    pub async fn get_object(&self, uri: &str) -> Result<i64> {
        let header = self
            .base
            .create_header(message_types::GET_OBJECT, 0, flags::FINAL_PART)?;
        self.base.send(header, &GetObject { uri: uri.to_string() }).await
    }

    /// Send GetObject and register for the Object that answers it.
    pub async fn request_object(&self, uri: &str) -> Result<PendingResponse> {
        let header = self
            .base
            .create_header(message_types::GET_OBJECT, 0, flags::FINAL_PART)?;
        self.base
            .request(header, &GetObject { uri: uri.to_string() })
            .await
    }

    pub async fn put_object(&self, data_object: DataObject) -> Result<i64> {
        let header = self
            .base
            .create_header(message_types::PUT_OBJECT, 0, flags::FINAL_PART)?;
        self.base.send(header, &PutObject { data_object }).await
    }

    pub async fn delete_object(&self, uri: &str) -> Result<i64> {
        let header = self
            .base
            .create_header(message_types::DELETE_OBJECT, 0, flags::FINAL_PART)?;
        self.base
            .send(header, &DeleteObject { uri: uri.to_string() })
            .await
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
pub struct StoreHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    pub on_get_object: EventSubscribers<ProtocolEvent<GetObject>>,
    pub on_put_object: EventSubscribers<ProtocolEvent<PutObject>>,
    pub on_delete_object: EventSubscribers<ProtocolEvent<DeleteObject>>,
}

impl StoreHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new()
            .on::<GetObject, _>(
                message_types::GET_OBJECT,
                "GetObject",
                |handler, _session, header, message| {
                    Box::pin(async move {
                        handler
                            .on_get_object
                            .notify(&ProtocolEvent::new(header, message))
                    })
                },
            )
            .on::<PutObject, _>(
                message_types::PUT_OBJECT,
                "PutObject",
                |handler, _session, header, message| {
                    Box::pin(async move {
                        handler
                            .on_put_object
                            .notify(&ProtocolEvent::new(header, message))
                    })
                },
            )
            .on::<DeleteObject, _>(
                message_types::DELETE_OBJECT,
                "DeleteObject",
                |handler, _session, header, message| {
                    Box::pin(async move {
                        handler
                            .on_delete_object
                            .notify(&ProtocolEvent::new(header, message))
                    })
                },
            );
        Self {
            base: HandlerBase::new(protocols::STORE, "store", "customer"),
            table,
            on_get_object: EventSubscribers::new(),
            on_put_object: EventSubscribers::new(),
            on_delete_object: EventSubscribers::new(),
        }
    }

    /// Answer `request` with `data_object`.
    pub async fn object(&self, request: &MessageHeader, data_object: DataObject) -> Result<i64> {
        let header = self.base.create_header(
            message_types::OBJECT,
            request.message_id,
            flags::FINAL_PART,
        )?;
        self.base.send(header, &Object { data_object }).await
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
    use crate::v11::datatypes::Resource;

    #[test]
    fn test_object_frame() {
        let mut data_object = DataObject::new(Resource::new(
            "eml://witsml14/well(1)",
            "application/x-witsml+xml",
            "Well 1",
        ));
        data_object.set_string("<wells><well uid=\"1\"/></wells>", true).unwrap();
        let message = Object { data_object };

        let mut header = MessageHeader::new(protocols::STORE, message_types::OBJECT, 5, flags::FINAL_PART);
        header.message_id = 6;
        let frame = encode_message(&message, &mut header, None).unwrap();
        let (decoded_header, decoded): (MessageHeader, Object) = decode_message(&frame).unwrap();
        assert_eq!(decoded_header, header);
        assert_eq!(decoded.data_object.get_string().unwrap(), "<wells><well uid=\"1\"/></wells>");
    }

    #[test]
    fn test_roles() {
        let customer = StoreCustomerHandler::new();
        let store = StoreHandler::new();
        assert_eq!(customer.counterpart_role(), store.role());
        assert_eq!(store.counterpart_role(), customer.role());
        assert!(customer.table.handles(message_types::OBJECT));
        assert_eq!(store.table.name_of(message_types::DELETE_OBJECT), Some("DeleteObject"));
    }
}
