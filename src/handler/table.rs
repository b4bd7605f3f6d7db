//! Typed routing from message type numbers to handler methods.
//!
//! Each route decodes the raw body into its message type before calling the
//! handler method, so handler code only ever sees typed messages.

use std::collections::HashMap;

use bytes::Bytes;

use super::BoxFuture;
use crate::codec;
use crate::error::{error_codes, EtpError, Result};
use crate::protocol::{AvroDecode, MessageHeader};
use crate::session::Session;

type Route<H> = Box<
    dyn for<'a> Fn(&'a H, &'a Session, MessageHeader, Bytes) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

struct Entry<H> {
    name: &'static str,
    route: Route<H>,
}

/// Message type → handler method table for handler type `H`.
pub struct MessageTable<H> {
    entries: HashMap<i32, Entry<H>>,
}

impl<H: Send + Sync + 'static> MessageTable<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Route `message_type` to `method`, decoding the body as `T` first.
    pub fn on<T, F>(mut self, message_type: i32, name: &'static str, method: F) -> Self
    where
        T: AvroDecode + Send + 'static,
        F: for<'a> Fn(&'a H, &'a Session, MessageHeader, T) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        let route = erase::<H, _>(move |handler, session, header, body| {
            let limit = session.config().max_blob_size;
            match codec::decode_body_limited::<T>(&header, &body, limit) {
                Ok(message) => method(handler, session, header, message),
                Err(e) => failed(e),
            }
        });
        self.entries.insert(message_type, Entry { name, route });
        self
    }

    /// Whether a route exists for `message_type`.
    pub fn handles(&self, message_type: i32) -> bool {
        self.entries.contains_key(&message_type)
    }

    /// Name of the message routed at `message_type`.
    pub fn name_of(&self, message_type: i32) -> Option<&'static str> {
        self.entries.get(&message_type).map(|e| e.name)
    }

    /// Decode and dispatch one message to `handler`.
    ///
    /// Unknown message types are a protocol violation.
    pub fn dispatch<'a>(
        &'a self,
        handler: &'a H,
        session: &'a Session,
        header: MessageHeader,
        body: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        match self.entries.get(&header.message_type) {
            Some(entry) => (entry.route)(handler, session, header, body),
            None => failed(EtpError::violation(
                error_codes::INVALID_MESSAGE_TYPE,
                format!(
                    "Invalid message type {} for protocol {}",
                    header.message_type, header.protocol
                ),
            )),
        }
    }
}

impl<H: Send + Sync + 'static> Default for MessageTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

fn erase<H, F>(route: F) -> Route<H>
where
    F: for<'a> Fn(&'a H, &'a Session, MessageHeader, Bytes) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync
        + 'static,
{
    Box::new(route)
}

fn failed<'a>(error: EtpError) -> BoxFuture<'a, Result<()>> {
    Box::pin(std::future::ready(Err(error)))
}
