//! Handler module - per-protocol message handling and dispatch.
//!
//! Provides:
//! - [`ProtocolHandler`] - one implementation per (protocol, role) pair
//! - [`HandlerBase`] - identity and session link shared by every handler
//! - [`MessageTable`] - typed routing of message types to handler methods
//! - [`HandlerRegistry`] - protocol number and concrete-type lookup
//! - [`EventSubscribers`] - application callbacks for received messages
//!
//! # Example
//!
//! ```ignore
//! use etp_session::v12::store::StoreCustomerHandler;
//!
//! let store = StoreCustomerHandler::new();
//! store.on_get_data_objects_response.subscribe(|event| {
//!     println!("{} objects", event.message.data_objects.len());
//!     Ok(())
//! });
//!
//! let session = Session::builder().register(store).connect(sink, source)?;
//! ```

mod events;
mod registry;
mod table;

pub use events::{EventSubscribers, ProtocolEvent, SubscriberError, SubscriberResult};
pub use registry::HandlerRegistry;
pub use table::MessageTable;

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use bytes::Bytes;

use crate::error::{EtpError, Result};
use crate::protocol::{AvroEncode, Capabilities, ErrorInfo, MessageHeader};
use crate::session::{PendingResponse, Session, WeakSession};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A message handler for one protocol in one role.
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Identity and session link.
    fn base(&self) -> &HandlerBase;

    /// Handle one inbound message addressed to this protocol.
    ///
    /// `body` is the raw (possibly compressed) body; decoding errors are
    /// returned and reported to the peer by the session.
    fn handle_message<'a>(
        &'a self,
        session: &'a Session,
        header: MessageHeader,
        body: Bytes,
    ) -> BoxFuture<'a, Result<()>>;

    /// Capabilities advertised for this protocol during negotiation.
    fn capabilities(&self) -> Capabilities {
        Capabilities::new()
    }

    /// The peer answered one of this handler's messages with a
    /// ProtocolException.
    fn protocol_exception_received(&self, _header: &MessageHeader, _error: &ErrorInfo) {}

    /// The session closed. Per-request state should be dropped.
    fn session_closed(&self) {}

    fn protocol(&self) -> i32 {
        self.base().protocol()
    }

    fn role(&self) -> &str {
        self.base().role()
    }

    fn counterpart_role(&self) -> &str {
        self.base().counterpart_role()
    }
}

/// State every handler carries: protocol number, both roles, and a weak
/// link to the owning session.
#[derive(Debug)]
pub struct HandlerBase {
    protocol: i32,
    role: String,
    counterpart_role: String,
    session: OnceLock<WeakSession>,
}

impl HandlerBase {
    pub fn new(protocol: i32, role: impl Into<String>, counterpart_role: impl Into<String>) -> Self {
        Self {
            protocol,
            role: role.into(),
            counterpart_role: counterpart_role.into(),
            session: OnceLock::new(),
        }
    }

    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn counterpart_role(&self) -> &str {
        &self.counterpart_role
    }

    /// Link to `session`. Only the first call has an effect.
    pub(crate) fn bind(&self, session: &Session) {
        let _ = self.session.set(session.downgrade());
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Result<Session> {
        self.session
            .get()
            .and_then(WeakSession::upgrade)
            .ok_or(EtpError::SessionClosed)
    }

    /// Build a header for one of this protocol's message types.
    pub fn create_header(
        &self,
        message_type: i32,
        correlation_id: i64,
        message_flags: i32,
    ) -> Result<MessageHeader> {
        let session = self.session()?;
        Ok(session.create_message_header(self.protocol, message_type, correlation_id, message_flags))
    }

    /// Send a message in this handler's role.
    ///
    /// Returns the assigned message id, or a negative status when the
    /// session refused the send.
    pub async fn send<T: AvroEncode + ?Sized>(&self, header: MessageHeader, body: &T) -> Result<i64> {
        self.session()?.send_as(&self.role, header, body).await
    }

    /// Send a request in this handler's role and register for its response.
    pub async fn request<T: AvroEncode + ?Sized>(
        &self,
        header: MessageHeader,
        body: &T,
    ) -> Result<PendingResponse> {
        self.session()?.request_as(&self.role, header, body).await
    }
}
