//! ETP 1.2 Core protocol (0): session negotiation and control messages.

use std::any::Any;
use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::datatypes::{
    now_micros, read_error_info, read_protocols, read_strings, write_error_info,
    write_protocols, write_strings,
};
use crate::codec::is_gzip;
use crate::error::{error_codes, EtpError, Result};
use crate::handler::{
    BoxFuture, EventSubscribers, HandlerBase, MessageTable, ProtocolEvent, ProtocolHandler,
};
use crate::protocol::{
    core_message_types, flags, AvroDecode, AvroEncode, AvroReader, AvroWriter, ErrorDescriptor,
    ErrorInfo, MessageHeader, SupportedProtocol, CORE_PROTOCOL,
};
use crate::session::{accept_protocols, select_compression, Negotiated, Session, SessionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSession {
    pub application_name: String,
    pub application_version: String,
    pub client_instance_id: Uuid,
    pub requested_protocols: Vec<SupportedProtocol>,
    pub supported_compression: Vec<String>,
    pub supported_formats: Vec<String>,
    pub current_date_time: i64,
}

impl AvroEncode for RequestSession {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.application_name);
        writer.write_string(&self.application_version);
        writer.write_uuid(&self.client_instance_id);
        write_protocols(writer, &self.requested_protocols);
        write_strings(writer, &self.supported_compression);
        write_strings(writer, &self.supported_formats);
        writer.write_long(self.current_date_time);
    }
}

impl AvroDecode for RequestSession {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            application_name: reader.read_string()?,
            application_version: reader.read_string()?,
            client_instance_id: reader.read_uuid()?,
            requested_protocols: read_protocols(reader)?,
            supported_compression: read_strings(reader)?,
            supported_formats: read_strings(reader)?,
            current_date_time: reader.read_long()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSession {
    pub application_name: String,
    pub application_version: String,
    pub server_instance_id: Uuid,
    pub supported_protocols: Vec<SupportedProtocol>,
    /// Selected compression, empty for none.
    pub supported_compression: String,
    pub supported_formats: Vec<String>,
    pub session_id: Uuid,
    pub current_date_time: i64,
}

impl AvroEncode for OpenSession {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.application_name);
        writer.write_string(&self.application_version);
        writer.write_uuid(&self.server_instance_id);
        write_protocols(writer, &self.supported_protocols);
        writer.write_string(&self.supported_compression);
        write_strings(writer, &self.supported_formats);
        writer.write_uuid(&self.session_id);
        writer.write_long(self.current_date_time);
    }
}

impl AvroDecode for OpenSession {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            application_name: reader.read_string()?,
            application_version: reader.read_string()?,
            server_instance_id: reader.read_uuid()?,
            supported_protocols: read_protocols(reader)?,
            supported_compression: reader.read_string()?,
            supported_formats: read_strings(reader)?,
            session_id: reader.read_uuid()?,
            current_date_time: reader.read_long()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CloseSession {
    pub reason: String,
}

impl AvroEncode for CloseSession {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.reason);
    }
}

impl AvroDecode for CloseSession {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            reason: reader.read_string()?,
        })
    }
}

/// Error report for one message, or for several at once through `errors`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProtocolException {
    pub error: Option<ErrorInfo>,
    pub errors: BTreeMap<String, ErrorInfo>,
}

impl ProtocolException {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            error: Some(ErrorInfo::new(code, message)),
            errors: BTreeMap::new(),
        }
    }

    /// The single error, or the first of the keyed errors.
    pub fn primary(&self) -> Option<&ErrorInfo> {
        self.error.as_ref().or_else(|| self.errors.values().next())
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        self.primary()
            .cloned()
            .unwrap_or_else(|| ErrorInfo::new(error_codes::INVALID_STATE, "unspecified error"))
    }
}

impl ErrorDescriptor for ProtocolException {
    fn code(&self) -> i32 {
        self.primary().map_or(error_codes::INVALID_STATE, |e| e.code)
    }

    fn message(&self) -> &str {
        self.primary().map_or("", |e| e.message.as_str())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl AvroEncode for ProtocolException {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_optional(self.error.as_ref(), write_error_info);
        writer.write_map(&self.errors, write_error_info);
    }
}

impl AvroDecode for ProtocolException {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            error: reader.read_optional(read_error_info)?,
            errors: reader.read_map(read_error_info)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Acknowledge;

impl AvroEncode for Acknowledge {
    fn encode(&self, _writer: &mut AvroWriter) {}
}

impl AvroDecode for Acknowledge {
    fn decode(_reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Acknowledge)
    }
}

fn core_routes<H>(table: MessageTable<H>) -> MessageTable<H>
where
    H: CloseSessionHandler,
{
    table.on::<CloseSession, _>(
        core_message_types::CLOSE_SESSION,
        "CloseSession",
        |handler, session, header, message| handler.handle_close_session(session, header, message),
    )
}

/// CloseSession handling shared by both core roles.
trait CloseSessionHandler: Send + Sync + 'static {
    fn close_subscribers(&self) -> &EventSubscribers<ProtocolEvent<CloseSession>>;

    fn handle_close_session<'a>(
        &'a self,
        session: &'a Session,
        header: MessageHeader,
        message: CloseSession,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let notified = self
                .close_subscribers()
                .notify(&ProtocolEvent::new(header, message.clone()));
            session.close_by_peer(&message.reason);
            notified
        })
    }
}

/// Core protocol handler of a client.
pub struct CoreClientHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    pub on_open_session: EventSubscribers<ProtocolEvent<OpenSession>>,
    pub on_close_session: EventSubscribers<ProtocolEvent<CloseSession>>,
}

impl CoreClientHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new().on::<OpenSession, _>(
            core_message_types::OPEN_SESSION,
            "OpenSession",
            |handler: &Self, session, header, message| {
                Box::pin(handler.handle_open_session(session, header, message))
            },
        );
        Self {
            base: HandlerBase::new(CORE_PROTOCOL, "client", "server"),
            table: core_routes(table),
            on_open_session: EventSubscribers::new(),
            on_close_session: EventSubscribers::new(),
        }
    }

    /// Send RequestSession with every protocol registered on the session.
    pub async fn request_session(&self) -> Result<i64> {
        let session = self.base.session()?;
        let config = session.config();
        let message = RequestSession {
            application_name: config.application_name.clone(),
            application_version: config.application_version.clone(),
            client_instance_id: session.id(),
            requested_protocols: session.requested_protocols(),
            supported_compression: config.compression.iter().cloned().collect(),
            supported_formats: config.supported_formats.clone(),
            current_date_time: now_micros(),
        };
        let header = self.base.create_header(
            core_message_types::REQUEST_SESSION,
            0,
            flags::FINAL_PART,
        )?;
        self.base.send(header, &message).await
    }

    async fn handle_open_session(
        &self,
        session: &Session,
        header: MessageHeader,
        message: OpenSession,
    ) -> Result<()> {
        if session.state() != SessionState::Negotiating {
            return Err(EtpError::violation(
                error_codes::INVALID_STATE,
                "OpenSession received outside negotiation",
            ));
        }
        if message.supported_protocols.is_empty() {
            let reason = "server accepted none of the requested protocols";
            session.fail_negotiation(reason);
            return Err(EtpError::Negotiation(reason.to_string()));
        }

        let offered = session.config().compression.as_deref().is_some_and(is_gzip);
        let compression = (offered && is_gzip(&message.supported_compression))
            .then(|| message.supported_compression.to_ascii_lowercase());

        session.complete_negotiation(Negotiated {
            session_id: message.session_id.to_string(),
            protocols: message.supported_protocols.clone(),
            compression,
            peer_application: message.application_name.clone(),
        })?;
        self.on_open_session
            .notify(&ProtocolEvent::new(header, message))
    }
}

impl Default for CoreClientHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSessionHandler for CoreClientHandler {
    fn close_subscribers(&self) -> &EventSubscribers<ProtocolEvent<CloseSession>> {
        &self.on_close_session
    }
}

impl ProtocolHandler for CoreClientHandler {
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

/// Core protocol handler of a server.
pub struct CoreServerHandler {
    base: HandlerBase,
    table: MessageTable<Self>,
    pub on_request_session: EventSubscribers<ProtocolEvent<RequestSession>>,
    pub on_close_session: EventSubscribers<ProtocolEvent<CloseSession>>,
}

impl CoreServerHandler {
    pub fn new() -> Self {
        let table = MessageTable::<Self>::new().on::<RequestSession, _>(
            core_message_types::REQUEST_SESSION,
            "RequestSession",
            |handler: &Self, session, header, message| {
                Box::pin(handler.handle_request_session(session, header, message))
            },
        );
        Self {
            base: HandlerBase::new(CORE_PROTOCOL, "server", "client"),
            table: core_routes(table),
            on_request_session: EventSubscribers::new(),
            on_close_session: EventSubscribers::new(),
        }
    }

    async fn handle_request_session(
        &self,
        session: &Session,
        header: MessageHeader,
        message: RequestSession,
    ) -> Result<()> {
        if session.state() != SessionState::Negotiating {
            return Err(EtpError::violation(
                error_codes::INVALID_STATE,
                "RequestSession received on an open session",
            ));
        }
        let notified = self
            .on_request_session
            .notify(&ProtocolEvent::new(header, message.clone()));

        let accepted = accept_protocols(&message.requested_protocols, &session.supported_protocols());
        if accepted.is_empty() {
            let reason = "none of the requested protocols are supported";
            let error = ProtocolException::new(error_codes::NO_SUPPORTED_PROTOCOLS, reason);
            session
                .send_protocol_exception(CORE_PROTOCOL, header.message_id, &error)
                .await?;
            session.fail_negotiation(reason);
            return Err(EtpError::Negotiation(reason.to_string()));
        }

        let config = session.config();
        let compression = select_compression(&message.supported_compression, config.compression.as_deref());
        let session_id = Uuid::new_v4();
        let reply = OpenSession {
            application_name: config.application_name.clone(),
            application_version: config.application_version.clone(),
            server_instance_id: session.id(),
            supported_protocols: accepted.clone(),
            supported_compression: compression.clone().unwrap_or_default(),
            supported_formats: config.supported_formats.clone(),
            session_id,
            current_date_time: now_micros(),
        };
        let reply_header = self.base.create_header(
            core_message_types::OPEN_SESSION,
            header.message_id,
            flags::FINAL_PART,
        )?;
        self.base.send(reply_header, &reply).await?;

        session.complete_negotiation(Negotiated {
            session_id: session_id.to_string(),
            protocols: accepted,
            compression,
            peer_application: message.application_name,
        })?;
        notified
    }
}

impl Default for CoreServerHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseSessionHandler for CoreServerHandler {
    fn close_subscribers(&self) -> &EventSubscribers<ProtocolEvent<CloseSession>> {
        &self.on_close_session
    }
}

impl ProtocolHandler for CoreServerHandler {
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
