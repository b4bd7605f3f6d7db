//! ETP 1.1 Core protocol (0).
//!
//! 1.1 has no compression field in the handshake; the encoding is agreed
//! out of band (the `etp-encoding` connection header), so both endpoints
//! apply their configured compression once the session opens.

use std::any::Any;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::datatypes::{read_protocols, read_strings, write_protocols, write_strings};
use crate::codec::{is_gzip, GZIP_ENCODING};
use crate::error::{error_codes, EtpError, Result};
use crate::handler::{
    BoxFuture, EventSubscribers, HandlerBase, MessageTable, ProtocolEvent, ProtocolHandler,
};
use crate::protocol::{
    core_message_types, flags, AvroDecode, AvroEncode, AvroReader, AvroWriter, ErrorDescriptor,
    MessageHeader, SupportedProtocol, CORE_PROTOCOL,
};
use crate::session::{accept_protocols, Negotiated, Session, SessionConfig, SessionState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSession {
    pub application_name: String,
    pub application_version: String,
    pub requested_protocols: Vec<SupportedProtocol>,
    pub supported_objects: Vec<String>,
}

impl AvroEncode for RequestSession {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.application_name);
        writer.write_string(&self.application_version);
        write_protocols(writer, &self.requested_protocols);
        write_strings(writer, &self.supported_objects);
    }
}

impl AvroDecode for RequestSession {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            application_name: reader.read_string()?,
            application_version: reader.read_string()?,
            requested_protocols: read_protocols(reader)?,
            supported_objects: read_strings(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSession {
    pub application_name: String,
    pub application_version: String,
    pub session_id: String,
    pub supported_protocols: Vec<SupportedProtocol>,
    pub supported_objects: Vec<String>,
}

impl AvroEncode for OpenSession {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_string(&self.application_name);
        writer.write_string(&self.application_version);
        writer.write_string(&self.session_id);
        write_protocols(writer, &self.supported_protocols);
        write_strings(writer, &self.supported_objects);
    }
}

impl AvroDecode for OpenSession {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            application_name: reader.read_string()?,
            application_version: reader.read_string()?,
            session_id: reader.read_string()?,
            supported_protocols: read_protocols(reader)?,
            supported_objects: read_strings(reader)?,
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

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolException {
    pub error_code: i32,
    pub error_message: String,
}

impl ErrorDescriptor for ProtocolException {
    fn code(&self) -> i32 {
        self.error_code
    }

    fn message(&self) -> &str {
        &self.error_message
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl AvroEncode for ProtocolException {
    fn encode(&self, writer: &mut AvroWriter) {
        writer.write_int(self.error_code);
        writer.write_string(&self.error_message);
    }
}

impl AvroDecode for ProtocolException {
    fn decode(reader: &mut AvroReader<'_>) -> Result<Self> {
        Ok(Self {
            error_code: reader.read_int()?,
            error_message: reader.read_string()?,
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

/// Body compression configured for this endpoint, if it is one we support.
fn configured_compression(config: &SessionConfig) -> Option<String> {
    config
        .compression
        .as_deref()
        .filter(|c| is_gzip(c))
        .map(|_| GZIP_ENCODING.to_string())
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
        let table = MessageTable::<Self>::new()
            .on::<OpenSession, _>(
                core_message_types::OPEN_SESSION,
                "OpenSession",
                |handler, session, header, message| {
                    Box::pin(async move { handler.handle_open_session(session, header, message) })
                },
            )
            .on::<CloseSession, _>(
                core_message_types::CLOSE_SESSION,
                "CloseSession",
                |handler, session, header, message| {
                    Box::pin(async move {
                        let notified = handler
                            .on_close_session
                            .notify(&ProtocolEvent::new(header, message.clone()));
                        session.close_by_peer(&message.reason);
                        notified
                    })
                },
            );
        Self {
            base: HandlerBase::new(CORE_PROTOCOL, "client", "server"),
            table,
            on_open_session: EventSubscribers::new(),
            on_close_session: EventSubscribers::new(),
        }
    }

    /// Send RequestSession with every protocol registered on the session.
    pub async fn request_session(&self) -> Result<i64> {
        let session = self.base.session()?;
        let message = RequestSession {
            application_name: session.config().application_name.clone(),
            application_version: session.config().application_version.clone(),
            requested_protocols: session.requested_protocols(),
            supported_objects: Vec::new(),
        };
        let header = self.base.create_header(
            core_message_types::REQUEST_SESSION,
            0,
            flags::FINAL_PART,
        )?;
        self.base.send(header, &message).await
    }

    fn handle_open_session(
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

        session.complete_negotiation(Negotiated {
            session_id: message.session_id.clone(),
            protocols: message.supported_protocols.clone(),
            compression: configured_compression(session.config()),
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
        let table = MessageTable::<Self>::new()
            .on::<RequestSession, _>(
                core_message_types::REQUEST_SESSION,
                "RequestSession",
                |handler, session, header, message| {
                    Box::pin(handler.handle_request_session(session, header, message))
                },
            )
            .on::<CloseSession, _>(
                core_message_types::CLOSE_SESSION,
                "CloseSession",
                |handler, session, header, message| {
                    Box::pin(async move {
                        let notified = handler
                            .on_close_session
                            .notify(&ProtocolEvent::new(header, message.clone()));
                        session.close_by_peer(&message.reason);
                        notified
                    })
                },
            );
        Self {
            base: HandlerBase::new(CORE_PROTOCOL, "server", "client"),
            table,
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
            let error = ProtocolException {
                error_code: error_codes::NO_SUPPORTED_PROTOCOLS,
                error_message: reason.to_string(),
            };
            session
                .send_protocol_exception(CORE_PROTOCOL, header.message_id, &error)
                .await?;
            session.fail_negotiation(reason);
            return Err(EtpError::Negotiation(reason.to_string()));
        }

        let session_id = Uuid::new_v4().to_string();
        let reply = OpenSession {
            application_name: session.config().application_name.clone(),
            application_version: session.config().application_version.clone(),
            session_id: session_id.clone(),
            supported_protocols: accepted.clone(),
            supported_objects: Vec::new(),
        };
        let reply_header = self.base.create_header(
            core_message_types::OPEN_SESSION,
            header.message_id,
            flags::FINAL_PART,
        )?;
        self.base.send(reply_header, &reply).await?;

        session.complete_negotiation(Negotiated {
            session_id,
            protocols: accepted,
            compression: configured_compression(session.config()),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::avro::{from_slice, to_bytes};
    use crate::protocol::Version;

    #[test]
    fn test_open_session_record() {
        let message = OpenSession {
            application_name: "server".into(),
            application_version: "1.0".into(),
            session_id: Uuid::new_v4().to_string(),
            supported_protocols: vec![SupportedProtocol::new(4, Version::new(1, 1, 0, 0), "store")],
            supported_objects: vec!["application/x-witsml+xml;version=1.4.1.1;type=well".into()],
        };
        let decoded: OpenSession = from_slice(&to_bytes(&message)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_protocol_exception_wire_order() {
        let exception = ProtocolException {
            error_code: 4,
            error_message: "x".into(),
        };
        assert_eq!(to_bytes(&exception).as_ref(), &[8, 2, b'x']);
    }

    #[test]
    fn test_configured_compression() {
        let mut config = SessionConfig::default();
        assert_eq!(configured_compression(&config), None);
        config.compression = Some("GZip".into());
        assert_eq!(configured_compression(&config).as_deref(), Some("gzip"));
        config.compression = Some("br".into());
        assert_eq!(configured_compression(&config), None);
    }
}
