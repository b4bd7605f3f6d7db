//! Protocol version adapters.
//!
//! A session holds exactly one [`VersionAdapter`] for its lifetime. Every
//! behavior that differs between ETP 1.1 and 1.2 (core message shapes, the
//! exception layout, how the session request is built) goes through it, so
//! the session itself never branches on version.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::Result;
use crate::handler::{BoxFuture, HandlerRegistry};
use crate::protocol::{AvroEncode, ErrorDescriptor, ErrorInfo, MessageHeader, Version};
use crate::session::Session;
use crate::v11::Etp11Adapter;
use crate::v12::Etp12Adapter;

/// Supported protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtpVersion {
    #[serde(rename = "1.1")]
    V11,
    #[serde(rename = "1.2")]
    V12,
}

impl EtpVersion {
    /// Version record announced in supported-protocol entries.
    pub fn protocol_version(self) -> Version {
        match self {
            EtpVersion::V11 => Version::new(1, 1, 0, 0),
            EtpVersion::V12 => Version::new(1, 2, 0, 0),
        }
    }

    /// WebSocket sub-protocol name the version is negotiated under.
    pub fn subprotocol(self) -> &'static str {
        match self {
            EtpVersion::V11 => "energistics-tp",
            EtpVersion::V12 => "etp12.energistics.org",
        }
    }

    /// Adapter implementing this version.
    pub fn adapter(self) -> Arc<dyn VersionAdapter> {
        match self {
            EtpVersion::V11 => Arc::new(Etp11Adapter::new()),
            EtpVersion::V12 => Arc::new(Etp12Adapter::new()),
        }
    }
}

impl std::fmt::Display for EtpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EtpVersion::V11 => write!(f, "1.1"),
            EtpVersion::V12 => write!(f, "1.2"),
        }
    }
}

/// Version-specific factory and translation layer.
pub trait VersionAdapter: Send + Sync + 'static {
    fn version(&self) -> EtpVersion;

    /// Build a header template. The session assigns the message id on send.
    fn create_message_header(
        &self,
        protocol: i32,
        message_type: i32,
        correlation_id: i64,
        message_flags: i32,
    ) -> MessageHeader {
        MessageHeader::new(protocol, message_type, correlation_id, message_flags)
    }

    /// Split a frame into its header and raw body.
    fn decode_message_header(&self, frame: &[u8]) -> Result<(MessageHeader, Bytes)> {
        codec::decode_frame(frame)
    }

    /// Body of an Acknowledge message.
    fn create_acknowledge(&self) -> Box<dyn AvroEncode>;

    /// Body of a ProtocolException carrying `error`.
    ///
    /// When `error` already is this version's native exception message it
    /// is reused unchanged.
    fn create_protocol_exception(&self, error: &dyn ErrorDescriptor) -> Box<dyn AvroEncode>;

    /// Decode a ProtocolException body into a version-independent form.
    fn decode_protocol_exception(&self, header: &MessageHeader, body: &[u8]) -> Result<ErrorInfo>;

    /// Body of a CloseSession message.
    fn create_close_session(&self, reason: &str) -> Box<dyn AvroEncode>;

    /// Register the core protocol handler for a client or a server.
    fn register_core(&self, registry: &mut HandlerRegistry, is_client: bool) -> Result<()>;

    /// Send the session request carrying this endpoint's wanted protocols.
    ///
    /// Only meaningful on a client.
    fn request_session<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<i64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_metadata() {
        assert_eq!(EtpVersion::V11.protocol_version(), Version::new(1, 1, 0, 0));
        assert_eq!(EtpVersion::V12.to_string(), "1.2");
        assert_eq!(EtpVersion::V12.subprotocol(), "etp12.energistics.org");
        assert_eq!(EtpVersion::V11.adapter().version(), EtpVersion::V11);
        assert_eq!(EtpVersion::V12.adapter().version(), EtpVersion::V12);
    }

    #[test]
    fn test_version_serde() {
        assert_eq!(serde_json::to_string(&EtpVersion::V11).unwrap(), "\"1.1\"");
        let v: EtpVersion = serde_json::from_str("\"1.2\"").unwrap();
        assert_eq!(v, EtpVersion::V12);
    }
}
