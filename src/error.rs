//! Error types for etp-session.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Main error type for all session operations.
#[derive(Debug, Error)]
pub enum EtpError {
    /// I/O error raised by a transport or by the gzip streams.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error (diagnostics and configuration only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed bytes in a header or body.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No acceptable protocol/role overlap, or negotiation timed out.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// The peer sent something this endpoint cannot process.
    #[error("Protocol violation ({code}): {message}")]
    ProtocolViolation {
        /// ETP error code reported back to the peer.
        code: i32,
        /// Human readable description.
        message: String,
    },

    /// The peer answered one of our requests with a protocol exception.
    #[error("Protocol exception from peer ({code}): {message}")]
    RemoteException {
        /// Error code sent by the peer.
        code: i32,
        /// Error message sent by the peer.
        message: String,
    },

    /// A correlated wait exceeded its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Content encoding other than gzip.
    #[error("Content encoding not supported: {0}")]
    UnsupportedEncoding(String),

    /// The underlying connection dropped or refused a frame.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The session is closing or closed.
    #[error("Session closed")]
    SessionClosed,

    /// One or more event subscribers failed during dispatch.
    #[error("Subscriber error: {0}")]
    Subscriber(String),

    /// A blob being reassembled exceeded its size or age ceiling.
    #[error("Chunk limit exceeded for blob {blob_id}: {reason}")]
    ChunkLimit {
        /// Blob identifier of the discarded buffer.
        blob_id: Uuid,
        /// Which ceiling was hit.
        reason: String,
    },

    /// A send was refused locally; carries the negative status code.
    #[error("Message not sent (status {0})")]
    NotSent(i64),

    /// Handler registration conflict.
    #[error("Registration error: {0}")]
    Registration(String),
}

impl EtpError {
    /// Shorthand for a protocol violation with the given code.
    pub fn violation(code: i32, message: impl Into<String>) -> Self {
        EtpError::ProtocolViolation {
            code,
            message: message.into(),
        }
    }

    /// Whether this error forces the session to close.
    ///
    /// Transport failures and undecodable headers are fatal; everything else
    /// is contained to the frame or request that produced it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EtpError::Transport(_) | EtpError::Io(_) | EtpError::Negotiation(_)
        )
    }

    /// Whether the peer should be told about this error with a protocol
    /// exception correlated to the message that caused it.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            EtpError::Decode(_)
                | EtpError::ProtocolViolation { .. }
                | EtpError::UnsupportedEncoding(_)
                | EtpError::ChunkLimit { .. }
        )
    }

    /// Error code to report to the peer when this error was caused by one of
    /// its messages.
    pub fn error_code(&self) -> i32 {
        match self {
            EtpError::ProtocolViolation { code, .. } => *code,
            EtpError::RemoteException { code, .. } => *code,
            EtpError::Decode(_) => error_codes::INVALID_MESSAGE,
            EtpError::UnsupportedEncoding(_) => error_codes::COMPRESSION_NOT_SUPPORTED,
            EtpError::ChunkLimit { .. } => error_codes::MAX_SIZE_EXCEEDED,
            EtpError::Negotiation(_) => error_codes::NO_SUPPORTED_PROTOCOLS,
            EtpError::SessionClosed => error_codes::INVALID_STATE,
            _ => error_codes::INVALID_STATE,
        }
    }
}

/// Error codes carried in protocol exception messages.
pub mod error_codes {
    /// The requested role is not supported.
    pub const NO_ROLE: i32 = 1;
    /// None of the requested protocols is supported.
    pub const NO_SUPPORTED_PROTOCOLS: i32 = 2;
    /// The message type is not valid for the protocol.
    pub const INVALID_MESSAGE_TYPE: i32 = 3;
    /// The protocol is not supported by this endpoint.
    pub const UNSUPPORTED_PROTOCOL: i32 = 4;
    /// An argument is invalid.
    pub const INVALID_ARGUMENT: i32 = 5;
    /// Permission denied.
    pub const PERMISSION_DENIED: i32 = 6;
    /// The operation is not supported.
    pub const NOT_SUPPORTED: i32 = 7;
    /// The session is not in a state where the message is valid.
    pub const INVALID_STATE: i32 = 8;
    /// A URI is malformed.
    pub const INVALID_URI: i32 = 9;
    /// The security token expired.
    pub const EXPIRED_TOKEN: i32 = 10;
    /// An object was not found.
    pub const NOT_FOUND: i32 = 11;
    /// A limit was exceeded.
    pub const LIMIT_EXCEEDED: i32 = 12;
    /// The requested compression is not supported.
    pub const COMPRESSION_NOT_SUPPORTED: i32 = 13;
    /// A data object is invalid.
    pub const INVALID_OBJECT: i32 = 14;
    /// Too many concurrent transactions.
    pub const MAX_TRANSACTIONS_EXCEEDED: i32 = 15;
    /// The content type is not supported.
    pub const CONTENT_TYPE_NOT_SUPPORTED: i32 = 16;
    /// A message or payload is too large.
    pub const MAX_SIZE_EXCEEDED: i32 = 17;
    /// A multi-part message was cancelled.
    pub const MULTIPART_CANCELLED: i32 = 18;
    /// The message body could not be decoded.
    pub const INVALID_MESSAGE: i32 = 19;
}

/// Result type alias using EtpError.
pub type Result<T> = std::result::Result<T, EtpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EtpError::Transport("reset".into()).is_fatal());
        assert!(EtpError::Negotiation("no overlap".into()).is_fatal());
        assert!(!EtpError::Decode("short".into()).is_fatal());
        assert!(!EtpError::Timeout(Duration::from_millis(50)).is_fatal());
        assert!(!EtpError::violation(error_codes::UNSUPPORTED_PROTOCOL, "x").is_fatal());
    }

    #[test]
    fn test_reportable_classification() {
        assert!(EtpError::Decode("short".into()).is_reportable());
        assert!(EtpError::UnsupportedEncoding("br".into()).is_reportable());
        assert!(!EtpError::Subscriber("boom".into()).is_reportable());
        assert!(!EtpError::Negotiation("no overlap".into()).is_reportable());
        assert!(!EtpError::SessionClosed.is_reportable());
    }

    #[test]
    fn test_error_codes_for_peer() {
        assert_eq!(
            EtpError::Decode("bad".into()).error_code(),
            error_codes::INVALID_MESSAGE
        );
        assert_eq!(
            EtpError::violation(error_codes::INVALID_MESSAGE_TYPE, "x").error_code(),
            error_codes::INVALID_MESSAGE_TYPE
        );
        assert_eq!(
            EtpError::UnsupportedEncoding("br".into()).error_code(),
            error_codes::COMPRESSION_NOT_SUPPORTED
        );
    }

    #[test]
    fn test_display() {
        let err = EtpError::violation(4, "Protocol not supported: 99");
        assert_eq!(err.to_string(), "Protocol violation (4): Protocol not supported: 99");
    }
}
