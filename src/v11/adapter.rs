use crate::adapter::{EtpVersion, VersionAdapter};
use crate::codec;
use crate::error::{EtpError, Result};
use crate::handler::{BoxFuture, HandlerRegistry};
use crate::protocol::{AvroEncode, ErrorDescriptor, ErrorInfo, MessageHeader};
use crate::session::Session;

use super::core::{Acknowledge, CloseSession, CoreClientHandler, CoreServerHandler, ProtocolException};

/// Adapter for ETP 1.1 sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Etp11Adapter;

impl Etp11Adapter {
    pub fn new() -> Self {
        Etp11Adapter
    }
}

impl VersionAdapter for Etp11Adapter {
    fn version(&self) -> EtpVersion {
        EtpVersion::V11
    }

    fn create_acknowledge(&self) -> Box<dyn AvroEncode> {
        Box::new(Acknowledge)
    }

    fn create_protocol_exception(&self, error: &dyn ErrorDescriptor) -> Box<dyn AvroEncode> {
        if let Some(native) = error.as_any().downcast_ref::<ProtocolException>() {
            return Box::new(native.clone());
        }
        Box::new(ProtocolException {
            error_code: error.code(),
            error_message: error.message().to_string(),
        })
    }

    fn decode_protocol_exception(&self, header: &MessageHeader, body: &[u8]) -> Result<ErrorInfo> {
        let exception: ProtocolException = codec::decode_body(header, body)?;
        Ok(ErrorInfo::new(exception.error_code, exception.error_message))
    }

    fn create_close_session(&self, reason: &str) -> Box<dyn AvroEncode> {
        Box::new(CloseSession {
            reason: reason.to_string(),
        })
    }

    fn register_core(&self, registry: &mut HandlerRegistry, is_client: bool) -> Result<()> {
        match is_client {
            true => registry.register(CoreClientHandler::new()).map(|_| ()),
            false => registry.register(CoreServerHandler::new()).map(|_| ()),
        }
    }

    fn request_session<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let core = session.handler::<CoreClientHandler>().ok_or_else(|| {
                EtpError::Registration("no ETP 1.1 core client handler registered".to_string())
            })?;
            core.request_session().await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::avro::to_bytes;

    #[test]
    fn test_exception_translation() {
        let adapter = Etp11Adapter::new();
        let native = ProtocolException {
            error_code: 3,
            error_message: "invalid message type".into(),
        };
        assert_eq!(
            to_bytes(&*adapter.create_protocol_exception(&native)),
            to_bytes(&native)
        );

        let generic = ErrorInfo::new(3, "invalid message type");
        let body = to_bytes(&*adapter.create_protocol_exception(&generic));
        assert_eq!(body, to_bytes(&native));

        let header = MessageHeader::new(0, 1000, 2, 0);
        assert_eq!(adapter.decode_protocol_exception(&header, &body).unwrap(), generic);
    }

    #[test]
    fn test_close_session_body() {
        let adapter = Etp11Adapter::new();
        let body = to_bytes(&*adapter.create_close_session("done"));
        assert_eq!(body.as_ref(), &[8, b'd', b'o', b'n', b'e']);
    }
}
