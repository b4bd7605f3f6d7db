use crate::adapter::{EtpVersion, VersionAdapter};
use crate::codec;
use crate::error::{EtpError, Result};
use crate::handler::{BoxFuture, HandlerRegistry};
use crate::protocol::{AvroEncode, ErrorDescriptor, ErrorInfo, MessageHeader};
use crate::session::Session;

use super::core::{Acknowledge, CloseSession, CoreClientHandler, CoreServerHandler, ProtocolException};

/// Adapter for ETP 1.2 sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Etp12Adapter;

impl Etp12Adapter {
    pub fn new() -> Self {
        Etp12Adapter
    }
}

impl VersionAdapter for Etp12Adapter {
    fn version(&self) -> EtpVersion {
        EtpVersion::V12
    }

    fn create_acknowledge(&self) -> Box<dyn AvroEncode> {
        Box::new(Acknowledge)
    }

    fn create_protocol_exception(&self, error: &dyn ErrorDescriptor) -> Box<dyn AvroEncode> {
        match error.as_any().downcast_ref::<ProtocolException>() {
            Some(native) => Box::new(native.clone()),
            None => Box::new(ProtocolException::new(error.code(), error.message())),
        }
    }

    fn decode_protocol_exception(&self, header: &MessageHeader, body: &[u8]) -> Result<ErrorInfo> {
        let exception: ProtocolException = codec::decode_body(header, body)?;
        Ok(exception.to_error_info())
    }

    fn create_close_session(&self, reason: &str) -> Box<dyn AvroEncode> {
        Box::new(CloseSession {
            reason: reason.to_string(),
        })
    }

    fn register_core(&self, registry: &mut HandlerRegistry, is_client: bool) -> Result<()> {
        if is_client {
            registry.register(CoreClientHandler::new())?;
        } else {
            registry.register(CoreServerHandler::new())?;
        }
        Ok(())
    }

    fn request_session<'a>(&'a self, session: &'a Session) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let core = session.handler::<CoreClientHandler>().ok_or_else(|| {
                EtpError::Registration("no ETP 1.2 core client handler registered".to_string())
            })?;
            core.request_session().await
        })
    }
}
