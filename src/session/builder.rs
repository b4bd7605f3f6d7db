//! Fluent construction of sessions.

use std::sync::Arc;
use std::time::Duration;

use super::{Session, SessionConfig};
use crate::adapter::{EtpVersion, VersionAdapter};
use crate::error::{EtpError, Result};
use crate::handler::{HandlerRegistry, ProtocolHandler};
use crate::transport::{FrameSink, FrameSource};

/// Builder for configuring and creating a [`Session`].
///
/// Defaults to an ETP 1.2 client with [`SessionConfig::default`]. The core
/// protocol handler for the chosen role is registered by `build`.
///
/// # Example
///
/// ```ignore
/// let (client_transport, server_transport) = memory_pair(64);
/// let (sink, source) = client_transport.split();
///
/// let session = Session::builder()
///     .version(EtpVersion::V12)
///     .application("rig-monitor", "2.1.0")
///     .compression("gzip")
///     .register(StoreCustomerHandler::new())
///     .connect(sink, source)?;
/// session.open(Duration::from_secs(5)).await?;
/// ```
pub struct SessionBuilder {
    is_client: bool,
    adapter: Arc<dyn VersionAdapter>,
    config: SessionConfig,
    registry: HandlerRegistry,
    errors: Vec<EtpError>,
}

impl SessionBuilder {
    /// Create a new session builder.
    pub fn new() -> Self {
        Self {
            is_client: true,
            adapter: EtpVersion::V12.adapter(),
            config: SessionConfig::default(),
            registry: HandlerRegistry::new(),
            errors: Vec::new(),
        }
    }

    /// Act as the client (the side sending the session request).
    pub fn client(mut self) -> Self {
        self.is_client = true;
        self
    }

    /// Act as the server.
    pub fn server(mut self) -> Self {
        self.is_client = false;
        self
    }

    /// Use the adapter for `version`.
    pub fn version(mut self, version: EtpVersion) -> Self {
        self.adapter = version.adapter();
        self
    }

    /// Use a custom version adapter.
    pub fn adapter(mut self, adapter: Arc<dyn VersionAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn application(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.config.application_name = name.into();
        self.config.application_version = version.into();
        self
    }

    /// Offer body compression (only `"gzip"` is understood).
    pub fn compression(mut self, encoding: impl Into<String>) -> Self {
        self.config.compression = Some(encoding.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.config.negotiation_timeout = timeout;
        self
    }

    /// Register a protocol handler.
    ///
    /// A second handler for the same protocol makes `build` fail.
    pub fn register<H: ProtocolHandler>(mut self, handler: H) -> Self {
        if let Err(e) = self.registry.register(handler) {
            self.errors.push(e);
        }
        self
    }

    /// Build an unconnected session.
    pub fn build(mut self) -> Result<Session> {
        if let Some(e) = self.errors.into_iter().next() {
            return Err(e);
        }
        self.adapter.register_core(&mut self.registry, self.is_client)?;
        Ok(Session::from_parts(
            self.is_client,
            self.config,
            self.adapter,
            self.registry,
        ))
    }

    /// Build and attach the transport. Must be called inside a tokio runtime.
    pub fn connect<S: FrameSink, R: FrameSource>(self, sink: S, source: R) -> Result<Session> {
        let session = self.build()?;
        session.connect(sink, source)?;
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("is_client", &self.is_client)
            .field("version", &self.adapter.version())
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish()
    }
}
