//! Session - connection lifecycle, negotiation, message ids and dispatch.
//!
//! One [`Session`] drives exactly one connection. Inbound frames are read by
//! a single task and dispatched in order; outbound frames from any number of
//! tasks go through the writer task, so ids are unique and frames never
//! interleave.
//!
//! ```text
//!                ┌──────────── Session ────────────┐
//! FrameSource ─► read loop ─► registry ─► handler ─┼─► subscribers
//!                │     │                           │
//!                │     └─► pending requests ◄──────┼── send_request / wait
//! FrameSink   ◄─ writer task ◄─ mpsc ◄─────────────┼── send_message
//!                └─────────────────────────────────┘
//! ```

mod builder;
mod chunks;
mod config;
mod negotiation;
mod pending;

pub use builder::SessionBuilder;
pub use chunks::{ChunkOutcome, ChunkReassembler, ExpiredBlob};
pub use config::{
    SessionConfig, DEFAULT_APPLICATION_NAME, DEFAULT_APPLICATION_VERSION, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_BLOB_AGE, DEFAULT_MAX_BLOB_SIZE, DEFAULT_MAX_PROTOCOL_VIOLATIONS,
    DEFAULT_NEGOTIATION_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SUPPORTED_FORMATS,
};
pub use negotiation::{
    accept_protocols, requested_protocols, select_compression, supported_protocols, Negotiated,
};
pub use pending::{Blob, Completion, CorrelatedMessage, PendingRequests, PendingResponse};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use crate::adapter::{EtpVersion, VersionAdapter};
use crate::codec;
use crate::error::{error_codes, EtpError, Result};
use crate::handler::{EventSubscribers, HandlerRegistry, ProtocolEvent, ProtocolHandler};
use crate::protocol::{
    core_message_types, flags, AvroEncode, ErrorDescriptor, ErrorInfo, MessageHeader,
    SupportedProtocol, CORE_PROTOCOL,
};
use crate::transport::{FrameSink, FrameSource};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Negative results of a send that was not attempted.
pub mod send_status {
    /// The session is not open (or, while negotiating, the message is not
    /// a core protocol message).
    pub const NOT_OPEN: i64 = -1;
    /// No handler is registered for the protocol, or it was not negotiated.
    pub const NOT_REGISTERED: i64 = -2;
    /// The caller's role does not match the registered handler's role.
    pub const ROLE_MISMATCH: i64 = -3;
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Unconnected,
    Negotiating,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

pub(crate) struct SessionShared {
    id: Uuid,
    is_client: bool,
    config: SessionConfig,
    adapter: Arc<dyn VersionAdapter>,
    registry: HandlerRegistry,
    state: watch::Sender<SessionState>,
    close_reason: Mutex<Option<String>>,
    session_requested: AtomicBool,
    next_message_id: AtomicI64,
    negotiated: RwLock<Negotiated>,
    pending: Arc<PendingRequests>,
    chunks: Mutex<ChunkReassembler>,
    writer: RwLock<Option<WriterHandle>>,
    tasks: Mutex<Vec<AbortHandle>>,
    violations: AtomicU32,
    on_acknowledge: EventSubscribers<ProtocolEvent<()>>,
    on_protocol_exception: EventSubscribers<ProtocolEvent<ErrorInfo>>,
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Handle to a session. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

/// Non-owning session link held by protocol handlers.
#[derive(Clone, Debug)]
pub struct WeakSession(Weak<SessionShared>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|shared| Session { shared })
    }
}

impl Session {
    /// Create a new session builder.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub(crate) fn from_parts(
        is_client: bool,
        config: SessionConfig,
        adapter: Arc<dyn VersionAdapter>,
        registry: HandlerRegistry,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Unconnected);
        let chunks = ChunkReassembler::new(config.max_blob_size, config.max_blob_age);
        let session = Session {
            shared: Arc::new(SessionShared {
                id: Uuid::new_v4(),
                is_client,
                config,
                adapter,
                registry,
                state,
                close_reason: Mutex::new(None),
                session_requested: AtomicBool::new(false),
                next_message_id: AtomicI64::new(1),
                negotiated: RwLock::new(Negotiated::default()),
                pending: Arc::new(PendingRequests::new()),
                chunks: Mutex::new(chunks),
                writer: RwLock::new(None),
                tasks: Mutex::new(Vec::new()),
                violations: AtomicU32::new(0),
                on_acknowledge: EventSubscribers::new(),
                on_protocol_exception: EventSubscribers::new(),
            }),
        };

        for handler in session.shared.registry.handlers() {
            handler.base().bind(&session);
        }
        session
    }

    // ------------------------------------------------------------------
    // Identity and state
    // ------------------------------------------------------------------

    /// Local connection identity (not the negotiated session id).
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn is_client(&self) -> bool {
        self.shared.is_client
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn adapter(&self) -> &dyn VersionAdapter {
        self.shared.adapter.as_ref()
    }

    pub fn version(&self) -> EtpVersion {
        self.shared.adapter.version()
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.shared))
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// Registered handler of concrete type `H`.
    pub fn handler<H: ProtocolHandler>(&self) -> Option<Arc<H>> {
        self.shared.registry.handler::<H>()
    }

    /// Snapshot of the negotiated state.
    pub fn negotiated(&self) -> Negotiated {
        self.shared.negotiated.read().clone()
    }

    pub fn negotiated_protocols(&self) -> Vec<SupportedProtocol> {
        self.shared.negotiated.read().protocols.clone()
    }

    /// Body compression in force.
    pub fn compression(&self) -> Option<String> {
        self.shared.negotiated.read().compression.clone()
    }

    /// Why the session closed, once it has.
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason.lock().clone()
    }

    /// Protocols this endpoint asks the server for.
    pub fn requested_protocols(&self) -> Vec<SupportedProtocol> {
        requested_protocols(&self.shared.registry, self.version().protocol_version())
    }

    /// Protocols this endpoint serves.
    pub fn supported_protocols(&self) -> Vec<SupportedProtocol> {
        supported_protocols(&self.shared.registry, self.version().protocol_version())
    }

    /// Subscribers for received Acknowledge messages.
    pub fn on_acknowledge(&self) -> &EventSubscribers<ProtocolEvent<()>> {
        &self.shared.on_acknowledge
    }

    /// Subscribers for received ProtocolException messages.
    pub fn on_protocol_exception(&self) -> &EventSubscribers<ProtocolEvent<ErrorInfo>> {
        &self.shared.on_protocol_exception
    }

    /// Responses dropped because their wait had already timed out.
    pub fn late_responses(&self) -> u64 {
        self.shared.pending.late_responses()
    }

    /// Protocol violations by the peer reported so far.
    pub fn protocol_violations(&self) -> u32 {
        self.shared.violations.load(Ordering::Relaxed)
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Attach the transport and start the reader and writer tasks.
    ///
    /// Moves the session from `Unconnected` to `Negotiating`. Must be called
    /// inside a tokio runtime.
    pub fn connect<S: FrameSink, R: FrameSource>(&self, sink: S, source: R) -> Result<()> {
        let mut connected = false;
        self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Unconnected {
                *state = SessionState::Negotiating;
                connected = true;
            }
            connected
        });
        if !connected {
            return Err(EtpError::violation(
                error_codes::INVALID_STATE,
                "session already connected",
            ));
        }

        let (writer, writer_task) = spawn_writer_task(
            sink,
            WriterConfig {
                channel_capacity: self.shared.config.channel_capacity,
            },
        );
        *self.shared.writer.write() = Some(writer);

        let weak = Arc::downgrade(&self.shared);
        let reader = tokio::spawn(read_loop(weak.clone(), source));
        let mut tasks = vec![
            reader.abort_handle(),
            tokio::spawn(watch_reader(weak.clone(), reader)).abort_handle(),
            tokio::spawn(watch_writer(weak.clone(), writer_task)).abort_handle(),
        ];
        let deadline = self.shared.config.negotiation_timeout;
        if !deadline.is_zero() {
            let state = self.shared.state.subscribe();
            tasks.push(tokio::spawn(enforce_negotiation_deadline(weak, state, deadline)).abort_handle());
        }
        self.shared.tasks.lock().extend(tasks);

        tracing::info!(
            "Session {} connected as {} (ETP {})",
            self.id(),
            if self.is_client() { "client" } else { "server" },
            self.version()
        );
        Ok(())
    }

    /// Wait until the session is open.
    ///
    /// A client sends its session request first. Fails with a negotiation
    /// error when the peer rejects the request, the session closes, or
    /// `timeout` passes; on timeout the session is closed.
    pub async fn open(&self, timeout: Duration) -> Result<()> {
        let mut state_rx = self.shared.state.subscribe();
        match self.state() {
            SessionState::Open => return Ok(()),
            SessionState::Unconnected => {
                return Err(EtpError::violation(
                    error_codes::INVALID_STATE,
                    "session not connected",
                ))
            }
            SessionState::Closing | SessionState::Closed => return Err(self.negotiation_error()),
            SessionState::Negotiating => {}
        }

        let first_request =
            self.is_client() && !self.shared.session_requested.swap(true, Ordering::AcqRel);
        if first_request {
            let status = self.shared.adapter.request_session(self).await?;
            if status < 0 {
                return Err(EtpError::NotSent(status));
            }
        }

        let wait = state_rx.wait_for(|s| *s == SessionState::Open || s.is_terminal());
        let opened = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(state)) => *state == SessionState::Open,
            Ok(Err(_)) => false,
            Err(_) => {
                let reason = format!("negotiation timed out after {:?}", timeout);
                self.shutdown(&reason, || EtpError::Negotiation(reason.clone()));
                return Err(EtpError::Negotiation(reason));
            }
        };

        if opened {
            Ok(())
        } else {
            Err(self.negotiation_error())
        }
    }

    /// Close the session.
    ///
    /// Sends CloseSession when the peer can still receive it, then fails
    /// every outstanding wait with [`EtpError::SessionClosed`] and discards
    /// partial blobs.
    pub async fn close(&self, reason: &str) -> Result<()> {
        match self.state() {
            SessionState::Closing | SessionState::Closed => return Ok(()),
            SessionState::Unconnected => {}
            SessionState::Negotiating | SessionState::Open => {
                let body = self.shared.adapter.create_close_session(reason);
                let mut header = self.create_message_header(
                    CORE_PROTOCOL,
                    core_message_types::CLOSE_SESSION,
                    0,
                    flags::FINAL_PART,
                );
                header.message_id = self.next_message_id();
                if let Err(e) = self.transmit(&mut header, &*body).await {
                    tracing::debug!("Could not send CloseSession: {}", e);
                }
            }
        }

        self.shutdown(reason, || EtpError::SessionClosed);
        Ok(())
    }

    /// The peer closed the session.
    pub(crate) fn close_by_peer(&self, reason: &str) {
        tracing::info!("Session {} closed by peer: {}", self.id(), reason);
        self.shutdown(reason, || EtpError::SessionClosed);
    }

    /// Record a successful negotiation and open the session.
    pub(crate) fn complete_negotiation(&self, negotiated: Negotiated) -> Result<()> {
        if self.state() != SessionState::Negotiating {
            return Err(EtpError::violation(
                error_codes::INVALID_STATE,
                format!("cannot open session in state {:?}", self.state()),
            ));
        }

        tracing::info!(
            "Session {} open: id={} protocols={:?} compression={:?}",
            self.id(),
            negotiated.session_id,
            negotiated
                .protocols
                .iter()
                .map(|p| (p.protocol, p.role.as_str()))
                .collect::<Vec<_>>(),
            negotiated.compression
        );
        *self.shared.negotiated.write() = negotiated;
        self.shared.state.send_if_modified(|state| {
            let opening = *state == SessionState::Negotiating;
            if opening {
                *state = SessionState::Open;
            }
            opening
        });
        Ok(())
    }

    /// Abort negotiation and close.
    pub(crate) fn fail_negotiation(&self, reason: &str) {
        tracing::warn!("Session {} negotiation failed: {}", self.id(), reason);
        self.shutdown(reason, || EtpError::Negotiation(reason.to_string()));
    }

    fn negotiation_error(&self) -> EtpError {
        EtpError::Negotiation(
            self.close_reason()
                .unwrap_or_else(|| "session closed".to_string()),
        )
    }

    /// Move to `Closed`, cancelling waits with `make_error`. Idempotent.
    fn shutdown(&self, reason: &str, make_error: impl Fn() -> EtpError) {
        let mut first = false;
        self.shared.state.send_if_modified(|state| {
            if !state.is_terminal() {
                *state = SessionState::Closing;
                first = true;
            }
            first
        });
        if !first {
            return;
        }

        *self.shared.close_reason.lock() = Some(reason.to_string());
        tracing::debug!("Session {} closing: {}", self.id(), reason);

        self.shared.pending.cancel_all(&make_error);
        self.shared.chunks.lock().clear();
        // Dropping the handle lets the writer drain its queue and stop.
        self.shared.writer.write().take();
        for handler in self.shared.registry.handlers() {
            handler.session_closed();
        }
        let tasks: Vec<AbortHandle> = self.shared.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        self.shared.state.send_replace(SessionState::Closed);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Build a header through the version adapter.
    pub fn create_message_header(
        &self,
        protocol: i32,
        message_type: i32,
        correlation_id: i64,
        message_flags: i32,
    ) -> MessageHeader {
        self.shared
            .adapter
            .create_message_header(protocol, message_type, correlation_id, message_flags)
    }

    fn next_message_id(&self) -> i64 {
        self.shared.next_message_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Why a send of `header` cannot be attempted, if it cannot.
    fn check_sendable(&self, role: Option<&str>, header: &MessageHeader) -> Option<i64> {
        let allowed = match self.state() {
            SessionState::Open => true,
            SessionState::Negotiating => header.is_core(),
            _ => false,
        };
        if !allowed {
            return Some(send_status::NOT_OPEN);
        }

        let Some(registered_role) = self.shared.registry.role_of(header.protocol) else {
            return Some(send_status::NOT_REGISTERED);
        };
        if let Some(role) = role {
            if !registered_role.eq_ignore_ascii_case(role) {
                return Some(send_status::ROLE_MISMATCH);
            }
        }

        if !header.is_core()
            && !self
                .shared
                .negotiated
                .read()
                .protocols
                .iter()
                .any(|p| p.protocol == header.protocol)
        {
            return Some(send_status::NOT_REGISTERED);
        }
        None
    }

    /// Encode and queue one message whose id is already assigned.
    async fn transmit<T: AvroEncode + ?Sized>(&self, header: &mut MessageHeader, body: &T) -> Result<()> {
        let writer = self
            .shared
            .writer
            .read()
            .clone()
            .ok_or(EtpError::SessionClosed)?;
        let compression = self.shared.negotiated.read().compression.clone();
        let frame = codec::encode_message(body, header, compression.as_deref())?;

        tracing::trace!(
            "Sending protocol={} type={} id={} correlation={} flags={:#x} ({} bytes)",
            header.protocol,
            header.message_type,
            header.message_id,
            header.correlation_id,
            header.message_flags,
            frame.len()
        );
        writer.send(frame).await
    }

    /// Send a message.
    ///
    /// Returns the assigned message id, or one of the negative
    /// [`send_status`] values when the send is not applicable. Transport
    /// failures are errors.
    pub async fn send_message<T: AvroEncode + ?Sized>(&self, header: MessageHeader, body: &T) -> Result<i64> {
        self.send_checked(None, header, body).await
    }

    /// Send a message on behalf of `role`.
    pub async fn send_as<T: AvroEncode + ?Sized>(
        &self,
        role: &str,
        header: MessageHeader,
        body: &T,
    ) -> Result<i64> {
        self.send_checked(Some(role), header, body).await
    }

    async fn send_checked<T: AvroEncode + ?Sized>(
        &self,
        role: Option<&str>,
        mut header: MessageHeader,
        body: &T,
    ) -> Result<i64> {
        if let Some(status) = self.check_sendable(role, &header) {
            tracing::debug!(
                "Not sending protocol={} type={}: status {}",
                header.protocol,
                header.message_type,
                status
            );
            return Ok(status);
        }

        header.message_id = self.next_message_id();
        self.transmit(&mut header, body).await?;
        Ok(header.message_id)
    }

    /// Send a request and register for its response.
    ///
    /// A send that is not applicable fails with [`EtpError::NotSent`].
    pub async fn send_request<T: AvroEncode + ?Sized>(
        &self,
        header: MessageHeader,
        body: &T,
    ) -> Result<PendingResponse> {
        self.request_checked(None, header, body).await
    }

    /// Send a request on behalf of `role`.
    pub async fn request_as<T: AvroEncode + ?Sized>(
        &self,
        role: &str,
        header: MessageHeader,
        body: &T,
    ) -> Result<PendingResponse> {
        self.request_checked(Some(role), header, body).await
    }

    /// Send a request and wait for its response using the configured
    /// request timeout.
    pub async fn request<T: AvroEncode + ?Sized>(
        &self,
        header: MessageHeader,
        body: &T,
    ) -> Result<Completion> {
        let pending = self.send_request(header, body).await?;
        pending.wait(self.shared.config.request_timeout).await
    }

    async fn request_checked<T: AvroEncode + ?Sized>(
        &self,
        role: Option<&str>,
        mut header: MessageHeader,
        body: &T,
    ) -> Result<PendingResponse> {
        if let Some(status) = self.check_sendable(role, &header) {
            return Err(EtpError::NotSent(status));
        }

        header.message_id = self.next_message_id();
        let pending = self.shared.pending.register(header.message_id);
        if let Err(e) = self.transmit(&mut header, body).await {
            self.shared.pending.remove(header.message_id);
            return Err(e);
        }
        Ok(pending)
    }

    /// Send a ProtocolException on `protocol` correlated to `correlation_id`.
    ///
    /// Allowed for any protocol, registered or not, while the session is
    /// negotiating or open.
    pub async fn send_protocol_exception(
        &self,
        protocol: i32,
        correlation_id: i64,
        error: &dyn ErrorDescriptor,
    ) -> Result<i64> {
        if !matches!(self.state(), SessionState::Negotiating | SessionState::Open) {
            return Ok(send_status::NOT_OPEN);
        }

        let body = self.shared.adapter.create_protocol_exception(error);
        let mut header = self.create_message_header(
            protocol,
            core_message_types::PROTOCOL_EXCEPTION,
            correlation_id,
            flags::FINAL_PART,
        );
        header.message_id = self.next_message_id();
        self.transmit(&mut header, &*body).await?;
        Ok(header.message_id)
    }

    /// Send an Acknowledge on `protocol` correlated to `correlation_id`.
    pub async fn send_acknowledge(&self, protocol: i32, correlation_id: i64) -> Result<i64> {
        if !matches!(self.state(), SessionState::Negotiating | SessionState::Open) {
            return Ok(send_status::NOT_OPEN);
        }

        let body = self.shared.adapter.create_acknowledge();
        let mut header = self.create_message_header(
            protocol,
            core_message_types::ACKNOWLEDGE,
            correlation_id,
            flags::FINAL_PART,
        );
        header.message_id = self.next_message_id();
        self.transmit(&mut header, &*body).await?;
        Ok(header.message_id)
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Process one inbound frame.
    pub(crate) async fn handle_frame(&self, frame: Bytes) -> Result<()> {
        let (header, body) = match self.shared.adapter.decode_message_header(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                // Without a header there is nothing to correlate a reply to.
                return Err(EtpError::Transport(format!("undecodable message header: {}", e)));
            }
        };

        tracing::trace!(
            "Received protocol={} type={} id={} correlation={} flags={:#x}",
            header.protocol,
            header.message_type,
            header.message_id,
            header.correlation_id,
            header.message_flags
        );

        let state = self.state();
        if state.is_terminal() {
            tracing::debug!("Dropping message {} received while closing", header.message_id);
            return Ok(());
        }

        if header.correlation_id > 0 && self.shared.pending.is_late(header.correlation_id) {
            tracing::debug!(
                "Dropping late response {} to request {}",
                header.message_id,
                header.correlation_id
            );
            return Ok(());
        }

        if header.is_protocol_exception() {
            return self.handle_protocol_exception(header, &body);
        }
        if header.is_acknowledge() {
            tracing::debug!("Acknowledge for message {}", header.correlation_id);
            return self
                .shared
                .on_acknowledge
                .notify(&ProtocolEvent::new(header, ()));
        }

        if state == SessionState::Negotiating && !header.is_core() {
            let e = EtpError::violation(
                error_codes::INVALID_STATE,
                format!("protocol {} message before session open", header.protocol),
            );
            self.report_violation(&header, &e).await;
            return Err(e);
        }

        let handler = match self.shared.registry.resolve(header.protocol) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::warn!("Session {}: {}", self.id(), e);
                self.report_violation(&header, &e).await;
                return Err(e);
            }
        };

        let result = handler.handle_message(self, header, body.clone()).await;
        if let Err(e) = &result {
            if e.is_reportable() {
                tracing::warn!(
                    "Session {}: rejecting message {} (protocol={} type={}): {}",
                    self.id(),
                    header.message_id,
                    header.protocol,
                    header.message_type,
                    e
                );
                self.report_violation(&header, e).await;
                return result;
            }
        }

        if header.wants_acknowledge() {
            self.send_acknowledge(header.protocol, header.message_id).await?;
        }

        if header.correlation_id > 0 && header.completes_exchange() {
            self.shared.pending.complete(
                header.correlation_id,
                Ok(Completion::Message(CorrelatedMessage { header, body })),
            );
        }

        result
    }

    fn handle_protocol_exception(&self, header: MessageHeader, body: &[u8]) -> Result<()> {
        let info = self
            .shared
            .adapter
            .decode_protocol_exception(&header, body)?;
        tracing::warn!(
            "Session {}: protocol exception on protocol {} for message {}: ({}) {}",
            self.id(),
            header.protocol,
            header.correlation_id,
            info.code,
            info.message
        );

        if header.correlation_id > 0 {
            self.shared.pending.complete(
                header.correlation_id,
                Err(EtpError::RemoteException {
                    code: info.code,
                    message: info.message.clone(),
                }),
            );
        }

        if !header.is_core() {
            if let Some(handler) = self.shared.registry.get(header.protocol) {
                handler.protocol_exception_received(&header, &info);
            }
        }

        let notified = self
            .shared
            .on_protocol_exception
            .notify(&ProtocolEvent::new(header, info.clone()));

        if header.is_core() {
            match self.state() {
                SessionState::Negotiating => self.fail_negotiation(&info.message),
                SessionState::Open => self.shutdown(&info.message, || EtpError::RemoteException {
                    code: info.code,
                    message: info.message.clone(),
                }),
                _ => {}
            }
        }
        notified
    }

    /// Tell the peer its message was rejected and count the violation.
    async fn report_violation(&self, header: &MessageHeader, error: &EtpError) {
        let info = ErrorInfo::from(error);
        if let Err(e) = self
            .send_protocol_exception(header.protocol, header.message_id, &info)
            .await
        {
            tracing::warn!("Could not send protocol exception: {}", e);
        }

        let count = self.shared.violations.fetch_add(1, Ordering::AcqRel) + 1;
        let limit = self.shared.config.max_protocol_violations;
        if limit > 0 && count > limit {
            tracing::error!(
                "Session {}: {} protocol violations, closing",
                self.id(),
                count
            );
            let reason = format!("too many protocol violations ({})", count);
            // Best effort: tell the peer, then close.
            let _ = self.close(&reason).await;
        }
    }

    /// Feed one Chunk message into the reassembler.
    ///
    /// Returns the blob once its final part arrived; the pending request it
    /// answers is resolved with it. A blob that exceeds its size ceiling
    /// fails that request and yields [`EtpError::ChunkLimit`].
    pub fn reassemble_chunk(
        &self,
        header: &MessageHeader,
        blob_id: Uuid,
        data: &[u8],
    ) -> Result<Option<Blob>> {
        let (outcome, expired) = {
            let mut chunks = self.shared.chunks.lock();
            let expired = chunks.sweep_expired(Instant::now());
            (chunks.accept(header, blob_id, data), expired)
        };

        for blob in expired {
            tracing::warn!(
                "Discarding blob {} incomplete after {:?}",
                blob.blob_id,
                blob.age
            );
            self.shared
                .pending
                .complete(blob.correlation_id, Err(blob.to_error()));
        }

        match outcome {
            Ok(ChunkOutcome::Complete(data)) => {
                let blob = Blob {
                    blob_id,
                    header: *header,
                    data,
                };
                self.shared
                    .pending
                    .complete(header.correlation_id, Ok(Completion::Blob(blob.clone())));
                Ok(Some(blob))
            }
            Ok(ChunkOutcome::Incomplete { received }) => {
                tracing::trace!("Blob {}: {} bytes so far", blob_id, received);
                Ok(None)
            }
            Ok(ChunkOutcome::Ignored) => {
                tracing::warn!("Ignoring chunk for finished blob {}", blob_id);
                Ok(None)
            }
            Err(e) => {
                if let EtpError::ChunkLimit { blob_id, reason } = &e {
                    self.shared.pending.complete(
                        header.correlation_id,
                        Err(EtpError::ChunkLimit {
                            blob_id: *blob_id,
                            reason: reason.clone(),
                        }),
                    );
                }
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("is_client", &self.shared.is_client)
            .field("version", &self.version())
            .field("state", &self.state())
            .field("registry", &self.shared.registry)
            .finish()
    }
}

/// Read frames until the connection or the session ends.
async fn read_loop<R: FrameSource>(shared: Weak<SessionShared>, mut source: R) {
    loop {
        let next = source.recv_frame().await;
        let Some(session) = shared.upgrade().map(|shared| Session { shared }) else {
            return;
        };

        match next {
            Some(Ok(frame)) => {
                if let Err(e) = session.handle_frame(frame).await {
                    if e.is_fatal() {
                        tracing::error!("Session {}: {}", session.id(), e);
                        let reason = e.to_string();
                        session.shutdown(&reason, || EtpError::Transport(reason.clone()));
                        return;
                    }
                    tracing::debug!("Session {}: message handling failed: {}", session.id(), e);
                }
                if session.state() == SessionState::Closed {
                    return;
                }
            }
            Some(Err(e)) if !e.is_fatal() => {
                tracing::warn!("Session {}: dropping unreadable frame: {}", session.id(), e);
            }
            Some(Err(e)) => {
                tracing::error!("Session {}: read error: {}", session.id(), e);
                let reason = e.to_string();
                session.shutdown(&reason, || EtpError::Transport(reason.clone()));
                return;
            }
            None => {
                if !session.state().is_terminal() {
                    tracing::info!("Session {}: connection closed by peer", session.id());
                }
                session.shutdown("connection closed by peer", || {
                    EtpError::Transport("connection closed by peer".to_string())
                });
                return;
            }
        }
    }
}

/// Close the session when the read loop dies without closing it.
async fn watch_reader(shared: Weak<SessionShared>, reader_task: JoinHandle<()>) {
    let outcome = reader_task.await;
    let Some(session) = shared.upgrade().map(|shared| Session { shared }) else {
        return;
    };

    let reason = match outcome {
        Ok(()) => return,
        Err(e) if e.is_cancelled() => return,
        Err(e) => format!("reader task failed: {}", e),
    };
    tracing::error!("Session {}: {}", session.id(), reason);
    session.shutdown(&reason, || EtpError::Transport(reason.clone()));
}

/// Fail negotiation that has not finished within `deadline`.
async fn enforce_negotiation_deadline(
    shared: Weak<SessionShared>,
    mut state: watch::Receiver<SessionState>,
    deadline: Duration,
) {
    let settled = tokio::time::timeout(
        deadline,
        state.wait_for(|s| *s != SessionState::Negotiating),
    )
    .await
    .is_ok();
    if settled {
        return;
    }
    let Some(session) = shared.upgrade().map(|shared| Session { shared }) else {
        return;
    };
    if session.state() == SessionState::Negotiating {
        session.fail_negotiation(&format!("negotiation timed out after {:?}", deadline));
    }
}

/// Close the session when the writer task fails.
async fn watch_writer(shared: Weak<SessionShared>, writer_task: JoinHandle<Result<()>>) {
    let outcome = writer_task.await;
    let Some(session) = shared.upgrade().map(|shared| Session { shared }) else {
        return;
    };

    let reason = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("writer task failed: {}", e),
    };
    tracing::error!("Session {}: write error: {}", session.id(), reason);
    session.shutdown(&reason, || EtpError::Transport(reason.clone()));
}
