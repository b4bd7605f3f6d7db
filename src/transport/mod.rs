//! Transport module - frame-oriented connections the session runs over.
//!
//! A transport delivers whole frames: one `send_frame` call puts exactly one
//! encoded message on the wire and one `recv_frame` call yields exactly one.
//! Two bindings ship with the crate:
//! - an in-memory duplex pair for loopback and tests
//! - a length-delimited binding over any tokio byte stream

mod memory;
mod stream;

pub use memory::{memory_pair, MemorySink, MemorySource, MemoryTransport};
pub use stream::{StreamSink, StreamSource, DEFAULT_MAX_FRAME_SIZE};

use std::future::Future;

use bytes::Bytes;

use crate::error::Result;

/// Outbound half of a connection.
pub trait FrameSink: Send + 'static {
    /// Write one frame.
    fn send_frame(&mut self, frame: Bytes) -> impl Future<Output = Result<()>> + Send;
}

/// Inbound half of a connection.
pub trait FrameSource: Send + 'static {
    /// Read the next frame, or `None` once the peer has closed the connection.
    fn recv_frame(&mut self) -> impl Future<Output = Option<Result<Bytes>>> + Send;
}
