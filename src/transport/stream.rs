//! Length-delimited frames over a tokio byte stream.
//!
//! Wire format per frame: 4-byte big-endian length, then that many bytes.
//! Suitable for Unix sockets, TCP and pipes when both ends speak this framing.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{FrameSink, FrameSource};
use crate::error::{EtpError, Result};

/// Default maximum frame size accepted by [`StreamSource`] (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Writes length-prefixed frames to an `AsyncWrite`.
pub struct StreamSink<W> {
    writer: W,
}

impl<W> StreamSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        let len = u32::try_from(frame.len())
            .map_err(|_| EtpError::Transport(format!("frame of {} bytes too large", frame.len())))?;
        self.writer.write_all(&len.to_be_bytes()).await?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Reads length-prefixed frames from an `AsyncRead`.
///
/// Partial reads accumulate in a single buffer; complete frames are split
/// off without copying.
pub struct StreamSource<R> {
    reader: R,
    buffer: BytesMut,
    max_frame_size: u32,
}

impl<R> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_frame_size(reader, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(reader: R, max_frame_size: u32) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(64 * 1024),
            max_frame_size,
        }
    }

    /// Extract one complete frame from the buffer, if present.
    fn try_extract(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix);
        if len > self.max_frame_size {
            return Err(EtpError::Transport(format!(
                "frame size {} exceeds maximum {}",
                len, self.max_frame_size
            )));
        }

        let len = len as usize;
        if self.buffer.len() < LENGTH_PREFIX + len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}

impl<R> FrameSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn recv_frame(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.try_extract() {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            match self.reader.read_buf(&mut self.buffer).await {
                Ok(0) if self.buffer.is_empty() => return None,
                Ok(0) => {
                    return Some(Err(EtpError::Transport(format!(
                        "connection closed with {} bytes of a partial frame",
                        self.buffer.len()
                    ))))
                }
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}
