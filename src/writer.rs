//! Dedicated writer task serializing outbound frames.
//!
//! Every sender in the session (handlers, the read loop answering with
//! acknowledgements or exceptions, application calls) pushes encoded frames
//! into one mpsc channel. A single task owns the [`FrameSink`] and writes
//! them in order, so frames never interleave on the wire.
//!
//! ```text
//! Handler 1 ─┐
//! Handler 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► FrameSink
//! Read loop ─┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{EtpError, Result};
use crate::transport::FrameSink;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames drained from the channel per wake-up.
const MAX_BATCH_SIZE: usize = 64;

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue. Senders wait when it is full.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable. The task exits once every handle is dropped and the
/// queue has been drained.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Bytes>,
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Queue a frame, waiting while the channel is full.
    pub async fn send(&self, frame: Bytes) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            EtpError::Transport("writer task stopped".to_string())
        })
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Spawn the writer task over `sink`.
///
/// The returned `JoinHandle` resolves with the first sink error, or `Ok(())`
/// after a clean shutdown.
pub fn spawn_writer_task<S: FrameSink>(
    sink: S,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, sink, pending));

    (handle, task)
}

async fn writer_loop<S: FrameSink>(
    mut rx: mpsc::Receiver<Bytes>,
    mut sink: S,
    pending: Arc<AtomicUsize>,
) -> Result<()> {
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    loop {
        let Some(first) = rx.recv().await else {
            debug!("writer channel closed, stopping");
            return Ok(());
        };

        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        trace!(frames = batch_size, "writing batch");
        for frame in batch.drain(..) {
            if let Err(e) = sink.send_frame(frame).await {
                rx.close();
                return Err(e);
            }
        }

        pending.fetch_sub(batch_size, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{memory_pair, FrameSource};

    #[tokio::test]
    async fn test_frames_written_in_order() {
        let (a, b) = memory_pair(16);
        let (sink, _a_source) = a.split();
        let (_b_sink, mut source) = b.split();

        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());
        for i in 0..10u8 {
            handle.send(Bytes::from(vec![i])).await.unwrap();
        }

        for i in 0..10u8 {
            let frame = source.recv_frame().await.unwrap().unwrap();
            assert_eq!(frame.as_ref(), &[i]);
        }

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (a, b) = memory_pair(1024);
        let (sink, _a_source) = a.split();
        let (_b_sink, mut source) = b.split();

        let (handle, task) = spawn_writer_task(sink, WriterConfig { channel_capacity: 8 });

        let mut joins = Vec::new();
        for sender in 0..4u8 {
            let handle = handle.clone();
            joins.push(tokio::spawn(async move {
                for i in 0..50u8 {
                    handle.send(Bytes::from(vec![sender; i as usize + 1])).await.unwrap();
                }
            }));
        }
        for j in joins {
            j.await.unwrap();
        }
        drop(handle);

        let mut received = 0;
        while let Some(frame) = source.recv_frame().await {
            let frame = frame.unwrap();
            assert!(frame.iter().all(|b| *b == frame[0]));
            received += 1;
            if received == 200 {
                break;
            }
        }
        assert_eq!(received, 200);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sink_failure_stops_task() {
        let (a, b) = memory_pair(1);
        let (sink, _a_source) = a.split();
        drop(b);

        let (handle, task) = spawn_writer_task(sink, WriterConfig::default());
        handle.send(Bytes::from_static(b"lost")).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(EtpError::Transport(_))));
        assert!(handle.send(Bytes::from_static(b"after")).await.is_err());
    }
}
