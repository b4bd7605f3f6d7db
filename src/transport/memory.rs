//! In-memory duplex transport backed by tokio mpsc channels.

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{FrameSink, FrameSource};
use crate::error::{EtpError, Result};

/// Sending half of an in-memory connection.
#[derive(Debug, Clone)]
pub struct MemorySink {
    tx: mpsc::Sender<Bytes>,
}

/// Receiving half of an in-memory connection.
#[derive(Debug)]
pub struct MemorySource {
    rx: mpsc::Receiver<Bytes>,
}

/// One endpoint of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    pub sink: MemorySink,
    pub source: MemorySource,
}

impl MemoryTransport {
    pub fn split(self) -> (MemorySink, MemorySource) {
        (self.sink, self.source)
    }
}

/// Create two connected endpoints. Frames sent on one arrive on the other in
/// order. Each direction buffers up to `capacity` frames.
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));

    let a = MemoryTransport {
        sink: MemorySink { tx: a_tx },
        source: MemorySource { rx: a_rx },
    };
    let b = MemoryTransport {
        sink: MemorySink { tx: b_tx },
        source: MemorySource { rx: b_rx },
    };
    (a, b)
}

impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| EtpError::Transport("peer endpoint dropped".to_string()))
    }
}

impl FrameSource for MemorySource {
    async fn recv_frame(&mut self) -> Option<Result<Bytes>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_in_order() {
        let (a, b) = memory_pair(4);
        let (mut a_sink, _a_source) = a.split();
        let (_b_sink, mut b_source) = b.split();

        for i in 0..3u8 {
            a_sink.send_frame(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..3u8 {
            let frame = b_source.recv_frame().await.unwrap().unwrap();
            assert_eq!(frame.as_ref(), &[i]);
        }
    }

    #[tokio::test]
    async fn test_dropped_peer() {
        let (a, b) = memory_pair(1);
        let (mut a_sink, mut a_source) = a.split();
        drop(b);

        assert!(matches!(
            a_sink.send_frame(Bytes::from_static(b"x")).await,
            Err(EtpError::Transport(_))
        ));
        assert!(a_source.recv_frame().await.is_none());
    }
}
