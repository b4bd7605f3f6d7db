//! Reassembly of blobs split across Chunk messages.
//!
//! Parts of one blob share a blob id and arrive in send order on one
//! connection. Each buffer is bounded by size and by age; a blob that hits
//! either ceiling is discarded and its id is remembered as finished, so
//! stray parts that follow are ignored instead of opening a new buffer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{EtpError, Result};
use crate::protocol::MessageHeader;

/// How many finished blob ids are remembered.
const FINISHED_HISTORY: usize = 1024;

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// More parts are expected; `received` bytes buffered so far.
    Incomplete { received: usize },
    /// The final part arrived; the whole blob.
    Complete(Bytes),
    /// The blob was already finished or discarded; the part was dropped.
    Ignored,
}

/// A buffer discarded for exceeding its age ceiling.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredBlob {
    pub blob_id: Uuid,
    pub correlation_id: i64,
    pub age: Duration,
}

impl ExpiredBlob {
    pub fn to_error(&self) -> EtpError {
        EtpError::ChunkLimit {
            blob_id: self.blob_id,
            reason: format!("incomplete after {:?}", self.age),
        }
    }
}

#[derive(Debug)]
struct ChunkBuffer {
    correlation_id: i64,
    data: BytesMut,
    started: Instant,
}

/// Per-session chunk buffers keyed by blob id.
#[derive(Debug)]
pub struct ChunkReassembler {
    buffers: HashMap<Uuid, ChunkBuffer>,
    finished: HashSet<Uuid>,
    finished_order: VecDeque<Uuid>,
    max_blob_size: usize,
    max_blob_age: Duration,
}

impl ChunkReassembler {
    pub fn new(max_blob_size: usize, max_blob_age: Duration) -> Self {
        Self {
            buffers: HashMap::new(),
            finished: HashSet::new(),
            finished_order: VecDeque::new(),
            max_blob_size,
            max_blob_age,
        }
    }

    /// Feed one part of `blob_id`.
    ///
    /// `header` is the Chunk message header; its final-part flag closes the
    /// blob. Exceeding the size ceiling discards the buffer and returns
    /// [`EtpError::ChunkLimit`].
    pub fn accept(&mut self, header: &MessageHeader, blob_id: Uuid, data: &[u8]) -> Result<ChunkOutcome> {
        if self.finished.contains(&blob_id) {
            return Ok(ChunkOutcome::Ignored);
        }

        let final_part = header.is_final_part();

        // Fast path: a single final part for an unseen blob.
        if final_part && !self.buffers.contains_key(&blob_id) {
            self.check_size(blob_id, data.len())?;
            self.finish(blob_id);
            return Ok(ChunkOutcome::Complete(Bytes::copy_from_slice(data)));
        }

        let buffered = self.buffers.get(&blob_id).map_or(0, |b| b.data.len());
        if let Err(e) = self.check_size(blob_id, buffered + data.len()) {
            self.buffers.remove(&blob_id);
            self.finish(blob_id);
            return Err(e);
        }

        let buffer = self.buffers.entry(blob_id).or_insert_with(|| ChunkBuffer {
            correlation_id: header.correlation_id,
            data: BytesMut::new(),
            started: Instant::now(),
        });
        buffer.data.extend_from_slice(data);

        if !final_part {
            return Ok(ChunkOutcome::Incomplete {
                received: buffer.data.len(),
            });
        }

        let blob = self
            .buffers
            .remove(&blob_id)
            .map(|b| b.data.freeze())
            .unwrap_or_default();
        self.finish(blob_id);
        Ok(ChunkOutcome::Complete(blob))
    }

    /// Discard every buffer older than the age ceiling at `now`.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<ExpiredBlob> {
        let max_age = self.max_blob_age;
        let expired: Vec<ExpiredBlob> = self
            .buffers
            .iter()
            .filter_map(|(blob_id, buffer)| {
                let age = now.saturating_duration_since(buffer.started);
                (age > max_age).then_some(ExpiredBlob {
                    blob_id: *blob_id,
                    correlation_id: buffer.correlation_id,
                    age,
                })
            })
            .collect();

        for blob in &expired {
            self.buffers.remove(&blob.blob_id);
            self.finish(blob.blob_id);
        }
        expired
    }

    /// Drop all buffers and history.
    pub fn clear(&mut self) {
        self.buffers.clear();
        self.finished.clear();
        self.finished_order.clear();
    }

    /// Blobs currently being assembled.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn check_size(&self, blob_id: Uuid, size: usize) -> Result<()> {
        if size > self.max_blob_size {
            return Err(EtpError::ChunkLimit {
                blob_id,
                reason: format!("{} bytes exceeds maximum {}", size, self.max_blob_size),
            });
        }
        Ok(())
    }

    fn finish(&mut self, blob_id: Uuid) {
        if self.finished.insert(blob_id) {
            self.finished_order.push_back(blob_id);
            if self.finished_order.len() > FINISHED_HISTORY {
                if let Some(oldest) = self.finished_order.pop_front() {
                    self.finished.remove(&oldest);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    fn part(final_part: bool) -> MessageHeader {
        let f = if final_part {
            flags::MULTI_PART_AND_FINAL_PART
        } else {
            flags::MULTI_PART
        };
        MessageHeader::new(4, 8, 12, f)
    }

    fn reassembler() -> ChunkReassembler {
        ChunkReassembler::new(1024, Duration::from_secs(60))
    }

    #[test]
    fn test_three_parts() {
        let mut r = reassembler();
        let blob = Uuid::new_v4();

        assert_eq!(
            r.accept(&part(false), blob, b"AB").unwrap(),
            ChunkOutcome::Incomplete { received: 2 }
        );
        assert_eq!(
            r.accept(&part(false), blob, b"CD").unwrap(),
            ChunkOutcome::Incomplete { received: 4 }
        );
        assert_eq!(
            r.accept(&part(true), blob, b"EF").unwrap(),
            ChunkOutcome::Complete(Bytes::from_static(b"ABCDEF"))
        );
        assert!(r.is_empty());
    }

    #[test]
    fn test_final_only_part() {
        let mut r = reassembler();
        assert_eq!(
            r.accept(&part(true), Uuid::new_v4(), b"XYZ").unwrap(),
            ChunkOutcome::Complete(Bytes::from_static(b"XYZ"))
        );
    }

    #[test]
    fn test_interleaved_blobs() {
        let mut r = reassembler();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        r.accept(&part(false), a, b"a1").unwrap();
        r.accept(&part(false), b, b"b1").unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(
            r.accept(&part(true), b, b"b2").unwrap(),
            ChunkOutcome::Complete(Bytes::from_static(b"b1b2"))
        );
        assert_eq!(
            r.accept(&part(true), a, b"a2").unwrap(),
            ChunkOutcome::Complete(Bytes::from_static(b"a1a2"))
        );
    }

    #[test]
    fn test_part_after_final_is_ignored() {
        let mut r = reassembler();
        let blob = Uuid::new_v4();
        r.accept(&part(true), blob, b"done").unwrap();

        assert_eq!(r.accept(&part(false), blob, b"late").unwrap(), ChunkOutcome::Ignored);
        assert_eq!(r.accept(&part(true), blob, b"late").unwrap(), ChunkOutcome::Ignored);
        assert!(r.is_empty());
    }

    #[test]
    fn test_size_ceiling() {
        let mut r = ChunkReassembler::new(4, Duration::from_secs(60));
        let blob = Uuid::new_v4();

        r.accept(&part(false), blob, b"abc").unwrap();
        let err = r.accept(&part(false), blob, b"de").unwrap_err();
        assert!(matches!(err, EtpError::ChunkLimit { blob_id, .. } if blob_id == blob));
        assert!(r.is_empty());

        // the rest of the blob is dropped
        assert_eq!(r.accept(&part(true), blob, b"f").unwrap(), ChunkOutcome::Ignored);
    }

    #[test]
    fn test_size_ceiling_single_final_part() {
        let mut r = ChunkReassembler::new(2, Duration::from_secs(60));
        assert!(r.accept(&part(true), Uuid::new_v4(), b"abc").is_err());
    }

    #[test]
    fn test_age_ceiling() {
        let mut r = ChunkReassembler::new(1024, Duration::from_millis(100));
        let blob = Uuid::new_v4();
        r.accept(&part(false), blob, b"stale").unwrap();

        assert!(r.sweep_expired(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(1);
        let expired = r.sweep_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].blob_id, blob);
        assert_eq!(expired[0].correlation_id, 12);
        assert!(matches!(expired[0].to_error(), EtpError::ChunkLimit { .. }));
        assert!(r.is_empty());
        assert_eq!(r.accept(&part(true), blob, b"!").unwrap(), ChunkOutcome::Ignored);
    }
}
