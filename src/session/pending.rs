//! Correlation of outbound requests with their responses.
//!
//! Every request sent with [`Session::send_request`](super::Session::send_request)
//! parks a oneshot sender here under its message id. The read loop completes
//! it when the final correlated message, a reassembled blob or a protocol
//! exception arrives. Ids whose wait timed out are remembered for a while so
//! their late responses can be recognised and dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::codec;
use crate::error::{EtpError, Result};
use crate::protocol::{AvroDecode, MessageHeader};

/// How many expired ids are remembered for late-response detection.
const EXPIRED_HISTORY: usize = 4096;

/// A message correlated to a request, body still encoded.
#[derive(Debug, Clone)]
pub struct CorrelatedMessage {
    pub header: MessageHeader,
    pub body: Bytes,
}

impl CorrelatedMessage {
    /// Decode the body as `T`.
    pub fn decode<T: AvroDecode>(&self) -> Result<T> {
        codec::decode_body(&self.header, &self.body)
    }
}

/// A blob reassembled from Chunk messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Blob {
    pub blob_id: Uuid,
    /// Header of the final chunk.
    pub header: MessageHeader,
    pub data: Bytes,
}

/// What a request resolved with.
#[derive(Debug, Clone)]
pub enum Completion {
    Message(CorrelatedMessage),
    Blob(Blob),
}

impl Completion {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Completion::Message(m) => &m.header,
            Completion::Blob(b) => &b.header,
        }
    }

    pub fn into_message(self) -> Option<CorrelatedMessage> {
        match self {
            Completion::Message(m) => Some(m),
            Completion::Blob(_) => None,
        }
    }

    pub fn into_blob(self) -> Option<Blob> {
        match self {
            Completion::Blob(b) => Some(b),
            Completion::Message(_) => None,
        }
    }
}

type Waiter = oneshot::Sender<Result<Completion>>;

#[derive(Default)]
struct Inner {
    waiters: HashMap<i64, Waiter>,
    expired: HashSet<i64>,
    expired_order: VecDeque<i64>,
}

/// Pending request table owned by one session.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<Inner>,
    late_responses: AtomicU64,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a waiter for `message_id`.
    pub(crate) fn register(self: &Arc<Self>, message_id: i64) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().waiters.insert(message_id, tx);
        PendingResponse {
            message_id,
            rx,
            requests: self.clone(),
        }
    }

    /// Resolve the waiter for `message_id`. Returns whether one existed.
    pub(crate) fn complete(&self, message_id: i64, result: Result<Completion>) -> bool {
        let waiter = self.inner.lock().waiters.remove(&message_id);
        match waiter {
            Some(tx) => {
                // the receiver may already be gone
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop the waiter without resolving it.
    pub(crate) fn remove(&self, message_id: i64) {
        self.inner.lock().waiters.remove(&message_id);
    }

    /// Drop the waiter and remember the id as expired.
    pub(crate) fn expire(&self, message_id: i64) {
        let mut inner = self.inner.lock();
        inner.waiters.remove(&message_id);
        if inner.expired.insert(message_id) {
            inner.expired_order.push_back(message_id);
            if inner.expired_order.len() > EXPIRED_HISTORY {
                if let Some(oldest) = inner.expired_order.pop_front() {
                    inner.expired.remove(&oldest);
                }
            }
        }
    }

    /// Whether `correlation_id` belongs to an expired request. Counts the
    /// late response when it does.
    pub(crate) fn is_late(&self, correlation_id: i64) -> bool {
        let late = self.inner.lock().expired.contains(&correlation_id);
        if late {
            self.late_responses.fetch_add(1, Ordering::Relaxed);
        }
        late
    }

    /// Fail every outstanding waiter with the error `make_error` builds.
    pub(crate) fn cancel_all(&self, make_error: impl Fn() -> EtpError) -> usize {
        let waiters: Vec<Waiter> = self.inner.lock().waiters.drain().map(|(_, tx)| tx).collect();
        let count = waiters.len();
        for tx in waiters {
            let _ = tx.send(Err(make_error()));
        }
        if count > 0 {
            debug!(count, "cancelled pending requests");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Responses dropped because their wait had already timed out.
    pub fn late_responses(&self) -> u64 {
        self.late_responses.load(Ordering::Relaxed)
    }
}

/// Handle to the eventual response of one request.
#[derive(Debug)]
pub struct PendingResponse {
    message_id: i64,
    rx: oneshot::Receiver<Result<Completion>>,
    requests: Arc<PendingRequests>,
}

impl PendingResponse {
    /// Message id of the request.
    pub fn message_id(&self) -> i64 {
        self.message_id
    }

    /// Wait up to `timeout` for the response.
    ///
    /// On timeout the pending entry is removed and any later response for
    /// this request is dropped by the session.
    pub async fn wait(self, timeout: Duration) -> Result<Completion> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EtpError::SessionClosed),
            Err(_) => {
                self.requests.expire(self.message_id);
                Err(EtpError::Timeout(timeout))
            }
        }
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.len())
            .field("late_responses", &self.late_responses())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    fn message(correlation_id: i64) -> Completion {
        Completion::Message(CorrelatedMessage {
            header: MessageHeader::new(4, 4, correlation_id, flags::FINAL_PART),
            body: Bytes::new(),
        })
    }

    #[tokio::test]
    async fn test_complete_resolves_wait() {
        let requests = Arc::new(PendingRequests::new());
        let pending = requests.register(5);
        assert_eq!(requests.len(), 1);

        assert!(requests.complete(5, Ok(message(5))));
        let completion = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(completion.header().correlation_id, 5);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn test_complete_unknown_id() {
        let requests = PendingRequests::new();
        assert!(!requests.complete(99, Ok(message(99))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires_entry() {
        let requests = Arc::new(PendingRequests::new());
        let pending = requests.register(7);

        let err = pending.wait(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, EtpError::Timeout(_)));
        assert!(requests.is_empty());

        assert!(requests.is_late(7));
        assert!(!requests.complete(7, Ok(message(7))));
        assert_eq!(requests.late_responses(), 1);
        assert!(!requests.is_late(8));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let requests = Arc::new(PendingRequests::new());
        let a = requests.register(1);
        let b = requests.register(2);

        assert_eq!(requests.cancel_all(|| EtpError::SessionClosed), 2);
        assert!(matches!(a.wait(Duration::from_secs(1)).await, Err(EtpError::SessionClosed)));
        assert!(matches!(b.wait(Duration::from_secs(1)).await, Err(EtpError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_remote_exception_surfaces() {
        let requests = Arc::new(PendingRequests::new());
        let pending = requests.register(3);
        requests.complete(
            3,
            Err(EtpError::RemoteException {
                code: 11,
                message: "not found".into(),
            }),
        );
        match pending.wait(Duration::from_secs(1)).await {
            Err(EtpError::RemoteException { code, .. }) => assert_eq!(code, 11),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_expired_history_is_bounded() {
        let requests = PendingRequests::new();
        for id in 0..(EXPIRED_HISTORY as i64 + 10) {
            requests.expire(id);
        }
        assert!(!requests.is_late(0));
        assert!(requests.is_late(EXPIRED_HISTORY as i64 + 9));
    }
}
