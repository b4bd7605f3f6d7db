//! Subscriber lists for application-visible protocol events.
//!
//! Subscribers are plain callbacks invoked synchronously, in registration
//! order, while the session dispatches the message. A failing subscriber
//! does not stop delivery to the ones after it; the failures are collected
//! and reported to whoever drove the dispatch.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{EtpError, Result};
use crate::protocol::MessageHeader;

/// Error type subscribers may return.
pub type SubscriberError = Box<dyn std::error::Error + Send + Sync>;

/// Result returned by a subscriber callback.
pub type SubscriberResult = std::result::Result<(), SubscriberError>;

type Subscriber<E> = Arc<dyn Fn(&E) -> SubscriberResult + Send + Sync>;

/// A received message together with its header and, for responses, the
/// request it answers.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolEvent<T, R = ()> {
    pub header: MessageHeader,
    pub message: T,
    pub request: Option<R>,
}

impl<T> ProtocolEvent<T> {
    pub fn new(header: MessageHeader, message: T) -> Self {
        Self {
            header,
            message,
            request: None,
        }
    }
}

impl<T, R> ProtocolEvent<T, R> {
    pub fn with_request(header: MessageHeader, message: T, request: Option<R>) -> Self {
        Self {
            header,
            message,
            request,
        }
    }
}

/// Ordered list of callbacks for one event.
pub struct EventSubscribers<E> {
    subscribers: RwLock<Vec<Subscriber<E>>>,
}

impl<E> EventSubscribers<E> {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Add a subscriber at the end of the list.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&E) -> SubscriberResult + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(subscriber));
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Deliver `event` to every subscriber.
    ///
    /// The list is snapshotted first so a subscriber may subscribe further
    /// callbacks without deadlocking.
    pub fn notify(&self, event: &E) -> Result<()> {
        let snapshot: Vec<Subscriber<E>> = self.subscribers.read().clone();
        let mut failures = Vec::new();

        for subscriber in snapshot {
            if let Err(e) = subscriber(event) {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EtpError::Subscriber(failures.join("; ")))
        }
    }
}

impl<E> Default for EventSubscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventSubscribers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscribers")
            .field("len", &self.len())
            .finish()
    }
}
