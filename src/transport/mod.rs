//! Transport module - the pub/sub broker seam.
//!
//! The runtime only needs three things from a broker: publish to a subject,
//! subscribe to a subject (and later unsubscribe), and hand out unique inbox
//! subjects. [`Transport`] captures exactly that; [`MemoryTransport`] is an
//! in-process broker used by tests and demos.
//!
//! # Example
//!
//! ```ignore
//! use pubsub_rpc::transport::{Connection, MemoryTransport, Transport};
//!
//! let broker = MemoryTransport::new();
//! let conn: Connection = broker.connection();
//!
//! let mut sub = conn.subscribe("greetings").await?;
//! conn.publish("greetings", "hi".into()).await?;
//! let msg = sub.next().await.unwrap();
//! ```

mod memory;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

pub use crate::handler::BoxFuture;
pub use memory::MemoryTransport;

/// Shared handle to a broker connection.
///
/// Server and client both hold one; neither closes it.
pub type Connection = Arc<dyn Transport>;

/// A message delivered by the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,
    /// Raw message body.
    pub payload: Bytes,
}

/// Publish/subscribe transport.
///
/// Implementations must be safe to use from many tasks at once.
pub trait Transport: Send + Sync + 'static {
    /// Publish `payload` to `subject`. Delivery is best effort.
    fn publish(&self, subject: &str, payload: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Subscribe to `subject`.
    ///
    /// Messages published after this resolves are delivered to the returned
    /// [`Subscription`].
    fn subscribe(&self, subject: &str) -> BoxFuture<'_, Result<Subscription>>;

    /// A subject no other caller will be handed.
    fn new_inbox(&self) -> String;

    /// Whether the connection can currently be used.
    fn is_connected(&self) -> bool;
}

/// A live subscription.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Build a subscription from a message channel and an unsubscribe hook.
    ///
    /// `unsubscribe` runs at most once.
    pub fn new<F>(
        subject: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Message>,
        unsubscribe: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            subject: subject.into(),
            receiver,
            handle: SubscriptionHandle {
                inner: Arc::new(HandleInner {
                    active: AtomicBool::new(true),
                    unsubscribe: Box::new(unsubscribe),
                }),
            },
        }
    }

    /// Subject this subscription listens on.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message, or `None` once unsubscribed and drained.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    /// Detached handle that can unsubscribe from elsewhere.
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Stop receiving. Returns `false` if already unsubscribed.
    pub fn unsubscribe(&self) -> bool {
        self.handle.unsubscribe()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .field("active", &self.handle.is_active())
            .finish()
    }
}

/// Cloneable unsubscribe handle for a [`Subscription`].
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    active: AtomicBool,
    unsubscribe: Box<dyn Fn() + Send + Sync>,
}

impl SubscriptionHandle {
    /// Unsubscribe; idempotent. Returns `true` only for the call that did it.
    pub fn unsubscribe(&self) -> bool {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            (self.inner.unsubscribe)();
            true
        } else {
            false
        }
    }

    /// Whether the subscription is still active.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_unsubscribe_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (_tx, rx) = mpsc::unbounded_channel();

        let sub = Subscription::new("a", rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = sub.handle();

        assert!(handle.unsubscribe());
        assert!(!sub.unsubscribe());
        assert!(!handle.is_active());
        drop(sub);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let (_tx, rx) = mpsc::unbounded_channel();

        let sub = Subscription::new("a", rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let handle = sub.handle();
        drop(sub);

        assert!(!handle.is_active());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_next_yields_messages_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut sub = Subscription::new("a", rx, || {});

        for i in 0..3u8 {
            tx.send(Message {
                subject: "a".into(),
                payload: Bytes::from(vec![i]),
            })
            .unwrap();
        }
        drop(tx);

        for i in 0..3u8 {
            assert_eq!(sub.next().await.unwrap().payload[0], i);
        }
        assert!(sub.next().await.is_none());
    }
}
