//! In-process broker.
//!
//! Routes by exact subject match. Messages published to a subject nobody
//! listens on are dropped and counted, the same way a real broker silently
//! discards them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{BoxFuture, Connection, Message, Subscription, Transport};
use crate::error::{Result, RpcError};
use crate::protocol::{random_nonce, INBOX_PREFIX};

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Message>)>>;

/// In-memory pub/sub broker.
///
/// Cheap to clone; clones share the same broker.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Broker>,
}

struct Broker {
    subscribers: Mutex<Subscribers>,
    next_sid: AtomicU64,
    next_inbox: AtomicU64,
    inbox_nonce: u64,
    closed: AtomicBool,
    undelivered: AtomicUsize,
}

impl Broker {
    fn subscribers(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, subject: &str, sid: u64) {
        let mut subs = self.subscribers();
        if let Some(list) = subs.get_mut(subject) {
            list.retain(|(id, _)| *id != sid);
            if list.is_empty() {
                subs.remove(subject);
            }
        }
    }
}

impl MemoryTransport {
    /// Create an empty, connected broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Broker {
                subscribers: Mutex::new(HashMap::new()),
                next_sid: AtomicU64::new(1),
                next_inbox: AtomicU64::new(1),
                inbox_nonce: random_nonce(),
                closed: AtomicBool::new(false),
                undelivered: AtomicUsize::new(0),
            }),
        }
    }

    /// This broker as a shared [`Connection`].
    pub fn connection(&self) -> Connection {
        Arc::new(self.clone())
    }

    /// Disconnect: drops every subscription and fails further operations.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.subscribers().clear();
    }

    /// Active subscriptions on `subject`.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.inner.subscribers().get(subject).map_or(0, Vec::len)
    }

    /// Active subscriptions across all subjects.
    pub fn total_subscriptions(&self) -> usize {
        self.inner.subscribers().values().map(Vec::len).sum()
    }

    /// Messages that found no subscriber.
    pub fn undelivered(&self) -> usize {
        self.inner.undelivered.load(Ordering::Acquire)
    }

    fn publish_now(&self, subject: &str, payload: Bytes) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }

        let mut delivered = false;
        {
            let subs = self.inner.subscribers();
            if let Some(list) = subs.get(subject) {
                for (_, tx) in list {
                    let msg = Message {
                        subject: subject.to_string(),
                        payload: payload.clone(),
                    };
                    delivered |= tx.send(msg).is_ok();
                }
            }
        }

        if !delivered {
            self.inner.undelivered.fetch_add(1, Ordering::AcqRel);
            tracing::trace!("No subscriber for {}, message dropped", subject);
        }
        Ok(())
    }

    fn subscribe_now(&self, subject: &str) -> Result<Subscription> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        if subject.is_empty() || subject.chars().any(char::is_whitespace) {
            return Err(RpcError::InvalidSubject(subject.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers()
            .entry(subject.to_string())
            .or_default()
            .push((sid, tx));

        let broker = Arc::downgrade(&self.inner);
        let owned = subject.to_string();
        Ok(Subscription::new(subject, rx, move || {
            if let Some(broker) = broker.upgrade() {
                broker.remove(&owned, sid);
            }
        }))
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn publish(&self, subject: &str, payload: Bytes) -> BoxFuture<'_, Result<()>> {
        let result = self.publish_now(subject, payload);
        Box::pin(async move { result })
    }

    fn subscribe(&self, subject: &str) -> BoxFuture<'_, Result<Subscription>> {
        let result = self.subscribe_now(subject);
        Box::pin(async move { result })
    }

    fn new_inbox(&self) -> String {
        let seq = self.inner.next_inbox.fetch_add(1, Ordering::Relaxed);
        format!("{}.{:x}.{}", INBOX_PREFIX, self.inner.inbox_nonce, seq)
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }
}
