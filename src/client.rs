//! Client builder and call path.
//!
//! A call is one round trip over the broker:
//! 1. Marshal the request and pick a fresh inbox subject
//! 2. Subscribe to the inbox before publishing, so the reply cannot be missed
//! 3. Publish the request envelope to the method subject
//! 4. Wait for a reply with the right correlation id, or for the context
//!
//! The inbox subscription is released on every exit path, including when
//! the call future is dropped.
//!
//! # Example
//!
//! ```ignore
//! use pubsub_rpc::{Client, Context};
//!
//! let client = Client::builder()
//!     .default_timeout(Duration::from_secs(2))
//!     .build(connection);
//!
//! let ctx = Context::background().with_timeout(Duration::from_millis(500));
//! let reply = client.call(&ctx, &Echo::echo, &EchoRequest { message: "hi".into() }).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::protocol::{
    deadline_to_wire, method_subject, CorrelationIds, ErrorBody, ErrorKind, Outcome,
    ReplyEnvelope, RequestEnvelope,
};
use crate::service::Method;
use crate::transport::Connection;

/// Builder for configuring and creating a [`Client`].
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the method subject prefix.
    ///
    /// Default: `"rpc"`
    pub fn subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.subject_prefix = prefix.into();
        self
    }

    /// Timeout for calls whose context carries no deadline.
    ///
    /// Default: none
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.config.default_timeout_ms = Some(millis);
        self
    }

    /// Build the client on `connection`.
    pub fn build(self, connection: Connection) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                transport: connection,
                config: self.config,
                ids: CorrelationIds::new(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC client.
///
/// Cheap to clone; clones share correlation ids and in-flight bookkeeping.
/// Safe to call from many tasks at once.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    transport: Connection,
    config: ClientConfig,
    ids: CorrelationIds,
    /// Correlation id to inbox subject of every pending call.
    in_flight: Mutex<HashMap<String, String>>,
}

impl ClientInner {
    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Client {
    /// Create a client with default configuration.
    pub fn new(connection: Connection) -> Self {
        ClientBuilder::new().build(connection)
    }

    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The configuration in effect.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Calls currently waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight().len()
    }

    /// Invoke `method` and wait for its reply.
    ///
    /// Fails with [`RpcError::Timeout`] or [`RpcError::Cancelled`] when `ctx`
    /// ends first, [`RpcError::Application`] when the handler returned an
    /// error, and an encoding error when either side could not marshal.
    pub async fn call<Req, Rep>(
        &self,
        ctx: &Context,
        method: &Method<Req, Rep>,
        request: &Req,
    ) -> Result<Rep>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        let payload = method.marshal_request(request)?;
        let subject = method.subject(&self.inner.config.subject_prefix);
        let reply = self
            .round_trip(ctx, &subject, method.name(), payload)
            .await?;
        method.unmarshal_reply(&reply)
    }

    /// Invoke a method by name with an already marshaled payload.
    pub async fn call_raw(
        &self,
        ctx: &Context,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<Bytes> {
        let subject = method_subject(&self.inner.config.subject_prefix, service, method);
        let reply = self
            .round_trip(ctx, &subject, method, payload.to_vec())
            .await?;
        Ok(Bytes::from(reply))
    }

    /// Publish a request that expects no reply.
    ///
    /// Returns once the broker accepted the message; handler errors are
    /// never reported back.
    pub async fn notify<Req, Rep>(&self, method: &Method<Req, Rep>, request: &Req) -> Result<()>
    where
        Req: Serialize,
    {
        let envelope = RequestEnvelope {
            correlation_id: self.inner.ids.next_id(),
            method: method.name().to_string(),
            payload: method.marshal_request(request)?,
            reply_to: None,
            deadline_ms: None,
        };
        let subject = method.subject(&self.inner.config.subject_prefix);
        self.inner
            .transport
            .publish(&subject, Bytes::from(envelope.encode()?))
            .await
    }

    async fn round_trip(
        &self,
        ctx: &Context,
        subject: &str,
        method: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let ctx = match (ctx.deadline(), self.inner.config.default_timeout()) {
            (None, Some(timeout)) => ctx.with_timeout(timeout),
            _ => ctx.clone(),
        };
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let transport = &self.inner.transport;
        if !transport.is_connected() {
            return Err(RpcError::ConnectionClosed);
        }

        let inbox = transport.new_inbox();
        let mut sub = transport.subscribe(&inbox).await?;

        let correlation_id = self.inner.ids.next_id();
        let _pending = Pending::track(&self.inner, &correlation_id, &inbox);

        let envelope = RequestEnvelope {
            correlation_id: correlation_id.clone(),
            method: method.to_string(),
            payload,
            reply_to: Some(inbox.clone()),
            deadline_ms: ctx.deadline().map(deadline_to_wire),
        };
        transport
            .publish(subject, Bytes::from(envelope.encode()?))
            .await?;
        tracing::debug!("Sent {} to {} ({})", method, subject, correlation_id);

        loop {
            let msg = tokio::select! {
                biased;
                msg = sub.next() => match msg {
                    Some(m) => m,
                    None => return Err(RpcError::ConnectionClosed),
                },
                err = ctx.done() => {
                    tracing::debug!("Call {} on {} ended: {}", correlation_id, subject, err);
                    return Err(err);
                }
            };

            let reply = match ReplyEnvelope::decode(&msg.payload) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        "Ignoring undecodable message on inbox of call {}: {}",
                        correlation_id,
                        e
                    );
                    continue;
                }
            };
            if reply.correlation_id != correlation_id {
                tracing::warn!(
                    "Ignoring reply {} on inbox of call {}",
                    reply.correlation_id,
                    correlation_id
                );
                continue;
            }

            return match reply.outcome {
                Outcome::Payload(bytes) => Ok(bytes),
                Outcome::Error(body) => Err(remote_error(body)),
            };
        }
    }
}

/// Turn a wire error into the caller-facing error.
fn remote_error(body: ErrorBody) -> RpcError {
    match body.kind {
        ErrorKind::Application => RpcError::Application {
            code: body.code,
            message: body.message,
        },
        kind => RpcError::Remote {
            kind,
            message: body.message,
        },
    }
}

/// In-flight entry removed on drop.
struct Pending<'a> {
    inner: &'a ClientInner,
    correlation_id: &'a str,
}

impl<'a> Pending<'a> {
    fn track(inner: &'a ClientInner, correlation_id: &'a str, inbox: &str) -> Self {
        inner
            .in_flight()
            .insert(correlation_id.to_string(), inbox.to_string());
        Self {
            inner,
            correlation_id,
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.inner.in_flight().remove(self.correlation_id);
    }
}
