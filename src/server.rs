//! Server builder and dispatch loop.
//!
//! The [`Server`] hosts services on a shared broker [`Connection`]:
//! 1. `register_service` subscribes to every method subject of a service
//! 2. one receive loop per subject waits for a handler slot, then spawns a
//!    tracked dispatch task per message
//! 3. each dispatch decodes the envelope, runs the handler and publishes
//!    exactly one reply when the request asked for one
//! 4. `close` unsubscribes everything, then drains in-flight dispatches
//!
//! # Example
//!
//! ```ignore
//! use pubsub_rpc::{Context, Server};
//!
//! let server = Server::builder()
//!     .max_concurrent_handlers(64)
//!     .build(connection)?;
//!
//! let handle = Echo::register(&server, EchoHandler).await?;
//!
//! // ...
//!
//! server.close(&Context::background().with_timeout(Duration::from_secs(5))).await?;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::{Result, RpcError};
use crate::handler::{Handler, RawReply, RequestContext, ServiceRegistration};
use crate::protocol::{
    validate_subject, EnvelopeHead, ErrorBody, ErrorKind, ReplyEnvelope, RequestEnvelope,
};
use crate::transport::{Connection, Message, Subscription, SubscriptionHandle};

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of concurrent handlers.
    ///
    /// When this limit is reached, further requests wait in their
    /// subscription until a handler finishes.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the method subject prefix.
    ///
    /// Default: `"rpc"`
    pub fn subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.subject_prefix = prefix.into();
        self
    }

    /// Build the server on `connection`.
    ///
    /// Fails if the connection is not usable or the prefix is not a valid
    /// subject.
    pub fn build(self, connection: Connection) -> Result<Server> {
        if !connection.is_connected() {
            return Err(RpcError::ConnectionClosed);
        }
        if !self.config.subject_prefix.is_empty() {
            validate_subject(&self.config.subject_prefix)?;
        }

        let mut config = self.config;
        if config.max_concurrent_handlers == 0 {
            tracing::warn!("max_concurrent_handlers is 0, using 1");
            config.max_concurrent_handlers = 1;
        }

        let dispatcher = Arc::new(Dispatcher {
            transport: connection,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            tracker: TaskTracker::new(),
            accepting: RwLock::new(true),
            abandon: CancellationToken::new(),
        });

        Ok(Server {
            inner: Arc::new(ServerInner {
                dispatcher,
                config,
                services: Mutex::new(HashMap::new()),
                closing: CancellationToken::new(),
                closed: AtomicBool::new(false),
                next_service_id: AtomicU64::new(1),
            }),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// RPC server hosting zero or more services.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    dispatcher: Arc<Dispatcher>,
    config: ServerConfig,
    /// Registered services by name.
    services: Mutex<HashMap<String, ServiceEntry>>,
    /// Parent of every service's stop token.
    closing: CancellationToken,
    closed: AtomicBool,
    next_service_id: AtomicU64,
}

/// Live registration of one service.
struct ServiceEntry {
    id: u64,
    stop: CancellationToken,
    subscriptions: Vec<SubscriptionHandle>,
}

impl ServiceEntry {
    fn shutdown(&self) {
        self.stop.cancel();
        for sub in &self.subscriptions {
            sub.unsubscribe();
        }
    }
}

impl Server {
    /// Create a server with default configuration.
    pub fn new(connection: Connection) -> Result<Self> {
        ServerBuilder::new().build(connection)
    }

    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// The configuration in effect.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Dispatches currently running or waiting on their handler.
    pub fn in_flight(&self) -> usize {
        self.inner.dispatcher.tracker.len()
    }

    /// Names of the registered services, sorted.
    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.services.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a service and start serving its methods.
    ///
    /// Every method subject is subscribed before this returns. On any
    /// failure the subscriptions already made are released.
    pub async fn register_service(&self, registration: ServiceRegistration) -> Result<ServiceHandle> {
        registration.validate()?;

        let descriptor = *registration.descriptor();
        let name = descriptor.name.to_string();

        let mut services = self.inner.services.lock().await;
        if self.is_closed() {
            return Err(RpcError::ServerClosed);
        }
        if services.contains_key(&name) {
            return Err(RpcError::ServiceExists(name));
        }

        let routes = registration.routes();
        let transport = &self.inner.dispatcher.transport;
        let mut subscriptions: Vec<Subscription> = Vec::with_capacity(routes.len());
        for (method, _) in &routes {
            let subject = descriptor.subject(&self.inner.config.subject_prefix, method);
            match transport.subscribe(&subject).await {
                Ok(sub) => subscriptions.push(sub),
                Err(e) => {
                    tracing::warn!(
                        "Subscribing {} failed, rolling back {} subscription(s): {}",
                        subject,
                        subscriptions.len(),
                        e
                    );
                    // Dropping the subscriptions unsubscribes them.
                    return Err(e);
                }
            }
        }

        let id = self.inner.next_service_id.fetch_add(1, Ordering::Relaxed);
        let stop = self.inner.closing.child_token();
        let handles = subscriptions.iter().map(Subscription::handle).collect();

        for (sub, (method, handler)) in subscriptions.into_iter().zip(routes) {
            let route = Arc::new(Route {
                service: name.clone(),
                method: method.to_string(),
            });
            tokio::spawn(receive_loop(
                self.inner.dispatcher.clone(),
                sub,
                handler,
                route,
                stop.clone(),
            ));
        }

        services.insert(
            name.clone(),
            ServiceEntry {
                id,
                stop,
                subscriptions: handles,
            },
        );
        tracing::debug!(
            "Registered service {} with {} method(s)",
            name,
            descriptor.methods.len()
        );

        Ok(ServiceHandle {
            server: Arc::downgrade(&self.inner),
            name,
            id,
        })
    }

    /// Stop serving and drain.
    ///
    /// Unsubscribes every service first, so no new dispatch starts, then
    /// waits for in-flight handlers until `ctx` is done. Handlers still
    /// running at that point are abandoned: their context is cancelled and
    /// their replies are discarded, and this returns
    /// [`RpcError::DrainTimeout`].
    ///
    /// Later calls do not repeat the shutdown; they wait for the same drain,
    /// bounded by their own `ctx`. Only the first call abandons handlers.
    pub async fn close(&self, ctx: &Context) -> Result<()> {
        let dispatcher = &self.inner.dispatcher;

        let first = !self.inner.closed.swap(true, Ordering::AcqRel);
        if first {
            {
                let mut services = self.inner.services.lock().await;
                for (name, entry) in services.drain() {
                    entry.shutdown();
                    tracing::debug!("Unsubscribed service {}", name);
                }
            }
            self.inner.closing.cancel();

            dispatcher.stop_accepting();
            dispatcher.tracker.close();
        } else {
            tracing::debug!("Close already started, waiting for drain");
        }

        tokio::select! {
            biased;
            _ = dispatcher.tracker.wait() => {
                tracing::debug!("Server drained");
                Ok(())
            }
            _ = ctx.done() => {
                let abandoned = dispatcher.tracker.len();
                if first {
                    dispatcher.abandon.cancel();
                    tracing::warn!("Close deadline reached, abandoning {} handler(s)", abandoned);
                }
                Err(RpcError::DrainTimeout { abandoned })
            }
        }
    }
}

/// Handle on one registered service.
///
/// Dropping the handle does not unregister; call [`close`](Self::close).
#[derive(Debug)]
pub struct ServiceHandle {
    server: Weak<ServerInner>,
    name: String,
    id: u64,
}

impl ServiceHandle {
    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unsubscribe this service's subjects and remove it from the server.
    ///
    /// Other services keep running. Idempotent, and a no-op after the
    /// server itself closed.
    pub async fn close(&self) -> Result<()> {
        let Some(inner) = self.server.upgrade() else {
            return Ok(());
        };

        let mut services = inner.services.lock().await;
        match services.get(&self.name) {
            Some(entry) if entry.id == self.id => {}
            _ => return Ok(()),
        }
        if let Some(entry) = services.remove(&self.name) {
            entry.shutdown();
            tracing::debug!("Unregistered service {}", self.name);
        }
        Ok(())
    }
}

/// Which method a receive loop serves.
struct Route {
    service: String,
    method: String,
}

/// State shared by receive loops and dispatch tasks.
struct Dispatcher {
    transport: Connection,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    /// Cleared by `close`; spawns happen under the read lock.
    accepting: RwLock<bool>,
    /// Parent of every handler context; cancelled when handlers are abandoned.
    abandon: CancellationToken,
}

impl Dispatcher {
    fn stop_accepting(&self) {
        *self.accepting.write().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Spawn a tracked dispatch unless the server stopped accepting.
    fn track<F>(&self, fut: F) -> bool
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let accepting = self.accepting.read().unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return false;
        }
        self.tracker.spawn(fut);
        true
    }

    async fn dispatch(&self, msg: Message, handler: Arc<dyn Handler>, route: &Route) {
        let request = match RequestEnvelope::decode(&msg.payload) {
            Ok(r) => r,
            Err(e) => return self.reject(&msg, e).await,
        };

        if request.method != route.method {
            tracing::warn!(
                "Request {} names method {:?} but arrived on {}",
                request.correlation_id,
                request.method,
                msg.subject
            );
            if let Some(reply_to) = &request.reply_to {
                let body = ErrorBody::new(
                    ErrorKind::Decode,
                    format!("method {:?} is not served on {}", request.method, msg.subject),
                );
                self.publish_reply(reply_to, ReplyEnvelope::error(&request.correlation_id, body))
                    .await;
            }
            return;
        }

        tracing::debug!(
            "Dispatching {}.{} ({})",
            route.service,
            route.method,
            request.correlation_id
        );

        let ctx = Context::from_parts(request.deadline(), self.abandon.child_token());
        let req_ctx = RequestContext::for_dispatch(
            request.correlation_id.clone(),
            msg.subject.clone(),
            request.method.clone(),
            request.reply_to.is_some(),
            ctx,
        );

        // Abandoned dispatches finish at once; the handler task runs on detached.
        let outcome = tokio::select! {
            outcome = run_handler(handler, request.payload, req_ctx, route) => outcome,
            _ = self.abandon.cancelled() => {
                tracing::debug!(
                    "Discarding reply for {} from abandoned handler",
                    request.correlation_id
                );
                return;
            }
        };

        let Some(reply_to) = request.reply_to else {
            if let Err(body) = outcome {
                tracing::debug!(
                    "Fire-and-forget {}.{} failed: {}",
                    route.service,
                    route.method,
                    body.message
                );
            }
            return;
        };

        if self.abandon.is_cancelled() {
            tracing::debug!(
                "Discarding reply for {} from abandoned handler",
                request.correlation_id
            );
            return;
        }

        let reply = match outcome {
            Ok(payload) => ReplyEnvelope::payload(request.correlation_id, payload),
            Err(body) => ReplyEnvelope::error(request.correlation_id, body),
        };
        self.publish_reply(&reply_to, reply).await;
    }

    /// Answer an undecodable request if the reply subject is recoverable.
    async fn reject(&self, msg: &Message, err: RpcError) {
        let head = EnvelopeHead::recover(&msg.payload);

        match head.map(|h| (h.correlation_id, h.reply_to)) {
            Some((Some(correlation_id), Some(reply_to))) => {
                tracing::warn!("Rejecting undecodable request on {}: {}", msg.subject, err);
                let body = ErrorBody::new(ErrorKind::Decode, err.to_string());
                self.publish_reply(&reply_to, ReplyEnvelope::error(correlation_id, body))
                    .await;
            }
            Some((None, Some(reply_to))) => {
                // No caller could match a reply without a correlation id.
                tracing::warn!(
                    "Dropping undecodable request on {} without correlation id, not replying to {}: {}",
                    msg.subject,
                    reply_to,
                    err
                );
            }
            _ => {
                tracing::warn!("Dropping undecodable request on {}: {}", msg.subject, err);
            }
        }
    }

    async fn publish_reply(&self, reply_to: &str, reply: ReplyEnvelope) {
        let bytes = match reply.encode() {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Encoding reply {} failed: {}", reply.correlation_id, e);
                let body = ErrorBody::new(ErrorKind::Encode, e.to_string());
                match ReplyEnvelope::error(reply.correlation_id, body).encode() {
                    Ok(b) => b,
                    Err(_) => return,
                }
            }
        };

        if let Err(e) = self.transport.publish(reply_to, Bytes::from(bytes)).await {
            tracing::warn!("Publishing reply to {} failed: {}", reply_to, e);
        }
    }
}

/// Run the handler in its own task so a panic becomes an internal error.
async fn run_handler(
    handler: Arc<dyn Handler>,
    payload: Vec<u8>,
    ctx: RequestContext,
    route: &Route,
) -> RawReply {
    let task = tokio::spawn(async move { handler.call(&payload, ctx).await });
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                "Handler for {}.{} failed: {}",
                route.service,
                route.method,
                e
            );
            let message = if e.is_panic() {
                "handler panicked"
            } else {
                "handler aborted"
            };
            Err(ErrorBody::new(ErrorKind::Internal, message))
        }
    }
}

/// Receive loop for one method subject.
async fn receive_loop(
    dispatcher: Arc<Dispatcher>,
    mut sub: Subscription,
    handler: Arc<dyn Handler>,
    route: Arc<Route>,
    stop: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            msg = sub.next() => match msg {
                Some(m) => m,
                None => break,
            },
        };

        // Wait for a handler slot; the message stays queued meanwhile.
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                tracing::debug!("Dropping request on {} received during shutdown", msg.subject);
                break;
            }
            permit = dispatcher.semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        let task_dispatcher = dispatcher.clone();
        let task_handler = handler.clone();
        let task_route = route.clone();
        let subject = msg.subject.clone();
        let spawned = dispatcher.track(async move {
            let _permit = permit;
            task_dispatcher
                .dispatch(msg, task_handler, &task_route)
                .await;
        });
        if !spawned {
            tracing::debug!("Dropping request on {} received during shutdown", subject);
            break;
        }
    }

    sub.unsubscribe();
    tracing::debug!("Stopped serving {}", sub.subject());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerResult, Status};
    use crate::protocol::Outcome;
    use crate::service::{Method, ServiceDescriptor};
    use crate::transport::{MemoryTransport, Transport};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Ping {
        n: u32,
    }

    const PINGER: ServiceDescriptor = ServiceDescriptor::new("test.Pinger", &["ping"]);
    const PING: Method<Ping, Ping> = Method::new("test.Pinger", "ping");

    fn pinger() -> ServiceRegistration {
        ServiceRegistration::new(PINGER).method(&PING, |_ctx, req: Ping| async move {
            HandlerResult::Ok(Ping { n: req.n + 1 })
        })
    }

    fn request(correlation_id: &str, method: &str, payload: Vec<u8>, reply_to: Option<&str>) -> Bytes {
        let env = RequestEnvelope {
            correlation_id: correlation_id.to_string(),
            method: method.to_string(),
            payload,
            reply_to: reply_to.map(str::to_string),
            deadline_ms: None,
        };
        Bytes::from(env.encode().unwrap())
    }

    async fn next_reply(sub: &mut Subscription) -> ReplyEnvelope {
        let msg = tokio::time::timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("reply timed out")
            .expect("subscription closed");
        ReplyEnvelope::decode(&msg.payload).unwrap()
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Server::builder()
            .max_concurrent_handlers(8)
            .subject_prefix("acme");
        assert_eq!(builder.config.max_concurrent_handlers, 8);
        assert_eq!(builder.config.subject_prefix, "acme");
    }

    #[test]
    fn test_new_fails_on_closed_connection() {
        let broker = MemoryTransport::new();
        broker.close();
        assert!(matches!(
            Server::new(broker.connection()),
            Err(RpcError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_new_rejects_bad_prefix() {
        let broker = MemoryTransport::new();
        let result = Server::builder()
            .subject_prefix("bad prefix")
            .build(broker.connection());
        assert!(matches!(result, Err(RpcError::InvalidSubject(_))));
    }

    #[tokio::test]
    async fn test_register_subscribes_every_method() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();

        let handle = server.register_service(pinger()).await.unwrap();
        assert_eq!(handle.name(), "test.Pinger");
        assert_eq!(broker.subscription_count("rpc.test.Pinger.ping"), 1);
        assert_eq!(server.services().await, vec!["test.Pinger".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_service_rejected() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();

        server.register_service(pinger()).await.unwrap();
        let err = server.register_service(pinger()).await.unwrap_err();
        assert!(matches!(err, RpcError::ServiceExists(name) if name == "test.Pinger"));
        assert_eq!(broker.subscription_count("rpc.test.Pinger.ping"), 1);
    }

    #[tokio::test]
    async fn test_failed_subscription_rolls_back() {
        const TWO: ServiceDescriptor = ServiceDescriptor::new("test.Two", &["a", "b"]);
        const A: Method<Ping, Ping> = Method::new("test.Two", "a");
        const B: Method<Ping, Ping> = Method::new("test.Two", "b");

        /// Broker that refuses one subject.
        struct Picky {
            broker: MemoryTransport,
            refuse: &'static str,
        }

        impl Transport for Picky {
            fn publish(&self, subject: &str, payload: Bytes) -> crate::transport::BoxFuture<'_, Result<()>> {
                self.broker.publish(subject, payload)
            }

            fn subscribe(&self, subject: &str) -> crate::transport::BoxFuture<'_, Result<Subscription>> {
                if subject == self.refuse {
                    return Box::pin(async { Err(RpcError::Transport("permission denied".into())) });
                }
                self.broker.subscribe(subject)
            }

            fn new_inbox(&self) -> String {
                self.broker.new_inbox()
            }

            fn is_connected(&self) -> bool {
                true
            }
        }

        let broker = MemoryTransport::new();
        let picky = Arc::new(Picky {
            broker: broker.clone(),
            refuse: "rpc.test.Two.b",
        });
        let server = Server::new(picky).unwrap();

        let reg = ServiceRegistration::new(TWO)
            .method(&A, |_ctx, req: Ping| async move { HandlerResult::Ok(req) })
            .method(&B, |_ctx, req: Ping| async move { HandlerResult::Ok(req) });

        let err = server.register_service(reg).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(broker.total_subscriptions(), 0);
        assert!(server.services().await.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_publishes_reply() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        server.register_service(pinger()).await.unwrap();

        let mut inbox = broker.subscribe("inbox.1").await.unwrap();
        let payload = PING.marshal_request(&Ping { n: 41 }).unwrap();
        broker
            .publish("rpc.test.Pinger.ping", request("c-1", "ping", payload, Some("inbox.1")))
            .await
            .unwrap();

        let reply = next_reply(&mut inbox).await;
        assert_eq!(reply.correlation_id, "c-1");
        match reply.outcome {
            Outcome::Payload(p) => assert_eq!(PING.unmarshal_reply(&p).unwrap(), Ping { n: 42 }),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_envelope_with_reply_to_gets_decode_error() {
        #[derive(Serialize)]
        struct Broken<'a> {
            correlation_id: &'a str,
            reply_to: &'a str,
        }

        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        server.register_service(pinger()).await.unwrap();

        let mut inbox = broker.subscribe("inbox.2").await.unwrap();
        let bytes = crate::codec::MsgPackCodec::encode(&Broken {
            correlation_id: "c-2",
            reply_to: "inbox.2",
        })
        .unwrap();
        broker
            .publish("rpc.test.Pinger.ping", Bytes::from(bytes))
            .await
            .unwrap();

        let reply = next_reply(&mut inbox).await;
        assert_eq!(reply.correlation_id, "c-2");
        assert!(matches!(reply.outcome, Outcome::Error(ErrorBody { kind: ErrorKind::Decode, .. })));
    }

    #[tokio::test]
    async fn test_undecodable_envelope_without_correlation_id_gets_no_reply() {
        #[derive(Serialize)]
        struct Broken<'a> {
            reply_to: &'a str,
        }

        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        server.register_service(pinger()).await.unwrap();

        let mut inbox = broker.subscribe("inbox.2b").await.unwrap();
        let bytes = crate::codec::MsgPackCodec::encode(&Broken { reply_to: "inbox.2b" }).unwrap();
        broker
            .publish("rpc.test.Pinger.ping", Bytes::from(bytes))
            .await
            .unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(100), inbox.next()).await;
        assert!(nothing.is_err(), "replied without a correlation id");
        assert_eq!(broker.undelivered(), 0);
    }

    #[tokio::test]
    async fn test_garbage_is_dropped_and_loop_survives() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        server.register_service(pinger()).await.unwrap();

        broker
            .publish("rpc.test.Pinger.ping", Bytes::from_static(b"\xff\x00garbage"))
            .await
            .unwrap();

        let mut inbox = broker.subscribe("inbox.3").await.unwrap();
        let payload = PING.marshal_request(&Ping { n: 1 }).unwrap();
        broker
            .publish("rpc.test.Pinger.ping", request("c-3", "ping", payload, Some("inbox.3")))
            .await
            .unwrap();

        let reply = next_reply(&mut inbox).await;
        assert_eq!(reply.correlation_id, "c-3");
    }

    #[tokio::test]
    async fn test_method_mismatch_is_decode_error() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        server.register_service(pinger()).await.unwrap();

        let mut inbox = broker.subscribe("inbox.4").await.unwrap();
        broker
            .publish("rpc.test.Pinger.ping", request("c-4", "pong", Vec::new(), Some("inbox.4")))
            .await
            .unwrap();

        let reply = next_reply(&mut inbox).await;
        assert!(matches!(reply.outcome, Outcome::Error(ErrorBody { kind: ErrorKind::Decode, .. })));
    }

    #[tokio::test]
    async fn test_panicking_handler_becomes_internal_error() {
        const BOOM: ServiceDescriptor = ServiceDescriptor::new("test.Boom", &["boom"]);
        const BOOM_BOOM: Method<Ping, Ping> = Method::new("test.Boom", "boom");

        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        let reg = ServiceRegistration::new(BOOM).method(&BOOM_BOOM, |_ctx, req: Ping| async move {
            if req.n > 0 {
                panic!("handler exploded");
            }
            HandlerResult::Ok(req)
        });
        server.register_service(reg).await.unwrap();

        let mut inbox = broker.subscribe("inbox.5").await.unwrap();
        for (id, n) in [("c-5", 1u32), ("c-6", 0u32)] {
            let payload = BOOM_BOOM.marshal_request(&Ping { n }).unwrap();
            broker
                .publish("rpc.test.Boom.boom", request(id, "boom", payload, Some("inbox.5")))
                .await
                .unwrap();
        }

        let mut replies = vec![next_reply(&mut inbox).await, next_reply(&mut inbox).await];
        replies.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        assert!(matches!(
            &replies[0].outcome,
            Outcome::Error(ErrorBody { kind: ErrorKind::Internal, .. })
        ));
        assert!(matches!(&replies[1].outcome, Outcome::Payload(_)));
    }

    #[tokio::test]
    async fn test_fire_and_forget_publishes_nothing() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let reg = ServiceRegistration::new(PINGER).method(&PING, move |ctx, req: Ping| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((ctx.expects_reply(), req.n));
                HandlerResult::Ok(req)
            }
        });
        server.register_service(reg).await.unwrap();

        let payload = PING.marshal_request(&Ping { n: 9 }).unwrap();
        broker
            .publish("rpc.test.Pinger.ping", request("c-7", "ping", payload, None))
            .await
            .unwrap();

        let (expects_reply, n) = rx.recv().await.unwrap();
        assert!(!expects_reply);
        assert_eq!(n, 9);

        server.close(&Context::background()).await.unwrap();
        assert_eq!(broker.undelivered(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit_queues_requests() {
        use std::sync::atomic::AtomicUsize;

        let broker = MemoryTransport::new();
        let server = Server::builder()
            .max_concurrent_handlers(2)
            .build(broker.connection())
            .unwrap();

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let reg = ServiceRegistration::new(PINGER).method(&PING, move |_ctx, req: Ping| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                HandlerResult::Ok(req)
            }
        });
        server.register_service(reg).await.unwrap();

        let mut inbox = broker.subscribe("inbox.8").await.unwrap();
        for i in 0..6u32 {
            let payload = PING.marshal_request(&Ping { n: i }).unwrap();
            broker
                .publish(
                    "rpc.test.Pinger.ping",
                    request(&format!("c-{i}"), "ping", payload, Some("inbox.8")),
                )
                .await
                .unwrap();
        }

        for _ in 0..6 {
            next_reply(&mut inbox).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_handle_close_is_scoped_and_idempotent() {
        const OTHER: ServiceDescriptor = ServiceDescriptor::new("test.Other", &["ping"]);
        const OTHER_PING: Method<Ping, Ping> = Method::new("test.Other", "ping");

        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        let first = server.register_service(pinger()).await.unwrap();
        let _second = server
            .register_service(
                ServiceRegistration::new(OTHER)
                    .method(&OTHER_PING, |_ctx, req: Ping| async move { HandlerResult::Ok(req) }),
            )
            .await
            .unwrap();

        first.close().await.unwrap();
        first.close().await.unwrap();

        assert_eq!(broker.subscription_count("rpc.test.Pinger.ping"), 0);
        assert_eq!(broker.subscription_count("rpc.test.Other.ping"), 1);
        assert_eq!(server.services().await, vec!["test.Other".to_string()]);

        // The name is free again.
        server.register_service(pinger()).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unsubscribes_and_rejects_registration() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();
        let handle = server.register_service(pinger()).await.unwrap();

        server.close(&Context::background()).await.unwrap();
        assert!(server.is_closed());
        assert_eq!(broker.total_subscriptions(), 0);
        assert!(matches!(
            server.register_service(pinger()).await,
            Err(RpcError::ServerClosed)
        ));

        handle.close().await.unwrap();
        server.close(&Context::background()).await.unwrap();
    }

    #[tokio::test]
    async fn test_second_close_waits_for_drain() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();

        let reg = ServiceRegistration::new(PINGER).method(&PING, |_ctx, req: Ping| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            HandlerResult::Ok(req)
        });
        server.register_service(reg).await.unwrap();

        let mut inbox = broker.subscribe("inbox.10").await.unwrap();
        let payload = PING.marshal_request(&Ping { n: 1 }).unwrap();
        broker
            .publish("rpc.test.Pinger.ping", request("c-10", "ping", payload, Some("inbox.10")))
            .await
            .unwrap();

        while server.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let first = {
            let server = server.clone();
            tokio::spawn(async move { server.close(&Context::background()).await })
        };
        while !server.is_closed() {
            tokio::task::yield_now().await;
        }

        // A short second close reports the drain is not done yet.
        let short = Context::background().with_timeout(Duration::from_millis(10));
        assert!(matches!(
            server.close(&short).await,
            Err(RpcError::DrainTimeout { .. })
        ));

        let patient = Context::background().with_timeout(Duration::from_secs(2));
        server.close(&patient).await.unwrap();
        assert_eq!(server.in_flight(), 0);
        first.await.unwrap().unwrap();

        let reply = next_reply(&mut inbox).await;
        assert_eq!(reply.correlation_id, "c-10");
    }

    #[tokio::test]
    async fn test_close_abandons_handlers_past_deadline() {
        let broker = MemoryTransport::new();
        let server = Server::new(broker.connection()).unwrap();

        let reg = ServiceRegistration::new(PINGER).method(&PING, |ctx, req: Ping| async move {
            // Runs until the server gives up on it.
            ctx.context().cancelled().await;
            Err::<Ping, _>(Status::new(format!("abandoned at {}", req.n)))
        });
        server.register_service(reg).await.unwrap();

        let mut inbox = broker.subscribe("inbox.9").await.unwrap();
        let payload = PING.marshal_request(&Ping { n: 1 }).unwrap();
        broker
            .publish("rpc.test.Pinger.ping", request("c-9", "ping", payload, Some("inbox.9")))
            .await
            .unwrap();

        while server.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let err = server.close(&ctx).await.unwrap_err();
        assert!(matches!(err, RpcError::DrainTimeout { abandoned: 1 }));
        assert!(err.is_timeout());

        // The abandoned handler's reply is discarded.
        let late = tokio::time::timeout(Duration::from_millis(100), inbox.next()).await;
        assert!(late.is_err(), "abandoned handler replied");
    }
}
