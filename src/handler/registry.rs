//! Method tables for service registration.
//!
//! A [`ServiceRegistration`] maps each method a [`ServiceDescriptor`]
//! declares to a type-erased [`Handler`]. The table is checked against the
//! descriptor when the service is registered and is immutable afterwards.
//!
//! # Example
//!
//! ```ignore
//! use pubsub_rpc::handler::ServiceRegistration;
//!
//! let registration = ServiceRegistration::new(Echo::DESCRIPTOR)
//!     .method(&Echo::echo, |_ctx, req: EchoRequest| async move {
//!         Ok(EchoReply { message: format!("echo: {}", req.message) })
//!     });
//!
//! let handle = server.register_service(registration).await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{RequestContext, Status};
use crate::codec::MsgPackCodec;
use crate::error::{Result, RpcError};
use crate::protocol::{ErrorBody, ErrorKind};
use crate::service::{Method, ServiceDescriptor};

/// Result type for typed handler functions.
pub type HandlerResult<T> = std::result::Result<T, Status>;

/// Result of an erased handler: marshaled reply or wire error.
pub type RawReply = std::result::Result<Vec<u8>, ErrorBody>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with raw payload bytes.
    fn call(&self, payload: &[u8], ctx: RequestContext) -> BoxFuture<'static, RawReply>;
}

/// Wrapper that unmarshals the request and marshals the reply around a
/// typed handler function.
pub struct TypedHandler<F, Req, Rep, Fut>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<Rep>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(Req) -> Fut>,
}

impl<F, Req, Rep, Fut> TypedHandler<F, Req, Rep, Fut>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<Rep>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Req, Rep, Fut> Handler for TypedHandler<F, Req, Rep, Fut>
where
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Req: DeserializeOwned + Send + 'static,
    Rep: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<Rep>> + Send + 'static,
{
    fn call(&self, payload: &[u8], ctx: RequestContext) -> BoxFuture<'static, RawReply> {
        // A request that does not unmarshal never reaches the handler.
        let request: Req = match MsgPackCodec::decode(payload) {
            Ok(v) => v,
            Err(e) => {
                let body = ErrorBody::new(ErrorKind::Decode, e.to_string());
                return Box::pin(async move { Err(body) });
            }
        };

        let fut = (self.handler)(ctx, request);
        Box::pin(async move {
            match fut.await {
                Ok(reply) => MsgPackCodec::encode(&reply)
                    .map_err(|e| ErrorBody::new(ErrorKind::Encode, e.to_string())),
                Err(status) => Err(status.into_body()),
            }
        })
    }
}

/// Handler table for one service.
pub struct ServiceRegistration {
    descriptor: ServiceDescriptor,
    handlers: HashMap<String, Arc<dyn Handler>>,
    /// `(service, method)` of typed methods that belong to another service.
    foreign: Vec<(String, String)>,
}

impl ServiceRegistration {
    /// Start an empty table for `descriptor`.
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            handlers: HashMap::new(),
            foreign: Vec::new(),
        }
    }

    /// Register a typed handler for `method`.
    ///
    /// A later registration for the same method replaces the earlier one.
    pub fn method<Req, Rep, F, Fut>(mut self, method: &Method<Req, Rep>, handler: F) -> Self
    where
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Req: DeserializeOwned + Send + 'static,
        Rep: Serialize + Send + 'static,
        Fut: Future<Output = HandlerResult<Rep>> + Send + 'static,
    {
        if method.service() != self.descriptor.name {
            self.foreign
                .push((method.service().to_string(), method.name().to_string()));
            return self;
        }
        self.insert(method.name(), Arc::new(TypedHandler::new(handler)));
        self
    }

    /// Register an already type-erased handler by method name.
    pub fn raw<H: Handler>(mut self, method: &str, handler: H) -> Self {
        self.insert(method, Arc::new(handler));
        self
    }

    fn insert(&mut self, method: &str, handler: Arc<dyn Handler>) {
        if self.handlers.insert(method.to_string(), handler).is_some() {
            tracing::warn!(
                "Handler for {}.{} registered twice, keeping the last one",
                self.descriptor.name,
                method
            );
        }
    }

    /// The descriptor this table implements.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Handler for `method`, if present.
    pub fn handler(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(method).cloned()
    }

    /// Check the table covers exactly the declared methods.
    pub fn validate(&self) -> Result<()> {
        self.descriptor.validate()?;

        if let Some((service, method)) = self.foreign.first() {
            return Err(RpcError::UnknownMethod {
                service: service.clone(),
                method: method.clone(),
            });
        }

        for method in self.descriptor.methods {
            if !self.handlers.contains_key(*method) {
                return Err(RpcError::MissingHandler {
                    service: self.descriptor.name.to_string(),
                    method: method.to_string(),
                });
            }
        }

        let mut undeclared: Vec<&String> = self
            .handlers
            .keys()
            .filter(|name| !self.descriptor.declares(name))
            .collect();
        undeclared.sort();
        if let Some(method) = undeclared.first() {
            return Err(RpcError::UnknownMethod {
                service: self.descriptor.name.to_string(),
                method: method.to_string(),
            });
        }

        Ok(())
    }

    /// Method routes in declaration order. Call after [`validate`](Self::validate).
    pub(crate) fn routes(&self) -> Vec<(&'static str, Arc<dyn Handler>)> {
        self.descriptor
            .methods
            .iter()
            .filter_map(|name| self.handler(name).map(|h| (*name, h)))
            .collect()
    }
}
