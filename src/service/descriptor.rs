//! Service and method descriptors.
//!
//! A [`ServiceDescriptor`] is plain `const` data naming a service and its
//! methods. A [`Method`] adds the request/reply types, so the client can
//! marshal and unmarshal without any lookup. Both are normally emitted by
//! [`rpc_service!`](crate::rpc_service).

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::protocol::{method_subject, validate_subject};

/// Static description of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Logical service name, e.g. `echo.EchoService`.
    pub name: &'static str,
    /// Declared method names.
    pub methods: &'static [&'static str],
}

impl ServiceDescriptor {
    /// Create a descriptor.
    pub const fn new(name: &'static str, methods: &'static [&'static str]) -> Self {
        Self { name, methods }
    }

    /// Whether `method` is declared.
    pub fn declares(&self, method: &str) -> bool {
        self.methods.contains(&method)
    }

    /// Subject of `method` under `prefix`.
    pub fn subject(&self, prefix: &str, method: &str) -> String {
        method_subject(prefix, self.name, method)
    }

    /// Check that the service and every method name is subject-safe.
    pub fn validate(&self) -> Result<()> {
        validate_subject(self.name)?;
        for method in self.methods {
            validate_subject(method)?;
        }
        Ok(())
    }
}

/// Typed handle on one method of a service.
pub struct Method<Req, Rep> {
    service: &'static str,
    name: &'static str,
    _types: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep> Method<Req, Rep> {
    /// Create a method handle.
    pub const fn new(service: &'static str, name: &'static str) -> Self {
        Self {
            service,
            name,
            _types: PhantomData,
        }
    }

    /// Owning service's name.
    pub fn service(&self) -> &'static str {
        self.service
    }

    /// Method name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Subject this method is served on under `prefix`.
    pub fn subject(&self, prefix: &str) -> String {
        method_subject(prefix, self.service, self.name)
    }
}

impl<Req: Serialize, Rep> Method<Req, Rep> {
    /// Marshal a request payload.
    pub fn marshal_request(&self, request: &Req) -> Result<Vec<u8>> {
        MsgPackCodec::encode(request)
    }
}

impl<Req, Rep: DeserializeOwned> Method<Req, Rep> {
    /// Unmarshal a reply payload.
    pub fn unmarshal_reply(&self, bytes: &[u8]) -> Result<Rep> {
        MsgPackCodec::decode(bytes)
    }
}

impl<Req, Rep> Clone for Method<Req, Rep> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Req, Rep> Copy for Method<Req, Rep> {}

impl<Req, Rep> fmt::Debug for Method<Req, Rep> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("service", &self.service)
            .field("name", &self.name)
            .field("request", &std::any::type_name::<Req>())
            .field("reply", &std::any::type_name::<Rep>())
            .finish()
    }
}
