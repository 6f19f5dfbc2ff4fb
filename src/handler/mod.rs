//! Handler module - server-side request handling.
//!
//! Provides:
//! - [`ServiceRegistration`] - maps a service's methods to handlers
//! - [`RequestContext`] - what a handler knows about the request it serves
//! - [`Status`] - application error returned by handlers

mod context;
mod registry;
mod status;

pub use context::RequestContext;
pub use registry::{
    BoxFuture, Handler, HandlerResult, RawReply, ServiceRegistration, TypedHandler,
};
pub use status::Status;
