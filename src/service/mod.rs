//! Service module - descriptors shared by server and client.
//!
//! Provides:
//! - [`ServiceDescriptor`] - service name and declared methods
//! - [`Method`] - typed method handle with marshal/unmarshal
//! - [`rpc_service!`](crate::rpc_service) - generates descriptor, server trait and client

mod descriptor;
mod macros;

pub use descriptor::{Method, ServiceDescriptor};
