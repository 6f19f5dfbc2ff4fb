//! # pubsub-rpc
//!
//! Typed request/reply RPC on top of a publish/subscribe message broker.
//!
//! Services are described once with [`rpc_service!`], which generates a
//! server trait, a registration function and a typed client. Requests travel
//! as MessagePack envelopes on deterministic subjects
//! (`{prefix}.{service}.{method}`); replies come back on a per-call inbox
//! subject and are matched by correlation id.
//!
//! ## Architecture
//!
//! - **Transport**: [`Transport`] is the broker seam; [`MemoryTransport`] is
//!   an in-process broker
//! - **Server**: one receive loop per method subject, bounded handler
//!   concurrency, graceful drain on [`Server::close`]
//! - **Client**: per-call inbox, deadline and cancellation via [`Context`]
//!
//! ## Example
//!
//! ```ignore
//! use pubsub_rpc::{rpc_service, Client, Context, HandlerResult, MemoryTransport, RequestContext, Server};
//!
//! rpc_service! {
//!     pub service Echo = "echo.EchoService" {
//!         server EchoServer;
//!         client EchoClient;
//!         rpc echo(EchoRequest) -> EchoReply;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> pubsub_rpc::Result<()> {
//!     let broker = MemoryTransport::new();
//!
//!     let server = Server::new(broker.connection())?;
//!     Echo::register(&server, EchoHandler).await?;
//!
//!     let echo = EchoClient::new(Client::new(broker.connection()));
//!     let reply = echo
//!         .echo(&Context::background(), &EchoRequest { message: "hello".into() })
//!         .await?;
//!     assert_eq!(reply.message, "echo: hello");
//!
//!     server.close(&Context::background()).await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod service;
pub mod transport;

mod client;
mod server;

pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, ServerConfig};
pub use context::Context;
pub use error::{ErrorClass, Result, RpcError};
pub use handler::{HandlerResult, RequestContext, ServiceRegistration, Status};
pub use server::{Server, ServerBuilder, ServiceHandle};
pub use service::{Method, ServiceDescriptor};
pub use transport::{Connection, MemoryTransport, Transport};
