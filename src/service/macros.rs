//! Generator macro for typed services.
//!
//! [`rpc_service!`](crate::rpc_service) turns a short service definition into
//! everything both sides need:
//!
//! - a marker struct carrying the [`ServiceDescriptor`](crate::service::ServiceDescriptor)
//!   and one typed [`Method`](crate::service::Method) constant per method
//! - a server trait to implement, plus a `register` function
//! - a typed client wrapper
//!
//! # Example
//!
//! ```ignore
//! use pubsub_rpc::rpc_service;
//!
//! rpc_service! {
//!     /// Echo service.
//!     pub service Echo = "echo.EchoService" {
//!         server EchoServer;
//!         client EchoClient;
//!
//!         /// Echo the message back.
//!         rpc echo(EchoRequest) -> EchoReply;
//!     }
//! }
//!
//! struct Handler;
//!
//! impl EchoServer for Handler {
//!     async fn echo(&self, _ctx: RequestContext, req: EchoRequest) -> HandlerResult<EchoReply> {
//!         Ok(EchoReply { message: format!("echo: {}", req.message) })
//!     }
//! }
//!
//! let handle = Echo::register(&server, Handler).await?;
//! let echo = EchoClient::new(client);
//! let reply = echo.echo(&ctx, &EchoRequest { message: "hello".into() }).await?;
//! ```

/// Define a typed RPC service.
///
/// See the [module docs](crate::service) for the generated items.
#[macro_export]
macro_rules! rpc_service {
    (
        $(#[$meta:meta])*
        $vis:vis service $name:ident = $service:literal {
            server $server:ident;
            client $client:ident;
            $(
                $(#[$method_meta:meta])*
                rpc $method:ident ( $req:ty ) -> $rep:ty;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name;

        #[allow(non_upper_case_globals)]
        impl $name {
            /// Descriptor listing this service's methods.
            pub const DESCRIPTOR: $crate::service::ServiceDescriptor =
                $crate::service::ServiceDescriptor::new($service, &[$(stringify!($method)),*]);

            $(
                $(#[$method_meta])*
                pub const $method: $crate::service::Method<$req, $rep> =
                    $crate::service::Method::new($service, stringify!($method));
            )*

            /// Register `implementation` on `server`.
            pub async fn register<S: $server>(
                server: &$crate::Server,
                implementation: S,
            ) -> $crate::Result<$crate::ServiceHandle> {
                #[allow(unused_variables)]
                let implementation = ::std::sync::Arc::new(implementation);
                let registration = $crate::handler::ServiceRegistration::new(Self::DESCRIPTOR)
                $(
                    .method(&Self::$method, {
                        let implementation = ::std::sync::Arc::clone(&implementation);
                        move |ctx: $crate::handler::RequestContext, request: $req| {
                            let implementation = ::std::sync::Arc::clone(&implementation);
                            async move { implementation.$method(ctx, request).await }
                        }
                    })
                )*;
                server.register_service(registration).await
            }
        }

        $(#[$meta])*
        $vis trait $server: Send + Sync + 'static {
            $(
                $(#[$method_meta])*
                fn $method(
                    &self,
                    ctx: $crate::handler::RequestContext,
                    request: $req,
                ) -> impl ::std::future::Future<Output = $crate::handler::HandlerResult<$rep>> + Send;
            )*
        }

        $(#[$meta])*
        #[derive(Clone)]
        $vis struct $client {
            client: $crate::Client,
        }

        impl $client {
            /// Wrap a runtime client.
            pub fn new(client: $crate::Client) -> Self {
                Self { client }
            }

            $(
                $(#[$method_meta])*
                pub async fn $method(
                    &self,
                    ctx: &$crate::Context,
                    request: &$req,
                ) -> $crate::Result<$rep> {
                    self.client.call(ctx, &$name::$method, request).await
                }
            )*
        }
    };
}
