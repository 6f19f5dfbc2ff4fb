//! Echo service - simple request/reply example.
//!
//! This example demonstrates:
//! - Declaring a typed service with `rpc_service!`
//! - Serving it on a broker connection
//! - Calling it with a deadline through the generated client
//! - Draining the server on shutdown
//!
//! ```text
//! cargo run --example echo
//! ```

use std::time::Duration;

use pubsub_rpc::{
    rpc_service, Client, Context, HandlerResult, MemoryTransport, RequestContext, Server, Status,
};
use serde::{Deserialize, Serialize};

/// Input structure for the echo method.
#[derive(Serialize, Deserialize, Debug)]
struct EchoRequest {
    message: String,
}

/// Output structure for the echo method.
#[derive(Serialize, Deserialize, Debug)]
struct EchoReply {
    message: String,
}

rpc_service! {
    /// Echo service.
    pub service Echo = "echo.EchoService" {
        server EchoServer;
        client EchoClient;

        /// Echo the message back.
        rpc echo(EchoRequest) -> EchoReply;
    }
}

struct EchoHandler;

impl EchoServer for EchoHandler {
    async fn echo(&self, _ctx: RequestContext, req: EchoRequest) -> HandlerResult<EchoReply> {
        if req.message.is_empty() {
            return Err(Status::with_code("empty", "nothing to echo"));
        }
        Ok(EchoReply {
            message: format!("echo: {}", req.message),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let broker = MemoryTransport::new();

    let server = Server::builder()
        .max_concurrent_handlers(16)
        .build(broker.connection())?;
    Echo::register(&server, EchoHandler).await?;

    let echo = EchoClient::new(Client::new(broker.connection()));
    let ctx = Context::background().with_timeout(Duration::from_secs(1));

    let reply = echo
        .echo(&ctx, &EchoRequest { message: "hello".into() })
        .await?;
    println!("{}", reply.message);

    match echo.echo(&ctx, &EchoRequest { message: String::new() }).await {
        Err(e) => println!("error: {}", e),
        Ok(reply) => println!("unexpected reply: {}", reply.message),
    }

    // Wait for in-flight handlers, but not forever.
    server
        .close(&Context::background().with_timeout(Duration::from_secs(5)))
        .await?;
    Ok(())
}
