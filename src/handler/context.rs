//! Request context for handlers.
//!
//! A [`RequestContext`] tells the handler which request it is serving and
//! carries a [`Context`] derived from the caller's deadline hint. The context
//! is also cancelled when the server abandons the handler during shutdown,
//! so long-running handlers can bail out early:
//!
//! ```ignore
//! async fn slow(&self, ctx: RequestContext, req: Job) -> Result<Done, Status> {
//!     tokio::select! {
//!         out = do_work(req) => Ok(out),
//!         err = ctx.context().done() => Err(Status::new(err.to_string())),
//!     }
//! }
//! ```

use tokio::time::Instant;

use crate::context::Context;

/// Context passed to request handlers.
///
/// Cheap to clone; clones share the cancellation state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id of the request.
    correlation_id: String,
    /// Subject the request arrived on.
    subject: String,
    /// Method name from the envelope.
    method: String,
    /// Whether the caller expects a reply.
    expects_reply: bool,
    /// Deadline and cancellation for this invocation.
    ctx: Context,
}

impl RequestContext {
    /// Create a request context (mostly useful in handler unit tests).
    pub fn new(correlation_id: impl Into<String>, method: impl Into<String>, ctx: Context) -> Self {
        let method = method.into();
        Self {
            correlation_id: correlation_id.into(),
            subject: method.clone(),
            method,
            expects_reply: true,
            ctx,
        }
    }

    pub(crate) fn for_dispatch(
        correlation_id: String,
        subject: String,
        method: String,
        expects_reply: bool,
        ctx: Context,
    ) -> Self {
        Self {
            correlation_id,
            subject,
            method,
            expects_reply,
            ctx,
        }
    }

    /// Correlation id of the request.
    #[inline]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Subject the request arrived on.
    #[inline]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Method being invoked.
    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// `false` for fire-and-forget requests; the result will be discarded.
    #[inline]
    pub fn expects_reply(&self) -> bool {
        self.expects_reply
    }

    /// Caller's deadline, if it sent one.
    pub fn deadline(&self) -> Option<Instant> {
        self.ctx.deadline()
    }

    /// Whether the caller's deadline has passed or the server abandoned this handler.
    pub fn is_done(&self) -> bool {
        self.ctx.err().is_some()
    }

    /// The derived call context, for passing to downstream calls.
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_context_accessors() {
        let ctx = RequestContext::new("id-1", "echo", Context::background());
        assert_eq!(ctx.correlation_id(), "id-1");
        assert_eq!(ctx.method(), "echo");
        assert!(ctx.expects_reply());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_done());
    }

    #[test]
    fn test_context_is_clone() {
        let ctx = RequestContext::new("id-1", "echo", Context::background());
        let ctx2 = ctx.clone();

        ctx.context().cancel();
        assert!(ctx2.is_done());
        assert_eq!(ctx.correlation_id(), ctx2.correlation_id());
    }

    #[tokio::test]
    async fn test_deadline_is_visible_to_handler() {
        let parent = Context::background().with_timeout(Duration::from_millis(5));
        let ctx = RequestContext::new("id-2", "slow", parent);
        assert!(ctx.deadline().is_some());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ctx.is_done());
    }
}
