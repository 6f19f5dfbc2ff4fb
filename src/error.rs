//! Error types for pubsub-rpc.

use thiserror::Error;

use crate::protocol::ErrorKind;

/// Broad class of an [`RpcError`].
///
/// Callers usually branch on the class rather than on the exact variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connection unusable, publish/subscribe failure.
    Transport,
    /// Request or reply failed to marshal/unmarshal, locally or remotely.
    Encoding,
    /// The remote handler reported a failure.
    Application,
    /// A deadline elapsed.
    Timeout,
    /// The caller cancelled.
    Cancelled,
    /// The remote handler failed unexpectedly.
    Internal,
    /// Service registration was rejected.
    Registration,
}

/// Main error type for all RPC operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The transport rejected an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The transport connection is closed or unusable.
    #[error("Connection closed")]
    ConnectionClosed,

    /// JSON error (configuration loading only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// The handler returned an application-level error.
    #[error("Application error{}: {message}", code.as_deref().map(|c| format!(" [{c}]")).unwrap_or_default())]
    Application {
        /// Optional machine-readable code chosen by the handler.
        code: Option<String>,
        /// Human-readable description.
        message: String,
    },

    /// The server reported a non-application failure.
    #[error("Remote {kind} error: {message}")]
    Remote {
        /// Failure kind reported by the server.
        kind: ErrorKind,
        /// Description reported by the server.
        message: String,
    },

    /// No reply before the caller's deadline.
    #[error("Deadline exceeded")]
    Timeout,

    /// The caller cancelled the call.
    #[error("Call cancelled")]
    Cancelled,

    /// Graceful drain did not finish before the close deadline.
    #[error("Drain timed out with {abandoned} handler(s) still running")]
    DrainTimeout {
        /// Handlers that were still running and got abandoned.
        abandoned: usize,
    },

    /// A service with this name is already registered on the server.
    #[error("Service already registered: {0}")]
    ServiceExists(String),

    /// The registration has no handler for a declared method.
    #[error("No handler for {service}.{method}")]
    MissingHandler {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },

    /// The registration has a handler for a method the descriptor does not declare.
    #[error("Method {service}.{method} is not declared by the service")]
    UnknownMethod {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },

    /// A name cannot be used as a subject token.
    #[error("Invalid subject token: {0:?}")]
    InvalidSubject(String),

    /// The server is closed.
    #[error("Server closed")]
    ServerClosed,
}

impl RpcError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            RpcError::Transport(_) | RpcError::ConnectionClosed => ErrorClass::Transport,
            RpcError::Json(_) | RpcError::MsgPackEncode(_) | RpcError::MsgPackDecode(_) => {
                ErrorClass::Encoding
            }
            RpcError::Application { .. } => ErrorClass::Application,
            RpcError::Remote { kind, .. } => match kind {
                ErrorKind::Decode | ErrorKind::Encode => ErrorClass::Encoding,
                ErrorKind::Application => ErrorClass::Application,
                ErrorKind::Internal => ErrorClass::Internal,
            },
            RpcError::Timeout | RpcError::DrainTimeout { .. } => ErrorClass::Timeout,
            RpcError::Cancelled => ErrorClass::Cancelled,
            RpcError::ServiceExists(_)
            | RpcError::MissingHandler { .. }
            | RpcError::UnknownMethod { .. }
            | RpcError::InvalidSubject(_)
            | RpcError::ServerClosed => ErrorClass::Registration,
        }
    }

    /// True for deadline expiry, including a drain timeout.
    pub fn is_timeout(&self) -> bool {
        self.class() == ErrorClass::Timeout
    }

    /// True when the caller cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }

    /// True when the remote handler reported the failure.
    pub fn is_application(&self) -> bool {
        self.class() == ErrorClass::Application
    }

    /// True for marshal/unmarshal failures on either side.
    pub fn is_encoding(&self) -> bool {
        self.class() == ErrorClass::Encoding
    }

    /// True for transport failures.
    pub fn is_transport(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
