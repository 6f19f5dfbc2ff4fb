//! Application-level handler errors.

use std::fmt;

use crate::error::RpcError;
use crate::protocol::{ErrorBody, ErrorKind};

/// Error a handler returns to its caller.
///
/// Carried verbatim to the client, which sees it as
/// [`RpcError::Application`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: Option<String>,
    message: String,
}

impl Status {
    /// Error with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// Error with a machine-readable code.
    pub fn with_code(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// The code, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// The message.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn into_body(self) -> ErrorBody {
        ErrorBody {
            kind: ErrorKind::Application,
            code: self.code,
            message: self.message,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Status {}

/// Lets handlers that call other services use `?` on client results.
impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Application { code, message } => Self { code, message },
            other => Self::new(other.to_string()),
        }
    }
}
