//! Request and reply envelopes.
//!
//! Both envelopes are MessagePack maps with named fields:
//!
//! ```text
//! request: { correlation_id, method, payload: bin, reply_to: str|nil, deadline_ms: u64|nil }
//! reply:   { correlation_id, outcome: { payload: bin } | { error: { kind, code, message } } }
//! ```
//!
//! `deadline_ms` is an absolute Unix epoch time in milliseconds, so it stays
//! meaningful across processes; each side converts it to and from its own
//! monotonic clock.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::codec::MsgPackCodec;
use crate::error::Result;

/// Request published by a client to a method subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Token echoed back in the reply.
    pub correlation_id: String,
    /// Method name, matching the subject's last token.
    pub method: String,
    /// Marshaled request payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Inbox for the reply. `None` means fire-and-forget.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Deadline hint for the handler.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl RequestEnvelope {
    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
    }

    /// Deadline hint converted to the local monotonic clock.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline_ms.map(deadline_from_wire)
    }
}

/// The fields of a request that are still useful when the full envelope
/// does not decode.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct EnvelopeHead {
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl EnvelopeHead {
    /// Best-effort decode; `None` if the bytes are not a map at all.
    pub(crate) fn recover(bytes: &[u8]) -> Option<Self> {
        MsgPackCodec::decode(bytes).ok()
    }
}

/// Reply published by a server to the request's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// Echo of the request's correlation id.
    pub correlation_id: String,
    /// Payload or error, never both.
    pub outcome: Outcome,
}

impl ReplyEnvelope {
    /// Successful reply carrying a marshaled payload.
    pub fn payload(correlation_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            outcome: Outcome::Payload(payload),
        }
    }

    /// Failed reply.
    pub fn error(correlation_id: impl Into<String>, error: ErrorBody) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            outcome: Outcome::Error(error),
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        MsgPackCodec::encode(self)
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        MsgPackCodec::decode(bytes)
    }
}

/// Outcome of a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Marshaled reply payload.
    Payload(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Structured error.
    Error(ErrorBody),
}

/// Structured error carried in a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Who failed and how.
    pub kind: ErrorKind,
    /// Application-defined code, only set for application errors.
    #[serde(default)]
    pub code: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl ErrorBody {
    /// Error of the given kind without a code.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }
}

/// Failure kinds that travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The handler returned an error.
    Application,
    /// The server could not decode the request.
    Decode,
    /// The server could not encode the handler's reply.
    Encode,
    /// The handler panicked or was aborted.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Application => "application",
            ErrorKind::Decode => "decode",
            ErrorKind::Encode => "encode",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Convert a local deadline to Unix epoch milliseconds, rounded up.
///
/// Deadlines too far out to represent saturate at `u64::MAX`.
pub fn deadline_to_wire(deadline: Instant) -> u64 {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let Some(at) = SystemTime::now().checked_add(remaining) else {
        return u64::MAX;
    };
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros().div_ceil(1000)).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Convert Unix epoch milliseconds to a local deadline.
///
/// Deadlines already in the past map to "now".
pub fn deadline_from_wire(ms: u64) -> Instant {
    let at = UNIX_EPOCH + Duration::from_millis(ms);
    let remaining = at
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO);
    let now = Instant::now();
    now.checked_add(remaining)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Stand-in for deadlines the local clock cannot represent.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);
