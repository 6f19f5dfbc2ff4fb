//! Subject naming and correlation ids.
//!
//! Method subjects are `{prefix}.{service}.{method}`, or `{service}.{method}`
//! when the prefix is empty. Server and client must be configured with the
//! same prefix to meet.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, RpcError};

/// Default subject prefix for method subjects.
pub const DEFAULT_SUBJECT_PREFIX: &str = "rpc";

/// Prefix of inbox subjects handed out by transports.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Build the subject a method is served on.
pub fn method_subject(prefix: &str, service: &str, method: &str) -> String {
    if prefix.is_empty() {
        format!("{}.{}", service, method)
    } else {
        format!("{}.{}.{}", prefix, service, method)
    }
}

/// Check that `name` can be embedded in a subject.
///
/// Dots are allowed so services can be namespaced (`echo.v1.EchoService`),
/// but empty tokens, whitespace and the wildcard tokens `*` / `>` are not.
pub fn validate_subject(name: &str) -> Result<()> {
    let bad_token = name
        .split('.')
        .any(|token| token.is_empty() || token == "*" || token == ">");
    if bad_token || name.chars().any(char::is_whitespace) {
        return Err(RpcError::InvalidSubject(name.to_string()));
    }
    Ok(())
}

/// Process-unique random-ish u64 from the clock, the pid and a counter.
pub fn random_nonce() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    static SALT: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    let salt = SALT.fetch_add(1, Ordering::Relaxed);

    // splitmix64 finalizer
    let mut z = nanos ^ pid.rotate_left(32) ^ salt.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Generates correlation ids unique to one client instance.
///
/// Ids look like `{nonce:016x}-{seq}`; the nonce keeps ids from different
/// clients apart when they share an inbox namespace.
#[derive(Debug)]
pub struct CorrelationIds {
    nonce: u64,
    next: AtomicU64,
}

impl CorrelationIds {
    /// Create a generator with a fresh nonce.
    pub fn new() -> Self {
        Self {
            nonce: random_nonce(),
            next: AtomicU64::new(1),
        }
    }

    /// Next id.
    pub fn next_id(&self) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{}", self.nonce, seq)
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}
