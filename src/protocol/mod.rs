//! Protocol module - wire envelopes and subject naming.
//!
//! - [`RequestEnvelope`] / [`ReplyEnvelope`] - what travels on the broker
//! - [`method_subject`] - deterministic `(prefix, service, method)` subjects
//! - [`CorrelationIds`] - per-client correlation id generator

mod envelope;
mod subject;

pub(crate) use envelope::EnvelopeHead;
pub use envelope::{
    deadline_from_wire, deadline_to_wire, ErrorBody, ErrorKind, Outcome, ReplyEnvelope,
    RequestEnvelope,
};
pub use subject::{
    method_subject, random_nonce, validate_subject, CorrelationIds, DEFAULT_SUBJECT_PREFIX,
    INBOX_PREFIX,
};
