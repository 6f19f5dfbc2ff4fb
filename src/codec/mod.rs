//! Codec module - serialization for envelopes and payloads.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`)
//!
//! Codecs are marker structs with static methods rather than trait objects,
//! so the codec is fixed at compile time for both envelope and payload.

mod msgpack;

pub use msgpack::MsgPackCodec;
