//! Core primitives shared by the network layer.

pub mod hash;

pub use hash::{canonical_json, message_digest, typed_data_digest, PayloadHasher, SigningDigest};
