//! Signing Digests
//!
//! Deterministic hashing of everything that gets signed:
//! - Canonical JSON for structured (typed) payloads
//! - Length-prefixed plain messages
//!
//! Both schemes are domain separated so a signature produced for one
//! can never be replayed as the other.

use serde::Serialize;
use sha2::{Sha256, Digest};

/// Digest output type (256 bits / 32 bytes)
pub type SigningDigest = [u8; 32];

/// Domain separator for structured payloads.
pub const TYPED_DATA_DOMAIN: &[u8] = b"TICTAC_CHANNEL_TYPED_DATA_V1";

/// Prefix for plain messages, followed by the decimal byte length.
pub const MESSAGE_PREFIX: &str = "\x19Signed Message:\n";

/// Deterministic hasher for signing payloads.
///
/// Wraps SHA-256 with a domain separator and helpers for canonical JSON.
pub struct PayloadHasher {
    hasher: Sha256,
}

impl PayloadHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for structured payloads.
    pub fn for_typed_data() -> Self {
        Self::new(TYPED_DATA_DOMAIN)
    }

    /// Create hasher for a plain message of `len` bytes.
    pub fn for_message(len: usize) -> Self {
        Self::new(format!("{}{}", MESSAGE_PREFIX, len).as_bytes())
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Update with a string's UTF-8 bytes.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.hasher.update(value.as_bytes());
    }

    /// Update with the canonical JSON encoding of a value.
    pub fn update_canonical<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
        let encoded = canonical_json(value)?;
        self.update_str(&encoded);
        Ok(())
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> SigningDigest {
        self.hasher.finalize().into()
    }
}

/// Encode a value as canonical JSON.
///
/// Goes through `serde_json::Value`, whose maps are ordered by key, so the
/// output does not depend on struct field order or map insertion order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let value = serde_json::to_value(value)?;
    serde_json::to_string(&value)
}

/// Digest of a plain message (length-prefixed scheme).
pub fn message_digest(message: &str) -> SigningDigest {
    let mut hasher = PayloadHasher::for_message(message.len());
    hasher.update_str(message);
    hasher.finalize()
}

/// Digest of a structured payload (typed-data scheme).
pub fn typed_data_digest<T: Serialize>(value: &T) -> Result<SigningDigest, serde_json::Error> {
    let mut hasher = PayloadHasher::for_typed_data();
    hasher.update_canonical(value)?;
    Ok(hasher.finalize())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_digest_determinism() {
        assert_eq!(message_digest("hello"), message_digest("hello"));
        assert_ne!(message_digest("hello"), message_digest("hello!"));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        #[derive(Serialize)]
        struct Unordered {
            zeta: u32,
            alpha: u32,
        }

        let encoded = canonical_json(&Unordered { zeta: 1, alpha: 2 }).unwrap();
        assert_eq!(encoded, r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_typed_digest_ignores_field_order() {
        let a = json!({"challenge": "abc", "wallet": "0x01"});
        let b = json!({"wallet": "0x01", "challenge": "abc"});

        assert_eq!(typed_data_digest(&a).unwrap(), typed_data_digest(&b).unwrap());
    }

    #[test]
    fn test_schemes_are_domain_separated() {
        let value = json!("abc");
        let encoded = canonical_json(&value).unwrap();

        let typed = typed_data_digest(&value).unwrap();
        let message = message_digest(&encoded);

        assert_ne!(typed, message);
    }

    #[test]
    fn test_message_prefix_includes_length() {
        let mut manual = PayloadHasher::new(b"\x19Signed Message:\n3");
        manual.update_str("abc");

        assert_eq!(manual.finalize(), message_digest("abc"));
    }
}
