//! Signing Capability
//!
//! The session never touches key material directly. Everything that has to be
//! signed goes through a [`Signer`], which may pick a different signature
//! scheme per payload shape:
//!
//! - [`SignPayload::Structured`]: typed data, hashed as canonical JSON
//! - [`SignPayload::Message`]: a plain string, hashed with a length prefix
//!
//! Implementations must be deterministic for a given key and payload.

use async_trait::async_trait;
use ed25519_dalek::{Signature as Ed25519Signature, SigningKey, Signer as _, Verifier as _, VerifyingKey};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::core::hash::{message_digest, typed_data_digest, SigningDigest};

/// A structured payload: a named type, its domain, and the message body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedPayload {
    /// Name of the top-level type (e.g. `Policy`).
    pub primary_type: String,
    /// Domain the signature is scoped to.
    pub domain: Value,
    /// The body being signed.
    pub message: Value,
}

/// Anything a [`Signer`] can be asked to sign.
#[derive(Debug, Clone, PartialEq)]
pub enum SignPayload {
    /// Plain message-hash scheme.
    Message(String),
    /// Structured typed-data scheme.
    Structured(TypedPayload),
}

impl SignPayload {
    /// Short name of the scheme this payload selects.
    pub fn scheme(&self) -> &'static str {
        match self {
            SignPayload::Message(_) => "message",
            SignPayload::Structured(_) => "structured",
        }
    }

    /// Digest of the payload under its scheme.
    pub fn digest(&self) -> Result<SigningDigest, SignError> {
        match self {
            SignPayload::Message(message) => Ok(message_digest(message)),
            SignPayload::Structured(typed) => {
                typed_data_digest(typed).map_err(|e| SignError::Encode(e.to_string()))
            }
        }
    }
}

/// Hex encoded signature (`0x` prefixed).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// Wrap raw signature bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(format!("0x{}", hex::encode(bytes)))
    }

    /// Hex form, as it goes on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode back to raw bytes.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(self.0.trim_start_matches("0x")).ok()
    }
}

impl From<Signature> for String {
    fn from(signature: Signature) -> Self {
        signature.0
    }
}

/// Signing errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignError {
    /// The signer does not implement the scheme for this payload shape.
    #[error("{0} signing is not supported by this signer")]
    Unsupported(&'static str),
    /// The payload could not be encoded for hashing.
    #[error("payload encoding failed: {0}")]
    Encode(String),
    /// Key material is unusable.
    #[error("invalid key: {0}")]
    InvalidKey(String),
    /// The signer failed for another reason (remote wallet, hardware, ...).
    #[error("signing failed: {0}")]
    Failed(String),
}

/// Produces signatures on behalf of one identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Identity the signatures belong to.
    fn identity(&self) -> &str;

    /// Sign a payload.
    async fn sign(&self, payload: &SignPayload) -> Result<Signature, SignError>;
}

// =============================================================================
// LOCAL ED25519 SIGNER
// =============================================================================

/// In-process ed25519 signer.
pub struct LocalSigner {
    key: SigningKey,
    identity: String,
}

impl LocalSigner {
    /// Create from a 32-byte secret key.
    pub fn new(secret: [u8; 32]) -> Self {
        let key = SigningKey::from_bytes(&secret);
        let identity = identity_of(&key.verifying_key());
        Self { key, identity }
    }

    /// Create from a hex encoded secret key (`0x` optional).
    pub fn from_secret_hex(secret: &str) -> Result<Self, SignError> {
        let bytes = hex::decode(secret.trim().trim_start_matches("0x"))
            .map_err(|e| SignError::InvalidKey(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| SignError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self::new(secret))
    }

    /// Create with a fresh random key.
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let identity = identity_of(&key.verifying_key());
        Self { key, identity }
    }

    /// Check a signature produced by this signer.
    pub fn verify(&self, payload: &SignPayload, signature: &Signature) -> bool {
        let Ok(digest) = payload.digest() else {
            return false;
        };
        let Some(bytes) = signature.to_bytes() else {
            return false;
        };
        let Ok(signature) = Ed25519Signature::from_slice(&bytes) else {
            return false;
        };
        self.key.verifying_key().verify(&digest, &signature).is_ok()
    }
}

fn identity_of(key: &VerifyingKey) -> String {
    format!("0x{}", hex::encode(key.as_bytes()))
}

#[async_trait]
impl Signer for LocalSigner {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn sign(&self, payload: &SignPayload) -> Result<Signature, SignError> {
        let digest = payload.digest()?;
        let signature = self.key.sign(&digest);
        Ok(Signature::from_bytes(&signature.to_bytes()))
    }
}
