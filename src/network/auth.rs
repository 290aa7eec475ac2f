//! Challenge-Response Authentication
//!
//! Builds the handshake messages and signs the server's challenge:
//!
//! ```text
//! client                               server
//!   | -- auth_request (unsigned) -------> |
//!   | <------------- auth_challenge ----- |
//!   | -- auth_verify (signed policy) ---> |
//!   | <---------------- auth_verify ----- |
//! ```
//!
//! The signed policy is first offered to the structured scheme. If the signer
//! rejects that, the canonical JSON of the same policy is signed as a plain
//! message instead.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::hash::canonical_json;
use crate::network::protocol::{error_message, ChallengeError, ChallengeToken, RpcRequest, AUTH_REQUEST, AUTH_VERIFY};
use crate::network::signer::{SignError, SignPayload, Signature, Signer, TypedPayload};

/// Spending allowance declared for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    /// Asset symbol.
    pub asset: String,
    /// Amount as a decimal string.
    pub amount: String,
}

impl Allowance {
    /// Parse `asset:amount,asset:amount`.
    pub fn parse_list(list: &str) -> Vec<Allowance> {
        list.split(',')
            .filter_map(|entry| {
                let (asset, amount) = entry.trim().split_once(':')?;
                if asset.is_empty() || amount.is_empty() {
                    return None;
                }
                Some(Allowance {
                    asset: asset.trim().to_string(),
                    amount: amount.trim().to_string(),
                })
            })
            .collect()
    }
}

/// Handshake configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Application name, used as the signing domain.
    pub app_name: String,
    /// Requested permission scope.
    pub scope: String,
    /// Application address the session is bound to.
    pub application: String,
    /// Declared session key. If None, the signer identity is used.
    pub session_key: Option<String>,
    /// Session expiry (unix seconds, 0 = server default).
    pub expire: u64,
    /// Declared spending allowances.
    pub allowances: Vec<Allowance>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            app_name: "tictac".to_string(),
            scope: "app.tictac".to_string(),
            application: String::new(),
            session_key: None,
            expire: 0,
            allowances: Vec::new(),
        }
    }
}

impl AuthConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            app_name: std::env::var("AUTH_APP_NAME").unwrap_or(defaults.app_name),
            scope: std::env::var("AUTH_SCOPE").unwrap_or(defaults.scope),
            application: std::env::var("AUTH_APPLICATION").unwrap_or(defaults.application),
            session_key: std::env::var("AUTH_SESSION_KEY").ok().filter(|k| !k.is_empty()),
            expire: std::env::var("AUTH_EXPIRE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.expire),
            allowances: std::env::var("AUTH_ALLOWANCES")
                .map(|v| Allowance::parse_list(&v))
                .unwrap_or_default(),
        }
    }

    /// Session key to declare for `identity`.
    pub fn session_key_for<'a>(&'a self, identity: &'a str) -> &'a str {
        self.session_key.as_deref().unwrap_or(identity)
    }
}

/// Handshake failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// The challenge carried no usable token.
    #[error("challenge extraction failed: {0}")]
    Challenge(#[from] ChallengeError),
    /// Both signature schemes failed.
    #[error("signing failed (structured: {structured}; message: {message})")]
    Signing {
        /// Structured scheme failure.
        structured: SignError,
        /// Message scheme failure.
        message: SignError,
    },
    /// The server refused the verification.
    #[error("verification rejected: {0}")]
    Rejected(String),
    /// No verdict within the handshake timeout.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    /// A handshake message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),
}

/// The structure whose signature proves control of the identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthPolicy {
    /// Challenge token issued by the server.
    pub challenge: String,
    /// Requested scope.
    pub scope: String,
    /// Identity being authenticated.
    pub wallet: String,
    /// Application address.
    pub application: String,
    /// Declared session key.
    pub participant: String,
    /// Session expiry.
    pub expire: u64,
    /// Declared allowances.
    pub allowances: Vec<Allowance>,
}

impl AuthPolicy {
    /// Build the policy for a challenge.
    pub fn new(config: &AuthConfig, identity: &str, challenge: &ChallengeToken) -> Self {
        Self {
            challenge: challenge.as_str().to_string(),
            scope: config.scope.clone(),
            wallet: identity.to_string(),
            application: config.application.clone(),
            participant: config.session_key_for(identity).to_string(),
            expire: config.expire,
            allowances: config.allowances.clone(),
        }
    }

    /// Structured-scheme form.
    pub fn typed_payload(&self, app_name: &str) -> Result<TypedPayload, HandshakeError> {
        Ok(TypedPayload {
            primary_type: "Policy".to_string(),
            domain: json!({ "name": app_name }),
            message: serde_json::to_value(self).map_err(|e| HandshakeError::Encode(e.to_string()))?,
        })
    }

    /// Message-scheme form.
    pub fn message_payload(&self) -> Result<String, HandshakeError> {
        canonical_json(self).map_err(|e| HandshakeError::Encode(e.to_string()))
    }
}

/// Sign a policy, falling back from the structured to the message scheme.
pub async fn sign_policy(
    signer: &dyn Signer,
    policy: &AuthPolicy,
    app_name: &str,
) -> Result<Signature, HandshakeError> {
    let structured = SignPayload::Structured(policy.typed_payload(app_name)?);
    let structured_err = match signer.sign(&structured).await {
        Ok(signature) => return Ok(signature),
        Err(e) => e,
    };

    debug!("Structured signing failed ({}), falling back to message signing", structured_err);
    let message = SignPayload::Message(policy.message_payload()?);
    signer.sign(&message).await.map_err(|message_err| {
        warn!("Both signing schemes failed for identity {}", signer.identity());
        HandshakeError::Signing {
            structured: structured_err,
            message: message_err,
        }
    })
}

/// Unsigned `auth_request` opening the handshake.
pub fn auth_request(id: u64, config: &AuthConfig, identity: &str) -> Result<String, HandshakeError> {
    let params = json!({
        "address": identity,
        "session_key": config.session_key_for(identity),
        "app_name": config.app_name,
        "allowances": config.allowances,
        "expire": config.expire,
        "scope": config.scope,
        "application": config.application,
    });
    RpcRequest::new(id, AUTH_REQUEST, params)
        .to_json(&[])
        .map_err(|e| HandshakeError::Encode(e.to_string()))
}

/// Signed `auth_verify` answering a challenge.
pub async fn auth_verify(
    id: u64,
    config: &AuthConfig,
    signer: &dyn Signer,
    challenge: &ChallengeToken,
) -> Result<String, HandshakeError> {
    let identity = signer.identity();
    let policy = AuthPolicy::new(config, identity, challenge);
    let signature = sign_policy(signer, &policy, &config.app_name).await?;

    let params = json!({
        "address": identity,
        "challenge": challenge.as_str(),
        "session_key": policy.participant,
        "allowances": policy.allowances,
    });
    RpcRequest::new(id, AUTH_VERIFY, params)
        .to_json(&[signature.into()])
        .map_err(|e| HandshakeError::Encode(e.to_string()))
}

/// Interpret the payload of an inbound `auth_verify`.
pub fn verify_outcome(payload: &Value) -> Result<(), HandshakeError> {
    if let Some(error) = error_message(payload) {
        return Err(HandshakeError::Rejected(error));
    }
    let body = match payload {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    if let Some(false) = body.and_then(|b| b.get("success")).and_then(Value::as_bool) {
        return Err(HandshakeError::Rejected("server reported success=false".to_string()));
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::signer::LocalSigner;
    use async_trait::async_trait;

    /// Signer that refuses selected schemes.
    struct PickySigner {
        inner: LocalSigner,
        refuse_structured: bool,
        refuse_message: bool,
    }

    #[async_trait]
    impl Signer for PickySigner {
        fn identity(&self) -> &str {
            self.inner.identity()
        }

        async fn sign(&self, payload: &SignPayload) -> Result<Signature, SignError> {
            match payload {
                SignPayload::Structured(_) if self.refuse_structured => Err(SignError::Unsupported("structured")),
                SignPayload::Message(_) if self.refuse_message => Err(SignError::Failed("wallet locked".into())),
                _ => self.inner.sign(payload).await,
            }
        }
    }

    fn picky(refuse_structured: bool, refuse_message: bool) -> PickySigner {
        PickySigner {
            inner: LocalSigner::new([3u8; 32]),
            refuse_structured,
            refuse_message,
        }
    }

    fn config() -> AuthConfig {
        AuthConfig {
            allowances: vec![Allowance { asset: "usdc".into(), amount: "100".into() }],
            ..Default::default()
        }
    }

    fn token() -> ChallengeToken {
        ChallengeToken::parse(&json!({"token": "abc"})).unwrap()
    }

    #[tokio::test]
    async fn test_structured_scheme_preferred() {
        let signer = picky(false, false);
        let policy = AuthPolicy::new(&config(), signer.identity(), &token());

        let signature = sign_policy(&signer, &policy, "tictac").await.unwrap();
        let structured = SignPayload::Structured(policy.typed_payload("tictac").unwrap());
        assert!(signer.inner.verify(&structured, &signature));
    }

    #[tokio::test]
    async fn test_falls_back_to_message_scheme() {
        let signer = picky(true, false);
        let policy = AuthPolicy::new(&config(), signer.identity(), &token());

        let signature = sign_policy(&signer, &policy, "tictac").await.unwrap();
        let message = SignPayload::Message(policy.message_payload().unwrap());
        assert!(signer.inner.verify(&message, &signature));
    }

    #[tokio::test]
    async fn test_both_schemes_failing_reports_both() {
        let signer = picky(true, true);
        let policy = AuthPolicy::new(&config(), signer.identity(), &token());

        let err = sign_policy(&signer, &policy, "tictac").await.unwrap_err();
        assert_eq!(
            err,
            HandshakeError::Signing {
                structured: SignError::Unsupported("structured"),
                message: SignError::Failed("wallet locked".into()),
            }
        );
        let text = err.to_string();
        assert!(text.contains("structured") && text.contains("wallet locked"));
    }

    #[tokio::test]
    async fn test_verify_envelope_carries_challenge() {
        let signer = LocalSigner::new([3u8; 32]);
        let frame = auth_verify(5, &config(), &signer, &token()).await.unwrap();
        let json: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(json["req"][0], 5);
        assert_eq!(json["req"][1], "auth_verify");
        assert_eq!(json["req"][2]["challenge"], "abc");
        assert_eq!(json["req"][2]["address"], signer.identity());
        assert_eq!(json["req"][2]["allowances"][0]["asset"], "usdc");
        assert_eq!(json["sig"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_auth_request_is_unsigned() {
        let frame = auth_request(1, &config(), "0xabc").unwrap();
        let json: Value = serde_json::from_str(&frame).unwrap();

        assert_eq!(json["req"][1], "auth_request");
        assert_eq!(json["req"][2]["address"], "0xabc");
        assert_eq!(json["req"][2]["session_key"], "0xabc");
        assert_eq!(json["sig"], json!([]));
    }

    #[test]
    fn test_session_key_override() {
        let config = AuthConfig {
            session_key: Some("0xsession".into()),
            ..Default::default()
        };
        assert_eq!(config.session_key_for("0xabc"), "0xsession");
    }

    #[test]
    fn test_verify_outcome() {
        assert!(verify_outcome(&json!([{"address": "0xabc", "success": true}])).is_ok());
        assert!(verify_outcome(&json!({})).is_ok());
        assert_eq!(
            verify_outcome(&json!([{"error": "invalid signature"}])),
            Err(HandshakeError::Rejected("invalid signature".into()))
        );
        assert!(matches!(
            verify_outcome(&json!({"success": false})),
            Err(HandshakeError::Rejected(_))
        ));
    }

    #[test]
    fn test_allowance_list_parsing() {
        let list = Allowance::parse_list("usdc:100, eth:0.5,broken,:1");
        assert_eq!(
            list,
            vec![
                Allowance { asset: "usdc".into(), amount: "100".into() },
                Allowance { asset: "eth".into(), amount: "0.5".into() },
            ]
        );
    }
}
