//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text message. Requests, responses and errors are
//! positional arrays wrapped in a one-key envelope:
//!
//! ```text
//! { "req": [id, method, params, timestamp], "sig": ["0x..."] }
//! { "res": [id, method, payload, timestamp] }
//! { "err": [id, code, message, timestamp] }
//! ```

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Method that opens the handshake.
pub const AUTH_REQUEST: &str = "auth_request";
/// Method tag of the server's handshake challenge.
pub const AUTH_CHALLENGE: &str = "auth_challenge";
/// Method that completes the handshake (both directions).
pub const AUTH_VERIFY: &str = "auth_verify";
/// Liveness message method.
pub const PING: &str = "ping";
/// Method tag some servers use for errors carried inside a `res` envelope.
pub const ERROR_METHOD: &str = "error";

/// Request id reserved for server-initiated pushes.
pub const NOTIFICATION_ID: u64 = 0;

/// Current wall-clock time in milliseconds.
pub fn timestamp_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// An outbound request before it is wrapped and signed.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Request identifier (unique per session).
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    pub params: Value,
    /// Client timestamp (ms).
    pub timestamp: u64,
}

/// Outer envelope of an outbound request.
#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    req: Value,
    sig: &'a [String],
}

impl RpcRequest {
    /// Create a request stamped with the current time.
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            timestamp: timestamp_ms(),
        }
    }

    /// Positional `[id, method, params, timestamp]` form.
    pub fn to_array(&self) -> Value {
        Value::Array(vec![
            Value::from(self.id),
            Value::from(self.method.clone()),
            self.params.clone(),
            Value::from(self.timestamp),
        ])
    }

    /// The exact string that gets signed for this request.
    pub fn signing_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_array())
    }

    /// Serialize the full envelope with the given signatures.
    pub fn to_json(&self, signatures: &[String]) -> Result<String, serde_json::Error> {
        serde_json::to_string(&RequestEnvelope {
            req: self.to_array(),
            sig: signatures,
        })
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// A response to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    /// Request id this answers.
    pub id: u64,
    /// Method tag.
    pub method: String,
    /// Result payload.
    pub payload: Value,
    /// Server timestamp (ms), 0 if absent.
    pub timestamp: u64,
}

/// An error answer to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    /// Request id this answers.
    pub id: u64,
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Server timestamp (ms), 0 if absent.
    pub timestamp: u64,
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Handshake challenge; payload still has to be parsed into a token.
    Challenge(Value),
    /// Handshake result; payload may still carry an error.
    AuthVerify(Value),
    /// Response to a request.
    Response(RpcResponse),
    /// Error answer to a request.
    Error(RpcError),
    /// Anything else, forwarded verbatim.
    Notification(Value),
}

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(String),
    /// Valid JSON but not an object.
    #[error("frame is not a json object")]
    NotAnObject,
    /// A `res`/`err` envelope with the wrong layout.
    #[error("malformed {tag} envelope: {reason}")]
    Malformed {
        /// Envelope key.
        tag: &'static str,
        /// What was wrong.
        reason: &'static str,
    },
}

impl Inbound {
    /// Classify a text frame.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Classify an already decoded frame.
    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let object = value.as_object().ok_or(FrameError::NotAnObject)?;

        if let Some(res) = object.get("res") {
            let response = parse_res(res)?;
            return Ok(match response.method.as_str() {
                AUTH_CHALLENGE => Inbound::Challenge(response.payload),
                AUTH_VERIFY => Inbound::AuthVerify(response.payload),
                ERROR_METHOD if response.id != NOTIFICATION_ID => Inbound::Error(RpcError {
                    id: response.id,
                    code: 0,
                    message: error_message(&response.payload)
                        .unwrap_or_else(|| response.payload.to_string()),
                    timestamp: response.timestamp,
                }),
                _ if response.id == NOTIFICATION_ID => Inbound::Notification(value),
                _ => Inbound::Response(response),
            });
        }

        if let Some(err) = object.get("err") {
            return parse_err(err).map(Inbound::Error);
        }

        Ok(Inbound::Notification(value))
    }
}

fn parse_res(value: &Value) -> Result<RpcResponse, FrameError> {
    const TAG: &str = "res";
    let items = value
        .as_array()
        .ok_or(FrameError::Malformed { tag: TAG, reason: "not an array" })?;
    if items.len() < 3 {
        return Err(FrameError::Malformed { tag: TAG, reason: "fewer than 3 elements" });
    }
    let id = items[0]
        .as_u64()
        .ok_or(FrameError::Malformed { tag: TAG, reason: "id is not an unsigned integer" })?;
    let method = items[1]
        .as_str()
        .ok_or(FrameError::Malformed { tag: TAG, reason: "method is not a string" })?;

    Ok(RpcResponse {
        id,
        method: method.to_string(),
        payload: items[2].clone(),
        timestamp: items.get(3).and_then(Value::as_u64).unwrap_or(0),
    })
}

fn parse_err(value: &Value) -> Result<RpcError, FrameError> {
    const TAG: &str = "err";
    let items = value
        .as_array()
        .ok_or(FrameError::Malformed { tag: TAG, reason: "not an array" })?;
    if items.len() < 3 {
        return Err(FrameError::Malformed { tag: TAG, reason: "fewer than 3 elements" });
    }
    let id = items[0]
        .as_u64()
        .ok_or(FrameError::Malformed { tag: TAG, reason: "id is not an unsigned integer" })?;
    let code = items[1]
        .as_i64()
        .ok_or(FrameError::Malformed { tag: TAG, reason: "code is not an integer" })?;
    let message = match &items[2] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    Ok(RpcError {
        id,
        code,
        message,
        timestamp: items.get(3).and_then(Value::as_u64).unwrap_or(0),
    })
}

/// Pull an `error` string out of a payload (`{error}` or `[{error}]`).
pub fn error_message(payload: &Value) -> Option<String> {
    let object = match payload {
        Value::Array(items) => items.first()?.as_object()?,
        Value::Object(map) => map,
        _ => return None,
    };
    object.get("error").map(|e| match e {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

// =============================================================================
// HANDSHAKE CHALLENGE
// =============================================================================

/// Keys a challenge token may be stored under, in lookup order.
const CHALLENGE_KEYS: [&str; 4] = ["challenge_message", "challengeMessage", "challenge", "token"];

/// Maximum nesting accepted around a challenge token.
pub const MAX_CHALLENGE_DEPTH: usize = 4;

/// Opaque challenge token for one handshake attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeToken(String);

/// Why a challenge payload did not yield a token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChallengeError {
    /// Empty array.
    #[error("challenge payload is empty")]
    Empty,
    /// Token string is empty.
    #[error("challenge token is an empty string")]
    EmptyToken,
    /// Object without any known token key.
    #[error("challenge object has no known token key")]
    MissingKey,
    /// Leaf of an unusable JSON type.
    #[error("challenge token has unsupported type {0}")]
    UnsupportedType(&'static str),
    /// Nesting beyond `MAX_CHALLENGE_DEPTH`.
    #[error("challenge payload nested deeper than {0} levels")]
    TooDeep(usize),
}

impl ChallengeToken {
    /// Extract the token from any of the accepted payload shapes.
    pub fn parse(payload: &Value) -> Result<Self, ChallengeError> {
        Self::parse_at(payload, 0)
    }

    fn parse_at(value: &Value, depth: usize) -> Result<Self, ChallengeError> {
        if depth > MAX_CHALLENGE_DEPTH {
            return Err(ChallengeError::TooDeep(MAX_CHALLENGE_DEPTH));
        }
        match value {
            Value::String(s) if s.is_empty() => Err(ChallengeError::EmptyToken),
            Value::String(s) => Ok(Self(s.clone())),
            Value::Array(items) => match items.first() {
                Some(first) => Self::parse_at(first, depth + 1),
                None => Err(ChallengeError::Empty),
            },
            Value::Object(map) => {
                let inner = CHALLENGE_KEYS
                    .iter()
                    .find_map(|key| map.get(*key))
                    .ok_or(ChallengeError::MissingKey)?;
                Self::parse_at(inner, depth + 1)
            }
            Value::Number(_) => Err(ChallengeError::UnsupportedType("number")),
            Value::Bool(_) => Err(ChallengeError::UnsupportedType("bool")),
            Value::Null => Err(ChallengeError::UnsupportedType("null")),
        }
    }

    /// Token text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_request_envelope_layout() {
        let req = RpcRequest {
            id: 7,
            method: "get_channels".into(),
            params: json!([{"participant": "0xabc"}]),
            timestamp: 1000,
        };

        let json: Value = serde_json::from_str(&req.to_json(&["0xsig".into()]).unwrap()).unwrap();
        assert_eq!(json["req"], json!([7, "get_channels", [{"participant": "0xabc"}], 1000]));
        assert_eq!(json["sig"], json!(["0xsig"]));
    }

    #[test]
    fn test_signing_payload_is_the_req_array() {
        let req = RpcRequest {
            id: 1,
            method: "ping".into(),
            params: json!([]),
            timestamp: 5,
        };
        assert_eq!(req.signing_payload().unwrap(), r#"[1,"ping",[],5]"#);
    }

    #[test]
    fn test_parse_response() {
        let inbound = Inbound::parse(r#"{"res":[1,"get_channels",[],0]}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Response(RpcResponse {
                id: 1,
                method: "get_channels".into(),
                payload: json!([]),
                timestamp: 0,
            })
        );
    }

    #[test]
    fn test_parse_error() {
        let inbound = Inbound::parse(r#"{"err":[2,42,"bad params",0]}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Error(RpcError {
                id: 2,
                code: 42,
                message: "bad params".into(),
                timestamp: 0,
            })
        );
    }

    #[test]
    fn test_parse_error_inside_res() {
        let inbound = Inbound::parse(r#"{"res":[3,"error",{"error":"nope"},0]}"#).unwrap();
        match inbound {
            Inbound::Error(err) => {
                assert_eq!(err.id, 3);
                assert_eq!(err.message, "nope");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_pushed_error_is_notification() {
        let inbound = Inbound::parse(r#"{"res":[0,"error",{"error":"maintenance"},0]}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Notification(json!({"res": [0, "error", {"error": "maintenance"}, 0]}))
        );
    }

    #[test]
    fn test_parse_handshake_tags() {
        let challenge = Inbound::parse(r#"{"res":[0,"auth_challenge",{"token":"abc"},0]}"#).unwrap();
        assert_eq!(challenge, Inbound::Challenge(json!({"token": "abc"})));

        let verify = Inbound::parse(r#"{"res":[0,"auth_verify",[{"success":true}],0]}"#).unwrap();
        assert_eq!(verify, Inbound::AuthVerify(json!([{"success": true}])));
    }

    #[test]
    fn test_parse_notifications() {
        let push = Inbound::parse(r#"{"res":[0,"bu",{"balance":"10"},0]}"#).unwrap();
        assert!(matches!(push, Inbound::Notification(_)));

        let other = Inbound::parse(r#"{"type":"room_update","players":2}"#).unwrap();
        assert_eq!(other, Inbound::Notification(json!({"type": "room_update", "players": 2})));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(Inbound::parse("not json"), Err(FrameError::InvalidJson(_))));
        assert_eq!(Inbound::parse("[1,2]"), Err(FrameError::NotAnObject));
        assert!(matches!(
            Inbound::parse(r#"{"res":["x","m",null]}"#),
            Err(FrameError::Malformed { tag: "res", .. })
        ));
        assert!(matches!(
            Inbound::parse(r#"{"err":[1,"code","msg"]}"#),
            Err(FrameError::Malformed { tag: "err", .. })
        ));
    }

    #[test]
    fn test_challenge_shapes() {
        let shapes = vec![
            json!("abc"),
            json!(["abc"]),
            json!({"token": "abc"}),
            json!({"challenge": "abc"}),
            json!({"challengeMessage": "abc"}),
            json!([{"challenge_message": "abc"}]),
            json!({"challenge": {"token": "abc"}}),
        ];

        for shape in shapes {
            let token = ChallengeToken::parse(&shape).unwrap();
            assert_eq!(token.as_str(), "abc", "shape {}", shape);
        }
    }

    #[test]
    fn test_challenge_key_precedence() {
        let payload = json!({"token": "second", "challenge_message": "first"});
        assert_eq!(ChallengeToken::parse(&payload).unwrap().as_str(), "first");
    }

    #[test]
    fn test_challenge_rejects_bad_shapes() {
        assert_eq!(ChallengeToken::parse(&json!([])), Err(ChallengeError::Empty));
        assert_eq!(ChallengeToken::parse(&json!("")), Err(ChallengeError::EmptyToken));
        assert_eq!(ChallengeToken::parse(&json!({"nonce": "abc"})), Err(ChallengeError::MissingKey));
        assert_eq!(
            ChallengeToken::parse(&json!({"token": 12})),
            Err(ChallengeError::UnsupportedType("number"))
        );
        assert_eq!(
            ChallengeToken::parse(&json!(null)),
            Err(ChallengeError::UnsupportedType("null"))
        );
        assert_eq!(
            ChallengeToken::parse(&json!([[[[[["abc"]]]]]])),
            Err(ChallengeError::TooDeep(MAX_CHALLENGE_DEPTH))
        );
    }

    proptest! {
        #[test]
        fn prop_challenge_never_accepts_numbers_or_bools(n in any::<i64>(), b in any::<bool>()) {
            prop_assert!(ChallengeToken::parse(&json!(n)).is_err());
            let wrapped = json!({"token": n});
            prop_assert!(ChallengeToken::parse(&wrapped).is_err());
            prop_assert!(ChallengeToken::parse(&json!([b])).is_err());
        }

        #[test]
        fn prop_challenge_accepts_any_nonempty_string(s in ".+") {
            let token = ChallengeToken::parse(&json!({"challenge_message": s.clone()})).unwrap();
            prop_assert_eq!(token.as_str(), s.as_str());
        }
    }
}
