//! Channel Directory
//!
//! Looks up the payment channels an identity participates in. A session with
//! no open channel needs one created before it can transact.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::network::client::SessionClient;
use crate::network::session::RequestError;

/// Method name for the channel lookup.
pub const GET_CHANNELS: &str = "get_channels";

/// Status string of a channel that can be used.
pub const STATUS_OPEN: &str = "open";

/// One channel as reported by the server. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    /// Channel id.
    pub channel_id: String,
    /// Participant the channel belongs to.
    #[serde(default)]
    pub participant: String,
    /// Lifecycle status (`open`, `closed`, ...).
    #[serde(default)]
    pub status: String,
    /// Token the channel holds.
    #[serde(default)]
    pub token: Option<String>,
    /// Locked amount, as the server encodes it.
    #[serde(default)]
    pub amount: Option<Value>,
    /// Chain the channel lives on.
    #[serde(default)]
    pub chain_id: Option<u64>,
}

impl ChannelInfo {
    /// Channel can be used right now.
    pub fn is_open(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_OPEN)
    }
}

/// Result of [`check_channels`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCheck {
    /// At least one open channel exists.
    Open(Vec<ChannelInfo>),
    /// Nothing open; a channel has to be created first.
    CreationRequired,
}

/// Anything that can list channels for an identity.
#[async_trait]
pub trait ChannelDirectory: Send + Sync {
    /// All channels of `participant`.
    async fn get_channels(&self, participant: &str) -> Result<Vec<ChannelInfo>, RequestError>;
}

#[async_trait]
impl ChannelDirectory for SessionClient {
    async fn get_channels(&self, participant: &str) -> Result<Vec<ChannelInfo>, RequestError> {
        let payload = self
            .send_request(GET_CHANNELS, json!([{ "participant": participant }]))
            .await?;
        parse_channels(payload)
    }
}

/// Decode a `get_channels` payload.
///
/// Accepts a bare list, a list wrapped in a one-element list, or an object
/// with a `channels` list (optionally wrapped in a list as well).
pub fn parse_channels(payload: Value) -> Result<Vec<ChannelInfo>, RequestError> {
    let list = unwrap_list(payload)?;
    serde_json::from_value(list).map_err(|e| RequestError::Decode(e.to_string()))
}

fn unwrap_list(payload: Value) -> Result<Value, RequestError> {
    match payload {
        Value::Object(mut map) => match map.remove("channels") {
            Some(Value::Null) => Ok(Value::Array(Vec::new())),
            Some(list @ Value::Array(_)) => Ok(list),
            _ => Err(RequestError::Decode("object without a channels list".to_string())),
        },
        Value::Array(mut items) => {
            let wrapped = items.len() == 1 && matches!(items[0], Value::Array(_) | Value::Object(_));
            if wrapped && !is_channel_like(&items[0]) {
                return unwrap_list(items.remove(0));
            }
            Ok(Value::Array(items))
        }
        other => Err(RequestError::Decode(format!("unexpected channels payload: {}", other))),
    }
}

fn is_channel_like(value: &Value) -> bool {
    value.get("channel_id").is_some()
}

/// Decide whether `participant` can transact or needs a channel first.
pub async fn check_channels(
    directory: &dyn ChannelDirectory,
    participant: &str,
) -> Result<ChannelCheck, RequestError> {
    let channels = directory.get_channels(participant).await?;
    let total = channels.len();
    let open: Vec<ChannelInfo> = channels.into_iter().filter(ChannelInfo::is_open).collect();
    debug!("{} of {} channel(s) open for {}", open.len(), total, participant);

    if open.is_empty() {
        Ok(ChannelCheck::CreationRequired)
    } else {
        Ok(ChannelCheck::Open(open))
    }
}
