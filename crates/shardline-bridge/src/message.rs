//! The `ShardMessage` envelope and channel naming.
//!
//! Every message on the wire is a JSON object:
//!
//! ```json
//! { "type": "getStats", "shardId": 2, "requestId": "…", "data": {}, "timestamp": 1760000000000 }
//! ```
//!
//! `requestId` is present on requests and responses only. Three channels
//! carry the traffic: `{prefix}:broadcast`, `{prefix}:request` and
//! `{prefix}:response`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BridgeError;

/// Default channel prefix.
pub const DEFAULT_CHANNEL_PREFIX: &str = "shardline";

/// A message exchanged between shards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardMessage {
    /// Event or request type, e.g. `guildUpdated` or `getStats`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Sending shard.
    pub shard_id: u32,
    /// Correlates a request with its responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Uuid>,
    /// Payload.
    #[serde(default)]
    pub data: Value,
    /// Handler failure reported in a response instead of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Send time, Unix milliseconds.
    pub timestamp: i64,
}

impl ShardMessage {
    fn new(kind: &str, shard_id: u32, request_id: Option<Uuid>, data: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            shard_id,
            request_id,
            data,
            error: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// A fire-and-forget event for every other shard.
    pub fn broadcast(kind: &str, shard_id: u32, data: Value) -> Self {
        Self::new(kind, shard_id, None, data)
    }

    /// A fan-out request.
    pub fn request(kind: &str, shard_id: u32, request_id: Uuid, data: Value) -> Self {
        Self::new(kind, shard_id, Some(request_id), data)
    }

    /// A successful answer to `request`, sent by `shard_id`.
    pub fn response(request: &Self, shard_id: u32, data: Value) -> Self {
        Self::new(&request.kind, shard_id, request.request_id, data)
    }

    /// A failed answer to `request`, sent by `shard_id`.
    pub fn failure(request: &Self, shard_id: u32, error: &BridgeError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(&request.kind, shard_id, request.request_id, Value::Null)
        }
    }

    /// Encode as JSON text.
    pub fn encode(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON text.
    pub fn decode(raw: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// The three logical channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Events for every shard.
    Broadcast,
    /// Fan-out requests.
    Request,
    /// Answers to fan-out requests.
    Response,
}

impl Channel {
    /// All channels, in subscription order.
    pub const ALL: [Self; 3] = [Self::Broadcast, Self::Request, Self::Response];

    const fn suffix(self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

/// Concrete channel names under a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    prefix: String,
}

impl ChannelNames {
    /// Names under `prefix`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_owned(),
        }
    }

    /// Full name of `channel`.
    pub fn name(&self, channel: Channel) -> String {
        format!("{}:{}", self.prefix, channel.suffix())
    }

    /// Every full name, for subscribing.
    pub fn all(&self) -> Vec<String> {
        Channel::ALL.iter().map(|c| self.name(*c)).collect()
    }

    /// Which channel a full name refers to, if any.
    pub fn parse(&self, name: &str) -> Option<Channel> {
        let suffix = name.strip_prefix(self.prefix.as_str())?.strip_prefix(':')?;
        Channel::ALL.into_iter().find(|c| c.suffix() == suffix)
    }
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_camel_case_and_type() {
        let id = Uuid::nil();
        let msg = ShardMessage::request("getStats", 2, id, serde_json::json!({"x": 1}));
        let value: Value = serde_json::from_str(&msg.encode().unwrap_or_default()).unwrap_or_default();
        assert_eq!(value["type"], "getStats");
        assert_eq!(value["shardId"], 2);
        assert_eq!(value["requestId"], id.to_string());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn broadcast_has_no_request_id() {
        let msg = ShardMessage::broadcast("guildUpdated", 0, Value::Null);
        let raw = msg.encode().unwrap_or_default();
        assert!(!raw.contains("requestId"));
        assert_eq!(ShardMessage::decode(&raw).ok(), Some(msg));
    }

    #[test]
    fn responses_keep_the_request_correlation() {
        let request = ShardMessage::request("findGuild", 0, Uuid::new_v4(), Value::Null);
        let ok = ShardMessage::response(&request, 3, serde_json::json!({"name": "g"}));
        assert_eq!(ok.request_id, request.request_id);
        assert_eq!(ok.kind, "findGuild");
        let failed = ShardMessage::failure(&request, 3, &BridgeError::Closed);
        assert_eq!(failed.request_id, request.request_id);
        assert!(failed.error.is_some());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            ShardMessage::decode("not json"),
            Err(BridgeError::Serialization(_))
        ));
    }

    #[test]
    fn channel_names_round_trip() {
        let names = ChannelNames::new("bot");
        assert_eq!(names.name(Channel::Request), "bot:request");
        assert_eq!(names.parse("bot:response"), Some(Channel::Response));
        assert_eq!(names.parse("bot:other"), None);
        assert_eq!(names.parse("other:request"), None);
        assert_eq!(names.all(), vec!["bot:broadcast", "bot:request", "bot:response"]);
    }
}
