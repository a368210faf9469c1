//! Cluster wire protocol: JSON-RPC message model and reserved method names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::RpcResult;

/// Current protocol version. Sent as the first byte of the identity handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Version tag carried by replies and announcements.
pub const JSONRPC_VERSION: &str = "2.0";

/// Control method a peer uses to report how far it has processed our log.
/// Never counts as liveness evidence, in either direction.
pub const SET_LOG_POSITION: &str = "log::SetLogPosition";

/// One RPC unit: an ordered mapping of named fields.
///
/// Well-known fields: `method`, `params`, `id` (present only when a reply is expected),
/// `ts` (replay position) and `originZone`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Map<String, Value>);

impl Message {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Notification (no `id`): `{"jsonrpc": "2.0", "method": .., "params": ..}`.
    pub fn notification(method: &str, params: Value) -> Self {
        Self::new()
            .with("jsonrpc", JSONRPC_VERSION)
            .with("method", method)
            .with("params", params)
    }

    /// Request expecting a reply correlated by `id`.
    pub fn request(id: impl Into<Value>, method: &str, params: Value) -> Self {
        Self::notification(method, params).with("id", id)
    }

    /// Reply envelope for a request: `{"jsonrpc": "2.0", "id": .., "result"|"error": ..}`.
    pub fn reply(id: Value, outcome: RpcResult) -> Self {
        let reply = Self::new().with("jsonrpc", JSONRPC_VERSION).with("id", id);
        match outcome {
            Ok(value) => reply.with("result", value),
            Err(err) => reply.with("error", err.to_string()),
        }
    }

    /// `log::SetLogPosition` announcement telling the peer how far we processed its log.
    pub fn log_position(position: f64) -> Self {
        Self::notification(
            SET_LOG_POSITION,
            serde_json::json!({ "log_position": position }),
        )
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_owned(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn method(&self) -> Option<&str> {
        self.get("method").and_then(Value::as_str)
    }

    pub fn params(&self) -> Option<&Value> {
        self.get("params")
    }

    pub fn id(&self) -> Option<&Value> {
        self.get("id")
    }

    /// Replay position of this message. A non-numeric `ts` counts as absent.
    pub fn timestamp(&self) -> Option<f64> {
        self.get("ts").and_then(Value::as_f64)
    }

    pub fn origin_zone(&self) -> Option<&str> {
        self.get("originZone").and_then(Value::as_str)
    }

    /// Whether this is the log-position control message (exempt from last-seen updates).
    pub fn is_log_position(&self) -> bool {
        self.method() == Some(SET_LOG_POSITION)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Message {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
