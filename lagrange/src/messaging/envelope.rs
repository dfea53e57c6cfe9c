//! Wire envelope shared by every transport.
//!
//! Messages are JSON objects with camelCase keys:
//!
//! ```json
//! {"requestId": "…", "source": "tcp://…", "messageName": "PING_NODE", "data": {}}
//! ```
//!
//! Acknowledgements carry `messageName = "ACK"` and the `requestId` of the
//! message they answer in `originalRequestId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const GET_PEER_DATA: &str = "GET_PEER_DATA";
pub const PING_NODE: &str = "PING_NODE";
pub const UPDATE_TABLE: &str = "UPDATE_TABLE";
pub const CACHE_SYNC: &str = "CACHE_SYNC";
pub const PARTITION_QUERY: &str = "PARTITION_QUERY";
pub const PARTITION_REGISTER_LIVE_QUERY: &str = "PARTITION_REGISTER_LIVE_QUERY";
pub const PARTITION_DEREGISTER_LIVE_QUERY: &str = "PARTITION_DEREGISTER_LIVE_QUERY";
pub const LIVE_QUERY_UPDATE: &str = "LIVE_QUERY_UPDATE";
pub const ACK: &str = "ACK";

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub request_id: Uuid,
    /// Address of the sender, used as the reply destination.
    pub source: String,
    pub message_name: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_request_id: Option<Uuid>,
}

impl Message {
    /// A new command with a fresh request id.
    #[must_use]
    pub fn command(message_name: impl Into<String>, data: Value, source: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            source: source.into(),
            message_name: message_name.into(),
            data,
            original_request_id: None,
        }
    }

    /// An acknowledgement answering this message.
    #[must_use]
    pub fn ack(&self, data: Value, source: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            source: source.into(),
            message_name: ACK.to_owned(),
            data,
            original_request_id: Some(self.request_id),
        }
    }

    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.message_name == ACK
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_is_camel_case() {
        let message = Message::command(PING_NODE, json!({}), "mem://a");
        let value: Value = serde_json::from_str(&message.to_json().expect("json")).expect("parse");
        assert_eq!(value["messageName"], "PING_NODE");
        assert_eq!(value["source"], "mem://a");
        assert_eq!(value["requestId"], message.request_id.to_string());
        assert!(value.get("originalRequestId").is_none());
    }

    #[test]
    fn test_ack_links_original_request() {
        let command = Message::command(UPDATE_TABLE, json!({"key": "k"}), "mem://a");
        let ack = command.ack(json!({"ok": true}), "mem://b");
        assert!(ack.is_ack());
        assert_ne!(ack.request_id, command.request_id);
        assert_eq!(ack.original_request_id, Some(command.request_id));
        assert_eq!(ack.source, "mem://b");

        let parsed = Message::from_json(&ack.to_json().expect("json")).expect("parse");
        assert_eq!(parsed, ack);
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let parsed = Message::from_json(
            r#"{"requestId":"6f1f0a3c-3a43-4a43-9f8e-2b1f0c7a8d11","source":"x","messageName":"PING_NODE"}"#,
        )
        .expect("parse");
        assert_eq!(parsed.data, Value::Null);
    }
}
