// Messages exchanged between a client connection and its document session.
//
// Encoding is the transport's concern; these types only fix the shape.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Awareness, ClientId};

pub const STALE_SEQ: &str = "STALE_SEQ";
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
pub const INVALID_CHANGESET: &str = "INVALID_CHANGESET";
pub const SAVE_FAILED: &str = "SAVE_FAILED";
pub const LEASE_LOST: &str = "LEASE_LOST";
pub const SESSION_FAILED: &str = "SESSION_FAILED";
pub const SHUTTING_DOWN: &str = "SHUTTING_DOWN";

/// Client -> session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(bound(deserialize = "C: serde::de::DeserializeOwned"))]
pub struct IncomingMessage<C> {
    /// Per-client sequence number; must strictly increase.
    pub seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awareness: Option<Awareness>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<C>,
}

impl<C> IncomingMessage<C> {
    pub fn new(seq: i64) -> Self {
        Self { seq, awareness: None, change: None }
    }

    pub fn with_awareness(mut self, awareness: Awareness) -> Self {
        self.awareness = Some(awareness);
        self
    }

    pub fn with_change(mut self, change: C) -> Self {
        self.change = Some(change);
        self
    }
}

/// Session -> client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(bound(deserialize = "C: serde::de::DeserializeOwned"))]
pub struct OutgoingMessage<C> {
    /// Last accepted sequence number for every client that has sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acks: Option<HashMap<ClientId, i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awareness: Option<HashMap<ClientId, Awareness>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<C>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl<C> OutgoingMessage<C> {
    pub fn error(error: ErrorPayload) -> Self {
        Self { acks: None, awareness: None, change: None, error: Some(error) }
    }

    pub fn change(change: C) -> Self {
        Self { acks: None, awareness: None, change: Some(change), error: None }
    }

    /// Whether this message ends the connection.
    pub fn is_terminal(&self) -> bool {
        self.error.as_ref().is_some_and(|error| error.terminal)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    /// The session will send nothing further to this client.
    pub terminal: bool,
}

impl ErrorPayload {
    pub fn new(code: &str, message: impl Into<String>, terminal: bool) -> Self {
        Self { code: code.to_string(), message: message.into(), terminal }
    }

    pub fn stale_seq(sent: i64, last: i64) -> Self {
        Self::new(STALE_SEQ, format!("seq {sent} is not after last accepted seq {last}"), false)
    }
}

/// Tells a caller which instance owns the document it asked for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutingHint {
    pub addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn incoming_omits_absent_fields() {
        let message: IncomingMessage<String> = IncomingMessage::new(3);
        assert_eq!(serde_json::to_value(&message).unwrap(), json!({ "seq": 3 }));
    }

    #[test]
    fn incoming_parses_full_message() {
        let message: IncomingMessage<String> = serde_json::from_value(json!({
            "seq": 9,
            "awareness": { "cursor": [1.5, 52.1] },
            "change": "edit",
        }))
        .unwrap();

        assert_eq!(message.seq, 9);
        assert_eq!(message.awareness, Some(json!({ "cursor": [1.5, 52.1] })));
        assert_eq!(message.change.as_deref(), Some("edit"));
    }

    #[test]
    fn outgoing_broadcast_shape() {
        let client = Uuid::nil();
        let message: OutgoingMessage<String> = OutgoingMessage {
            acks: Some(HashMap::from([(client, 4)])),
            awareness: Some(HashMap::from([(client, json!({ "name": "Ada" }))])),
            change: None,
            error: None,
        };

        let value = serde_json::to_value(&message).unwrap();
        let object = value.as_object().unwrap();
        let mut keys = object.keys().map(String::as_str).collect::<Vec<_>>();
        keys.sort_unstable();
        assert_eq!(keys, ["acks", "awareness"]);
        assert_eq!(value["acks"][client.to_string()], json!(4));
    }

    #[test]
    fn terminal_only_when_error_says_so() {
        let stale: OutgoingMessage<String> = OutgoingMessage::error(ErrorPayload::stale_seq(1, 2));
        assert!(!stale.is_terminal());

        let fatal: OutgoingMessage<String> =
            OutgoingMessage::error(ErrorPayload::new(SAVE_FAILED, "disk gone", true));
        assert!(fatal.is_terminal());
        assert!(!OutgoingMessage::change("x".to_string()).is_terminal());
    }
}
