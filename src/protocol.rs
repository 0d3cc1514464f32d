//! JSON envelopes exchanged over the chat WebSocket.
//!
//! Every text frame carries `{"event": <name>, "data": <payload>}`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Events the browser sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ClientEvent {
    /// Plain chat text.
    Message(String),
    /// Start a new conversation from a previously uploaded image.
    Upload(UploadEvent),
}

impl ClientEvent {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("expected {\"event\": \"message\" | \"upload\", \"data\": ...}")
    }
}

/// Payload of the `upload` event; `path` is the value returned by `POST /upload`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEvent {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub initial_prompt: String,
}

/// Events the relay sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ServerEvent {
    Message(String),
    Error(String),
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("failed to encode server event")
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ServerEvent::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn message_event_parses() {
        let event = ClientEvent::parse(r#"{"event": "message", "data": "hello"}"#).expect("parse");
        assert_eq!(event, ClientEvent::Message("hello".into()));
    }

    #[test]
    fn upload_event_parses_camel_case_fields() {
        let raw = r#"{
            "event": "upload",
            "data": {"path": "uploads/1.png", "mimeType": "image/png", "initialPrompt": "describe"}
        }"#;
        let event = ClientEvent::parse(raw).expect("parse");
        assert_eq!(
            event,
            ClientEvent::Upload(UploadEvent {
                path: Some("uploads/1.png".into()),
                mime_type: Some("image/png".into()),
                initial_prompt: "describe".into(),
            })
        );
    }

    #[test]
    fn upload_event_tolerates_missing_fields() {
        let event = ClientEvent::parse(r#"{"event": "upload", "data": {}}"#).expect("parse");
        assert_eq!(event, ClientEvent::Upload(UploadEvent::default()));
    }

    #[test]
    fn unknown_or_malformed_events_are_rejected() {
        assert!(ClientEvent::parse(r#"{"event": "disconnect"}"#).is_err());
        assert!(ClientEvent::parse(r#"{"event": "message", "data": 42}"#).is_err());
        assert!(ClientEvent::parse("plain text").is_err());
    }

    #[test]
    fn server_events_use_the_same_envelope() {
        let encoded = ServerEvent::Error("File not found on server".into())
            .to_json()
            .expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value, json!({"event": "error", "data": "File not found on server"}));

        let encoded = ServerEvent::Message("hi".into()).to_json().expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["event"], "message");
    }
}
