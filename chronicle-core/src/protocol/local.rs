//! Frames of the local Chronicle server socket (`/ws`)
//!
//! ```json
//! {"type": "event" | "session" | "heartbeat" | "error" | "subscribe" | "unsubscribe",
//!  "data": ..., "id": "optional", "error": "optional"}
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{Inbound, Push, Topic, WireProtocol};
use crate::error::{Error, Result};
use crate::types::{Event, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Event,
    Session,
    Heartbeat,
    Error,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Frame {
    fn new(frame_type: FrameType, data: serde_json::Value) -> Self {
        Self {
            frame_type,
            data,
            id: None,
            error: None,
        }
    }

    fn to_text(&self) -> String {
        // Serializing a Frame cannot fail: every field is plain JSON.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct LocalProtocol;

impl LocalProtocol {
    pub fn new() -> Self {
        Self
    }
}

fn channel_of(data: &serde_json::Value) -> Option<Topic> {
    match data.get("channel").and_then(|c| c.as_str()) {
        Some("events") => Some(Topic::Events),
        Some("sessions") => Some(Topic::Sessions),
        _ => None,
    }
}

impl WireProtocol for LocalProtocol {
    fn subscribe_frame(&self, topic: Topic) -> String {
        Frame::new(
            FrameType::Subscribe,
            serde_json::json!({ "channel": topic.as_str() }),
        )
        .to_text()
    }

    fn unsubscribe_frame(&self, topic: Topic) -> String {
        Frame::new(
            FrameType::Unsubscribe,
            serde_json::json!({ "channel": topic.as_str() }),
        )
        .to_text()
    }

    fn heartbeat_frame(&self) -> String {
        Frame::new(
            FrameType::Heartbeat,
            serde_json::json!({ "timestamp": Utc::now().to_rfc3339() }),
        )
        .to_text()
    }

    fn encode(&self, message: &serde_json::Value) -> String {
        message.to_string()
    }

    fn decode(&self, text: &str) -> Result<Inbound> {
        let frame: Frame = serde_json::from_str(text)?;
        match frame.frame_type {
            FrameType::Event => {
                let event: Event = serde_json::from_value(frame.data)
                    .map_err(|e| Error::protocol(format!("malformed event frame: {}", e)))?;
                Ok(Inbound::Push(Push::Event(event)))
            }
            FrameType::Session => {
                let session: Session = serde_json::from_value(frame.data)
                    .map_err(|e| Error::protocol(format!("malformed session frame: {}", e)))?;
                Ok(Inbound::Push(Push::Session(session)))
            }
            FrameType::Heartbeat => Ok(Inbound::Heartbeat),
            FrameType::Error => {
                let message = frame
                    .error
                    .or_else(|| frame.data.as_str().map(str::to_string))
                    .unwrap_or_else(|| "unspecified server error".to_string());
                Ok(Inbound::ServerError(message))
            }
            FrameType::Subscribe => Ok(channel_of(&frame.data)
                .map(Inbound::Ack)
                .unwrap_or(Inbound::Ignored)),
            FrameType::Unsubscribe => Ok(Inbound::Ignored),
        }
    }
}
