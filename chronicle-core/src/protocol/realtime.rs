//! Phoenix channel frames of the cloud realtime service
//!
//! Every frame is `{topic, event, payload, ref}`. Table change streams are
//! joined as `realtime:{schema}:{table}` topics; the join reply is the
//! subscription acknowledgment. Heartbeats go to the `phoenix` topic.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Inbound, Push, Topic, WireProtocol};
use crate::error::{Error, Result};
use crate::types::{Event, Session};

const PHOENIX_TOPIC: &str = "phoenix";
const BROADCAST_TOPIC: &str = "realtime:chronicle";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

/// Row change as delivered inside a `postgres_changes` payload
#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    change_type: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: serde_json::Value,
}

#[derive(Debug)]
pub struct RealtimeProtocol {
    schema: String,
    events_table: String,
    sessions_table: String,
    next_ref: AtomicU64,
}

impl RealtimeProtocol {
    pub fn new(
        schema: impl Into<String>,
        events_table: impl Into<String>,
        sessions_table: impl Into<String>,
    ) -> Self {
        Self {
            schema: schema.into(),
            events_table: events_table.into(),
            sessions_table: sessions_table.into(),
            next_ref: AtomicU64::new(1),
        }
    }

    fn table(&self, topic: Topic) -> &str {
        match topic {
            Topic::Events => &self.events_table,
            Topic::Sessions => &self.sessions_table,
        }
    }

    pub fn channel_topic(&self, topic: Topic) -> String {
        format!("realtime:{}:{}", self.schema, self.table(topic))
    }

    fn topic_for_channel(&self, channel: &str) -> Option<Topic> {
        [Topic::Events, Topic::Sessions]
            .into_iter()
            .find(|t| self.channel_topic(*t) == channel)
    }

    fn topic_for_table(&self, table: &str) -> Option<Topic> {
        if table == self.events_table {
            Some(Topic::Events)
        } else if table == self.sessions_table {
            Some(Topic::Sessions)
        } else {
            None
        }
    }

    fn frame(&self, topic: String, event: &str, payload: serde_json::Value) -> String {
        let frame = PhoenixFrame {
            topic,
            event: event.to_string(),
            payload,
            reference: Some(self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()),
        };
        serde_json::to_string(&frame).unwrap_or_default()
    }

    fn decode_change(&self, channel: &str, payload: &serde_json::Value) -> Result<Inbound> {
        let data: ChangeData = serde_json::from_value(payload.get("data").cloned().unwrap_or_default())
            .map_err(|e| Error::protocol(format!("malformed postgres_changes payload: {}", e)))?;

        let topic = data
            .table
            .as_deref()
            .and_then(|t| self.topic_for_table(t))
            .or_else(|| self.topic_for_channel(channel))
            .ok_or_else(|| Error::protocol(format!("change for unknown channel {}", channel)))?;

        match (topic, data.change_type.as_str()) {
            (Topic::Events, "INSERT") => {
                let event: Event = serde_json::from_value(data.record)
                    .map_err(|e| Error::protocol(format!("malformed event row: {}", e)))?;
                Ok(Inbound::Push(Push::Event(event)))
            }
            (Topic::Sessions, "INSERT" | "UPDATE") => {
                let session: Session = serde_json::from_value(data.record)
                    .map_err(|e| Error::protocol(format!("malformed session row: {}", e)))?;
                Ok(Inbound::Push(Push::Session(session)))
            }
            _ => Ok(Inbound::Ignored),
        }
    }
}

impl WireProtocol for RealtimeProtocol {
    fn subscribe_frame(&self, topic: Topic) -> String {
        let change_event = match topic {
            Topic::Events => "INSERT",
            Topic::Sessions => "*",
        };
        let payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": change_event,
                    "schema": self.schema,
                    "table": self.table(topic),
                }],
            }
        });
        self.frame(self.channel_topic(topic), "phx_join", payload)
    }

    fn unsubscribe_frame(&self, topic: Topic) -> String {
        self.frame(self.channel_topic(topic), "phx_leave", json!({}))
    }

    fn heartbeat_frame(&self) -> String {
        self.frame(PHOENIX_TOPIC.to_string(), "heartbeat", json!({}))
    }

    fn encode(&self, message: &serde_json::Value) -> String {
        self.frame(
            BROADCAST_TOPIC.to_string(),
            "broadcast",
            json!({ "type": "broadcast", "event": "message", "payload": message }),
        )
    }

    fn decode(&self, text: &str) -> Result<Inbound> {
        let frame: PhoenixFrame = serde_json::from_str(text)?;

        match frame.event.as_str() {
            "phx_reply" if frame.topic == PHOENIX_TOPIC => Ok(Inbound::Heartbeat),
            "phx_reply" => {
                let Some(topic) = self.topic_for_channel(&frame.topic) else {
                    return Ok(Inbound::Ignored);
                };
                match frame.payload.get("status").and_then(|s| s.as_str()) {
                    Some("ok") => Ok(Inbound::Ack(topic)),
                    _ => Ok(Inbound::ChannelError(format!(
                        "join of {} rejected: {}",
                        frame.topic,
                        frame.payload.get("response").cloned().unwrap_or_default()
                    ))),
                }
            }
            "phx_error" => Ok(Inbound::ChannelError(format!(
                "channel {} errored",
                frame.topic
            ))),
            "phx_close" => Ok(Inbound::ChannelError(format!(
                "channel {} closed by server",
                frame.topic
            ))),
            "postgres_changes" => self.decode_change(&frame.topic, &frame.payload),
            "system" => {
                if frame.payload.get("status").and_then(|s| s.as_str()) == Some("error") {
                    let message = frame
                        .payload
                        .get("message")
                        .and_then(|m| m.as_str())
                        .unwrap_or("realtime system error");
                    Ok(Inbound::ServerError(message.to_string()))
                } else {
                    Ok(Inbound::Ignored)
                }
            }
            "presence_state" | "presence_diff" | "broadcast" => Ok(Inbound::Ignored),
            other => Err(Error::protocol(format!("unknown realtime event {}", other))),
        }
    }

    fn requires_ack(&self) -> bool {
        true
    }
}
