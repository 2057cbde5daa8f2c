//! Wire protocols spoken over a [`Link`](crate::connection::Link)
//!
//! The connection manager is protocol-agnostic: it asks a [`WireProtocol`]
//! for the frames to write and for the meaning of each frame it reads.
//!
//! - [`LocalProtocol`]: `{type, data, id?, error?}` frames of the local server
//! - [`RealtimeProtocol`]: Phoenix channel frames of the cloud realtime service

mod local;
mod realtime;

pub use local::LocalProtocol;
pub use realtime::RealtimeProtocol;

use crate::error::Result;
use crate::types::{Event, Session};

/// Push stream a subscription listens to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Events,
    Sessions,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Events => "events",
            Topic::Sessions => "sessions",
        }
    }
}

/// A record pushed by the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Push {
    Event(Event),
    Session(Session),
}

impl Push {
    pub fn topic(&self) -> Topic {
        match self {
            Push::Event(_) => Topic::Events,
            Push::Session(_) => Topic::Sessions,
        }
    }
}

/// Meaning of one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Push(Push),
    /// Reply to our heartbeat (or a server ping)
    Heartbeat,
    /// The server confirmed a subscription
    Ack(Topic),
    /// The server reported a non-fatal error
    ServerError(String),
    /// The channel itself failed; the link must be re-established
    ChannelError(String),
    /// Valid frame with nothing for us
    Ignored,
}

pub trait WireProtocol: Send + Sync {
    /// Frame that subscribes to `topic`
    fn subscribe_frame(&self, topic: Topic) -> String;

    /// Frame that unsubscribes from `topic`
    fn unsubscribe_frame(&self, topic: Topic) -> String;

    fn heartbeat_frame(&self) -> String;

    /// Wrap an application message for sending
    fn encode(&self, message: &serde_json::Value) -> String;

    /// Interpret a text frame; unparseable or unknown frames are errors
    fn decode(&self, text: &str) -> Result<Inbound>;

    /// Whether subscriptions count only once the server acknowledges them
    fn requires_ack(&self) -> bool {
        false
    }
}
