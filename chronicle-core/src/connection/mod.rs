//! Connection management
//!
//! [`ConnectionManager`] owns one logical link to a backend and keeps it
//! alive: connect with a health probe and subscription handshake, reconnect
//! with exponential backoff, heartbeats, periodic health checks, a queue of
//! outbound messages and a debounced visible status.

mod health;
mod manager;
mod status;
mod transport;

pub use health::{HealthOutcome, HealthProbe, HealthReport};
pub use manager::{
    ConnectionManager, ManagerSettings, SubscriptionHealth, SubscriptionId,
    MISSED_HEARTBEAT_LIMIT,
};
pub use status::{
    ConnectionQuality, ConnectionState, ConnectionStatus, DebounceDecision, PendingTransition,
    StatusDebouncer,
};
pub use transport::{Connector, Link, LinkEvent, WsConnector, ABNORMAL_CLOSE, NORMAL_CLOSE};
