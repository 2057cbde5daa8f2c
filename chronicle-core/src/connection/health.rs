//! Health probes
//!
//! A probe is a lightweight round-trip to the backend. Its outcome is
//! classified structurally by the transport layer that produced it: a
//! transient query error keeps the connection state, an unreachable or
//! rejecting backend does not.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ConnectionFailure, Error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// The backend answered but the probe query failed
    Transient(String),
    /// The backend could not be reached
    Unreachable(String),
    /// The backend rejected our credentials
    Rejected(String),
}

impl HealthOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthOutcome::Healthy)
    }

    /// Failures that should take a connected link down
    pub fn is_persistent_failure(&self) -> bool {
        matches!(
            self,
            HealthOutcome::Unreachable(_) | HealthOutcome::Rejected(_)
        )
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            HealthOutcome::Healthy => None,
            HealthOutcome::Transient(msg)
            | HealthOutcome::Unreachable(msg)
            | HealthOutcome::Rejected(msg) => Some(msg),
        }
    }

    /// Classify a request error produced while probing
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Authentication(msg) => HealthOutcome::Rejected(msg.clone()),
            Error::Timeout(after) => {
                HealthOutcome::Unreachable(format!("health probe timed out after {:?}", after))
            }
            Error::Connection {
                kind: ConnectionFailure::Unreachable | ConnectionFailure::Closed,
                message,
            } => HealthOutcome::Unreachable(message.clone()),
            other => HealthOutcome::Transient(other.to_string()),
        }
    }
}

/// Result of the most recent probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub outcome: HealthOutcome,
    pub checked_at: DateTime<Utc>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> HealthOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        assert_eq!(
            HealthOutcome::from_error(&Error::unreachable("connection refused")),
            HealthOutcome::Unreachable("connection refused".to_string())
        );
        assert!(matches!(
            HealthOutcome::from_error(&Error::Timeout(Duration::from_secs(5))),
            HealthOutcome::Unreachable(_)
        ));
        assert!(matches!(
            HealthOutcome::from_error(&Error::Authentication("bad key".into())),
            HealthOutcome::Rejected(_)
        ));
        assert!(matches!(
            HealthOutcome::from_error(&Error::connection(ConnectionFailure::Status(500), "boom")),
            HealthOutcome::Transient(_)
        ));
    }

    #[test]
    fn test_persistence() {
        assert!(HealthOutcome::Unreachable(String::new()).is_persistent_failure());
        assert!(HealthOutcome::Rejected(String::new()).is_persistent_failure());
        assert!(!HealthOutcome::Transient(String::new()).is_persistent_failure());
        assert!(!HealthOutcome::Healthy.is_persistent_failure());
    }
}
