//! Connection status, quality and the visible-status debouncer

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Display-only: a reconnect attempt in progress
    Retrying,
    /// Terminal until the next scheduled attempt or a manual retry
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Retrying => "retrying",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freshness of the live stream, from recency of the last push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Last push under 10 seconds ago
    Excellent,
    /// Under 30 seconds
    Good,
    /// Under 2 minutes
    Poor,
    /// Older, or nothing received yet
    Unknown,
}

impl ConnectionQuality {
    pub fn from_last_event(last_event_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(last) = last_event_at else {
            return ConnectionQuality::Unknown;
        };

        let elapsed = now.signed_duration_since(last).num_milliseconds();
        if elapsed < 10_000 {
            ConnectionQuality::Excellent
        } else if elapsed < 30_000 {
            ConnectionQuality::Good
        } else if elapsed < 120_000 {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Unknown => "unknown",
        }
    }
}

/// Point-in-time snapshot handed to status listeners
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// Actual state of the state machine
    pub state: ConnectionState,
    /// Debounced state a front end should show
    pub display_state: ConnectionState,
    pub is_healthy: bool,
    pub subscription_count: usize,
    pub reconnect_attempts: u32,
    pub missed_heartbeats: u32,
    /// Outbound messages waiting for a connection
    pub pending_messages: usize,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            display_state: ConnectionState::Disconnected,
            is_healthy: false,
            subscription_count: 0,
            reconnect_attempts: 0,
            missed_heartbeats: 0,
            pending_messages: 0,
            last_event_at: None,
            last_health_check: None,
            error: None,
        }
    }

    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality::from_last_event(self.last_event_at, Utc::now())
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// A visible transition waiting for its window to pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingTransition {
    pub target: ConnectionState,
    pub due: Instant,
}

/// What the owner of the debouncer should do after an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceDecision {
    /// The visible state changed now
    Show(ConnectionState),
    /// Arm the timer; call [`StatusDebouncer::fire`] after this delay
    Defer(Duration),
    /// A pending transition was cancelled; disarm the timer
    Collapse,
    /// Nothing to do
    Unchanged,
}

/// Guards the visible status against flicker.
///
/// - `connecting`/`retrying` become visible only after `connecting_delay`
/// - `connected -> disconnected` becomes visible only after `debounce`
/// - returning to the visible state inside the window cancels the change
/// - everything else is shown at once
#[derive(Debug)]
pub struct StatusDebouncer {
    visible: ConnectionState,
    pending: Option<PendingTransition>,
    debounce: Duration,
    connecting_delay: Duration,
}

impl StatusDebouncer {
    pub fn new(debounce: Duration, connecting_delay: Duration) -> Self {
        Self {
            visible: ConnectionState::Disconnected,
            pending: None,
            debounce,
            connecting_delay,
        }
    }

    pub fn visible(&self) -> ConnectionState {
        self.visible
    }

    pub fn pending(&self) -> Option<PendingTransition> {
        self.pending
    }

    pub fn observe(&mut self, state: ConnectionState, now: Instant) -> DebounceDecision {
        if state == self.visible {
            return if self.pending.take().is_some() {
                DebounceDecision::Collapse
            } else {
                DebounceDecision::Unchanged
            };
        }

        let window = match state {
            ConnectionState::Connecting | ConnectionState::Retrying => Some(self.connecting_delay),
            ConnectionState::Disconnected if self.visible == ConnectionState::Connected => {
                Some(self.debounce)
            }
            _ => None,
        };

        match window {
            Some(window) if !window.is_zero() => self.defer(state, window, now),
            _ => self.force(state),
        }
    }

    fn defer(&mut self, target: ConnectionState, window: Duration, now: Instant) -> DebounceDecision {
        if let Some(pending) = self.pending {
            if pending.target == target {
                return DebounceDecision::Unchanged;
            }
        }
        self.pending = Some(PendingTransition {
            target,
            due: now + window,
        });
        DebounceDecision::Defer(window)
    }

    /// Show `state` immediately, dropping any pending transition.
    pub fn force(&mut self, state: ConnectionState) -> DebounceDecision {
        self.pending = None;
        if self.visible == state {
            return DebounceDecision::Unchanged;
        }
        self.visible = state;
        DebounceDecision::Show(state)
    }

    /// Apply the pending transition if its window has passed.
    pub fn fire(&mut self, now: Instant) -> Option<ConnectionState> {
        match self.pending {
            Some(pending) if pending.due <= now => {
                self.pending = None;
                self.visible = pending.target;
                Some(pending.target)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn debouncer() -> StatusDebouncer {
        StatusDebouncer::new(Duration::from_millis(300), Duration::from_millis(500))
    }

    #[test]
    fn test_quality_thresholds() {
        let now = Utc::now();
        let ago = |secs: i64| Some(now - chrono::Duration::seconds(secs));

        assert_eq!(ConnectionQuality::from_last_event(ago(2), now), ConnectionQuality::Excellent);
        assert_eq!(ConnectionQuality::from_last_event(ago(15), now), ConnectionQuality::Good);
        assert_eq!(ConnectionQuality::from_last_event(ago(90), now), ConnectionQuality::Poor);
        assert_eq!(ConnectionQuality::from_last_event(ago(600), now), ConnectionQuality::Unknown);
        assert_eq!(ConnectionQuality::from_last_event(None, now), ConnectionQuality::Unknown);
    }

    #[test]
    fn test_brief_connecting_is_never_shown() {
        let mut d = debouncer();
        let t0 = Instant::now();

        assert_eq!(
            d.observe(ConnectionState::Connecting, t0),
            DebounceDecision::Defer(Duration::from_millis(500))
        );
        assert_eq!(
            d.observe(ConnectionState::Connected, t0 + Duration::from_millis(100)),
            DebounceDecision::Show(ConnectionState::Connected)
        );
        assert_eq!(d.fire(t0 + Duration::from_secs(1)), None);
        assert_eq!(d.visible(), ConnectionState::Connected);
    }

    #[test]
    fn test_persistent_connecting_is_shown_after_delay() {
        let mut d = debouncer();
        let t0 = Instant::now();

        d.observe(ConnectionState::Connecting, t0);
        assert_eq!(d.fire(t0 + Duration::from_millis(499)), None);
        assert_eq!(
            d.fire(t0 + Duration::from_millis(500)),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(d.visible(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connected_blip_collapses() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.force(ConnectionState::Connected);

        assert_eq!(
            d.observe(ConnectionState::Disconnected, t0),
            DebounceDecision::Defer(Duration::from_millis(300))
        );
        assert_eq!(
            d.observe(ConnectionState::Connected, t0 + Duration::from_millis(50)),
            DebounceDecision::Collapse
        );
        assert_eq!(d.pending(), None);
        assert_eq!(d.fire(t0 + Duration::from_secs(1)), None);
        assert_eq!(d.visible(), ConnectionState::Connected);
    }

    #[test]
    fn test_repeated_observation_does_not_extend_window() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.force(ConnectionState::Connected);

        d.observe(ConnectionState::Disconnected, t0);
        assert_eq!(
            d.observe(ConnectionState::Disconnected, t0 + Duration::from_millis(200)),
            DebounceDecision::Unchanged
        );
        assert_eq!(
            d.fire(t0 + Duration::from_millis(300)),
            Some(ConnectionState::Disconnected)
        );
    }

    #[test]
    fn test_error_is_shown_immediately() {
        let mut d = debouncer();
        let t0 = Instant::now();
        d.force(ConnectionState::Connected);
        d.observe(ConnectionState::Disconnected, t0);

        assert_eq!(
            d.observe(ConnectionState::Error, t0),
            DebounceDecision::Show(ConnectionState::Error)
        );
        assert_eq!(d.pending(), None);
    }

    #[test]
    fn test_zero_windows_disable_debounce() {
        let mut d = StatusDebouncer::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(
            d.observe(ConnectionState::Connecting, Instant::now()),
            DebounceDecision::Show(ConnectionState::Connecting)
        );
    }
}
