//! Core domain types for chronicle
//!
//! These types are the data exchanged with every backend: events pushed by
//! the agent hooks, the sessions they belong to, and the aggregate counters
//! the dashboard shows next to each session.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One long-lived agent-execution context, identified independently of its events |
//! | **Event** | One immutable recorded action within a session's timeline |
//! | **Awaiting input** | A session whose most recent event is a blocking notification |
//! | **Backend** | A pluggable data source satisfying [`crate::backend::Backend`] |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest page a single `get_events`/`get_sessions` call may request.
pub const MAX_PAGE_SIZE: usize = 1000;

// ============================================
// Events
// ============================================

/// Kind of agent action an event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionStart,
    PreToolUse,
    PostToolUse,
    UserPromptSubmit,
    Stop,
    SubagentStop,
    PreCompact,
    Notification,
    Error,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::SessionStart,
        EventType::PreToolUse,
        EventType::PostToolUse,
        EventType::UserPromptSubmit,
        EventType::Stop,
        EventType::SubagentStop,
        EventType::PreCompact,
        EventType::Notification,
        EventType::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SessionStart => "session_start",
            EventType::PreToolUse => "pre_tool_use",
            EventType::PostToolUse => "post_tool_use",
            EventType::UserPromptSubmit => "user_prompt_submit",
            EventType::Stop => "stop",
            EventType::SubagentStop => "subagent_stop",
            EventType::PreCompact => "pre_compact",
            EventType::Notification => "notification",
            EventType::Error => "error",
        }
    }

    /// Tool lifecycle events (counted as tool usage)
    pub fn is_tool_event(&self) -> bool {
        matches!(self, EventType::PreToolUse | EventType::PostToolUse)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event type: {}", s))
    }
}

/// An immutable fact describing one agent action.
///
/// Delivery is at-least-once: the same event may arrive from the initial
/// page fetch and again from the live stream, so consumers dedup by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque unique key
    pub id: String,
    /// Owning session
    pub session_id: String,
    pub event_type: EventType,
    /// Creation time; arrival order is not guaranteed to follow it
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl Event {
    pub fn is_tool_event(&self) -> bool {
        self.event_type.is_tool_event()
    }

    /// Error events, and any event whose metadata reports a failure.
    pub fn indicates_failure(&self) -> bool {
        if self.event_type == EventType::Error {
            return true;
        }
        if self.metadata.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return true;
        }
        match self.metadata.get("error") {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.is_empty(),
            Some(serde_json::Value::Bool(b)) => *b,
            Some(_) => true,
        }
    }

    /// Tool execution time, from the column or from the payload.
    pub fn response_time_ms(&self) -> Option<f64> {
        self.duration_ms.or_else(|| {
            self.metadata
                .get("duration_ms")
                .and_then(|v| v.as_f64())
        })
    }

    /// A notification that blocks the agent until the human responds.
    pub fn is_blocking_notification(&self) -> bool {
        self.event_type == EventType::Notification
            && self
                .metadata
                .get("requires_response")
                .and_then(|v| v.as_bool())
                .unwrap_or(false)
    }
}

// ============================================
// Sessions
// ============================================

/// One long-lived agent-execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Working directory of the agent (not guaranteed unique)
    #[serde(default)]
    pub project_path: Option<String>,
    #[serde(default)]
    pub git_branch: Option<String>,
    pub start_time: DateTime<Utc>,
    /// Set when the session terminates
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Session {
    /// A session without an end time is active, whatever else it says.
    pub fn is_active(&self) -> bool {
        self.end_time.is_none()
    }

    /// Last component of the project path, for display and grouping.
    pub fn project_name(&self) -> Option<&str> {
        let path = self.project_path.as_deref()?.trim_end_matches(['/', '\\']);
        path.rsplit(['/', '\\']).next().filter(|name| !name.is_empty())
    }
}

/// Aggregate counters for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub total_events: u64,
    pub tool_usage_count: u64,
    pub error_count: u64,
    /// Mean post-tool-use duration in milliseconds
    #[serde(default)]
    pub avg_response_time: Option<f64>,
}

impl SessionSummary {
    pub fn empty(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            total_events: 0,
            tool_usage_count: 0,
            error_count: 0,
            avg_response_time: None,
        }
    }
}

// ============================================
// Query filters
// ============================================

/// Filter for `get_events`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Only events from these sessions (empty = all)
    pub session_ids: Vec<String>,
    /// Only events of these types (empty = all)
    pub event_types: Vec<EventType>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Free-text search
    pub search: Option<String>,
}

impl EventFilter {
    pub fn validate(&self) -> Result<()> {
        validate_page(self.limit)?;
        validate_range(self.start_date, self.end_date)?;
        validate_search(self.search.as_deref())
    }

    /// Whether a live push belongs in a view built with this filter.
    ///
    /// Pagination is ignored; everything else mirrors the server-side query.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.session_ids.is_empty() && !self.session_ids.contains(&event.session_id) {
            return false;
        }
        if !self.event_types.is_empty() && !self.event_types.contains(&event.event_type) {
            return false;
        }
        if self.start_date.is_some_and(|start| event.timestamp < start) {
            return false;
        }
        if self.end_date.is_some_and(|end| event.timestamp > end) {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => {
                let query = query.to_lowercase();
                event.event_type.as_str().contains(&query)
                    || event.session_id.to_lowercase().contains(&query)
                    || event
                        .tool_name
                        .as_deref()
                        .is_some_and(|t| t.to_lowercase().contains(&query))
                    || event.metadata.to_string().to_lowercase().contains(&query)
            }
            _ => true,
        }
    }
}

/// Filter for `get_sessions`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionFilter {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub session_ids: Vec<String>,
    /// Only sessions without an end time
    pub active_only: bool,
    /// Sessions started at or after this time
    pub start_date: Option<DateTime<Utc>>,
    /// Sessions started at or before this time
    pub end_date: Option<DateTime<Utc>>,
    /// Free-text search over project path and branch
    pub search: Option<String>,
}

impl SessionFilter {
    pub fn validate(&self) -> Result<()> {
        validate_page(self.limit)?;
        validate_range(self.start_date, self.end_date)?;
        validate_search(self.search.as_deref())
    }
}

fn validate_page(limit: Option<usize>) -> Result<()> {
    match limit {
        Some(0) => Err(Error::Validation("limit must be at least 1".to_string())),
        Some(n) if n > MAX_PAGE_SIZE => Err(Error::Validation(format!(
            "limit must not exceed {}",
            MAX_PAGE_SIZE
        ))),
        _ => Ok(()),
    }
}

fn validate_range(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Result<()> {
    match (start, end) {
        (Some(start), Some(end)) if start > end => Err(Error::Validation(
            "start_date must not be after end_date".to_string(),
        )),
        _ => Ok(()),
    }
}

fn validate_search(search: Option<&str>) -> Result<()> {
    match search {
        Some(s) if s.trim().is_empty() => {
            Err(Error::Validation("search must not be blank".to_string()))
        }
        _ => Ok(()),
    }
}

// ============================================
// Backends
// ============================================

/// Which backend implementation serves the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hosted REST + realtime channels
    Cloud,
    /// Local server with REST + WebSocket
    #[default]
    Local,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Cloud => "cloud",
            BackendKind::Local => "local",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cloud" | "supabase" => Ok(BackendKind::Cloud),
            "local" => Ok(BackendKind::Local),
            _ => Err(format!("unknown backend: {}", s)),
        }
    }
}

/// Descriptive information about a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendMetadata {
    pub kind: BackendKind,
    /// Base URL the backend was reached at
    pub server: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Anything else the server reported
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(event_type: EventType, metadata: serde_json::Value) -> Event {
        Event {
            id: "e1".to_string(),
            session_id: "s1".to_string(),
            event_type,
            timestamp: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap(),
            metadata,
            tool_name: Some("Bash".to_string()),
            duration_ms: None,
        }
    }

    #[test]
    fn test_event_type_round_trip_names() {
        for t in EventType::ALL {
            assert_eq!(t.as_str().parse::<EventType>().unwrap(), t);
        }
        assert!("tool_call".parse::<EventType>().is_err());
    }

    #[test]
    fn test_event_deserializes_from_wire_shape() {
        let raw = json!({
            "id": "evt-1",
            "session_id": "sess-1",
            "event_type": "post_tool_use",
            "timestamp": "2025-03-01T12:00:00Z",
            "metadata": {"success": true},
            "tool_name": "Read",
            "duration_ms": 120
        });
        let event: Event = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, EventType::PostToolUse);
        assert_eq!(event.duration_ms, Some(120.0));
        assert!(!event.indicates_failure());
    }

    #[test]
    fn test_failure_detection() {
        assert!(event(EventType::Error, json!({})).indicates_failure());
        assert!(event(EventType::PostToolUse, json!({"success": false})).indicates_failure());
        assert!(event(EventType::PostToolUse, json!({"error": "boom"})).indicates_failure());
        assert!(!event(EventType::PostToolUse, json!({"error": null})).indicates_failure());
        assert!(!event(EventType::PostToolUse, json!({"error": ""})).indicates_failure());
        assert!(!event(EventType::PreToolUse, json!({})).indicates_failure());
    }

    #[test]
    fn test_response_time_falls_back_to_metadata() {
        let mut e = event(EventType::PostToolUse, json!({"duration_ms": 42}));
        assert_eq!(e.response_time_ms(), Some(42.0));
        e.duration_ms = Some(7.0);
        assert_eq!(e.response_time_ms(), Some(7.0));
    }

    #[test]
    fn test_blocking_notification() {
        assert!(event(EventType::Notification, json!({"requires_response": true}))
            .is_blocking_notification());
        assert!(!event(EventType::Notification, json!({"message": "fyi"}))
            .is_blocking_notification());
        assert!(!event(EventType::Stop, json!({"requires_response": true}))
            .is_blocking_notification());
    }

    #[test]
    fn test_session_without_end_time_is_active() {
        let session = Session {
            id: "s1".to_string(),
            project_path: Some("/home/dev/projects/chronicle/".to_string()),
            git_branch: None,
            start_time: Utc::now(),
            end_time: None,
            metadata: json!({"status": "completed"}),
        };
        assert!(session.is_active());
        assert_eq!(session.project_name(), Some("chronicle"));
    }

    #[test]
    fn test_filter_validation() {
        assert!(EventFilter::default().validate().is_ok());
        let bad_limit = EventFilter {
            limit: Some(0),
            ..Default::default()
        };
        assert!(matches!(bad_limit.validate(), Err(Error::Validation(_))));

        let now = Utc::now();
        let inverted = SessionFilter {
            start_date: Some(now),
            end_date: Some(now - chrono::Duration::hours(1)),
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let blank = EventFilter {
            search: Some("   ".to_string()),
            ..Default::default()
        };
        assert!(blank.validate().is_err());
    }

    #[test]
    fn test_filter_matches_live_push() {
        let e = event(EventType::PostToolUse, json!({"command": "cargo fmt"}));
        let filter = EventFilter {
            session_ids: vec!["s1".to_string()],
            event_types: vec![EventType::PostToolUse],
            search: Some("FMT".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&e));

        let other_session = EventFilter {
            session_ids: vec!["s2".to_string()],
            ..Default::default()
        };
        assert!(!other_session.matches(&e));

        let later = EventFilter {
            start_date: Some(e.timestamp + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!later.matches(&e));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("cloud".parse::<BackendKind>().unwrap(), BackendKind::Cloud);
        assert_eq!("supabase".parse::<BackendKind>().unwrap(), BackendKind::Cloud);
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("remote".parse::<BackendKind>().is_err());
    }
}
