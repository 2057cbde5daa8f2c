//! Session summary aggregation
//!
//! Backends that expose a server-side aggregate endpoint and backends that
//! have to fall back to pulling raw events must report the same numbers for
//! the same events. Both paths funnel through [`compute_session_summary`].

use std::collections::HashMap;

use crate::types::{Event, EventType, SessionSummary};

/// Aggregate counters for the events of one session.
///
/// - `total_events`: number of events
/// - `tool_usage_count`: pre/post tool-use events
/// - `error_count`: events that [`Event::indicates_failure`]
/// - `avg_response_time`: mean duration over `post_tool_use` events that
///   carry one, `None` when there are none
pub fn compute_session_summary(session_id: &str, events: &[Event]) -> SessionSummary {
    let mut summary = SessionSummary::empty(session_id);
    let mut duration_total = 0.0;
    let mut duration_count = 0u64;

    for event in events {
        summary.total_events += 1;
        if event.is_tool_event() {
            summary.tool_usage_count += 1;
        }
        if event.indicates_failure() {
            summary.error_count += 1;
        }
        if event.event_type == EventType::PostToolUse {
            if let Some(ms) = event.response_time_ms() {
                duration_total += ms;
                duration_count += 1;
            }
        }
    }

    if duration_count > 0 {
        summary.avg_response_time = Some(duration_total / duration_count as f64);
    }
    summary
}

/// Summaries for every requested session, in request order.
///
/// Events for sessions that were not requested are ignored; requested
/// sessions with no events get an empty summary.
pub fn summarize_by_session(session_ids: &[String], events: &[Event]) -> Vec<SessionSummary> {
    let mut grouped: HashMap<&str, Vec<Event>> = HashMap::new();
    for event in events {
        grouped
            .entry(event.session_id.as_str())
            .or_default()
            .push(event.clone());
    }

    session_ids
        .iter()
        .map(|id| {
            let events = grouped.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            compute_session_summary(id, events)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(id: &str, session: &str, event_type: EventType, duration: Option<f64>) -> Event {
        Event {
            id: id.to_string(),
            session_id: session.to_string(),
            event_type,
            timestamp: Utc::now(),
            metadata: json!({}),
            tool_name: None,
            duration_ms: duration,
        }
    }

    #[test]
    fn test_empty_session() {
        let summary = compute_session_summary("s1", &[]);
        assert_eq!(summary, SessionSummary::empty("s1"));
    }

    #[test]
    fn test_counts_and_average() {
        let mut failed = event("e4", "s1", EventType::PostToolUse, Some(300.0));
        failed.metadata = json!({"success": false});

        let events = vec![
            event("e1", "s1", EventType::SessionStart, None),
            event("e2", "s1", EventType::PreToolUse, None),
            event("e3", "s1", EventType::PostToolUse, Some(100.0)),
            failed,
            event("e5", "s1", EventType::Error, None),
            // pre_tool_use durations never count toward the average
            event("e6", "s1", EventType::PreToolUse, Some(9999.0)),
        ];

        let summary = compute_session_summary("s1", &events);
        assert_eq!(summary.total_events, 6);
        assert_eq!(summary.tool_usage_count, 4);
        assert_eq!(summary.error_count, 2);
        assert_eq!(summary.avg_response_time, Some(200.0));
    }

    #[test]
    fn test_metadata_duration_counts() {
        let mut e = event("e1", "s1", EventType::PostToolUse, None);
        e.metadata = json!({"duration_ms": 50});
        let summary = compute_session_summary("s1", &[e]);
        assert_eq!(summary.avg_response_time, Some(50.0));
    }

    #[test]
    fn test_post_tool_use_without_duration_has_no_average() {
        let summary =
            compute_session_summary("s1", &[event("e1", "s1", EventType::PostToolUse, None)]);
        assert_eq!(summary.avg_response_time, None);
        assert_eq!(summary.tool_usage_count, 1);
    }

    #[test]
    fn test_summarize_by_session_keeps_request_order() {
        let events = vec![
            event("a", "s2", EventType::PostToolUse, Some(10.0)),
            event("b", "s1", EventType::Stop, None),
            event("c", "s3", EventType::Stop, None),
        ];
        let ids = vec!["s1".to_string(), "s2".to_string(), "s4".to_string()];
        let summaries = summarize_by_session(&ids, &events);

        assert_eq!(summaries.len(), 3);
        assert_eq!(summaries[0].session_id, "s1");
        assert_eq!(summaries[0].total_events, 1);
        assert_eq!(summaries[1].avg_response_time, Some(10.0));
        assert_eq!(summaries[2], SessionSummary::empty("s4"));
    }
}
