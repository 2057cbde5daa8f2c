//! Dashboard store
//!
//! [`Dashboard`] is what a front end binds to. It owns an [`EventCache`],
//! the loaded sessions with their summaries, and the subscriptions that keep
//! both live. Views are plain snapshots; [`Dashboard::on_change`] says which
//! of them to re-read.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::backend::Backend;
use crate::cache::EventCache;
use crate::config::CacheConfig;
use crate::connection::{ConnectionQuality, ConnectionStatus};
use crate::error::Result;
use crate::observer::{ListenerHandle, ListenerSet};
use crate::types::{Event, EventFilter, Session, SessionFilter, SessionSummary, MAX_PAGE_SIZE};

/// Which view changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DashboardChange {
    Events,
    Sessions,
    Connection,
}

/// A session ready for display
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session: Session,
    pub summary: SessionSummary,
    pub is_active: bool,
    /// Active and blocked on a notification that requires a response
    pub awaiting_input: bool,
    pub last_event_at: Option<DateTime<Utc>>,
}

impl SessionView {
    /// Most recent sign of life
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_event_at
            .map_or(self.session.start_time, |at| at.max(self.session.start_time))
    }
}

/// Sessions sharing a project path
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectGroup {
    /// Project path, or `"(unknown)"` for sessions without one
    pub key: String,
    pub name: String,
    pub sessions: Vec<SessionView>,
}

impl ProjectGroup {
    pub fn active_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_active).count()
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.sessions.iter().map(SessionView::last_activity).max()
    }
}

const UNKNOWN_PROJECT: &str = "(unknown)";

struct DashboardState {
    cache: EventCache,
    filter: EventFilter,
    /// Bumped by every `load_events`; pages fetched for an older filter are dropped
    load_id: u64,
    next_offset: usize,
    has_more: bool,
    session_filter: SessionFilter,
    sessions: Vec<Session>,
    summaries: HashMap<String, SessionSummary>,
    latest_by_session: HashMap<String, Event>,
    handles: Vec<ListenerHandle>,
}

impl DashboardState {
    /// Track the newest event per session; returns whether that session's
    /// awaiting-input flag flipped.
    fn record_latest(&mut self, event: &Event) -> bool {
        let before = self
            .latest_by_session
            .get(&event.session_id)
            .map(Event::is_blocking_notification);
        let newer = self
            .latest_by_session
            .get(&event.session_id)
            .map_or(true, |latest| event.timestamp >= latest.timestamp);
        if !newer {
            return false;
        }
        self.latest_by_session
            .insert(event.session_id.clone(), event.clone());
        before.unwrap_or(false) != event.is_blocking_notification()
    }

    fn view(&self, session: &Session) -> SessionView {
        let latest = self.latest_by_session.get(&session.id);
        SessionView {
            session: session.clone(),
            summary: self
                .summaries
                .get(&session.id)
                .cloned()
                .unwrap_or_else(|| SessionSummary::empty(session.id.as_str())),
            is_active: session.is_active(),
            awaiting_input: session.is_active()
                && latest.is_some_and(Event::is_blocking_notification),
            last_event_at: latest.map(|e| e.timestamp),
        }
    }
}

struct DashboardInner {
    backend: Arc<dyn Backend>,
    page_size: usize,
    state: Mutex<DashboardState>,
    listeners: ListenerSet<DashboardChange>,
}

impl DashboardInner {
    fn admit_live_event(&self, event: &Event) {
        let (inserted, sessions_changed) = {
            let mut state = self.state.lock();
            let sessions_changed = state.record_latest(event);
            let inserted = state.filter.matches(event) && state.cache.insert(event.clone());
            (inserted, sessions_changed)
        };
        if inserted {
            self.listeners.notify(&DashboardChange::Events);
        }
        if sessions_changed {
            self.listeners.notify(&DashboardChange::Sessions);
        }
    }

    fn upsert_session(&self, session: &Session) {
        {
            let mut state = self.state.lock();
            match state.sessions.iter_mut().find(|s| s.id == session.id) {
                Some(existing) => *existing = session.clone(),
                None => state.sessions.push(session.clone()),
            }
            state
                .sessions
                .sort_by(|a, b| b.start_time.cmp(&a.start_time));
        }
        self.listeners.notify(&DashboardChange::Sessions);
    }
}

/// Live dashboard state over one backend
pub struct Dashboard {
    inner: Arc<DashboardInner>,
}

impl Dashboard {
    pub fn new(backend: Arc<dyn Backend>, cache: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(DashboardInner {
                backend,
                page_size: cache.page_size.clamp(1, MAX_PAGE_SIZE),
                state: Mutex::new(DashboardState {
                    cache: EventCache::new(cache.max_cached_events),
                    filter: EventFilter::default(),
                    load_id: 0,
                    next_offset: 0,
                    has_more: false,
                    session_filter: SessionFilter::default(),
                    sessions: Vec::new(),
                    summaries: HashMap::new(),
                    latest_by_session: HashMap::new(),
                    handles: Vec::new(),
                }),
                listeners: ListenerSet::new(),
            }),
        }
    }

    /// Use `filter` for the first page loaded by [`Dashboard::start`].
    pub fn with_event_filter(self, filter: EventFilter) -> Self {
        self.inner.state.lock().filter = filter;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    /// Subscribe to pushes and status, connect, then load the first event
    /// page and the sessions.
    ///
    /// A failed connection is not fatal unless it is terminal: the backend
    /// keeps retrying while the REST views load.
    pub async fn start(&self) -> Result<()> {
        self.stop_listening();
        let backend = &self.inner.backend;
        let weak: Weak<DashboardInner> = Arc::downgrade(&self.inner);

        let on_event = weak.clone();
        let events = backend.subscribe_to_events(Box::new(move |event: &Event| {
            if let Some(inner) = on_event.upgrade() {
                inner.admit_live_event(event);
            }
        }));
        let on_session = weak.clone();
        let sessions = backend.subscribe_to_sessions(Box::new(move |session: &Session| {
            if let Some(inner) = on_session.upgrade() {
                inner.upsert_session(session);
            }
        }));
        let on_status = weak;
        let status = backend.on_connection_status_change(Box::new(move |_: &ConnectionStatus| {
            if let Some(inner) = on_status.upgrade() {
                inner.listeners.notify(&DashboardChange::Connection);
            }
        }));
        self.inner
            .state
            .lock()
            .handles
            .extend([events, sessions, status]);

        if let Err(e) = backend.connect().await {
            if e.is_terminal() {
                return Err(e);
            }
            tracing::warn!(error = %e, "Live connection unavailable; will keep retrying");
        }

        let (filter, session_filter) = {
            let state = self.inner.state.lock();
            (state.filter.clone(), state.session_filter.clone())
        };
        self.load_events(filter).await?;
        self.refresh_sessions(session_filter).await
    }

    /// Drop every subscription and close the live link.
    pub fn stop(&self) {
        self.stop_listening();
        self.inner.backend.disconnect();
    }

    fn stop_listening(&self) {
        let handles = std::mem::take(&mut self.inner.state.lock().handles);
        for handle in handles {
            handle.unsubscribe();
        }
    }

    pub async fn retry(&self) -> Result<()> {
        self.inner.backend.retry().await
    }

    /// Replace the event filter and load its first page.
    pub async fn load_events(&self, filter: EventFilter) -> Result<()> {
        filter.validate()?;
        let load_id = {
            let mut state = self.inner.state.lock();
            state.load_id += 1;
            state.filter = filter;
            state.cache.reset();
            state.next_offset = 0;
            state.has_more = false;
            state.load_id
        };
        self.inner.listeners.notify(&DashboardChange::Events);
        self.fetch_page(load_id, 0).await.map(|_| ())
    }

    /// Fetch the next page of the current filter; returns how many new
    /// events were added.
    pub async fn load_more_events(&self) -> Result<usize> {
        let (load_id, offset) = {
            let state = self.inner.state.lock();
            if !state.has_more {
                return Ok(0);
            }
            (state.load_id, state.next_offset)
        };
        self.fetch_page(load_id, offset).await
    }

    async fn fetch_page(&self, load_id: u64, offset: usize) -> Result<usize> {
        let mut page_filter = self.inner.state.lock().filter.clone();
        page_filter.limit = Some(self.inner.page_size);
        page_filter.offset = Some(offset);

        let page = self.inner.backend.get_events(&page_filter).await?;
        let fetched = page.len();

        let added = {
            let mut state = self.inner.state.lock();
            if state.load_id != load_id {
                tracing::debug!("Dropping page fetched for a replaced filter");
                return Ok(0);
            }
            for event in &page {
                state.record_latest(event);
            }
            let added = state.cache.merge_page(page);
            state.next_offset = offset + fetched;
            state.has_more = fetched >= self.inner.page_size;
            added
        };
        tracing::debug!(offset, fetched, added, "Loaded event page");
        self.inner.listeners.notify(&DashboardChange::Events);
        self.inner.listeners.notify(&DashboardChange::Sessions);
        Ok(added)
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.lock().has_more
    }

    /// Load sessions for `filter` together with their summaries.
    ///
    /// A failing summary call keeps the sessions and the previous summaries.
    pub async fn refresh_sessions(&self, filter: SessionFilter) -> Result<()> {
        filter.validate()?;
        let sessions = self.inner.backend.get_sessions(&filter).await?;
        let ids: Vec<String> = sessions.iter().map(|s| s.id.clone()).collect();
        let summaries = match self.inner.backend.get_session_summaries(&ids).await {
            Ok(summaries) => Some(summaries),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load session summaries");
                None
            }
        };

        {
            let mut state = self.inner.state.lock();
            state.session_filter = filter;
            state.sessions = sessions;
            if let Some(summaries) = summaries {
                state.summaries = summaries
                    .into_iter()
                    .map(|s| (s.session_id.clone(), s))
                    .collect();
            }
        }
        self.inner.listeners.notify(&DashboardChange::Sessions);
        Ok(())
    }

    pub fn event_filter(&self) -> EventFilter {
        self.inner.state.lock().filter.clone()
    }

    /// Cached events, newest first
    pub fn events(&self) -> Vec<Event> {
        self.inner.state.lock().cache.to_vec()
    }

    /// Loaded sessions, most recently started first
    pub fn sessions(&self) -> Vec<SessionView> {
        let state = self.inner.state.lock();
        state.sessions.iter().map(|s| state.view(s)).collect()
    }

    /// Sessions grouped by project path, most recently active group first
    pub fn sessions_by_project(&self) -> Vec<ProjectGroup> {
        let mut groups: Vec<ProjectGroup> = Vec::new();
        for view in self.sessions() {
            let key = view
                .session
                .project_path
                .clone()
                .unwrap_or_else(|| UNKNOWN_PROJECT.to_string());
            match groups.iter_mut().find(|g| g.key == key) {
                Some(group) => group.sessions.push(view),
                None => {
                    let name = view
                        .session
                        .project_name()
                        .unwrap_or(UNKNOWN_PROJECT)
                        .to_string();
                    groups.push(ProjectGroup {
                        key,
                        name,
                        sessions: vec![view],
                    });
                }
            }
        }
        groups.sort_by(|a, b| b.last_activity().cmp(&a.last_activity()));
        groups
    }

    pub fn awaiting_input(&self) -> Vec<SessionView> {
        self.sessions()
            .into_iter()
            .filter(|view| view.awaiting_input)
            .collect()
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.inner.backend.connection_status()
    }

    pub fn connection_quality(&self) -> ConnectionQuality {
        self.connection().quality()
    }

    pub fn on_change(
        &self,
        listener: impl Fn(&DashboardChange) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.add(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EventCallback, SessionCallback, StatusCallback};
    use crate::connection::ConnectionState;
    use crate::summary::summarize_by_session;
    use crate::types::{BackendKind, BackendMetadata, EventType};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeBackend {
        events: Mutex<Vec<Event>>,
        sessions: Mutex<Vec<Session>>,
        event_listeners: ListenerSet<Event>,
        session_listeners: ListenerSet<Session>,
        status_listeners: ListenerSet<ConnectionStatus>,
        connects: AtomicUsize,
    }

    impl FakeBackend {
        fn push_event(&self, event: Event) {
            self.event_listeners.notify(&event);
        }

        fn push_session(&self, session: Session) {
            self.session_listeners.notify(&session);
        }
    }

    #[async_trait]
    impl Backend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn connect(&self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.status_listeners.notify(&self.connection_status());
            Ok(())
        }

        fn disconnect(&self) {}

        async fn retry(&self) -> Result<()> {
            self.connect().await
        }

        async fn get_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
            let mut events: Vec<Event> = self
                .events
                .lock()
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect();
            events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            Ok(events
                .into_iter()
                .skip(filter.offset.unwrap_or(0))
                .take(filter.limit.unwrap_or(usize::MAX))
                .collect())
        }

        async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
            Ok(self
                .sessions
                .lock()
                .iter()
                .filter(|s| !filter.active_only || s.is_active())
                .cloned()
                .collect())
        }

        fn subscribe_to_events(&self, callback: EventCallback) -> ListenerHandle {
            self.event_listeners.add(callback)
        }

        fn subscribe_to_sessions(&self, callback: SessionCallback) -> ListenerHandle {
            self.session_listeners.add(callback)
        }

        async fn get_session_summaries(
            &self,
            session_ids: &[String],
        ) -> Result<Vec<SessionSummary>> {
            Ok(summarize_by_session(session_ids, &self.events.lock()))
        }

        async fn health_check(&self) -> bool {
            true
        }

        async fn get_metadata(&self) -> Result<BackendMetadata> {
            Ok(BackendMetadata {
                kind: BackendKind::Local,
                server: "fake".to_string(),
                version: None,
                capabilities: Vec::new(),
                extra: serde_json::Value::Null,
            })
        }

        fn on_connection_status_change(&self, callback: StatusCallback) -> ListenerHandle {
            self.status_listeners.add(callback)
        }

        fn connection_status(&self) -> ConnectionStatus {
            let mut status = ConnectionStatus::disconnected();
            if self.connects.load(Ordering::SeqCst) > 0 {
                status.state = ConnectionState::Connected;
            }
            status
        }
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, minute, 0).unwrap()
    }

    fn event(id: &str, session: &str, event_type: EventType, minute: u32) -> Event {
        Event {
            id: id.to_string(),
            session_id: session.to_string(),
            event_type,
            timestamp: at(minute),
            metadata: json!({}),
            tool_name: None,
            duration_ms: None,
        }
    }

    fn session(id: &str, project: Option<&str>, minute: u32) -> Session {
        Session {
            id: id.to_string(),
            project_path: project.map(str::to_string),
            git_branch: None,
            start_time: at(minute),
            end_time: None,
            metadata: json!({}),
        }
    }

    fn dashboard(backend: &Arc<FakeBackend>, page_size: usize) -> Dashboard {
        let cache = CacheConfig {
            max_cached_events: 100,
            page_size,
        };
        Dashboard::new(Arc::clone(backend) as Arc<dyn Backend>, &cache)
    }

    #[tokio::test]
    async fn test_paging_and_dedup_across_fetch_and_push() {
        let backend = Arc::new(FakeBackend::default());
        *backend.events.lock() = (0..5)
            .map(|i| event(&format!("e{}", i), "s1", EventType::PreToolUse, i))
            .collect();
        let dash = dashboard(&backend, 2);
        dash.start().await.unwrap();

        let ids: Vec<String> = dash.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["e4", "e3"]);
        assert!(dash.has_more());

        assert_eq!(dash.load_more_events().await.unwrap(), 2);
        assert_eq!(dash.load_more_events().await.unwrap(), 1);
        assert!(!dash.has_more());
        assert_eq!(dash.load_more_events().await.unwrap(), 0);

        // A live echo of an already fetched event is ignored
        backend.push_event(event("e4", "s1", EventType::PreToolUse, 4));
        assert_eq!(dash.events().len(), 5);

        backend.push_event(event("e9", "s1", EventType::PostToolUse, 9));
        assert_eq!(dash.events()[0].id, "e9");
        assert_eq!(dash.events().len(), 6);
    }

    #[tokio::test]
    async fn test_live_events_respect_the_active_filter() {
        let backend = Arc::new(FakeBackend::default());
        let dash = dashboard(&backend, 10);
        dash.start().await.unwrap();
        dash.load_events(EventFilter {
            session_ids: vec!["s1".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();

        backend.push_event(event("other", "s2", EventType::Stop, 1));
        backend.push_event(event("mine", "s1", EventType::Stop, 2));
        let ids: Vec<String> = dash.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["mine"]);
    }

    #[tokio::test]
    async fn test_changing_filter_resets_cache() {
        let backend = Arc::new(FakeBackend::default());
        *backend.events.lock() = vec![
            event("a", "s1", EventType::Error, 1),
            event("b", "s2", EventType::Stop, 2),
        ];
        let dash = dashboard(&backend, 10);
        dash.start().await.unwrap();
        assert_eq!(dash.events().len(), 2);

        dash.load_events(EventFilter {
            event_types: vec![EventType::Error],
            ..Default::default()
        })
        .await
        .unwrap();
        let ids: Vec<String> = dash.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_initial_filter_applies_to_first_page() {
        let backend = Arc::new(FakeBackend::default());
        *backend.events.lock() = vec![
            event("a", "s1", EventType::Error, 1),
            event("b", "s2", EventType::Stop, 2),
        ];
        let dash = dashboard(&backend, 10).with_event_filter(EventFilter {
            session_ids: vec!["s2".to_string()],
            ..Default::default()
        });
        dash.start().await.unwrap();
        let ids: Vec<String> = dash.events().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b"]);
        assert_eq!(dash.event_filter().session_ids, vec!["s2".to_string()]);
    }

    #[tokio::test]
    async fn test_sessions_carry_summaries_and_awaiting_input() {
        let backend = Arc::new(FakeBackend::default());
        *backend.sessions.lock() = vec![session("s1", Some("/work/api"), 0)];
        let mut blocking = event("n1", "s1", EventType::Notification, 3);
        blocking.metadata = json!({ "requires_response": true });
        *backend.events.lock() = vec![event("e1", "s1", EventType::PreToolUse, 1), blocking];

        let dash = dashboard(&backend, 10);
        dash.start().await.unwrap();

        let views = dash.sessions();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].summary.total_events, 2);
        assert_eq!(views[0].summary.tool_usage_count, 1);
        assert!(views[0].awaiting_input);
        assert_eq!(dash.awaiting_input().len(), 1);

        // The human answered; the agent moved on
        backend.push_event(event("e2", "s1", EventType::UserPromptSubmit, 4));
        assert!(dash.awaiting_input().is_empty());
    }

    #[tokio::test]
    async fn test_ended_session_is_never_awaiting_input() {
        let backend = Arc::new(FakeBackend::default());
        let mut ended = session("s1", None, 0);
        ended.end_time = Some(at(10));
        *backend.sessions.lock() = vec![ended];
        let mut blocking = event("n1", "s1", EventType::Notification, 5);
        blocking.metadata = json!({ "requires_response": true });
        *backend.events.lock() = vec![blocking];

        let dash = dashboard(&backend, 10);
        dash.start().await.unwrap();
        assert!(!dash.sessions()[0].is_active);
        assert!(dash.awaiting_input().is_empty());
    }

    #[tokio::test]
    async fn test_grouping_by_project() {
        let backend = Arc::new(FakeBackend::default());
        *backend.sessions.lock() = vec![
            session("s3", Some("/work/web"), 30),
            session("s2", Some("/work/api"), 20),
            session("s1", Some("/work/web"), 10),
            session("s0", None, 5),
        ];
        // Old api session is the most recently active one
        *backend.events.lock() = vec![event("e1", "s2", EventType::PreToolUse, 50)];

        let dash = dashboard(&backend, 10);
        dash.start().await.unwrap();

        let groups = dash.sessions_by_project();
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        assert_eq!(keys, vec!["/work/api", "/work/web", "(unknown)"]);
        assert_eq!(groups[1].name, "web");
        assert_eq!(groups[1].sessions.len(), 2);
        assert_eq!(groups[1].active_count(), 2);
    }

    #[tokio::test]
    async fn test_session_push_upserts_and_notifies() {
        let backend = Arc::new(FakeBackend::default());
        *backend.sessions.lock() = vec![session("s1", None, 0)];
        let dash = dashboard(&backend, 10);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&changes);
        let _handle = dash.on_change(move |change| sink.lock().push(*change));
        dash.start().await.unwrap();
        assert!(changes.lock().contains(&DashboardChange::Connection));

        let mut ended = session("s1", None, 0);
        ended.end_time = Some(at(20));
        backend.push_session(ended);
        backend.push_session(session("s2", None, 30));

        let views = dash.sessions();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].session.id, "s2");
        assert!(!views[1].is_active);
        assert_eq!(changes.lock().last(), Some(&DashboardChange::Sessions));
    }

    #[tokio::test]
    async fn test_stop_unsubscribes() {
        let backend = Arc::new(FakeBackend::default());
        let dash = dashboard(&backend, 10);
        dash.start().await.unwrap();
        assert_eq!(backend.event_listeners.len(), 1);

        dash.stop();
        assert!(backend.event_listeners.is_empty());
        assert!(backend.session_listeners.is_empty());
        assert!(backend.status_listeners.is_empty());

        backend.push_event(event("late", "s1", EventType::Stop, 1));
        assert!(dash.events().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter_is_rejected_before_fetching() {
        let backend = Arc::new(FakeBackend::default());
        let dash = dashboard(&backend, 10);
        let err = dash
            .load_events(EventFilter {
                limit: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Validation(_)));
    }
}
