//! Backend abstraction
//!
//! A [`Backend`] is a pluggable data source: request/response queries for
//! events, sessions and summaries, plus live pushes delivered through a
//! [`ConnectionManager`]. The dashboard store only ever holds an
//! `Arc<dyn Backend>`; [`create_backend`] picks the implementation from
//! configuration.

mod cloud;
mod http;
mod local;

pub use cloud::CloudBackend;
pub use http::RestClient;
pub use local::LocalBackend;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::Result;
use crate::observer::ListenerHandle;
use crate::protocol::{Push, Topic};
use crate::summary::compute_session_summary;
use crate::types::{
    BackendKind, BackendMetadata, Event, EventFilter, Session, SessionFilter, SessionSummary,
    MAX_PAGE_SIZE,
};

pub type EventCallback = Box<dyn Fn(&Event) + Send + Sync>;
pub type SessionCallback = Box<dyn Fn(&Session) + Send + Sync>;
pub type StatusCallback = Box<dyn Fn(&ConnectionStatus) + Send + Sync>;

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Establish the live link. Idempotent; concurrent callers share one
    /// attempt.
    async fn connect(&self) -> Result<()>;

    fn disconnect(&self);

    /// Manual recovery after reconnection gave up
    async fn retry(&self) -> Result<()>;

    /// Newest first
    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;

    /// Newest first
    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>>;

    fn subscribe_to_events(&self, callback: EventCallback) -> ListenerHandle;

    fn subscribe_to_sessions(&self, callback: SessionCallback) -> ListenerHandle;

    /// One summary per requested id, in request order
    async fn get_session_summaries(&self, session_ids: &[String])
        -> Result<Vec<SessionSummary>>;

    /// Never fails; unreachable and erroring backends report `false`
    async fn health_check(&self) -> bool;

    async fn get_metadata(&self) -> Result<BackendMetadata>;

    fn on_connection_status_change(&self, callback: StatusCallback) -> ListenerHandle;

    fn connection_status(&self) -> ConnectionStatus;
}

/// Build the backend selected by `config.backend.mode`.
pub fn create_backend(config: &Config) -> Result<Arc<dyn Backend>> {
    tracing::info!(mode = %config.backend.mode, "Creating backend");
    let backend: Arc<dyn Backend> = match config.backend.mode {
        BackendKind::Local => Arc::new(LocalBackend::new(&config.local, &config.connection)?),
        BackendKind::Cloud => Arc::new(CloudBackend::new(&config.cloud, &config.connection)?),
    };
    Ok(backend)
}

fn subscribe_events(manager: &ConnectionManager, callback: EventCallback) -> ListenerHandle {
    let (_, handle) = manager.subscribe(Topic::Events, move |push| {
        if let Push::Event(event) = push {
            callback(event);
        }
    });
    handle
}

fn subscribe_sessions(manager: &ConnectionManager, callback: SessionCallback) -> ListenerHandle {
    let (_, handle) = manager.subscribe(Topic::Sessions, move |push| {
        if let Push::Session(session) = push {
            callback(session);
        }
    });
    handle
}

/// Client-side aggregation used when a backend has no summary endpoint.
///
/// Pulls every event of each session page by page and feeds them to the
/// same pure function the server-side path is held to.
async fn summaries_from_events<B: Backend + ?Sized>(
    backend: &B,
    session_ids: &[String],
) -> Result<Vec<SessionSummary>> {
    let mut summaries = Vec::with_capacity(session_ids.len());
    for session_id in session_ids {
        let events = all_session_events(session_id, |filter| async move {
            backend.get_events(&filter).await
        })
        .await?;
        summaries.push(compute_session_summary(session_id, &events));
    }
    Ok(summaries)
}

/// Page through one session's events until a short page or a page that
/// brings nothing new. The second stop covers servers that ignore `offset`.
async fn all_session_events<F, Fut>(session_id: &str, mut fetch: F) -> Result<Vec<Event>>
where
    F: FnMut(EventFilter) -> Fut,
    Fut: Future<Output = Result<Vec<Event>>>,
{
    let mut events = Vec::new();
    let mut seen = HashSet::new();
    let mut fetched = 0;
    loop {
        let filter = EventFilter {
            session_ids: vec![session_id.to_string()],
            limit: Some(MAX_PAGE_SIZE),
            offset: Some(fetched),
            ..Default::default()
        };
        let page = fetch(filter).await?;
        let short = page.len() < MAX_PAGE_SIZE;
        fetched += page.len();

        let before = events.len();
        events.extend(page.into_iter().filter(|e| seen.insert(e.id.clone())));
        if short {
            break;
        }
        if events.len() == before {
            tracing::warn!(
                session_id,
                offset = fetched,
                "Event page repeated earlier rows; stopping pagination"
            );
            break;
        }
    }
    Ok(events)
}

/// Put server summaries in request order, filling gaps with empty ones.
fn order_summaries(session_ids: &[String], mut found: Vec<SessionSummary>) -> Vec<SessionSummary> {
    session_ids
        .iter()
        .map(|id| match found.iter().position(|s| &s.session_id == id) {
            Some(index) => found.swap_remove(index),
            None => SessionSummary::empty(id.as_str()),
        })
        .collect()
}
