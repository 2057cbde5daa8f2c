//! Local Chronicle server: REST under `/api` plus a WebSocket at `/ws`

use std::sync::Arc;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header::HeaderMap;
use serde::Serialize;

use super::http::{unwrap_listing, RestClient};
use super::{
    order_summaries, subscribe_events, subscribe_sessions, summaries_from_events, Backend,
    EventCallback, SessionCallback, StatusCallback,
};
use crate::config::{ConnectionConfig, LocalConfig};
use crate::connection::{
    ConnectionManager, ConnectionStatus, Connector, HealthOutcome, HealthProbe, ManagerSettings,
    WsConnector,
};
use crate::error::{Error, Result};
use crate::observer::ListenerHandle;
use crate::protocol::LocalProtocol;
use crate::types::{
    BackendKind, BackendMetadata, Event, EventFilter, Session, SessionFilter, SessionSummary,
};

pub struct LocalBackend {
    rest: RestClient,
    manager: ConnectionManager,
}

impl LocalBackend {
    pub fn new(config: &LocalConfig, connection: &ConnectionConfig) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(connection.request_timeout()));
        Self::with_connector(config, connection, connector)
    }

    /// Same as [`LocalBackend::new`] with a caller-supplied socket connector
    pub fn with_connector(
        config: &LocalConfig,
        connection: &ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let rest = RestClient::new(
            &config.server_url,
            HeaderMap::new(),
            connection.request_timeout(),
        )?;
        let socket = socket_url(&config.server_url)?;
        let probe = Arc::new(LocalHealthProbe { rest: rest.clone() });

        let manager = ConnectionManager::new(
            socket,
            ManagerSettings::from_config(connection),
            connector,
            Arc::new(LocalProtocol::new()),
            probe,
        );
        Ok(Self { rest, manager })
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

/// `GET /health`
struct LocalHealthProbe {
    rest: RestClient,
}

#[async_trait]
impl HealthProbe for LocalHealthProbe {
    async fn probe(&self) -> HealthOutcome {
        self.rest.probe("/health", &[]).await
    }
}

/// `http://host:port/...` -> `ws://host:port/ws`
pub(crate) fn socket_url(server_url: &str) -> Result<String> {
    let mut url = url::Url::parse(server_url)
        .map_err(|e| Error::Config(format!("invalid server URL {}: {}", server_url, e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::Config(format!(
                "unsupported server URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot derive socket URL from {}", server_url)))?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url.to_string())
}

fn timestamp_param(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn event_query(filter: &EventFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(limit) = filter.limit {
        query.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = filter.offset {
        query.push(("offset".to_string(), offset.to_string()));
    }
    if !filter.session_ids.is_empty() {
        query.push(("session_ids".to_string(), filter.session_ids.join(",")));
    }
    if !filter.event_types.is_empty() {
        let types: Vec<&str> = filter.event_types.iter().map(|t| t.as_str()).collect();
        query.push(("event_types".to_string(), types.join(",")));
    }
    if let Some(start) = filter.start_date {
        query.push(("start_date".to_string(), timestamp_param(start)));
    }
    if let Some(end) = filter.end_date {
        query.push(("end_date".to_string(), timestamp_param(end)));
    }
    if let Some(search) = &filter.search {
        query.push(("search".to_string(), search.trim().to_string()));
    }
    query
}

fn session_query(filter: &SessionFilter) -> Vec<(String, String)> {
    let mut query = Vec::new();
    if let Some(limit) = filter.limit {
        query.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = filter.offset {
        query.push(("offset".to_string(), offset.to_string()));
    }
    if !filter.session_ids.is_empty() {
        query.push(("session_ids".to_string(), filter.session_ids.join(",")));
    }
    if filter.active_only {
        query.push(("active_only".to_string(), "true".to_string()));
    }
    if let Some(start) = filter.start_date {
        query.push(("start_date".to_string(), timestamp_param(start)));
    }
    if let Some(end) = filter.end_date {
        query.push(("end_date".to_string(), timestamp_param(end)));
    }
    if let Some(search) = &filter.search {
        query.push(("search".to_string(), search.trim().to_string()));
    }
    query
}

#[derive(Serialize)]
struct SummariesRequest<'a> {
    session_ids: &'a [String],
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    fn disconnect(&self) {
        self.manager.disconnect();
    }

    async fn retry(&self) -> Result<()> {
        self.manager.retry().await
    }

    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        filter.validate()?;
        let body: serde_json::Value = self.rest.get_json("/api/events", &event_query(filter)).await?;
        unwrap_listing(body, &["events", "data"])
    }

    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        filter.validate()?;
        let body: serde_json::Value = self
            .rest
            .get_json("/api/sessions", &session_query(filter))
            .await?;
        unwrap_listing(body, &["sessions", "data"])
    }

    fn subscribe_to_events(&self, callback: EventCallback) -> ListenerHandle {
        subscribe_events(&self.manager, callback)
    }

    fn subscribe_to_sessions(&self, callback: SessionCallback) -> ListenerHandle {
        subscribe_sessions(&self.manager, callback)
    }

    async fn get_session_summaries(&self, session_ids: &[String]) -> Result<Vec<SessionSummary>> {
        if session_ids.is_empty() {
            return Ok(Vec::new());
        }

        let request = SummariesRequest { session_ids };
        match self
            .rest
            .post_json::<_, serde_json::Value>("/api/sessions/summaries", &request)
            .await
        {
            Ok(body) => {
                let found = unwrap_listing(body, &["summaries", "data"])?;
                Ok(order_summaries(session_ids, found))
            }
            Err(e) if e.status() == Some(404) => {
                tracing::debug!("Summary endpoint missing; aggregating client-side");
                summaries_from_events(self, session_ids).await
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> bool {
        self.manager.check_health().await
    }

    async fn get_metadata(&self) -> Result<BackendMetadata> {
        let body: serde_json::Value = match self.rest.get_json("/api/metadata", &[]).await {
            Ok(body) => body,
            Err(e) if e.status() == Some(404) => serde_json::Value::Null,
            Err(e) => return Err(e),
        };

        let version = body
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let capabilities = body
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| vec!["rest".to_string(), "websocket".to_string()]);

        Ok(BackendMetadata {
            kind: BackendKind::Local,
            server: self.rest.base_url().to_string(),
            version,
            capabilities,
            extra: body,
        })
    }

    fn on_connection_status_change(&self, callback: StatusCallback) -> ListenerHandle {
        self.manager.on_status_change(callback)
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.manager.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("http://localhost:8510").unwrap(),
            "ws://localhost:8510/ws"
        );
        assert_eq!(
            socket_url("https://chronicle.example.com/api/").unwrap(),
            "wss://chronicle.example.com/ws"
        );
        assert!(socket_url("ftp://example.com").is_err());
    }

    #[test]
    fn test_event_query_parameters() {
        let filter = EventFilter {
            limit: Some(50),
            offset: Some(100),
            session_ids: vec!["s1".into(), "s2".into()],
            event_types: vec![EventType::PreToolUse, EventType::Error],
            start_date: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            end_date: None,
            search: Some("  grep ".into()),
        };
        let query = event_query(&filter);
        let get = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("limit"), Some("50"));
        assert_eq!(get("offset"), Some("100"));
        assert_eq!(get("session_ids"), Some("s1,s2"));
        assert_eq!(get("event_types"), Some("pre_tool_use,error"));
        assert_eq!(get("start_date"), Some("2025-01-01T00:00:00.000Z"));
        assert_eq!(get("end_date"), None);
        assert_eq!(get("search"), Some("grep"));
    }

    #[test]
    fn test_session_query_active_only() {
        let query = session_query(&SessionFilter {
            active_only: true,
            ..Default::default()
        });
        assert_eq!(query, vec![("active_only".to_string(), "true".to_string())]);
    }
}
