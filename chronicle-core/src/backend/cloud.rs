//! Hosted backend-as-a-service (Supabase-compatible)
//!
//! Queries go through the PostgREST interface at `/rest/v1`, live changes
//! arrive over Phoenix realtime channels at `/realtime/v1/websocket`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::json;

use super::http::{unwrap_listing, RestClient};
use super::{
    order_summaries, subscribe_events, subscribe_sessions, summaries_from_events, Backend,
    EventCallback, SessionCallback, StatusCallback,
};
use crate::config::{CloudConfig, ConnectionConfig};
use crate::connection::{
    ConnectionManager, ConnectionStatus, Connector, HealthOutcome, HealthProbe, ManagerSettings,
    WsConnector,
};
use crate::error::{Error, Result};
use crate::observer::ListenerHandle;
use crate::protocol::RealtimeProtocol;
use crate::types::{
    BackendKind, BackendMetadata, Event, EventFilter, Session, SessionFilter, SessionSummary,
};

const REALTIME_VSN: &str = "1.0.0";

pub struct CloudBackend {
    rest: RestClient,
    manager: ConnectionManager,
    config: CloudConfig,
}

impl CloudBackend {
    pub fn new(config: &CloudConfig, connection: &ConnectionConfig) -> Result<Self> {
        let connector = Arc::new(WsConnector::new(connection.request_timeout()));
        Self::with_connector(config, connection, connector)
    }

    /// Same as [`CloudBackend::new`] with a caller-supplied socket connector
    pub fn with_connector(
        config: &CloudConfig,
        connection: &ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let project_url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Config("cloud.url is required".to_string()))?;
        let anon_key = config
            .anon_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("cloud.anon_key is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            "apikey",
            HeaderValue::from_str(anon_key)
                .map_err(|e| Error::Config(format!("invalid anon_key: {}", e)))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", anon_key))
                .map_err(|e| Error::Config(format!("invalid anon_key: {}", e)))?,
        );

        let rest = RestClient::new(project_url, headers, connection.request_timeout())?;
        let probe = Arc::new(CloudHealthProbe {
            rest: rest.clone(),
            path: table_path(&config.sessions_table),
        });
        let protocol = Arc::new(RealtimeProtocol::new(
            config.schema.clone(),
            config.events_table.clone(),
            config.sessions_table.clone(),
        ));

        let manager = ConnectionManager::new(
            realtime_url(project_url, anon_key)?,
            ManagerSettings::from_config(connection),
            connector,
            protocol,
            probe,
        );

        Ok(Self {
            rest,
            manager,
            config: config.clone(),
        })
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

/// `GET /rest/v1/{sessions}?select=id&limit=1`
struct CloudHealthProbe {
    rest: RestClient,
    path: String,
}

#[async_trait]
impl HealthProbe for CloudHealthProbe {
    async fn probe(&self) -> HealthOutcome {
        let query = vec![
            ("select".to_string(), "id".to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        self.rest.probe(&self.path, &query).await
    }
}

fn table_path(table: &str) -> String {
    format!("/rest/v1/{}", table)
}

/// `https://ref.supabase.co` -> `wss://ref.supabase.co/realtime/v1/websocket?apikey=..&vsn=1.0.0`
pub(crate) fn realtime_url(project_url: &str, anon_key: &str) -> Result<String> {
    let mut url = url::Url::parse(project_url)
        .map_err(|e| Error::Config(format!("invalid cloud URL {}: {}", project_url, e)))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(Error::Config(format!(
                "unsupported cloud URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Config(format!("cannot derive realtime URL from {}", project_url)))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", REALTIME_VSN);
    Ok(url.to_string())
}

fn timestamp_param(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Characters that would break out of a PostgREST filter expression
fn sanitize_search(search: &str) -> String {
    search
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '(' | ')' | '*' | '"' | '\\'))
        .collect()
}

fn in_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    format!("in.({})", values.collect::<Vec<_>>().join(","))
}

fn event_query(filter: &EventFilter) -> Vec<(String, String)> {
    let mut query = vec![
        ("select".to_string(), "*".to_string()),
        ("order".to_string(), "timestamp.desc".to_string()),
    ];
    if let Some(limit) = filter.limit {
        query.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = filter.offset {
        query.push(("offset".to_string(), offset.to_string()));
    }
    if !filter.session_ids.is_empty() {
        query.push((
            "session_id".to_string(),
            in_list(filter.session_ids.iter().map(String::as_str)),
        ));
    }
    if !filter.event_types.is_empty() {
        query.push((
            "event_type".to_string(),
            in_list(filter.event_types.iter().map(|t| t.as_str())),
        ));
    }
    if let Some(start) = filter.start_date {
        query.push(("timestamp".to_string(), format!("gte.{}", timestamp_param(start))));
    }
    if let Some(end) = filter.end_date {
        query.push(("timestamp".to_string(), format!("lte.{}", timestamp_param(end))));
    }
    if let Some(search) = filter.search.as_deref().map(sanitize_search) {
        if !search.is_empty() {
            query.push((
                "or".to_string(),
                format!(
                    "(event_type.ilike.*{q}*,tool_name.ilike.*{q}*,session_id.ilike.*{q}*)",
                    q = search
                ),
            ));
        }
    }
    query
}

fn session_query(filter: &SessionFilter) -> Vec<(String, String)> {
    let mut query = vec![
        ("select".to_string(), "*".to_string()),
        ("order".to_string(), "start_time.desc".to_string()),
    ];
    if let Some(limit) = filter.limit {
        query.push(("limit".to_string(), limit.to_string()));
    }
    if let Some(offset) = filter.offset {
        query.push(("offset".to_string(), offset.to_string()));
    }
    if !filter.session_ids.is_empty() {
        query.push((
            "id".to_string(),
            in_list(filter.session_ids.iter().map(String::as_str)),
        ));
    }
    if filter.active_only {
        query.push(("end_time".to_string(), "is.null".to_string()));
    }
    if let Some(start) = filter.start_date {
        query.push(("start_time".to_string(), format!("gte.{}", timestamp_param(start))));
    }
    if let Some(end) = filter.end_date {
        query.push(("start_time".to_string(), format!("lte.{}", timestamp_param(end))));
    }
    if let Some(search) = filter.search.as_deref().map(sanitize_search) {
        if !search.is_empty() {
            query.push((
                "or".to_string(),
                format!(
                    "(project_path.ilike.*{q}*,git_branch.ilike.*{q}*)",
                    q = search
                ),
            ));
        }
    }
    query
}

#[derive(Serialize)]
struct SummariesRequest<'a> {
    session_ids: &'a [String],
}

#[async_trait]
impl Backend for CloudBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
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
        let body: serde_json::Value = self
            .rest
            .get_json(&table_path(&self.config.events_table), &event_query(filter))
            .await?;
        unwrap_listing(body, &[])
    }

    async fn get_sessions(&self, filter: &SessionFilter) -> Result<Vec<Session>> {
        filter.validate()?;
        let body: serde_json::Value = self
            .rest
            .get_json(&table_path(&self.config.sessions_table), &session_query(filter))
            .await?;
        unwrap_listing(body, &[])
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
            .post_json::<_, Vec<SessionSummary>>("/rest/v1/rpc/get_session_summaries", &request)
            .await
        {
            Ok(found) => Ok(order_summaries(session_ids, found)),
            Err(e) if e.status() == Some(404) => {
                tracing::debug!("get_session_summaries function missing; aggregating client-side");
                summaries_from_events(self, session_ids).await
            }
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> bool {
        self.manager.check_health().await
    }

    async fn get_metadata(&self) -> Result<BackendMetadata> {
        Ok(BackendMetadata {
            kind: BackendKind::Cloud,
            server: self.rest.base_url().to_string(),
            version: None,
            capabilities: vec![
                "rest".to_string(),
                "realtime".to_string(),
                "session_summaries_rpc".to_string(),
            ],
            extra: json!({
                "schema": self.config.schema,
                "events_table": self.config.events_table,
                "sessions_table": self.config.sessions_table,
            }),
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
    use chrono::TimeZone;

    fn values<'a>(query: &'a [(String, String)], key: &str) -> Vec<&'a str> {
        query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn test_realtime_url() {
        assert_eq!(
            realtime_url("https://abcd.supabase.co", "anon").unwrap(),
            "wss://abcd.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
        assert!(realtime_url("ftp://abcd", "anon").is_err());
    }

    #[test]
    fn test_event_query_operators() {
        let filter = EventFilter {
            limit: Some(25),
            session_ids: vec!["s1".into(), "s2".into()],
            event_types: vec![EventType::Notification],
            start_date: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            end_date: Some(Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap()),
            search: Some("Bash".into()),
            ..Default::default()
        };
        let query = event_query(&filter);
        assert_eq!(values(&query, "order"), vec!["timestamp.desc"]);
        assert_eq!(values(&query, "limit"), vec!["25"]);
        assert_eq!(values(&query, "session_id"), vec!["in.(s1,s2)"]);
        assert_eq!(values(&query, "event_type"), vec!["in.(notification)"]);
        assert_eq!(
            values(&query, "timestamp"),
            vec!["gte.2025-01-01T00:00:00.000Z", "lte.2025-01-02T00:00:00.000Z"]
        );
        assert_eq!(
            values(&query, "or"),
            vec!["(event_type.ilike.*Bash*,tool_name.ilike.*Bash*,session_id.ilike.*Bash*)"]
        );
    }

    #[test]
    fn test_session_query_active_and_search() {
        let query = session_query(&SessionFilter {
            active_only: true,
            search: Some("main),(x".into()),
            ..Default::default()
        });
        assert_eq!(values(&query, "end_time"), vec!["is.null"]);
        assert_eq!(
            values(&query, "or"),
            vec!["(project_path.ilike.*mainx*,git_branch.ilike.*mainx*)"]
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config = CloudConfig {
            url: Some("https://abcd.supabase.co".into()),
            ..Default::default()
        };
        assert!(CloudBackend::new(&config, &ConnectionConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_metadata_is_built_locally() {
        let config = CloudConfig {
            url: Some("https://abcd.supabase.co".into()),
            anon_key: Some("anon".into()),
            ..Default::default()
        };
        let backend = CloudBackend::new(&config, &ConnectionConfig::default()).unwrap();
        let metadata = backend.get_metadata().await.unwrap();
        assert_eq!(metadata.kind, BackendKind::Cloud);
        assert_eq!(metadata.server, "https://abcd.supabase.co");
        assert_eq!(metadata.extra["events_table"], "chronicle_events");
    }
}
