//! HTTP plumbing shared by both backends

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::connection::HealthOutcome;
use crate::error::{Error, Result};

/// Thin JSON client over a base URL.
///
/// Every failure is classified when it happens: timeouts, unreachable
/// hosts, rejected credentials, rejected input and other HTTP statuses map
/// onto distinct [`Error`] variants.
#[derive(Debug, Clone)]
pub struct RestClient {
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RestClient {
    pub fn new(base_url: &str, mut headers: HeaderMap, timeout: Duration) -> Result<Self> {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> Result<T> {
        let response = self
            .http_client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        self.read_json(response).await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let response = self
            .http_client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        self.read_json(response).await
    }

    /// Issue a GET and classify the outcome for health monitoring.
    pub async fn probe(&self, path: &str, query: &[(String, String)]) -> HealthOutcome {
        let result = self
            .http_client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(|e| self.classify(e));

        let outcome = match result {
            Ok(response) => match check_status(response).await {
                Ok(_) => HealthOutcome::Healthy,
                Err(e) => HealthOutcome::from_error(&e),
            },
            Err(e) => HealthOutcome::from_error(&e),
        };
        if !outcome.is_healthy() {
            tracing::debug!(path, outcome = ?outcome, "Health probe failed");
        }
        outcome
    }

    async fn read_json<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = check_status(response).await?;
        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::protocol(format!("failed to parse response: {}", e)))
    }

    fn classify(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.timeout)
        } else if err.is_connect() || err.is_request() {
            Error::unreachable(format!("HTTP request failed: {}", err))
        } else if err.is_decode() || err.is_body() {
            Error::protocol(format!("failed to read response: {}", err))
        } else {
            Error::unreachable(format!("HTTP request failed: {}", err))
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Err(status_error(status.as_u16(), &error_text))
}

fn status_error(status: u16, body: &str) -> Error {
    match status {
        401 | 403 => Error::Authentication(format!("API error ({}): {}", status, body)),
        400 | 422 => Error::Validation(format!("API error ({}): {}", status, body)),
        _ => Error::connection(
            crate::error::ConnectionFailure::Status(status),
            format!("API error ({}): {}", status, body),
        ),
    }
}

/// Accept a listing either as a bare array or wrapped under one of `keys`.
pub(crate) fn unwrap_listing<T: DeserializeOwned>(
    value: serde_json::Value,
    keys: &[&str],
) -> Result<Vec<T>> {
    let items = match value {
        serde_json::Value::Array(_) => value,
        serde_json::Value::Object(mut map) => keys
            .iter()
            .find_map(|key| map.remove(*key))
            .ok_or_else(|| Error::protocol(format!("response has none of {:?}", keys)))?,
        other => {
            return Err(Error::protocol(format!(
                "expected a list, got {}",
                json_kind(&other)
            )))
        }
    };
    serde_json::from_value(items).map_err(|e| Error::protocol(format!("malformed listing: {}", e)))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
