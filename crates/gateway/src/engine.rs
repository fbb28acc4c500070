use std::time::{Duration, Instant};

use dag_contracts::canonical::scalar_to_string;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;

use crate::filter::ColumnKind;
use crate::upstream::{http_client, join_url};

const FETCH_PATH: &str = "/api/data-connection/v1/gateway/fetch";

#[derive(Serialize)]
struct FetchRequest<'a> {
    sql: &'a str,
    #[serde(rename = "type")]
    kind: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineColumn {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
}

/// A successful engine response. Number tokens are kept as sent.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchResult {
    #[serde(default)]
    pub columns: Vec<EngineColumn>,
    #[serde(default)]
    pub data: Vec<Vec<Value>>,
    #[serde(default)]
    pub total_count: Option<Value>,
}

impl FetchResult {
    pub fn typed_columns(&self) -> Vec<(String, ColumnKind)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), ColumnKind::from_engine_type(&c.type_name)))
            .collect()
    }

    /// Pivots rows into objects keyed by column name.
    pub fn into_objects(self) -> Vec<serde_json::Map<String, Value>> {
        let names: Vec<String> = self.columns.into_iter().map(|c| c.name).collect();
        self.data
            .into_iter()
            .map(|row| names.iter().cloned().zip(row).collect())
            .collect()
    }
}

#[derive(Debug, Default, Deserialize)]
struct EngineErrorBody {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    description: Value,
    #[serde(default)]
    detail: Value,
    #[serde(default)]
    solution: Value,
}

impl EngineErrorBody {
    /// The most actionable text the engine offered.
    fn message(&self) -> String {
        [&self.solution, &self.detail, &self.description, &self.code]
            .into_iter()
            .map(render)
            .find(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "engine query failed".to_string())
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Array(_) | Value::Object(_) => value.to_string(),
        other => scalar_to_string(other),
    }
}

#[derive(Debug)]
pub enum EngineError {
    Timeout,
    Http(reqwest::Error),
    /// The engine rejected the query; carries its message.
    Query(String),
    InvalidResponse(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Timeout => write!(f, "engine request timed out"),
            EngineError::Http(err) => write!(f, "engine HTTP error: {}", err),
            EngineError::Query(message) => write!(f, "{}", message),
            EngineError::InvalidResponse(detail) => {
                write!(f, "engine returned an invalid response: {}", detail)
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<reqwest::Error> for EngineError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            EngineError::Timeout
        } else {
            EngineError::Http(value)
        }
    }
}

impl EngineError {
    fn outcome(&self) -> &'static str {
        match self {
            EngineError::Timeout => "timeout",
            EngineError::Http(_) => "error",
            EngineError::Query(_) => "query_error",
            EngineError::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Client of the virtual query engine.
#[derive(Clone)]
pub struct EngineClient {
    base_url: String,
    http: reqwest::Client,
}

impl EngineClient {
    pub fn new(base_url: String, default_timeout: Duration, tls_verify: bool) -> Result<Self, EngineError> {
        let http = http_client(default_timeout, tls_verify).map_err(EngineError::Http)?;
        Ok(Self { base_url, http })
    }

    pub async fn fetch(
        &self,
        sql: &str,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<FetchResult, EngineError> {
        let span = tracing::info_span!(
            "engine.fetch",
            count = false,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        self.observed(self.post(sql, bearer, timeout))
            .instrument(span)
            .await
    }

    /// Runs a counting query and returns its first cell.
    pub async fn fetch_count(
        &self,
        sql: &str,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<i64, EngineError> {
        let span = tracing::info_span!(
            "engine.fetch",
            count = true,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let result = self
            .observed(self.post(sql, bearer, timeout))
            .instrument(span)
            .await?;

        let cell = result
            .data
            .first()
            .and_then(|row| row.first())
            .ok_or_else(|| EngineError::InvalidResponse("count query returned no rows".to_string()))?;
        scalar_to_string(cell)
            .trim()
            .parse::<i64>()
            .map_err(|_| EngineError::InvalidResponse("count is not an integer".to_string()))
    }

    async fn observed<F>(&self, call: F) -> Result<FetchResult, EngineError>
    where
        F: std::future::Future<Output = Result<FetchResult, EngineError>>,
    {
        let started = Instant::now();
        let result = call.await;

        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::Span::current().record("latency_ms", latency_ms);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.outcome(),
        };
        tracing::Span::current().record("outcome", outcome);
        crate::metrics::observe_upstream_call("engine", outcome);
        result
    }

    async fn post(
        &self,
        sql: &str,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<FetchResult, EngineError> {
        let mut request = self
            .http
            .post(join_url(&self.base_url, FETCH_PATH))
            .timeout(timeout)
            .json(&FetchRequest { sql, kind: 0 });
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if status != reqwest::StatusCode::OK {
            let decoded = serde_json::from_slice::<EngineErrorBody>(&body).unwrap_or_default();
            let message = decoded.message();
            tracing::warn!(status = status.as_u16(), error = %message, "engine rejected query");
            return Err(EngineError::Query(message));
        }

        serde_json::from_slice::<FetchResult>(&body)
            .map_err(|err| EngineError::InvalidResponse(err.to_string()))
    }
}
