use std::time::{Duration, Instant};

use axum::body::Body;
use dag_contracts::{ParamMap, Position, Service};
use http::header;
use serde_json::{Map, Value};
use tracing::Instrument;

use crate::upstream::http_client;

/// Request headers never copied to a backend.
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "content-type",
    "accept-encoding",
];

#[derive(Debug)]
pub enum ProxyError {
    Timeout,
    Http(reqwest::Error),
    InvalidTarget(String),
    BadStatus(reqwest::StatusCode),
    UnsupportedContentType(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::Timeout => write!(f, "backend request timed out"),
            ProxyError::Http(err) => write!(f, "backend HTTP error: {}", err),
            ProxyError::InvalidTarget(reason) => write!(f, "invalid backend target: {}", reason),
            ProxyError::BadStatus(status) => write!(f, "backend returned status {}", status),
            ProxyError::UnsupportedContentType(content_type) => {
                write!(f, "backend returned content type {}", content_type)
            }
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<reqwest::Error> for ProxyError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ProxyError::Timeout
        } else {
            ProxyError::Http(value)
        }
    }
}

impl ProxyError {
    fn outcome(&self) -> &'static str {
        match self {
            ProxyError::Timeout => "timeout",
            ProxyError::Http(_) | ProxyError::InvalidTarget(_) => "error",
            ProxyError::BadStatus(_) => "bad_status",
            ProxyError::UnsupportedContentType(_) => "unsupported_content_type",
        }
    }
}

/// Forwards register-type services to their backend.
#[derive(Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
}

impl ProxyClient {
    pub fn new(default_timeout: Duration, tls_verify: bool) -> Result<Self, ProxyError> {
        let http = http_client(default_timeout, tls_verify).map_err(ProxyError::Http)?;
        Ok(Self { http })
    }

    /// Sends the call and returns the backend response once its status and
    /// media type are acceptable. The body is left unread for streaming.
    pub async fn forward(
        &self,
        service: &Service,
        params: &ParamMap,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let span = tracing::info_span!(
            "proxy.forward",
            method = %service.http_method.to_ascii_uppercase(),
            backend_host = %service.backend_host,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let result = self.send(service, params, timeout).await;

            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            let outcome = match &result {
                Ok(_) => "ok",
                Err(err) => err.outcome(),
            };
            tracing::Span::current().record("outcome", outcome);
            crate::metrics::observe_upstream_call("backend", outcome);
            result
        }
        .instrument(span)
        .await
    }

    async fn send(
        &self,
        service: &Service,
        params: &ParamMap,
        timeout: Duration,
    ) -> Result<reqwest::Response, ProxyError> {
        let method = reqwest::Method::from_bytes(service.http_method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ProxyError::InvalidTarget(format!("method {}", service.http_method)))?;
        let url = format!("{}{}", service.backend_host.trim(), service.backend_path.trim());
        let url = reqwest::Url::parse(&url).map_err(|err| ProxyError::InvalidTarget(err.to_string()))?;

        let parts = partition(params);
        let mut request = self.http.request(method, url).timeout(timeout);
        for (name, value) in &parts.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !parts.query.is_empty() {
            request = request.query(&parts.query);
        }
        if !parts.body.is_empty() {
            request = request.json(&parts.body);
        }

        let resp = request.send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(ProxyError::BadStatus(resp.status()));
        }

        let content_type = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default();
        if !is_json_media_type(&content_type) {
            return Err(ProxyError::UnsupportedContentType(content_type));
        }
        Ok(resp)
    }
}

/// Streams a checked backend response to the caller.
pub fn into_body(resp: reqwest::Response) -> Body {
    Body::from_stream(resp.bytes_stream())
}

#[derive(Debug, Default)]
struct Parts {
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Map<String, Value>,
}

/// Splits the parameter map back into the request positions it came from.
fn partition(params: &ParamMap) -> Parts {
    let mut parts = Parts::default();
    for (name, param) in params {
        match param.position {
            Position::Header => {
                if SKIPPED_HEADERS.contains(&name.as_str()) {
                    continue;
                }
                parts.headers.push((name.clone(), param.text()));
            }
            Position::Query | Position::Path => parts.query.push((name.clone(), param.text())),
            Position::Body => {
                parts.body.insert(name.clone(), param.value.clone());
            }
        }
    }
    parts
}

/// Empty is accepted; parameters such as charset are ignored.
pub fn is_json_media_type(content_type: &str) -> bool {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    media_type.is_empty() || media_type.eq_ignore_ascii_case("application/json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dag_contracts::Param;
    use serde_json::json;

    #[test]
    fn media_type_check_ignores_parameters() {
        assert!(is_json_media_type(""));
        assert!(is_json_media_type("application/json"));
        assert!(is_json_media_type("Application/JSON; charset=utf-8"));
        assert!(!is_json_media_type("text/html"));
        assert!(!is_json_media_type("application/json-patch+json"));
    }

    #[test]
    fn params_return_to_their_positions() {
        let mut params = ParamMap::new();
        params.insert("x-trace".to_string(), Param::new(json!("t1"), Position::Header));
        params.insert("accept-encoding".to_string(), Param::new(json!("gzip"), Position::Header));
        params.insert("host".to_string(), Param::new(json!("gw"), Position::Header));
        params.insert("page".to_string(), Param::new(json!("2"), Position::Query));
        params.insert("filter".to_string(), Param::new(json!({"a": 1}), Position::Body));

        let parts = partition(&params);
        assert_eq!(parts.headers, vec![("x-trace".to_string(), "t1".to_string())]);
        assert_eq!(parts.query, vec![("page".to_string(), "2".to_string())]);
        assert_eq!(Value::Object(parts.body), json!({"filter": {"a": 1}}));
    }
}
