use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::upstream::{UpstreamError, http_client, join_url};

pub const ACTION_READ: &str = "read";
pub const OBJECT_API: &str = "api";
pub const OBJECT_SUB_SERVICE: &str = "sub_service";

const ENFORCE_PATH: &str = "/api/auth-service/v1/enforce";
const SUBJECT_OBJECTS_PATH: &str = "/api/auth-service/v1/subject/objects";

/// One permission question: may `subject` perform `action` on the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforceQuery {
    pub action: String,
    pub object_id: String,
    pub object_type: String,
    pub subject_id: String,
    pub subject_type: String,
}

impl EnforceQuery {
    pub fn read_api(subject_id: &str, subject_type: &str, service_id: &str) -> Self {
        Self {
            action: ACTION_READ.to_string(),
            object_id: service_id.to_string(),
            object_type: OBJECT_API.to_string(),
            subject_id: subject_id.to_string(),
            subject_type: subject_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubjectObject {
    pub object_id: String,
    #[serde(default)]
    pub permissions: Vec<Grant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Grant {
    pub action: String,
    pub effect: String,
}

impl SubjectObject {
    pub fn allows(&self, action: &str) -> bool {
        self.permissions
            .iter()
            .any(|g| g.action == action && g.effect.eq_ignore_ascii_case("allow"))
    }
}

#[derive(Deserialize)]
struct SubjectObjectsResponse {
    #[serde(default)]
    entries: Vec<SubjectObject>,
}

/// Client of the external permission service.
#[derive(Clone)]
pub struct PermissionClient {
    base_url: String,
    http: reqwest::Client,
}

impl PermissionClient {
    pub fn new(
        base_url: String,
        timeout: Duration,
        tls_verify: bool,
    ) -> Result<Self, UpstreamError> {
        let http = http_client(timeout, tls_verify).map_err(UpstreamError::Http)?;
        Ok(Self { base_url, http })
    }

    /// Asks every query at once; the answers come back in query order.
    pub async fn enforce(&self, queries: &[EnforceQuery]) -> Result<Vec<bool>, UpstreamError> {
        let span = tracing::info_span!(
            "authz.enforce",
            queries = queries.len(),
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();
            let result = self.post_enforce(queries).await;

            let latency_ms = started.elapsed().as_millis() as u64;
            tracing::Span::current().record("latency_ms", latency_ms);
            let outcome = match &result {
                Ok(answers) if answers.iter().all(|allowed| *allowed) => "allow",
                Ok(_) => "deny",
                Err(err) => err.outcome(),
            };
            tracing::Span::current().record("outcome", outcome);
            crate::metrics::observe_upstream_call("permission", outcome);
            result
        }
        .instrument(span)
        .await
    }

    async fn post_enforce(&self, queries: &[EnforceQuery]) -> Result<Vec<bool>, UpstreamError> {
        let resp = self
            .http
            .post(join_url(&self.base_url, ENFORCE_PATH))
            .json(queries)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(UpstreamError::BadStatus(resp.status()));
        }

        let answers = resp
            .json::<Vec<bool>>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)?;
        if answers.len() != queries.len() {
            return Err(UpstreamError::InvalidResponse);
        }
        Ok(answers)
    }

    /// Objects of `object_type` the subject holds any grant on.
    pub async fn subject_objects(
        &self,
        subject_id: &str,
        subject_type: &str,
        object_type: &str,
    ) -> Result<Vec<SubjectObject>, UpstreamError> {
        let resp = self
            .http
            .get(join_url(&self.base_url, SUBJECT_OBJECTS_PATH))
            .query(&[
                ("subject_id", subject_id),
                ("subject_type", subject_type),
                ("object_type", object_type),
            ])
            .send()
            .await
            .inspect_err(|_| crate::metrics::observe_upstream_call("permission", "error"))?;

        if !resp.status().is_success() {
            crate::metrics::observe_upstream_call("permission", "bad_status");
            return Err(UpstreamError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<SubjectObjectsResponse>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)?;
        crate::metrics::observe_upstream_call("permission", "ok");
        Ok(decoded.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforce_query_serializes_wire_fields() {
        let query = EnforceQuery::read_api("app-1", "app", "svc-9");
        let json = serde_json::to_value(&query).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "action": "read",
                "object_id": "svc-9",
                "object_type": "api",
                "subject_id": "app-1",
                "subject_type": "app",
            })
        );
    }

    #[test]
    fn subject_object_allows_only_allow_effects() {
        let object: SubjectObject = serde_json::from_value(serde_json::json!({
            "object_id": "sub-1",
            "permissions": [
                {"action": "read", "effect": "deny"},
                {"action": "write", "effect": "allow"},
            ],
        }))
        .expect("deserialize");
        assert!(!object.allows("read"));
        assert!(object.allows("write"));
    }
}
