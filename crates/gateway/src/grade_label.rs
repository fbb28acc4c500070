use std::collections::BTreeSet;
use std::time::Duration;

use dag_contracts::{ParamType, ServiceParam};
use serde::{Deserialize, Serialize};

use crate::upstream::{UpstreamError, http_client, join_url};

const PROTECTION_PATH: &str = "/api/grade-label/v1/data-protection/query";

#[derive(Serialize)]
struct ProtectionRequest<'a> {
    data_view_id: &'a str,
    fields: Vec<&'a str>,
}

#[derive(Deserialize)]
struct ProtectionResponse {
    #[serde(default)]
    protected_fields: Vec<String>,
}

/// Asks which fields of a data view are graded as protected. Protected
/// response fields are projected as a mask instead of their value.
#[derive(Clone)]
pub struct GradeLabelClient {
    base_url: String,
    http: reqwest::Client,
}

impl GradeLabelClient {
    pub fn new(
        base_url: String,
        timeout: Duration,
        tls_verify: bool,
    ) -> Result<Self, UpstreamError> {
        let http = http_client(timeout, tls_verify).map_err(UpstreamError::Http)?;
        Ok(Self { base_url, http })
    }

    pub async fn protected_fields(
        &self,
        data_view_id: &str,
        fields: Vec<&str>,
    ) -> Result<BTreeSet<String>, UpstreamError> {
        let resp = self
            .http
            .post(join_url(&self.base_url, PROTECTION_PATH))
            .json(&ProtectionRequest {
                data_view_id,
                fields,
            })
            .send()
            .await
            .inspect_err(|_| crate::metrics::observe_upstream_call("grade_label", "error"))?;

        if !resp.status().is_success() {
            crate::metrics::observe_upstream_call("grade_label", "bad_status");
            return Err(UpstreamError::BadStatus(resp.status()));
        }

        let decoded = resp
            .json::<ProtectionResponse>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)?;
        crate::metrics::observe_upstream_call("grade_label", "ok");
        Ok(decoded.protected_fields.into_iter().collect())
    }

    /// Copies `params` with the protection flag set on protected response
    /// fields.
    pub async fn enrich(
        &self,
        data_view_id: &str,
        params: &[ServiceParam],
    ) -> Result<Vec<ServiceParam>, UpstreamError> {
        let fields: Vec<&str> = params
            .iter()
            .filter(|p| p.param_type == ParamType::Response)
            .map(|p| p.en_name.as_str())
            .collect();
        if fields.is_empty() {
            return Ok(params.to_vec());
        }

        let protected = self.protected_fields(data_view_id, fields).await?;
        Ok(mark_protected(params, &protected))
    }
}

pub fn mark_protected(params: &[ServiceParam], protected: &BTreeSet<String>) -> Vec<ServiceParam> {
    params
        .iter()
        .cloned()
        .map(|mut p| {
            if p.param_type == ParamType::Response && protected.contains(&p.en_name) {
                p.data_protection_query = true;
            }
            p
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dag_contracts::{DataType, SortOrder};

    fn param(name: &str, param_type: ParamType) -> ServiceParam {
        ServiceParam {
            param_type,
            en_name: name.to_string(),
            cn_name: String::new(),
            data_type: DataType::String,
            required: false,
            default_value: None,
            operator: None,
            sort: SortOrder::Unsorted,
            masking: None,
            sequence: 0,
            data_protection_query: false,
        }
    }

    #[test]
    fn only_response_params_are_marked() {
        let params = vec![
            param("id_card", ParamType::Response),
            param("name", ParamType::Response),
            param("id_card", ParamType::Request),
        ];
        let protected = BTreeSet::from(["id_card".to_string()]);

        let marked = mark_protected(&params, &protected);
        assert!(marked[0].data_protection_query);
        assert!(!marked[1].data_protection_query);
        assert!(!marked[2].data_protection_query);
    }
}
