use std::time::Duration;

use serde::Deserialize;

use crate::upstream::{UpstreamError, http_client, join_url};

const USING_PATH: &str = "/api/configuration-center/v1/data/using";
const APPS_PATH: &str = "/api/configuration-center/v1/apps";

/// `using == 1` selects signature authorisation.
const USING_SIGNATURE: i64 = 1;

#[derive(Deserialize)]
struct UsingResponse {
    #[serde(default)]
    using: i64,
}

/// An application as registered with the configuration centre.
#[derive(Debug, Clone, Deserialize)]
pub struct AppRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Clone)]
pub struct ConfigCenterClient {
    base_url: String,
    http: reqwest::Client,
}

impl ConfigCenterClient {
    pub fn new(
        base_url: String,
        timeout: Duration,
        tls_verify: bool,
    ) -> Result<Self, UpstreamError> {
        let http = http_client(timeout, tls_verify).map_err(UpstreamError::Http)?;
        Ok(Self { base_url, http })
    }

    pub async fn signature_mode_enabled(&self) -> Result<bool, UpstreamError> {
        let resp = self.http.get(join_url(&self.base_url, USING_PATH)).send().await?;
        if !resp.status().is_success() {
            return Err(UpstreamError::BadStatus(resp.status()));
        }
        let decoded = resp
            .json::<UsingResponse>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)?;
        Ok(decoded.using == USING_SIGNATURE)
    }

    pub async fn app(&self, app_id: &str) -> Result<AppRecord, UpstreamError> {
        let url = join_url(&self.base_url, &format!("{}/{}", APPS_PATH, app_id));
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .inspect_err(|_| crate::metrics::observe_upstream_call("config_center", "error"))?;

        if !resp.status().is_success() {
            crate::metrics::observe_upstream_call("config_center", "bad_status");
            return Err(UpstreamError::BadStatus(resp.status()));
        }

        let app = resp
            .json::<AppRecord>()
            .await
            .map_err(|_| UpstreamError::InvalidResponse)?;
        crate::metrics::observe_upstream_call("config_center", "ok");
        Ok(app)
    }
}
