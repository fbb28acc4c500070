use std::sync::Arc;
use std::time::{Duration, Instant};

use http::HeaderMap;
use http::header;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use tokio::sync::RwLock;

pub mod signature;

pub const SUBJECT_ID_HEADER: &str = "x-dag-subject-id";
pub const SUBJECT_TYPE_HEADER: &str = "x-dag-subject-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectType {
    App,
    User,
    Other,
}

impl SubjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectType::App => "app",
            SubjectType::User => "user",
            SubjectType::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "app" | "application" => SubjectType::App,
            "user" => SubjectType::User,
            _ => SubjectType::Other,
        }
    }
}

/// The caller as seen by capability checks and call records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject_id: String,
    pub subject_type: SubjectType,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: Option<String>,
    pub jwks_url: Option<String>,
    pub jwks_json: Option<String>,
    pub jwks_timeout: Duration,
    pub jwks_refresh_ttl: Duration,
    pub clock_skew: Duration,
    pub subject_claim: String,
    pub subject_type_claim: String,
    pub name_claim: String,
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl AuthError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

/// Reads the development identity headers.
pub fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, AuthError> {
    let subject_id = header_text(headers, SUBJECT_ID_HEADER).ok_or_else(|| {
        AuthError::new(
            "ERR_AUTH_REQUIRED",
            format!("missing {} header", SUBJECT_ID_HEADER),
        )
    })?;
    let subject_type = header_text(headers, SUBJECT_TYPE_HEADER)
        .map(SubjectType::parse)
        .unwrap_or(SubjectType::Other);

    Ok(Principal {
        name: subject_id.to_string(),
        subject_id: subject_id.to_string(),
        subject_type,
    })
}

fn header_text<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct OidcAuthenticator {
    config: OidcConfig,
    http: reqwest::Client,
    jwks: Arc<RwLock<JwksCache>>,
}

#[derive(Debug)]
struct JwksCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

impl OidcAuthenticator {
    pub async fn new(config: OidcConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "oidc issuer must be non-empty",
            ));
        }
        if config.subject_claim.trim().is_empty() {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "oidc subject claim must be non-empty",
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(config.jwks_timeout)
            .build()
            .map_err(|_| AuthError::new("ERR_INTERNAL", "failed to initialize oidc http client"))?;

        let mut cache = JwksCache {
            jwks: None,
            fetched_at: None,
        };
        cache.refresh(&http, &config).await?;

        Ok(Self {
            config,
            http,
            jwks: Arc::new(RwLock::new(cache)),
        })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let header = decode_header(token)
            .map_err(|_| AuthError::new("ERR_AUTH_INVALID", "invalid JWT header"))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::new(
                "ERR_AUTH_INVALID",
                "unsupported JWT alg (expected RS256)",
            ));
        }
        let kid = header
            .kid
            .ok_or_else(|| AuthError::new("ERR_AUTH_INVALID", "JWT header missing kid"))?;

        let decoding_key = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(std::slice::from_ref(&self.config.issuer));
        match self.config.audience.as_ref() {
            Some(audience) => validation.set_audience(std::slice::from_ref(audience)),
            None => validation.validate_aud = false,
        }
        validation.leeway = self.config.clock_skew.as_secs();

        let claims = decode::<Value>(token, &decoding_key, &validation)
            .map_err(|_| AuthError::new("ERR_AUTH_INVALID", "JWT validation failed"))?
            .claims;

        let subject_id = claim_string(&claims, &self.config.subject_claim)?;
        let subject_type = claims
            .get(&self.config.subject_type_claim)
            .and_then(Value::as_str)
            .map(SubjectType::parse)
            .unwrap_or(SubjectType::User);
        let name = claims
            .get(&self.config.name_claim)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(subject_id.as_str())
            .to_string();

        Ok(Principal {
            subject_id,
            subject_type,
            name,
        })
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.jwks.read().await;
            if let Some(jwk) = cache.jwk_for_kid(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|_| {
                    AuthError::new("ERR_AUTH_INVALID", "failed to parse JWK decoding key")
                });
            }
        }

        let mut cache = self.jwks.write().await;
        let refresh_needed = cache
            .fetched_at
            .map(|t| t.elapsed() > self.config.jwks_refresh_ttl)
            .unwrap_or(true);
        if refresh_needed {
            cache.refresh(&self.http, &self.config).await?;
        }

        match cache.jwk_for_kid(kid) {
            Some(jwk) => DecodingKey::from_jwk(jwk).map_err(|_| {
                AuthError::new("ERR_AUTH_INVALID", "failed to parse JWK decoding key")
            }),
            None => Err(AuthError::new("ERR_AUTH_INVALID", "JWT kid not found in JWKS")),
        }
    }
}

impl JwksCache {
    fn jwk_for_kid(&self, kid: &str) -> Option<&jsonwebtoken::jwk::Jwk> {
        self.jwks.as_ref()?.find(kid)
    }

    async fn refresh(
        &mut self,
        http: &reqwest::Client,
        config: &OidcConfig,
    ) -> Result<(), AuthError> {
        let jwks = if let Some(jwks_json) = config.jwks_json.as_ref() {
            serde_json::from_str::<JwkSet>(jwks_json).map_err(|_| {
                AuthError::new(
                    "ERR_INVALID_CONFIG",
                    "DAG_OIDC_JWKS_JSON is not valid JWKS JSON",
                )
            })?
        } else if let Some(url) = config.jwks_url.as_ref() {
            http.get(url)
                .send()
                .await
                .map_err(|_| AuthError::new("ERR_AUTH_UNAVAILABLE", "failed to fetch JWKS"))?
                .error_for_status()
                .map_err(|_| {
                    AuthError::new(
                        "ERR_AUTH_UNAVAILABLE",
                        "JWKS endpoint returned non-success status",
                    )
                })?
                .json::<JwkSet>()
                .await
                .map_err(|_| AuthError::new("ERR_AUTH_UNAVAILABLE", "failed to parse JWKS JSON"))?
        } else {
            return Err(AuthError::new(
                "ERR_INVALID_CONFIG",
                "oidc requires jwks_url or jwks_json",
            ));
        };

        self.jwks = Some(jwks);
        self.fetched_at = Some(Instant::now());
        Ok(())
    }
}

/// Returns the raw token of an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError::new("ERR_AUTH_REQUIRED", "missing Authorization header"))?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .map(str::trim)
        .ok_or_else(|| {
            AuthError::new("ERR_AUTH_INVALID", "Authorization must be a Bearer token")
        })?;

    if token.is_empty() {
        return Err(AuthError::new("ERR_AUTH_INVALID", "Bearer token is empty"));
    }
    Ok(token)
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| {
            AuthError::new(
                "ERR_AUTH_INVALID",
                format!("required claim `{}` is missing or not a string", claim),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_rejects_missing_header() {
        let headers = HeaderMap::new();
        let err = bearer_token(&headers).unwrap_err();
        assert_eq!(err.code, "ERR_AUTH_REQUIRED");
    }

    #[test]
    fn bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap_err().code, "ERR_AUTH_INVALID");

        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        assert_eq!(bearer_token(&headers).unwrap(), "tok");
    }

    #[test]
    fn local_headers_resolve_principal() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            principal_from_headers(&headers).unwrap_err().code,
            "ERR_AUTH_REQUIRED"
        );

        headers.insert(SUBJECT_ID_HEADER, "app-1".parse().unwrap());
        headers.insert(SUBJECT_TYPE_HEADER, "APP".parse().unwrap());
        let principal = principal_from_headers(&headers).unwrap();
        assert_eq!(principal.subject_id, "app-1");
        assert_eq!(principal.subject_type, SubjectType::App);
    }

    #[test]
    fn claim_string_requires_non_empty_text() {
        let claims = serde_json::json!({"sub": " ", "n": 5, "ok": "x"});
        assert!(claim_string(&claims, "sub").is_err());
        assert!(claim_string(&claims, "n").is_err());
        assert_eq!(claim_string(&claims, "ok").unwrap(), "x");
    }
}
