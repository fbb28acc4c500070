//! Per-request authorisation. One implementation is chosen at startup:
//! capability checks against the permission service, or the timestamp and
//! nonce signature protocol keyed by the service's application secret.

use std::collections::BTreeSet;

use async_trait::async_trait;
use dag_auth::signature::SignedHeaders;
use dag_auth::{Principal, SubjectType};
use dag_contracts::{ErrorCode, Service, SubService};
use dag_sql::safety::join_row_filters;
use http::HeaderMap;

use crate::config_center::ConfigCenterClient;
use crate::permission::{ACTION_READ, EnforceQuery, OBJECT_SUB_SERVICE, PermissionClient};
use crate::rate_limit::{NonceGuard, RateLimiter};
use crate::upstream::UpstreamError;

pub struct AuthzContext<'a> {
    pub service: &'a Service,
    pub sub_services: &'a [SubService],
    pub headers: &'a HeaderMap,
    pub principal: Option<&'a Principal>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    /// Recorded as both user identification and app id.
    pub subject_id: String,
    /// OR-joined sub-service clauses the subject may read.
    pub row_filter: Option<String>,
    /// Headers echoed to the caller in signature mode.
    pub response_headers: Option<SignedHeaders>,
}

#[derive(Debug)]
pub enum AuthzError {
    Unauthenticated(String),
    Denied(String),
    Signature(String),
    RateLimited,
    Upstream(UpstreamError),
}

impl std::fmt::Display for AuthzError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthzError::Unauthenticated(reason) => write!(f, "unauthenticated: {}", reason),
            AuthzError::Denied(reason) => write!(f, "denied: {}", reason),
            AuthzError::Signature(field) => write!(f, "signature rejected: {}", field),
            AuthzError::RateLimited => write!(f, "rate limit exceeded"),
            AuthzError::Upstream(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for AuthzError {}

impl From<UpstreamError> for AuthzError {
    fn from(value: UpstreamError) -> Self {
        AuthzError::Upstream(value)
    }
}

impl AuthzError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthzError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            AuthzError::Denied(_) => ErrorCode::ServiceApplyNotPass,
            AuthzError::Signature(_) => ErrorCode::ServiceApplyNotPassCssjj,
            AuthzError::RateLimited => ErrorCode::RateLimitError,
            AuthzError::Upstream(_) => ErrorCode::UpstreamUnavailable,
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            AuthzError::Unauthenticated(reason)
            | AuthzError::Denied(reason)
            | AuthzError::Signature(reason) => Some(reason.clone()),
            AuthzError::RateLimited => None,
            AuthzError::Upstream(err) => Some(err.to_string()),
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    fn mode(&self) -> &'static str;

    /// Whether a caller principal must be resolved before `authorize`.
    fn requires_principal(&self) -> bool;

    /// Whether dispatches in this mode produce call records.
    fn records_calls(&self) -> bool;

    async fn authorize(&self, ctx: &AuthzContext<'_>) -> Result<Authorization, AuthzError>;
}

/// Applies an optional per-service limit keyed by `subject:service`.
fn check_rate_limit(
    limiter: Option<&RateLimiter>,
    subject_id: &str,
    service: &Service,
) -> Result<(), AuthzError> {
    let Some(limiter) = limiter else {
        return Ok(());
    };
    if service.rate_limit_per_second == 0 {
        return Ok(());
    }
    if limiter.allow_call(subject_id, &service.service_id, service.rate_limit_per_second) {
        Ok(())
    } else {
        Err(AuthzError::RateLimited)
    }
}

pub struct CapabilityAuthorizer {
    permission: PermissionClient,
    rate_limiter: Option<RateLimiter>,
}

impl CapabilityAuthorizer {
    pub fn new(permission: PermissionClient, rate_limiter: Option<RateLimiter>) -> Self {
        Self {
            permission,
            rate_limiter,
        }
    }

    async fn row_filter(
        &self,
        principal: &Principal,
        sub_services: &[SubService],
    ) -> Result<Option<String>, AuthzError> {
        if sub_services.is_empty() {
            return Ok(None);
        }

        let readable: BTreeSet<String> = self
            .permission
            .subject_objects(
                &principal.subject_id,
                principal.subject_type.as_str(),
                OBJECT_SUB_SERVICE,
            )
            .await?
            .into_iter()
            .filter(|object| object.allows(ACTION_READ))
            .map(|object| object.object_id)
            .collect();

        let clauses = sub_services
            .iter()
            .filter(|sub| readable.contains(&sub.sub_service_id))
            .map(|sub| sub.row_filter_clause.as_str())
            .filter(|clause| !clause.trim().is_empty());

        let (joined, rejected) = join_row_filters(clauses);
        for (clause, err) in rejected {
            tracing::warn!(clause = %clause, error = %err, "skipping sub-service row filter");
        }
        Ok(joined)
    }
}

#[async_trait]
impl Authorizer for CapabilityAuthorizer {
    fn mode(&self) -> &'static str {
        "capability"
    }

    fn requires_principal(&self) -> bool {
        true
    }

    fn records_calls(&self) -> bool {
        true
    }

    async fn authorize(&self, ctx: &AuthzContext<'_>) -> Result<Authorization, AuthzError> {
        let principal = ctx
            .principal
            .ok_or_else(|| AuthzError::Unauthenticated("caller identity is missing".to_string()))?;
        if principal.subject_type != SubjectType::App {
            return Err(AuthzError::Denied(format!(
                "subject type {} may not call services",
                principal.subject_type.as_str()
            )));
        }

        let query = EnforceQuery::read_api(
            &principal.subject_id,
            principal.subject_type.as_str(),
            &ctx.service.service_id,
        );
        let answers = self.permission.enforce(std::slice::from_ref(&query)).await?;
        if !answers.first().copied().unwrap_or(false) {
            return Err(AuthzError::Denied(format!(
                "{} has no read grant on service {}",
                principal.subject_id, ctx.service.service_id
            )));
        }

        check_rate_limit(self.rate_limiter.as_ref(), &principal.subject_id, ctx.service)?;

        let row_filter = self.row_filter(principal, ctx.sub_services).await?;
        Ok(Authorization {
            subject_id: principal.subject_id.clone(),
            row_filter,
            response_headers: None,
        })
    }
}

pub struct SignatureAuthorizer {
    config_center: ConfigCenterClient,
    max_skew_secs: u64,
    nonces: Option<NonceGuard>,
    rate_limiter: Option<RateLimiter>,
    record_calls: bool,
}

impl SignatureAuthorizer {
    pub fn new(
        config_center: ConfigCenterClient,
        max_skew_secs: u64,
        nonces: Option<NonceGuard>,
        rate_limiter: Option<RateLimiter>,
        record_calls: bool,
    ) -> Self {
        Self {
            config_center,
            max_skew_secs,
            nonces,
            rate_limiter,
            record_calls,
        }
    }
}

#[async_trait]
impl Authorizer for SignatureAuthorizer {
    fn mode(&self) -> &'static str {
        "signature"
    }

    fn requires_principal(&self) -> bool {
        false
    }

    fn records_calls(&self) -> bool {
        self.record_calls
    }

    async fn authorize(&self, ctx: &AuthzContext<'_>) -> Result<Authorization, AuthzError> {
        let signed =
            SignedHeaders::from_headers(ctx.headers).map_err(|err| AuthzError::Signature(err.message))?;

        let app_id = ctx
            .service
            .app_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                AuthzError::Denied(format!(
                    "service {} is not bound to an application",
                    ctx.service.service_id
                ))
            })?;

        let app = match self.config_center.app(app_id).await {
            Ok(app) => app,
            Err(UpstreamError::BadStatus(status)) if status == reqwest::StatusCode::NOT_FOUND => {
                return Err(AuthzError::Denied(format!("application {} is unknown", app_id)));
            }
            Err(err) => return Err(err.into()),
        };
        if app.secret.is_empty() {
            return Err(AuthzError::Denied(format!(
                "application {} has no secret",
                app_id
            )));
        }

        let now_secs = chrono::Utc::now().timestamp();
        signed
            .verify(&app.secret, now_secs, self.max_skew_secs)
            .map_err(|err| AuthzError::Signature(err.message))?;

        if let Some(nonces) = self.nonces.as_ref()
            && !nonces.claim(&signed.nonce)
        {
            return Err(AuthzError::Signature(format!(
                "{} has already been used",
                dag_auth::signature::NONCE_HEADER
            )));
        }

        check_rate_limit(self.rate_limiter.as_ref(), app_id, ctx.service)?;

        Ok(Authorization {
            subject_id: app_id.to_string(),
            row_filter: None,
            response_headers: Some(SignedHeaders::issue(&app.secret, now_secs)),
        })
    }
}
