use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use dag_auth::{OidcAuthenticator, Principal, principal_from_headers};
use dag_contracts::{
    CallRecord, CreateModel, DataType, ErrorCode, ErrorKind, PAGE_SIZE_PARAM, Param, ParamMap,
    Position, Service, ServiceAssociations, ServiceDataSource, ServiceParam, ServiceResponseFilter,
    ServiceType,
};
use dag_sql::params::{assemble, page_window, prepare};
use dag_sql::{QueryContext, SqlError, script_query, wizard_query};
use dag_store::{CallRecordWriter, PgServiceStore, ServiceStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::Instrument;
use ulid::Ulid;

use crate::authorizer::{
    Authorization, Authorizer, AuthzContext, CapabilityAuthorizer, SignatureAuthorizer,
};
use crate::cache::{CacheError, ServiceCache};
use crate::config::{AuthMode, GatewayConfig, IdentityMode, StartupError};
use crate::config_center::ConfigCenterClient;
use crate::engine::{EngineClient, EngineError};
use crate::filter::{compile, retain_rows};
use crate::grade_label::GradeLabelClient;
use crate::permission::PermissionClient;
use crate::proxy::{ProxyClient, ProxyError, into_body};
use crate::rate_limit::{NONCE_TTL, NonceGuard, RateLimiter};
use crate::recorder::{CallRecordSink, CallRecorder};

const DISPATCH_ROUTE: &str = "/data-application-gateway";
const QUERY_TEST_ROUTE: &str = "/api/data-application-gateway/v1/query-test";
const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_SERVICE_PATH_BYTES: usize = 255;
const QUERY_TEST_MAX_PAGE_SIZE: u32 = 10;
const RATE_LIMIT_MAX_KEYS: usize = 16_384;
const NONCE_MAX_ENTRIES: usize = 65_536;
/// Status recorded when the caller goes away before a response is ready.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    oidc: Option<OidcAuthenticator>,
    cache: ServiceCache,
    authorizer: Arc<dyn Authorizer>,
    engine: EngineClient,
    proxy: ProxyClient,
    grade_label: Option<GradeLabelClient>,
    recorder: CallRecorder,
}

/// Storage the router runs against. Production wiring connects Postgres;
/// tests pass in-memory implementations.
pub struct GatewayDeps {
    pub store: Arc<dyn ServiceStore>,
    pub call_sink: Arc<dyn CallRecordSink>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let store = PgServiceStore::connect(
        &config.db_url,
        Duration::from_millis(config.db_query_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: format!("failed to connect service store: {}", err),
    })?;
    let writer = CallRecordWriter::new(
        store.pool().clone(),
        Duration::from_millis(config.call_record_write_timeout_ms),
    );

    router_with(
        config,
        GatewayDeps {
            store: Arc::new(store),
            call_sink: Arc::new(writer),
        },
    )
    .await
}

pub async fn router_with(config: GatewayConfig, deps: GatewayDeps) -> Result<Router, StartupError> {
    let oidc = if config.identity_mode == IdentityMode::Oidc {
        let oidc_config = config.oidc.clone().ok_or_else(|| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc identity mode requires oidc config".to_string(),
        })?;

        Some(
            OidcAuthenticator::new(oidc_config)
                .await
                .map_err(|err| StartupError {
                    code: err.code,
                    message: err.message,
                })?,
        )
    } else {
        None
    };

    let authorizer = build_authorizer(&config).await?;
    tracing::info!(mode = authorizer.mode(), "authorization mode selected");

    let engine = EngineClient::new(
        config.engine_url.clone(),
        Duration::from_secs(config.default_timeout_secs),
        config.upstream_tls_verify,
    )
    .map_err(|err| StartupError {
        code: "ERR_ENGINE_CLIENT",
        message: format!("failed to initialize engine client: {}", err),
    })?;
    let proxy = ProxyClient::new(
        Duration::from_secs(config.default_timeout_secs),
        config.upstream_tls_verify,
    )
    .map_err(|err| StartupError {
        code: "ERR_PROXY_CLIENT",
        message: format!("failed to initialize proxy client: {}", err),
    })?;
    let grade_label = config
        .grade_label_url
        .clone()
        .map(|url| GradeLabelClient::new(url, config.outbound_timeout(), config.upstream_tls_verify))
        .transpose()
        .map_err(|err| StartupError {
            code: "ERR_GRADE_LABEL_CLIENT",
            message: format!("failed to initialize grade-label client: {}", err),
        })?;

    let recorder = if authorizer.records_calls() {
        CallRecorder::spawn(deps.call_sink, config.call_record_queue_capacity)
    } else {
        CallRecorder::disabled()
    };

    let cache = ServiceCache::new(
        deps.store,
        config.service_cache_max_entries,
        Duration::from_millis(config.service_cache_ttl_ms),
    );

    let state = AppState {
        config: Arc::new(config),
        oidc,
        cache,
        authorizer,
        engine,
        proxy,
        grade_label,
        recorder,
    };

    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/data-application-gateway/{*service_path}", any(dispatch))
        .route(QUERY_TEST_ROUTE, post(query_test))
        .with_state(state))
}

async fn build_authorizer(config: &GatewayConfig) -> Result<Arc<dyn Authorizer>, StartupError> {
    let rate_limiter = config
        .rate_limit_enabled
        .then(|| RateLimiter::per_second(RATE_LIMIT_MAX_KEYS));

    let config_center = config
        .config_center_url
        .clone()
        .map(|url| ConfigCenterClient::new(url, config.outbound_timeout(), config.upstream_tls_verify))
        .transpose()
        .map_err(|err| StartupError {
            code: "ERR_CONFIG_CENTER_CLIENT",
            message: format!("failed to initialize configuration centre client: {}", err),
        })?;

    let signature = match config.auth_mode {
        AuthMode::Capability => false,
        AuthMode::Signature => true,
        AuthMode::ConfigCenter => {
            let client = config_center.as_ref().ok_or_else(|| missing("DAG_CONFIG_CENTER_URL"))?;
            client
                .signature_mode_enabled()
                .await
                .map_err(|err| StartupError {
                    code: "ERR_CONFIG_CENTER_UNAVAILABLE",
                    message: format!("failed to read authorization mode: {}", err),
                })?
        }
    };

    if signature {
        let client = config_center.ok_or_else(|| missing("DAG_CONFIG_CENTER_URL"))?;
        let nonces = config
            .signature_nonce_check
            .then(|| NonceGuard::new(NONCE_TTL, NONCE_MAX_ENTRIES));
        return Ok(Arc::new(SignatureAuthorizer::new(
            client,
            config.signature_max_skew_secs,
            nonces,
            rate_limiter,
            config.signature_record_calls,
        )));
    }

    let url = config
        .auth_service_url
        .clone()
        .ok_or_else(|| missing("DAG_AUTH_SERVICE_URL"))?;
    let permission =
        PermissionClient::new(url, config.outbound_timeout(), config.upstream_tls_verify).map_err(|err| StartupError {
            code: "ERR_PERMISSION_CLIENT",
            message: format!("failed to initialize permission client: {}", err),
        })?;
    Ok(Arc::new(CapabilityAuthorizer::new(permission, rate_limiter)))
}

fn missing(key: &str) -> StartupError {
    StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("{} is required for the selected authorization mode", key),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = state.cache.store().ping().await.is_ok();
    checks.insert("store", store_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Builds the call record of one dispatch as the pipeline learns about the
/// call. Dropping it unfinished records the call as abandoned by the client.
struct CallTrace {
    recorder: CallRecorder,
    record: Option<CallRecord>,
    response_headers: Vec<(&'static str, String)>,
}

impl CallTrace {
    fn start(recorder: CallRecorder, headers: &HeaderMap, remote: Option<SocketAddr>) -> Self {
        let forward_for = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Self {
            recorder,
            record: Some(CallRecord {
                service_id: String::new(),
                service_name: String::new(),
                service_path: String::new(),
                service_department_id: String::new(),
                remote_address: remote.map(|addr| addr.ip().to_string()).unwrap_or_default(),
                forward_for,
                user_identification: String::new(),
                app_id: String::new(),
                call_start_time_ms: unix_epoch_ms_now(),
                call_end_time_ms: 0,
                status_code: 0,
                call_status: 0,
                error_message: String::new(),
            }),
            response_headers: Vec::new(),
        }
    }

    fn service(&mut self, service: &Service) {
        if let Some(record) = self.record.as_mut() {
            record.service_id = service.service_id.clone();
            record.service_name = service.service_name.clone();
            record.service_path = service.service_path.clone();
            record.service_department_id = service.department_id.clone();
        }
    }

    fn subject(&mut self, subject_id: &str) {
        if let Some(record) = self.record.as_mut() {
            record.user_identification = subject_id.to_string();
            record.app_id = subject_id.to_string();
        }
    }

    fn finish(&mut self, status: u16, error_message: Option<String>) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        record.call_end_time_ms = unix_epoch_ms_now();
        record.status_code = status;
        record.call_status = i16::from(status == StatusCode::OK.as_u16() && error_message.is_none());
        record.error_message = error_message.unwrap_or_default();
        self.recorder.record(record);
    }
}

impl Drop for CallTrace {
    fn drop(&mut self) {
        if self.record.is_some() {
            self.finish(
                CLIENT_CLOSED_REQUEST,
                Some("client closed request".to_string()),
            );
        }
    }
}

async fn dispatch(
    State(state): State<AppState>,
    Path(raw_path): Path<String>,
    request: Request,
) -> Response {
    let request_started = Instant::now();
    let (parts, body) = request.into_parts();
    let request_id = extract_request_id(&parts.headers);
    let remote = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let method = parts.method.clone();

    let span = tracing::info_span!(
        "gateway.dispatch",
        request_id = %request_id,
        method = %method,
        service_path = tracing::field::Empty,
        service_id = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let mut trace = CallTrace::start(state.recorder.clone(), &parts.headers, remote);

    let result = run_dispatch(&state, &mut trace, &raw_path, &method, &parts.headers, &parts.uri, body)
        .instrument(span.clone())
        .await;

    let mut response = match result {
        Ok(response) => {
            trace.finish(response.status().as_u16(), None);
            response
        }
        Err((status, Json(err))) => {
            trace.finish(status.as_u16(), Some(err.message()));
            (status, Json(err)).into_response()
        }
    };

    for (name, value) in trace.response_headers.drain(..) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let latency_ms = request_started.elapsed().as_millis() as u64;
    span.record("latency_ms", latency_ms);
    span.record(
        "outcome",
        if response.status().is_success() { "ok" } else { "error" },
    );
    crate::metrics::observe_http_request(
        DISPATCH_ROUTE,
        method.as_str(),
        response.status().as_u16(),
        request_started.elapsed(),
    );
    response
}

async fn run_dispatch(
    state: &AppState,
    trace: &mut CallTrace,
    raw_path: &str,
    method: &Method,
    headers: &HeaderMap,
    uri: &axum::http::Uri,
    body: Body,
) -> Result<Response, ApiError> {
    let service_path = normalize_service_path(raw_path)?;
    tracing::Span::current().record("service_path", service_path.as_str());

    let Query(query) = Query::<Vec<(String, String)>>::try_from_uri(uri).map_err(|err| {
        json_error(ErrorCode::InvalidParameter, Some(Value::from(err.body_text())))
    })?;
    let body = axum::body::to_bytes(body, state.config.max_body_bytes)
        .await
        .map_err(|_| {
            json_error(
                ErrorCode::InvalidParameter,
                Some(Value::from("request body is unreadable or too large")),
            )
        })?;
    let header_pairs = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)));
    let mut params = assemble(header_pairs, &body, &query).map_err(sql_error)?;

    let associations = resolve_service(state, &service_path).await?;
    let service = &associations.service;
    trace.service(service);
    tracing::Span::current().record("service_id", service.service_id.as_str());

    if !service.status.is_dispatchable() {
        return Err(json_error(
            ErrorCode::ServiceStatusNotAvailable,
            Some(Value::from(format!("service status is {}", service.status.as_str()))),
        ));
    }
    if !service.http_method.trim().eq_ignore_ascii_case(method.as_str()) {
        return Err(json_error(
            ErrorCode::ServiceMethodNotAllowed,
            Some(Value::from(format!(
                "service expects {}",
                service.http_method.to_ascii_uppercase()
            ))),
        ));
    }

    let principal = if state.authorizer.requires_principal() {
        Some(resolve_principal(state, headers).await?)
    } else {
        resolve_principal(state, headers).await.ok()
    };
    if let Some(principal) = principal.as_ref() {
        trace.subject(&principal.subject_id);
    }

    let authorization = authorize(state, &associations, headers, principal.as_ref()).await?;
    trace.subject(&authorization.subject_id);
    if let Some(signed) = authorization.response_headers.as_ref() {
        trace.response_headers = signed
            .iter()
            .map(|(name, value)| (name, value.to_string()))
            .collect();
    }

    prepare(&associations.params, &mut params, associations.page_size()).map_err(sql_error)?;

    let timeout = state.config.service_timeout(service.timeout_seconds);
    match service.service_type {
        ServiceType::Register => {
            let resp = state
                .proxy
                .forward(service, &params, timeout)
                .await
                .map_err(proxy_error)?;
            Ok((
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                into_body(resp),
            )
                .into_response())
        }
        ServiceType::Generate => {
            let data_source = associations.data_source.as_ref().ok_or_else(|| {
                json_error(
                    ErrorCode::DataViewIdNotExist,
                    Some(Value::from("service has no data view")),
                )
            })?;
            let service_params = protected_params(state, data_source, &associations.params).await?;
            let plan = QueryPlan {
                create_model: service.create_model,
                data_source,
                script: associations.script_model.as_ref().map(|m| m.script.as_str()),
                service_params: &service_params,
                response_filters: &associations.response_filters,
                row_filter: authorization.row_filter.as_deref(),
            };
            let bearer = dag_auth::bearer_token(headers).ok();
            let body = execute(state, &plan, &params, bearer, timeout).await?;
            Ok(Json(body).into_response())
        }
    }
}

async fn resolve_service(
    state: &AppState,
    service_path: &str,
) -> Result<Arc<ServiceAssociations>, ApiError> {
    let span = tracing::info_span!("cache.resolve", outcome = tracing::field::Empty);
    async {
        let result = state.cache.get(service_path).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(CacheError::NotFound) => "not_found",
            Err(CacheError::Transient(_)) => "error",
        };
        tracing::Span::current().record("outcome", outcome);
        result.map_err(|err| match err {
            CacheError::NotFound => json_error(ErrorCode::ServicePathNotExist, None),
            CacheError::Transient(err) => {
                tracing::warn!(error = %err, "service store lookup failed");
                json_error(ErrorCode::StoreUnavailable, None)
            }
        })
    }
    .instrument(span)
    .await
}

async fn authorize(
    state: &AppState,
    associations: &ServiceAssociations,
    headers: &HeaderMap,
    principal: Option<&Principal>,
) -> Result<Authorization, ApiError> {
    let ctx = AuthzContext {
        service: &associations.service,
        sub_services: &associations.sub_services,
        headers,
        principal,
    };
    state.authorizer.authorize(&ctx).await.map_err(|err| {
        tracing::info!(code = %err.code(), error = %err, "authorization rejected");
        json_error(err.code(), err.detail().map(Value::from))
    })
}

async fn resolve_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, ApiError> {
    let resolved = match state.config.identity_mode {
        IdentityMode::Local => principal_from_headers(headers),
        IdentityMode::Oidc => {
            let Some(auth) = state.oidc.as_ref() else {
                return Err(json_error(
                    ErrorCode::InternalError,
                    Some(Value::from("oidc authenticator is not initialized")),
                ));
            };
            auth.authenticate(headers).await
        }
    };

    resolved.map_err(|err| {
        let code = if err.code == "ERR_AUTH_UNAVAILABLE" {
            ErrorCode::UpstreamUnavailable
        } else {
            ErrorCode::Unauthenticated
        };
        json_error(code, Some(Value::from(err.message)))
    })
}

/// Marks response params the grade-label service reports as protected.
async fn protected_params(
    state: &AppState,
    data_source: &ServiceDataSource,
    params: &[ServiceParam],
) -> Result<Vec<ServiceParam>, ApiError> {
    let Some(grade_label) = state.grade_label.as_ref() else {
        return Ok(params.to_vec());
    };
    grade_label
        .enrich(&data_source.data_view_id, params)
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "grade-label lookup failed");
            json_error(ErrorCode::UpstreamUnavailable, Some(Value::from(err.to_string())))
        })
}

/// Everything needed to run a generate-type service against the engine.
struct QueryPlan<'a> {
    create_model: CreateModel,
    data_source: &'a ServiceDataSource,
    script: Option<&'a str>,
    service_params: &'a [ServiceParam],
    response_filters: &'a [ServiceResponseFilter],
    row_filter: Option<&'a str>,
}

impl QueryPlan<'_> {
    /// Returns the data query and the count query.
    fn build(&self, params: &ParamMap) -> Result<(String, String), SqlError> {
        let ctx = QueryContext {
            catalog: &self.data_source.catalog_name,
            schema: &self.data_source.data_schema_name,
            sub_clause: self.row_filter,
            service_params: self.service_params,
            is_count: false,
        };
        match self.create_model {
            CreateModel::Wizard => {
                let table = &self.data_source.data_table_name;
                Ok((
                    wizard_query(params, table, &ctx)?,
                    wizard_query(params, table, &ctx.counting())?,
                ))
            }
            CreateModel::Script => {
                let script = self
                    .script
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| SqlError::unsafe_sql("service has no script"))?;
                Ok((
                    script_query(params, script, &ctx)?,
                    script_query(params, script, &ctx.counting())?,
                ))
            }
        }
    }
}

async fn execute(
    state: &AppState,
    plan: &QueryPlan<'_>,
    params: &ParamMap,
    bearer: Option<&str>,
    timeout: Duration,
) -> Result<Value, ApiError> {
    let (data_sql, count_sql) = plan.build(params).map_err(sql_error)?;
    tracing::debug!(sql = %data_sql, "engine query built");

    let (total_count, mut result) = tokio::try_join!(
        state.engine.fetch_count(&count_sql, bearer, timeout),
        state.engine.fetch(&data_sql, bearer, timeout),
    )
    .map_err(engine_error)?;

    let filters = compile(plan.response_filters, &result.typed_columns()).map_err(|err| {
        json_error(ErrorCode::QueryError, Some(Value::from(err.to_string())))
    })?;
    retain_rows(&mut result.data, &filters);

    Ok(serde_json::json!({
        "total_count": total_count,
        "data": result.into_objects(),
    }))
}

#[derive(Debug, Deserialize)]
struct QueryTestRequest {
    create_model: CreateModel,
    data_source: ServiceDataSource,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    page_size: Option<u32>,
    #[serde(default)]
    params: Vec<ServiceParam>,
    #[serde(default)]
    response_filters: Vec<ServiceResponseFilter>,
    #[serde(default)]
    values: serde_json::Map<String, Value>,
}

/// Runs an unpublished service definition so authors can preview results.
async fn query_test(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<QueryTestRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let request_started = Instant::now();
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "gateway.query_test",
        request_id = %request_id,
        principal = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let result = async {
        let principal = resolve_principal(&state, &headers).await?;
        tracing::Span::current().record("principal", principal.subject_id.as_str());

        let Json(req) = req.map_err(|err| {
            json_error(ErrorCode::InvalidParameter, Some(Value::from(err.body_text())))
        })?;

        let mut params: ParamMap = req
            .values
            .into_iter()
            .map(|(name, value)| (name, Param::new(value, Position::Body)))
            .collect();
        let page_size = req
            .page_size
            .filter(|size| *size > 0)
            .unwrap_or(QUERY_TEST_MAX_PAGE_SIZE)
            .min(QUERY_TEST_MAX_PAGE_SIZE);
        prepare(&req.params, &mut params, Some(page_size)).map_err(sql_error)?;
        cap_page_size(&mut params, QUERY_TEST_MAX_PAGE_SIZE);

        let plan = QueryPlan {
            create_model: req.create_model,
            data_source: &req.data_source,
            script: req.script.as_deref(),
            service_params: &req.params,
            response_filters: &req.response_filters,
            row_filter: None,
        };
        let bearer = dag_auth::bearer_token(&headers).ok();
        let timeout = state.config.service_timeout(0);
        execute(&state, &plan, &params, bearer, timeout).await
    }
    .instrument(span.clone())
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    span.record("outcome", if result.is_ok() { "ok" } else { "error" });
    crate::metrics::observe_http_request(
        QUERY_TEST_ROUTE,
        "POST",
        status.as_u16(),
        request_started.elapsed(),
    );
    result.map(Json)
}

fn cap_page_size(params: &mut ParamMap, cap: u32) {
    let (_, size) = page_window(params);
    let capped = size.min(u64::from(cap));
    params.insert(
        PAGE_SIZE_PARAM.to_string(),
        Param {
            value: Value::from(capped),
            position: Position::Query,
            data_type: Some(DataType::Long),
        },
    );
}

/// The wildcard tail of the dispatch route as a `/`-rooted service path.
fn normalize_service_path(raw: &str) -> Result<String, ApiError> {
    let trimmed = raw.trim_start_matches('/');
    let normalized = format!("/{}", trimmed);
    let valid = !trimmed.is_empty()
        && normalized.len() <= MAX_SERVICE_PATH_BYTES
        && trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'_' | b'.' | b'-'));
    if !valid {
        return Err(json_error(
            ErrorCode::InvalidParameter,
            Some(Value::from("service path is invalid")),
        ));
    }
    Ok(normalized)
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

fn unix_epoch_ms_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error_code: &'static str,
    description: &'static str,
    solution: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

impl ErrorResponse {
    /// Text stored on the call record.
    fn message(&self) -> String {
        match &self.detail {
            Some(Value::String(detail)) => format!("{}: {}", self.description, detail),
            Some(detail) => format!("{}: {}", self.description, detail),
            None => self.description.to_string(),
        }
    }
}

fn json_error(code: ErrorCode, detail: Option<Value>) -> ApiError {
    let status = match code.kind() {
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorResponse {
            error_code: code.as_str(),
            description: code.description(),
            solution: code.solution(),
            detail,
        }),
    )
}

fn sql_error(err: SqlError) -> ApiError {
    match err {
        SqlError::Invalid(errors) => json_error(ErrorCode::InvalidParameter, Some(Value::from(errors))),
        SqlError::Unsafe(reason) => {
            json_error(ErrorCode::ServiceSqlSyntaxError, Some(Value::from(reason)))
        }
    }
}

fn engine_error(err: EngineError) -> ApiError {
    tracing::warn!(error = %err, "engine query failed");
    json_error(ErrorCode::QueryError, Some(Value::from(err.to_string())))
}

fn proxy_error(err: ProxyError) -> ApiError {
    tracing::warn!(error = %err, "backend call failed");
    let code = match err {
        ProxyError::UnsupportedContentType(_) => ErrorCode::BackendUnsupportedContentType,
        _ => ErrorCode::BackendServiceError,
    };
    json_error(code, Some(Value::from(err.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_path_is_normalized_and_validated() {
        assert_eq!(
            normalize_service_path("people/v1").expect("valid").as_str(),
            "/people/v1"
        );
        assert_eq!(
            normalize_service_path("/a.b-c_d").expect("valid").as_str(),
            "/a.b-c_d"
        );
        assert!(normalize_service_path("").is_err());
        assert!(normalize_service_path("/").is_err());
        assert!(normalize_service_path("bad path").is_err());
        assert!(normalize_service_path("x?y").is_err());
        // 255 bytes including the leading slash is the longest accepted path.
        let longest = format!("/{}", "a".repeat(254));
        assert_eq!(
            normalize_service_path(&longest).expect("valid").len(),
            MAX_SERVICE_PATH_BYTES
        );
        assert!(normalize_service_path(&"a".repeat(254)).is_ok());
        assert!(normalize_service_path(&"a".repeat(255)).is_err());
    }

    #[test]
    fn request_id_is_sanitized_or_generated() {
        assert_eq!(sanitize_request_id("req-1_a.b").as_deref(), Some("req-1_a.b"));
        assert_eq!(sanitize_request_id("r e q").as_deref(), Some("req"));
        assert_eq!(sanitize_request_id("!!!"), None);
        assert_eq!(sanitize_request_id(&"x".repeat(100)).map(|s| s.len()), Some(64));

        let generated = extract_request_id(&HeaderMap::new());
        assert!(generated.parse::<Ulid>().is_ok());
    }

    #[test]
    fn errors_are_bad_requests_except_internal() {
        let (status, Json(body)) = json_error(ErrorCode::ServicePathNotExist, None);
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body.error_code,
            "DataApplicationGateway.Service.ServicePathNotExist"
        );

        let (status, _) = json_error(ErrorCode::InternalError, None);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

        let (_, Json(body)) = sql_error(SqlError::Invalid(vec!["param age required".to_string()]));
        assert_eq!(body.error_code, ErrorCode::InvalidParameter.as_str());
        assert_eq!(body.detail, Some(serde_json::json!(["param age required"])));
        assert_eq!(
            body.message(),
            "request parameters are invalid: [\"param age required\"]"
        );
    }

    #[test]
    fn page_size_is_capped() {
        let mut params = ParamMap::new();
        params.insert(
            PAGE_SIZE_PARAM.to_string(),
            Param::new(Value::from(500), Position::Body),
        );
        cap_page_size(&mut params, 10);
        assert_eq!(page_window(&params).1, 10);

        let mut params = ParamMap::new();
        params.insert(
            PAGE_SIZE_PARAM.to_string(),
            Param::new(Value::from(3), Position::Body),
        );
        cap_page_size(&mut params, 10);
        assert_eq!(page_window(&params).1, 3);
    }
}
