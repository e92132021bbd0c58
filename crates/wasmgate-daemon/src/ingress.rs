// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP ingress: system routes inline, everything else authenticated,
//! attributed to a tenant, rate-limited, and enqueued to the tenant's
//! stream with a `202 Accepted` receipt.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, OriginalUri, State};
use axum::http::header::{HeaderMap, AUTHORIZATION};
use axum::http::{HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use wasmgate_broker::{Broker, BrokerError, BrokerRegistry};
use wasmgate_core::ai::{AiClient, AiConfig};
use wasmgate_core::bridge::{UnconfiguredSql, UnconfiguredStore};
use wasmgate_core::{EngineSettings, HostServices, KvStore, Mount, RequestEnvelope};
use wasmgate_sovereign::{ModuleLoader, TrustError};

use crate::config::{ConfigError, GateConfig, WorkerTuning};
use crate::crash::CrashRecorder;
use crate::jobs::GateJobSink;
use crate::ratelimit::TenantRateLimiter;
use crate::telemetry::Telemetry;
use crate::tenant::{self, TenantManager};
use crate::worker::{WorkerPool, WorkerShared, MAX_RETRIES};
use crate::{audit::AuditSigner, snapshot};

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum GateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("module admission failed: {0}")]
    Trust(#[from] TrustError),

    #[error("broker failure: {0}")]
    Broker(#[from] BrokerError),

    #[error("sandbox failure: {0}")]
    Sandbox(#[from] wasmgate_core::SandboxError),

    #[error("runtime unavailable: {0}")]
    Runtime(String),
}

pub struct GateInner {
    pub cfg: GateConfig,
    pub broker: Arc<Broker>,
    pub tenants: Arc<TenantManager>,
    pub workers: Arc<WorkerPool>,
    pub jobs: Arc<GateJobSink>,
    pub limiter: TenantRateLimiter,
    pub telemetry: Telemetry,
    pub fingerprint: String,
    pub node_id: String,
}

/// Shared daemon state behind every route handler.
#[derive(Clone)]
pub struct GateState {
    inner: Arc<GateInner>,
}

impl std::ops::Deref for GateState {
    type Target = GateInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl GateState {
    pub fn build(cfg: GateConfig) -> Result<Self, GateError> {
        Self::build_with_tuning(cfg, WorkerTuning::default())
    }

    /// Verifies and compiles nothing yet: module admission happens here
    /// (strict deployments fail before any request is served), engines are
    /// built lazily per worker.
    pub fn build_with_tuning(cfg: GateConfig, tuning: WorkerTuning) -> Result<Self, GateError> {
        cfg.validate()?;
        let timeout = cfg.timeout()?;
        let memory_limit_bytes = cfg.memory_limit_bytes()?;

        let loader = ModuleLoader::from_hex_keys(&cfg.trusted_keys, cfg.security_policy)?;
        let module_bytes = loader.load(&cfg.path)?;

        let broker = BrokerRegistry::acquire(cfg.cluster_port, &cfg.data_dir)?;
        let tenants = Arc::new(TenantManager::new(
            broker.clone(),
            cfg.replicas,
            tuning.ack_wait,
            MAX_RETRIES + 1,
        ));

        let sink = GateJobSink::new(tenants.clone());
        let ai = build_ai_client(&cfg);
        let services = Arc::new(HostServices {
            kv: KvStore::new(),
            sql: Arc::new(UnconfiguredSql),
            objects: Arc::new(UnconfiguredStore),
            jobs: sink.clone(),
            ai,
        });

        let pool_size = Arc::new(AtomicUsize::new(cfg.pool_size));
        let shared = Arc::new(WorkerShared {
            module_bytes,
            artifact_path: cfg.path.clone(),
            engine_settings: EngineSettings {
                memory_limit_bytes,
                fuel_limit: cfg.fuel_limit,
            },
            services,
            tenants: tenants.clone(),
            audit: AuditSigner::new(&cfg.master_secret),
            crashes: CrashRecorder::new(&cfg.crash_path, cfg.record_crashes),
            telemetry: Telemetry::new(),
            timeout,
            backoff_unit: tuning.backoff_unit,
            argv: cfg.args.clone(),
            env: cfg.env.clone(),
            mounts: cfg
                .mounts
                .iter()
                .map(|m| Mount {
                    host: m.host.clone(),
                    guest: m.guest.clone(),
                })
                .collect(),
            pool_size,
        });

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| GateError::Runtime(err.to_string()))?;
        let workers = WorkerPool::new(shared.clone(), runtime);
        sink.attach_workers(workers.clone());

        let node_id = cfg.node_id();
        let fingerprint = tenant::module_fingerprint(&cfg.path.to_string_lossy());
        let limiter = TenantRateLimiter::new(cfg.rate_limit);
        let telemetry = shared.telemetry.clone();

        Ok(Self {
            inner: Arc::new(GateInner {
                cfg,
                broker,
                tenants,
                workers,
                jobs: sink,
                limiter,
                telemetry,
                fingerprint,
                node_id,
            }),
        })
    }
}

fn build_ai_client(cfg: &GateConfig) -> Option<AiClient> {
    if cfg.ai.provider.is_empty() && cfg.ai.endpoint.is_empty() && cfg.ai.model.is_empty() {
        return None;
    }
    let ai_cfg = AiConfig {
        provider: cfg.ai.provider.clone(),
        model: cfg.ai.model.clone(),
        endpoint: cfg.ai.endpoint.clone(),
        token: cfg.ai.token.clone(),
        allowed_hosts: cfg.allow_hosts.clone(),
    };
    Some(AiClient::new(ai_cfg))
}

#[derive(Debug, Serialize, PartialEq)]
pub struct AcceptedJob {
    pub status: &'static str,
    pub job_id: u64,
    pub stream: String,
    pub tenant: String,
}

#[derive(Debug)]
pub struct HttpErr {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl HttpErr {
    fn new(status: StatusCode, error: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": error }),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
    }

    fn service_unavailable(detail: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, detail)
    }

    fn internal(detail: &str) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

/// Authenticates the request and derives the tenant id: the API key when
/// keys are configured, the sanitized peer address otherwise.
fn authenticate(state: &GateState, headers: &HeaderMap, peer: &SocketAddr) -> Result<String, HttpErr> {
    if state.cfg.api_keys.is_empty() {
        return Ok(tenant::tenant_from_addr(peer));
    }
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });
    let Some(key) = presented else {
        return Err(HttpErr::unauthorized());
    };
    if !state.cfg.api_keys.iter().any(|k| *k == key) {
        return Err(HttpErr::unauthorized());
    }
    Ok(key)
}

fn envelope_for(method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> RequestEnvelope {
    let mut header_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    let uri = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());
    RequestEnvelope {
        method: method.as_str().to_string(),
        uri,
        headers: header_map,
        body: String::from_utf8_lossy(body).into_owned(),
    }
}

/// The enqueue path for every non-system route.
pub async fn dispatch_impl(
    state: &GateState,
    peer: SocketAddr,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<AcceptedJob, HttpErr> {
    let tenant = authenticate(state, &headers, &peer)?;

    if !state.limiter.allow(&tenant) {
        state.telemetry.record_request(&tenant, "429");
        return Err(HttpErr::too_many_requests());
    }

    let envelope = envelope_for(&method, &uri, &headers, &body);
    let payload = envelope.to_json().map_err(|err| {
        HttpErr::new(StatusCode::BAD_REQUEST, &format!("invalid request: {err}"))
    })?;

    state
        .tenants
        .ensure(&tenant)
        .map_err(|err| HttpErr::service_unavailable(&format!("tenant provisioning failed: {err}")))?;
    state.workers.ensure_started(&tenant);

    let subject = tenant::exec_subject(&tenant, &state.fingerprint);
    let msg_id = format!(
        "job_{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    );
    let (stream, job_id) = state
        .broker
        .publish(&subject, &msg_id, &payload)
        .map_err(|err| HttpErr::internal(&format!("failed to persist job: {err}")))?;

    state.telemetry.record_request(&tenant, "202");
    tracing::info!(tenant = %tenant, job_id, stream = %stream, "job queued");
    Ok(AcceptedJob {
        status: "queued",
        job_id,
        stream,
        tenant,
    })
}

/// CORS response headers for an allowed origin, mirrored from the request.
fn cors_headers(origins: &[String], request_headers: &HeaderMap) -> Vec<(&'static str, HeaderValue)> {
    if origins.is_empty() {
        return Vec::new();
    }
    let Some(origin) = request_headers.get("origin").and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    let allowed = origins.iter().any(|o| o == "*" || o == origin);
    if !allowed {
        return Vec::new();
    }
    let Ok(origin_value) = HeaderValue::from_str(origin) else {
        return Vec::new();
    };
    vec![
        ("access-control-allow-origin", origin_value),
        (
            "access-control-allow-methods",
            HeaderValue::from_static("POST, GET, OPTIONS, PUT, DELETE, PATCH"),
        ),
        (
            "access-control-allow-headers",
            HeaderValue::from_static("Content-Type, Authorization, X-API-Key, traceparent"),
        ),
        (
            "access-control-allow-credentials",
            HeaderValue::from_static("true"),
        ),
    ]
}

async fn dispatch_handler(
    State(state): State<GateState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let cors = cors_headers(&state.cfg.cors_origins, &headers);
    // Preflight short-circuits only for an allowed Origin; an OPTIONS
    // request with no Origin (or an unlisted one) is an ordinary request.
    if method == Method::OPTIONS && !cors.is_empty() {
        let mut response = StatusCode::OK.into_response();
        for (name, value) in cors {
            response.headers_mut().insert(name, value);
        }
        return response;
    }

    let mut response = match dispatch_impl(&state, peer, method, uri, headers, body).await {
        Ok(accepted) => {
            let mut response = (StatusCode::ACCEPTED, Json(&accepted)).into_response();
            if let Ok(value) = HeaderValue::from_str(&accepted.job_id.to_string()) {
                response.headers_mut().insert("x-job-id", value);
            }
            if let Ok(value) = HeaderValue::from_str(&accepted.tenant) {
                response.headers_mut().insert("x-tenant", value);
            }
            response
        }
        Err(err) => {
            tracing::error!(status = %err.status, detail = %err.body, "request rejected");
            (err.status, Json(err.body)).into_response()
        }
    };
    for (name, value) in cors {
        response.headers_mut().insert(name, value);
    }
    response
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PatchBody {
    pub pool_size: Option<usize>,
    pub reload: bool,
}

pub fn status_impl(state: &GateState) -> serde_json::Value {
    serde_json::json!({
        "node_id": state.node_id,
        "pool_size": state.workers.pool_size(),
        "memory_limit": state.cfg.memory_limit,
        "fuel_limit": state.cfg.fuel_limit.unwrap_or(0),
        "broker_status": "ok",
        "topic": tenant::exec_subject("*", &state.fingerprint),
        "streams": state.broker.stream_depths(),
        "active_tenants": state.workers.running_tenants(),
        "jobs": state.telemetry.snapshot(),
    })
}

pub async fn patch_impl(state: &GateState, patch: PatchBody) -> serde_json::Value {
    if let Some(size) = patch.pool_size {
        let old = state.workers.set_pool_size(size);
        if old != size {
            tracing::info!(old_pool_size = old, new_pool_size = size, "hot patching pool size");
        }
    }
    if patch.reload || patch.pool_size.is_some() {
        state.workers.drain_all().await;
    }
    serde_json::json!({ "status": "patched" })
}

async fn status_handler(State(state): State<GateState>) -> Json<serde_json::Value> {
    Json(status_impl(&state))
}

async fn patch_handler(
    State(state): State<GateState>,
    body: Bytes,
) -> Response {
    let patch: PatchBody = match serde_json::from_slice(&body) {
        Ok(patch) => patch,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    };
    Json(patch_impl(&state, patch).await).into_response()
}

async fn snapshot_handler(State(state): State<GateState>) -> Response {
    match snapshot::create_snapshot(state.broker.data_dir()) {
        Ok(file) => Json(serde_json::json!({ "file": file })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct RestoreBody {
    file: std::path::PathBuf,
}

async fn restore_handler(State(state): State<GateState>, body: Bytes) -> Response {
    let restore: RestoreBody = match serde_json::from_slice(&body) {
        Ok(restore) => restore,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    };
    if let Err(err) = snapshot::schedule_restore(state.broker.data_dir(), &restore.file) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response();
    }
    tracing::warn!(file = %restore.file.display(), "restore scheduled; terminating for supervisor restart");
    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::process::exit(0);
    });
    Json(serde_json::json!({ "status": "restore_scheduled", "file": restore.file })).into_response()
}

pub fn router(state: GateState) -> Router {
    Router::new()
        .route("/_sys/status", get(status_handler))
        .route("/_sys/patch", post(patch_handler))
        .route("/_sys/snapshot", post(snapshot_handler))
        .route("/_sys/restore", post(restore_handler))
        .fallback(dispatch_handler)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origins(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("origin", HeaderValue::from_str(origin).unwrap());
        headers
    }

    #[test]
    fn cors_disabled_without_config() {
        assert!(cors_headers(&[], &headers_with_origin("https://app.example")).is_empty());
    }

    #[test]
    fn cors_echoes_allowed_origin() {
        let set = cors_headers(
            &origins(&["https://app.example"]),
            &headers_with_origin("https://app.example"),
        );
        assert_eq!(set[0].0, "access-control-allow-origin");
        assert_eq!(set[0].1, "https://app.example");
        assert!(set.iter().any(|(name, _)| *name == "access-control-allow-credentials"));
    }

    #[test]
    fn cors_wildcard_allows_any_origin() {
        let set = cors_headers(&origins(&["*"]), &headers_with_origin("https://other.example"));
        assert_eq!(set[0].1, "https://other.example");
    }

    #[test]
    fn cors_rejects_unlisted_origins() {
        let set = cors_headers(
            &origins(&["https://app.example"]),
            &headers_with_origin("https://evil.example"),
        );
        assert!(set.is_empty());
    }

    #[test]
    fn envelope_captures_method_uri_headers_body() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("abc"));
        headers.append("accept", HeaderValue::from_static("text/plain"));
        headers.append("accept", HeaderValue::from_static("application/json"));
        let uri: Uri = "/run/fast?retry=1".parse().unwrap();

        let envelope = envelope_for(&Method::POST, &uri, &headers, b"hello");
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.uri, "/run/fast?retry=1");
        assert_eq!(envelope.body, "hello");
        assert_eq!(envelope.headers["x-api-key"], vec!["abc".to_string()]);
        assert_eq!(
            envelope.headers["accept"],
            vec!["text/plain".to_string(), "application/json".to_string()]
        );
    }
}
