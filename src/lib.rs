//! Core library for storygen.  This module holds the request/response
//! structures, application state and HTTP handlers; the generation flow
//! itself lives in [`pipeline`].

pub mod audit;
pub mod completion;
mod config;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod pipeline;
pub mod prompts;
pub mod rate_limit;
pub mod sanitize;
pub mod tokens;
pub mod util;

pub use config::{AppConfig, CompletionConfig, GeneratorConfig, RotationConfig};
pub use error::{ErrorKind, GenerationError};
pub use pipeline::{Generated, GenerationPipeline, RequestMeta};
pub use prompts::Level;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::{
    rejection::{BytesRejection, FailedToBufferBody, JsonRejection},
    ConnectInfo, DefaultBodyLimit, State,
};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use crate::audit::AuditLogger;
use crate::completion::{CompletionClient, HttpCompletionClient};
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;

/// Generated work item.  Its shape depends on the requested level.
pub type GenerationResult = Value;

/// Body of `POST /generate-story`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub story_level: Level,
    #[serde(default)]
    pub user_input: String,
    pub parent_context: Option<ParentContext>,
    pub additional_fields: Option<AdditionalFields>,
    pub parent_id: Option<String>,
}

/// Fields of the parent work item carried into a child's prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentContext {
    pub level: Level,
    #[serde(default)]
    pub title: String,
    pub description: Option<String>,
    pub business_objective: Option<String>,
    pub user_value: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalFields {
    pub user_role: Option<String>,
    pub goal: Option<String>,
    pub context: Option<String>,
    /// Any other keys the caller sent; sanitized but otherwise unused.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Who is asking.  Decides the rate-limit policy and the audit identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallerIdentity {
    Authenticated { user_id: String },
    Anonymous { ip_address: String },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetadata {
    pub level: Level,
    pub token_count: usize,
    /// Milliseconds.
    pub execution_time: u64,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
    pub data: GenerationResult,
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: ErrorKind,
}

impl ErrorResponse {
    fn new(error: impl Into<String>, code: ErrorKind) -> Self {
        Self {
            success: false,
            error: error.into(),
            code,
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<GenerationPipeline>,
    /// Bearer token -> user id.
    pub auth_tokens: Arc<HashMap<String, String>>,
    pub max_request_bytes: Option<usize>,
    pub trust_forwarded_headers: bool,
    pub metrics: Arc<Metrics>,
}

/// Assemble state from a loaded configuration and a completion client.
pub fn build_state(config: AppConfig, client: Arc<dyn CompletionClient>) -> AppState {
    let AppConfig {
        generator,
        auth_tokens,
        audit_log_file,
        rotation,
        max_request_bytes,
        trust_forwarded_headers,
    } = config;

    let audit = AuditLogger::from_config(audit_log_file.as_deref(), &rotation);
    let limiter = RateLimiter::in_memory(generator.rate_limits);
    let pipeline = GenerationPipeline::new(generator, limiter, client, audit);

    AppState {
        pipeline: Arc::new(pipeline),
        auth_tokens: Arc::new(auth_tokens),
        max_request_bytes,
        trust_forwarded_headers,
        metrics: Arc::new(Metrics::new()),
    }
}

/// Build state from environment variables (see [`AppConfig::from_env`]),
/// using the HTTP completion client.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    let client = HttpCompletionClient::new(config.generator.completion.clone())
        .context("failed to build completion HTTP client")?;
    tracing::info!(
        model = %client.config().model,
        url = %client.config().url,
        auth_tokens = config.auth_tokens.len(),
        "completion client configured"
    );
    Ok(build_state(config, Arc::new(client)))
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let router = Router::new()
        .route("/generate-story", post(generate_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler));

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

fn respond_with_error(status: StatusCode, err: ErrorResponse) -> axum::response::Response {
    (status, Json(err)).into_response()
}

fn respond_with_generation_error(err: &GenerationError) -> axum::response::Response {
    let body = ErrorResponse::new(err.user_message(), err.kind());
    match err.retry_after_secs() {
        Some(secs) => (
            err.status(),
            [(header::RETRY_AFTER, secs.to_string())],
            Json(body),
        )
            .into_response(),
        None => respond_with_error(err.status(), body),
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    if raw.len() < 7 || !raw[..6].eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = raw[6..].trim();
    (!token.is_empty()).then_some(token)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// The socket peer, unless forwarded headers are trusted, in which case the
/// first `X-Forwarded-For` entry or `X-Real-IP` wins.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> String {
    if trust_forwarded {
        if let Some(first) = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').map(str::trim).find(|s| !s.is_empty()))
        {
            return first.to_string();
        }
        if let Some(real) = header_str(headers, "x-real-ip") {
            return real.to_string();
        }
    }
    peer.map(|p| p.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Known bearer tokens resolve to their user; anything else is anonymous.
fn resolve_identity(
    headers: &HeaderMap,
    auth_tokens: &HashMap<String, String>,
    ip_address: &str,
) -> CallerIdentity {
    match extract_bearer_token(headers) {
        Some(token) => match auth_tokens.get(token) {
            Some(user_id) => CallerIdentity::Authenticated {
                user_id: user_id.clone(),
            },
            None => {
                tracing::debug!("unknown bearer token; treating caller as anonymous");
                CallerIdentity::Anonymous {
                    ip_address: ip_address.to_string(),
                }
            }
        },
        None => CallerIdentity::Anonymous {
            ip_address: ip_address.to_string(),
        },
    }
}

/// Handler for `POST /generate-story`.
async fn generate_handler(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> axum::response::Response {
    let start = Instant::now();
    // Size guard: rely on Content-Length header if provided.
    if let Some(limit) = state.max_request_bytes {
        if let Some(clen) =
            header_str(&headers, "content-length").and_then(|v| v.parse::<usize>().ok())
        {
            if clen > limit {
                return too_large(&state, Some(clen));
            }
        }
    }

    let payload = match payload {
        Ok(Json(inner)) => inner,
        Err(rejection) => return handle_json_rejection(&state, rejection, start),
    };

    let ip_address = client_ip(
        &headers,
        connect.map(|ConnectInfo(addr)| addr),
        state.trust_forwarded_headers,
    );
    let identity = resolve_identity(&headers, &state.auth_tokens, &ip_address);
    let meta = RequestMeta {
        ip_address: Some(ip_address),
        user_agent: header_str(&headers, "user-agent").map(str::to_string),
    };

    let result = state.pipeline.handle(payload, &identity, &meta).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(generated) => {
            state.metrics.observe(None, latency_ms);
            let body = SuccessResponse {
                success: true,
                data: generated.data,
                metadata: GenerationMetadata {
                    level: generated.level,
                    token_count: generated.token_count,
                    execution_time: generated.execution_time_ms,
                },
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            state.metrics.observe(Some(err.kind()), latency_ms);
            respond_with_generation_error(&err)
        }
    }
}

fn too_large(state: &AppState, content_length: Option<usize>) -> axum::response::Response {
    state.metrics.observe(Some(ErrorKind::ValidationError), 0);
    let message = match (content_length, state.max_request_bytes) {
        (Some(len), Some(limit)) => format!("Request too large ({} bytes > limit {} bytes)", len, limit),
        (None, Some(limit)) => format!("Request too large (body exceeded limit {} bytes)", limit),
        _ => "Request too large".to_string(),
    };
    tracing::warn!(limit = ?state.max_request_bytes, "request body exceeded configured limit");
    respond_with_error(
        StatusCode::PAYLOAD_TOO_LARGE,
        ErrorResponse::new(message, ErrorKind::ValidationError),
    )
}

/// Bodies that never become a [`GenerationRequest`] are answered here and
/// are not audited.
fn handle_json_rejection(
    state: &AppState,
    rejection: JsonRejection,
    start: Instant,
) -> axum::response::Response {
    if let JsonRejection::BytesRejection(BytesRejection::FailedToBufferBody(
        FailedToBufferBody::LengthLimitError(_),
    )) = &rejection
    {
        return too_large(state, None);
    }
    let message = rejection.body_text();
    tracing::warn!(status = %rejection.status(), error = %message, "rejected unparsable request body");
    state.metrics.observe(
        Some(ErrorKind::ValidationError),
        start.elapsed().as_millis() as u64,
    );
    respond_with_error(
        StatusCode::BAD_REQUEST,
        ErrorResponse::new(
            format!("Invalid request body: {}", message),
            ErrorKind::ValidationError,
        ),
    )
}

/// Health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "levels": Level::ALL,
        "maxPromptTokens": state.pipeline.config().max_prompt_tokens,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    let audit = state.pipeline.audit();
    let body = state
        .metrics
        .render(audit.records_total(), audit.write_errors_total());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
