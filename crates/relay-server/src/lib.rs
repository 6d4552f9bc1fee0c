//! # relay-server
//!
//! HTTP surface for the relay proxy. Provides:
//!
//! - chat ingress: `/v1/messages` (Anthropic dialect) and
//!   `/v1/chat/completions` (OpenAI dialect), JSON or SSE
//! - `/v1/models` with the synthetic `custom-model` alias
//! - health, metrics, and the model-pool / endpoint-group / provider admin API

pub mod admin;
pub mod metrics;
pub mod tracker;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use parking_lot::RwLock;
use relay_core::{CUSTOM_MODEL, Priority, RelayError};
use relay_dispatch::{DispatchOutcome, Dispatcher, IngressDialect, IngressMeta};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use relay_config::RelayConfig;

pub use metrics::Metrics;
pub use tracker::RequestTracker;

/// Shared server state.
pub struct AppState {
    pub config: Arc<RwLock<RelayConfig>>,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Metrics,
    pub tracker: Arc<RequestTracker>,
}

/// Build the Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ingress_routes = Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(models_handler));

    // Admin routes sit behind the bearer token when one is configured.
    let mut admin_routes = admin::routes();
    if state.config.read().server.api_key.is_some() {
        admin_routes = admin_routes.layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));
    }

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/recent", get(metrics_recent_handler))
        .route("/metrics/prometheus", get(prometheus_handler))
        .merge(ingress_routes)
        .merge(admin_routes)
        .with_state(Arc::clone(&state));

    if state.config.read().server.cors {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until shutdown.
pub async fn serve(state: Arc<AppState>) -> relay_core::Result<()> {
    let addr = state.config.read().server.listen.clone();
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "relay listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Middleware that checks the Authorization header against the configured
/// API key.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected) = state.config.read().server.api_key.clone() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match provided {
            Some(key) if key == expected => {}
            _ => {
                warn!("unauthorized admin request");
                return Err(StatusCode::UNAUTHORIZED);
            }
        }
    }
    Ok(next.run(request).await)
}

// ── Ingress ────────────────────────────────────────────────────

/// First matching header value among the given names.
fn first_header<'a>(headers: &'a HeaderMap, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
}

/// Assemble the per-request facts from headers and the parsed body.
fn ingress_meta(headers: &HeaderMap, dialect: IngressDialect, stream: bool) -> IngressMeta {
    let request_id = first_header(headers, &["x-request-id"])
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    IngressMeta {
        request_id,
        session_id: first_header(headers, &["x-session-id", "session-id"]).map(String::from),
        conversation_id: first_header(headers, &["x-conversation-id", "conversation-id"])
            .map(String::from),
        priority: first_header(headers, &["x-ccr-priority"])
            .map(Priority::from_header)
            .unwrap_or_default(),
        dialect,
        stream,
    }
}

async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    ingress(state, headers, body, IngressDialect::Anthropic).await
}

async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    ingress(state, headers, body, IngressDialect::OpenAi).await
}

async fn ingress(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Value,
    dialect: IngressDialect,
) -> Response {
    state.metrics.inc_http_requests();
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if stream {
        state.metrics.inc_stream_requests();
    } else {
        state.metrics.inc_chat_requests();
    }

    let meta = ingress_meta(&headers, dialect, stream);
    let request_id = meta.request_id.clone();

    match state.dispatcher.handle(body, meta).await {
        Ok(DispatchOutcome::Json(json)) => Json(json).into_response(),
        Ok(DispatchOutcome::Stream(rx)) => {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .header("x-request-id", request_id)
                .body(Body::from_stream(stream))
                .unwrap()
        }
        Err(err) => {
            state.metrics.inc_http_errors();
            error_response(err)
        }
    }
}

/// JSON error body `{error, code?}` with the status derived from the
/// normalized error.
fn error_response(err: RelayError) -> Response {
    let status = StatusCode::from_u16(err.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({"error": err.to_string()});
    if let Some(code) = err.code() {
        body["code"] = json!(code.as_str());
    }
    (status, Json(body)).into_response()
}

// ── Models / health / metrics ──────────────────────────────────

/// OpenAI-shaped model list: every enabled provider's models as
/// `provider,model` ids, plus the synthetic `custom-model`.
async fn models_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.metrics.inc_http_requests();
    let created = chrono::Utc::now().timestamp();
    let mut data = vec![json!({
        "id": CUSTOM_MODEL,
        "object": "model",
        "created": created,
        "owned_by": "relay",
    })];
    for provider in state.dispatcher.registry().list() {
        if !provider.enabled {
            continue;
        }
        for model in &provider.models {
            data.push(json!({
                "id": format!("{},{}", provider.name, model),
                "object": "model",
                "created": created,
                "owned_by": provider.name,
            }));
        }
    }
    Json(json!({"object": "list", "data": data}))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.metrics.inc_http_requests();
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

#[derive(serde::Deserialize)]
struct MetricsParams {
    #[serde(rename = "timeWindow")]
    time_window: Option<u64>,
    provider: Option<String>,
}

async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(params): axum::extract::Query<MetricsParams>,
) -> Json<Value> {
    let stats = state
        .tracker
        .aggregate(params.time_window, params.provider.as_deref());
    Json(json!({
        "uptime_secs": state.metrics.uptime_secs(),
        "stats": stats,
    }))
}

#[derive(serde::Deserialize)]
struct RecentParams {
    limit: Option<usize>,
    provider: Option<String>,
}

async fn metrics_recent_handler(
    State(state): State<Arc<AppState>>,
    axum::extract::Query(params): axum::extract::Query<RecentParams>,
) -> Json<Value> {
    let records = state
        .tracker
        .recent(params.limit.unwrap_or(50), params.provider.as_deref());
    Json(json!({"records": records}))
}

async fn prometheus_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}
