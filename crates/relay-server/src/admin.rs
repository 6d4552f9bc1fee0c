//! Admin API: model-pool and endpoint-group state, circuit-breaker and queue
//! controls, and provider CRUD.

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use relay_core::{RelayError, RouteTarget};
use serde_json::{Value, json};
use std::sync::Arc;

use relay_config::ProviderConfig;

use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/model-pool/status", get(pool_status))
        .route("/model-pool/queue", get(pool_queue))
        .route("/model-pool/config", get(pool_config))
        .route("/model-pool/reset-circuit-breakers", post(pool_reset_breakers))
        .route("/model-pool/clear-queue", post(pool_clear_queue))
        .route("/endpoint-groups/status", get(endpoint_status))
        .route(
            "/endpoint-groups/reset-circuit-breakers",
            post(endpoint_reset_breakers),
        )
        .route("/providers", get(providers_list).post(providers_create))
        .route(
            "/providers/{id}",
            get(providers_get)
                .put(providers_update)
                .delete(providers_delete),
        )
        .route("/providers/{id}/toggle", post(providers_toggle))
}

// ── Model pool ─────────────────────────────────────────────────

async fn pool_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"slots": state.dispatcher.pool().snapshot()}))
}

async fn pool_queue(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({"queues": state.dispatcher.pool().queue_snapshot()}))
}

async fn pool_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.config.read().clone();
    Json(json!({
        "model_pool": config.model_pool,
        "model_selector": config.model_selector,
        "endpoint_rate_limiting": config.endpoint_rate_limiting,
    }))
}

async fn pool_reset_breakers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let reset = state.dispatcher.pool().reset_circuit_breakers();
    Json(json!({"ok": true, "reset": reset}))
}

#[derive(serde::Deserialize, Default)]
struct ClearQueueBody {
    provider: Option<String>,
    model: Option<String>,
}

async fn pool_clear_queue(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ClearQueueBody>>,
) -> Json<Value> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let target = match (body.provider, body.model) {
        (Some(p), Some(m)) => Some(RouteTarget::new(p, m)),
        _ => None,
    };
    let cleared = state.dispatcher.pool().clear_queue(target.as_ref());
    Json(json!({"ok": true, "cleared": cleared}))
}

// ── Endpoint groups ────────────────────────────────────────────

async fn endpoint_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "enabled": state.dispatcher.endpoints().enabled(),
        "endpoints": state.dispatcher.endpoints().snapshot(),
    }))
}

async fn endpoint_reset_breakers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let reset = state.dispatcher.endpoints().reset_circuit_breakers();
    Json(json!({"ok": true, "reset": reset}))
}

// ── Providers ──────────────────────────────────────────────────

/// Public view of a provider. API keys never leave the process; only the
/// count is reported.
fn provider_view(provider: &relay_dispatch::Provider) -> Value {
    json!({
        "name": provider.name,
        "kind": provider.family.as_str(),
        "base_url": provider.base_url,
        "models": provider.models,
        "api_keys": provider.key_count(),
        "enabled": provider.enabled,
    })
}

async fn providers_list(State(state): State<Arc<AppState>>) -> Json<Value> {
    let providers: Vec<Value> = state
        .dispatcher
        .registry()
        .list()
        .iter()
        .map(|p| provider_view(p))
        .collect();
    Json(json!({"providers": providers}))
}

async fn providers_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.dispatcher.registry().get(&id) {
        Ok(provider) => Json(provider_view(&provider)).into_response(),
        Err(err) => not_found(err),
    }
}

async fn providers_create(
    State(state): State<Arc<AppState>>,
    Json(config): Json<ProviderConfig>,
) -> Response {
    if config.name.is_empty() || config.base_url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "name and base_url are required"})),
        )
            .into_response();
    }
    state.dispatcher.registry().upsert(&config);
    state
        .dispatcher
        .endpoints()
        .register_provider(config.base_url.trim_end_matches('/'), &config.name);
    (StatusCode::CREATED, Json(json!({"ok": true}))).into_response()
}

async fn providers_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut config): Json<ProviderConfig>,
) -> Response {
    if state.dispatcher.registry().get(&id).is_err() {
        return not_found(RelayError::ProviderNotFound(id));
    }
    config.name = id;
    state.dispatcher.registry().upsert(&config);
    Json(json!({"ok": true})).into_response()
}

async fn providers_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.dispatcher.registry().get(&id) {
        Ok(provider) => {
            state
                .dispatcher
                .endpoints()
                .remove_provider(&provider.base_url, &provider.name);
            state.dispatcher.registry().remove(&id);
            Json(json!({"ok": true})).into_response()
        }
        Err(err) => not_found(err),
    }
}

async fn providers_toggle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.dispatcher.registry().toggle(&id) {
        Ok(enabled) => Json(json!({"ok": true, "enabled": enabled})).into_response(),
        Err(err) => not_found(err),
    }
}

fn not_found(err: RelayError) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": err.to_string()})),
    )
        .into_response()
}
