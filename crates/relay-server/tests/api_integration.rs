use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use parking_lot::RwLock;
use relay_config::{ProviderConfig, RelayConfig};
use relay_core::{ErrorCode, ProviderError, RelayError, RequestContext};
use relay_dispatch::{Dispatcher, Provider, Upstream, UpstreamReply};
use relay_pool::{EndpointGroupManager, ModelPool};
use relay_server::{AppState, Metrics, RequestTracker, build_router};
use relay_transform::Transformer;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Upstream that succeeds for every provider except ones named "failing".
struct StubUpstream;

#[async_trait]
impl Upstream for StubUpstream {
    async fn send(
        &self,
        provider: &Provider,
        _ctx: &RequestContext,
        _body: &Value,
        _stream: bool,
        _auth: Option<Arc<dyn Transformer>>,
        _cancel: &CancellationToken,
    ) -> relay_core::Result<UpstreamReply> {
        if provider.name == "failing" {
            return Err(RelayError::Provider(
                ProviderError::new(ErrorCode::ModelError, "boom", 500)
                    .retryable(false)
                    .with_provider(provider.name.clone()),
            ));
        }
        Ok(UpstreamReply::Json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}],
        })))
    }
}

fn provider(name: &str) -> ProviderConfig {
    ProviderConfig {
        name: name.into(),
        kind: "openai".into(),
        base_url: format!("https://{name}.example.com/v1"),
        api_keys: vec!["key".into()],
        models: vec!["m-large".into(), "m-small".into()],
        ..Default::default()
    }
}

fn app() -> Router {
    let mut config = RelayConfig::default();
    config.router.default = "acme,m-large".into();
    let config = Arc::new(RwLock::new(config));
    let snapshot = config.read().clone();

    let pool = ModelPool::new(snapshot.model_pool.clone());
    let endpoints = EndpointGroupManager::new(
        snapshot.endpoint_rate_limiting.clone(),
        snapshot.model_pool.clone(),
    );
    let registry = relay_dispatch::ProviderRegistry::from_config(&[
        provider("acme"),
        provider("failing"),
    ]);
    let tracker = RequestTracker::new(
        snapshot.metrics.retention_ms,
        snapshot.metrics.max_records,
    );
    let dispatcher = Dispatcher::new(
        Arc::clone(&config),
        pool,
        endpoints,
        registry,
        Arc::new(StubUpstream),
    )
    .with_observer(tracker.clone());

    let state = Arc::new(AppState {
        config,
        dispatcher,
        metrics: Metrics::new(),
        tracker,
    });
    build_router(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["timestamp"].is_string());
}

#[tokio::test]
async fn test_models_lists_custom_model_and_providers() {
    let response = app()
        .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let ids: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"custom-model"));
    assert!(ids.contains(&"acme,m-large"));
}

#[tokio::test]
async fn test_chat_completion_explicit_model() {
    let response = app()
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "acme,m-large", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["message"]["content"], "ok");
}

#[tokio::test]
async fn test_custom_model_routes_to_default() {
    let response = app()
        .oneshot(post_json(
            "/v1/messages",
            json!({"model": "custom-model", "messages": [{"role": "user", "content": "hi"}], "max_tokens": 16}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // The anthropic ingress dialect gets an anthropic-shaped response back.
    let json = body_json(response).await;
    assert_eq!(json["role"], "assistant");
}

#[tokio::test]
async fn test_upstream_error_maps_status_and_code() {
    let response = app()
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "failing,m-large", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("boom"));
    assert_eq!(json["code"], "model_error");
}

#[tokio::test]
async fn test_unknown_provider_is_404() {
    let response = app()
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "ghost,m", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "provider_not_found");
}

#[tokio::test]
async fn test_model_pool_status_reflects_traffic() {
    let app = app();
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "acme,m-large", "messages": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::get("/model-pool/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    let slots = json["slots"].as_array().unwrap();
    let slot = slots
        .iter()
        .find(|s| s["provider"] == "acme" && s["model"] == "m-large")
        .unwrap();
    assert_eq!(slot["active"], 0);
    assert_eq!(slot["success_count"], 1);
}

#[tokio::test]
async fn test_metrics_aggregation_after_requests() {
    let app = app();
    for _ in 0..3 {
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/chat/completions",
                json!({"model": "acme,m-large", "messages": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["stats"]["total_requests"], 3);
    assert_eq!(json["stats"]["successes"], 3);

    let response = app
        .oneshot(
            Request::get("/metrics/recent?limit=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["records"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_provider_crud_and_toggle() {
    let app = app();

    // Create.
    let response = app
        .clone()
        .oneshot(post_json(
            "/providers",
            json!({
                "name": "newbie",
                "kind": "anthropic",
                "base_url": "https://newbie.example.com/v1",
                "api_keys": ["k"],
                "models": ["n-1"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Read back; keys are reported as a count only.
    let response = app
        .clone()
        .oneshot(Request::get("/providers/newbie").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["kind"], "anthropic");
    assert_eq!(json["api_keys"], 1);

    // Toggle off.
    let response = app
        .clone()
        .oneshot(
            Request::post("/providers/newbie/toggle")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["enabled"], false);

    // Delete, then 404.
    let response = app
        .clone()
        .oneshot(
            Request::delete("/providers/newbie")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .oneshot(Request::get("/providers/newbie").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reset_circuit_breakers_endpoint() {
    let app = app();
    let response = app
        .oneshot(
            Request::post("/model-pool/reset-circuit-breakers")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["ok"], true);
}
