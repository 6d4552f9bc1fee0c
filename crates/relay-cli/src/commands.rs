use parking_lot::RwLock;
use relay_core::{RelayError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use relay_config::ConfigLoader;
use relay_dispatch::{Dispatcher, ProviderRegistry, UpstreamClient};
use relay_pool::{EndpointGroupManager, ModelPool};
use relay_server::{AppState, Metrics, RequestTracker};
use relay_transform::ErrorClassifier;

fn relay_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".relay")
}

fn pid_path() -> PathBuf {
    relay_dir().join("relay.pid")
}

fn install_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

pub(super) async fn cmd_start(config_path: Option<&Path>, log_level: Option<&str>) -> Result<()> {
    let loader = ConfigLoader::load(config_path)?;
    let config = loader.get();
    let level = log_level.unwrap_or(&config.logging.level);
    install_tracing(level, &config.logging.format);

    println!("relay v{}", env!("CARGO_PKG_VERSION"));
    println!("   listen:  {}", config.server.listen);
    println!("   route:   {}", config.router.default);
    println!("   providers: {}", config.providers.len());
    println!();

    // Config hot-reload watcher, kept alive for the process lifetime.
    let _watcher = match loader.watch() {
        Ok(w) => Some(w),
        Err(e) => {
            tracing::warn!(error = %e, "config hot-reload disabled");
            None
        }
    };

    // PID file for stop/restart.
    std::fs::create_dir_all(relay_dir())?;
    std::fs::write(pid_path(), std::process::id().to_string())?;

    let shared_config: Arc<RwLock<_>> = loader.shared();

    let pool = ModelPool::new(config.model_pool.clone());
    let endpoints = EndpointGroupManager::new(
        config.endpoint_rate_limiting.clone(),
        config.model_pool.clone(),
    );
    let registry = ProviderRegistry::from_config(&config.providers);
    for provider in &config.providers {
        endpoints.register_provider(provider.base_url.trim_end_matches('/'), &provider.name);
    }

    let classifier = Arc::new(ErrorClassifier::with_defaults());
    let upstream = Arc::new(UpstreamClient::new(classifier));

    let tracker = RequestTracker::new(config.metrics.retention_ms, config.metrics.max_records);
    let dispatcher = Dispatcher::new(
        Arc::clone(&shared_config),
        Arc::clone(&pool),
        endpoints,
        registry,
        upstream,
    )
    .with_observer(tracker.clone());

    let _ticker = pool.start_ticker();
    let _sweeper = tracker.start_sweeper();

    let state = Arc::new(AppState {
        config: shared_config,
        dispatcher,
        metrics: Metrics::new(),
        tracker,
    });

    let served = relay_server::serve(state).await;
    let _ = std::fs::remove_file(pid_path());
    served
}

pub(super) fn cmd_stop() -> Result<()> {
    let path = pid_path();
    let raw = std::fs::read_to_string(&path)
        .map_err(|_| RelayError::Config("relay is not running (no PID file)".into()))?;
    let pid: u32 = raw
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("malformed PID file: {}", path.display())))?;

    let status = std::process::Command::new("kill")
        .arg(pid.to_string())
        .status()?;
    if !status.success() {
        // Stale PID file; clean it up so the next start is not blocked.
        let _ = std::fs::remove_file(&path);
        return Err(RelayError::Config(format!(
            "process {pid} not running, removed stale PID file"
        )));
    }
    let _ = std::fs::remove_file(&path);
    println!("stopped relay (pid {pid})");
    Ok(())
}

pub(super) async fn cmd_status(config_path: Option<&Path>) -> Result<()> {
    let loader = ConfigLoader::load(config_path)?;
    let listen = loader.get().server.listen;
    let url = format!("http://{listen}/health");

    let response = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .map_err(|e| RelayError::Config(format!("relay is not reachable at {listen}: {e}")))?;
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| RelayError::Config(format!("bad health response: {e}")))?;

    info!(%listen, %status, "health checked");
    println!("relay at {listen}: {}", body["status"].as_str().unwrap_or("unknown"));
    Ok(())
}
