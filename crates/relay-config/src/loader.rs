use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::RelayConfig;

/// Loads and optionally hot-reloads the relay configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<RelayConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > RELAY_CONFIG env > ~/.relay/relay.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("RELAY_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
            .join("relay.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> relay_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<RelayConfig>(&raw).map_err(|e| {
                relay_core::RelayError::Config(format!(
                    "failed to parse {}: {}",
                    config_path.display(),
                    e
                ))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            RelayConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        // Validate config — log warnings, fail on errors
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => {
                return Err(relay_core::RelayError::Config(e));
            }
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> RelayConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<RelayConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (RELAY_LISTEN, RELAY_LOG_LEVEL, etc.)
    fn apply_env_overrides(mut config: RelayConfig) -> RelayConfig {
        if let Ok(v) = std::env::var("RELAY_LISTEN") {
            config.server.listen = v;
        }
        if let Ok(v) = std::env::var("RELAY_LOG_LEVEL") {
            config.logging.level = v;
        }
        if let Ok(v) = std::env::var("RELAY_DEFAULT_ROUTE") {
            config.router.default = v;
        }
        if let Ok(v) = std::env::var("RELAY_API_KEY") {
            config.server.api_key = Some(v);
        }
        config
    }

    /// Reload the config from disk.
    pub fn reload(&self) -> relay_core::Result<()> {
        if !self.config_path.exists() {
            return Err(relay_core::RelayError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.config_path)?;
        let new_config = toml::from_str::<RelayConfig>(&raw).map_err(|e| {
            relay_core::RelayError::Config(format!(
                "failed to parse {}: {}",
                self.config_path.display(),
                e
            ))
        })?;
        let new_config = Self::apply_env_overrides(new_config);
        if let Err(e) = new_config.validate() {
            return Err(relay_core::RelayError::Config(format!(
                "reloaded config rejected: {e}"
            )));
        }
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that triggers `reload()` when the config
    /// file changes. Returns a handle that must be kept alive.
    pub fn watch(&self) -> relay_core::Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let watch_path = config_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<NotifyEvent, _>| {
            let Ok(event) = res else { return };
            if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                return;
            }
            let raw = match std::fs::read_to_string(&config_path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "config reload: read failed");
                    return;
                }
            };
            match toml::from_str::<RelayConfig>(&raw) {
                Ok(new_config) => {
                    let new_config = Self::apply_env_overrides(new_config);
                    match new_config.validate() {
                        Ok(_) => {
                            *config.write() = new_config;
                            info!("configuration hot-reloaded");
                        }
                        Err(e) => warn!(error = %e, "config reload rejected by validation"),
                    }
                }
                Err(e) => warn!(error = %e, "config reload: parse failed, keeping previous"),
            }
        })
        .map_err(|e| relay_core::RelayError::Config(format!("watcher setup failed: {e}")))?;

        let dir = watch_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| relay_core::RelayError::Config(format!("watch failed: {e}")))?;

        Ok(watcher)
    }
}
