use dashmap::DashMap;
use parking_lot::Mutex;
use relay_core::{DialectFamily, RelayError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use relay_config::{ProviderConfig, TransformerSpec};

/// Runtime view of one configured provider.
#[derive(Debug)]
pub struct Provider {
    pub name: String,
    pub family: DialectFamily,
    pub base_url: String,
    pub models: Vec<String>,
    pub headers: HashMap<String, String>,
    pub transformer: Option<TransformerSpec>,
    pub enabled: bool,
    api_keys: Vec<String>,
    /// Round-robin cursor, advanced under this provider's lock.
    key_cursor: Mutex<usize>,
}

impl Provider {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            name: config.name.clone(),
            family: DialectFamily::parse(&config.kind).unwrap_or(DialectFamily::OpenAi),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            models: config.models.clone(),
            headers: config.headers.clone(),
            transformer: config.transformer.clone(),
            enabled: config.enabled,
            api_keys: config.api_keys.clone(),
            key_cursor: Mutex::new(0),
        }
    }

    /// The next API key, rotating round-robin. Empty when none configured.
    pub fn next_key(&self) -> String {
        if self.api_keys.is_empty() {
            return String::new();
        }
        let mut cursor = self.key_cursor.lock();
        let key = self.api_keys[*cursor % self.api_keys.len()].clone();
        *cursor = cursor.wrapping_add(1);
        key
    }

    pub fn key_count(&self) -> usize {
        self.api_keys.len()
    }
}

/// Process-wide provider table. Owned by the dispatcher; the admin API
/// mutates it through the CRUD operations.
pub struct ProviderRegistry {
    providers: DashMap<String, Arc<Provider>>,
}

impl ProviderRegistry {
    pub fn from_config(configs: &[ProviderConfig]) -> Arc<Self> {
        let registry = Arc::new(Self {
            providers: DashMap::new(),
        });
        for config in configs {
            registry.upsert(config);
        }
        registry
    }

    pub fn get(&self, name: &str) -> Result<Arc<Provider>> {
        self.providers
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| RelayError::ProviderNotFound(name.to_string()))
    }

    /// An enabled provider, or `ProviderNotFound` when missing or disabled.
    pub fn get_enabled(&self, name: &str) -> Result<Arc<Provider>> {
        let provider = self.get(name)?;
        if !provider.enabled {
            return Err(RelayError::ProviderNotFound(format!("{name} (disabled)")));
        }
        Ok(provider)
    }

    pub fn list(&self) -> Vec<Arc<Provider>> {
        self.providers.iter().map(|kv| Arc::clone(kv.value())).collect()
    }

    /// Insert or replace a provider from its config.
    pub fn upsert(&self, config: &ProviderConfig) {
        info!(provider = %config.name, base_url = %config.base_url, "registering provider");
        self.providers
            .insert(config.name.clone(), Arc::new(Provider::from_config(config)));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.providers.remove(name).is_some()
    }

    /// Flip a provider's enabled flag. Returns the new state.
    pub fn toggle(&self, name: &str) -> Result<bool> {
        let current = self.get(name)?;
        let enabled = !current.enabled;
        let replacement = Provider {
            name: current.name.clone(),
            family: current.family,
            base_url: current.base_url.clone(),
            models: current.models.clone(),
            headers: current.headers.clone(),
            transformer: current.transformer.clone(),
            enabled,
            api_keys: current.api_keys.clone(),
            key_cursor: Mutex::new(*current.key_cursor.lock()),
        };
        info!(provider = name, enabled, "provider toggled");
        self.providers
            .insert(name.to_string(), Arc::new(replacement));
        Ok(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            kind: "openai".into(),
            base_url: "https://api.example.com/v1/".into(),
            api_keys: vec!["k1".into(), "k2".into(), "k3".into()],
            models: vec!["m".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_key_rotation_round_robin() {
        let p = Provider::from_config(&config("p"));
        assert_eq!(p.next_key(), "k1");
        assert_eq!(p.next_key(), "k2");
        assert_eq!(p.next_key(), "k3");
        assert_eq!(p.next_key(), "k1");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let p = Provider::from_config(&config("p"));
        assert_eq!(p.base_url, "https://api.example.com/v1");
    }

    #[test]
    fn test_toggle_flips_enabled() {
        let registry = ProviderRegistry::from_config(&[config("p")]);
        assert!(registry.get_enabled("p").is_ok());
        assert_eq!(registry.toggle("p").unwrap(), false);
        assert!(registry.get_enabled("p").is_err());
        assert!(registry.get("p").is_ok());
        assert_eq!(registry.toggle("p").unwrap(), true);
        assert!(registry.get_enabled("p").is_ok());
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ProviderRegistry::from_config(&[]);
        assert!(matches!(
            registry.get("nope").unwrap_err(),
            RelayError::ProviderNotFound(_)
        ));
    }

    #[test]
    fn test_remove() {
        let registry = ProviderRegistry::from_config(&[config("p")]);
        assert!(registry.remove("p"));
        assert!(!registry.remove("p"));
    }
}
