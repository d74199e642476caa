// crates/cadence-core/src/llm/factory.rs
// Provider registry: builds adapters from [providers.<name>] config

use crate::config::{ApiKeys, CadenceConfig, ProviderKind};
use crate::llm::openai_compat::OpenAiCompatClient;
use crate::llm::provider::ProviderAdapter;
use crate::llm::scripted::ScriptedProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Adapters by provider name
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: BTreeMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every declared provider that can be constructed.
    ///
    /// Remote providers whose `api_key_env` is set but empty are skipped; their
    /// candidates then fail at call time and trip the breaker like any outage.
    pub fn from_config(config: &CadenceConfig, keys: &ApiKeys) -> Self {
        let mut registry = Self::new();

        for (name, provider) in &config.providers {
            match provider.kind {
                ProviderKind::Scripted => {
                    registry.insert(Arc::new(ScriptedProvider::from_config(name, provider)));
                }
                ProviderKind::OpenaiCompat => {
                    let key = keys.get(name).map(str::to_string);
                    if provider.api_key_env.is_some() && key.is_none() {
                        warn!(provider = %name, "No API key, provider not initialized");
                        continue;
                    }
                    let Some(base_url) = provider.base_url.as_deref() else {
                        warn!(provider = %name, "No base_url, provider not initialized");
                        continue;
                    };
                    match OpenAiCompatClient::new(
                        name.clone(),
                        base_url,
                        key,
                        Duration::from_secs(provider.request_timeout_secs),
                    ) {
                        Ok(client) => registry.insert(Arc::new(client)),
                        Err(e) => warn!(provider = %name, error = %e, "Failed to build client"),
                    }
                }
            }
        }

        info!(providers = ?registry.names(), "LLM providers available");
        registry
    }

    /// Register an adapter under its own name, replacing any previous one
    pub fn insert(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .finish()
    }
}
