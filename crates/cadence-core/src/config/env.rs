// crates/cadence-core/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use super::file::{CadenceConfig, ProviderKind};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// API keys loaded from environment variables, by provider name
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: BTreeMap<String, String>,
}

impl ApiKeys {
    /// Load the API key of every provider that declares `api_key_env`
    ///
    /// Set `CADENCE_DISABLE_LLM=1` to suppress all keys (forces scripted providers only)
    pub fn from_env(config: &CadenceConfig) -> Self {
        if parse_bool_env("CADENCE_DISABLE_LLM").unwrap_or(false) {
            info!("CADENCE_DISABLE_LLM is set - remote providers disabled");
            return Self::default();
        }

        let mut keys = BTreeMap::new();
        for (name, provider) in &config.providers {
            if let Some(var) = provider.api_key_env.as_deref()
                && let Some(key) = Self::read_key(var)
            {
                keys.insert(name.clone(), key);
            }
        }

        let api_keys = Self { keys };
        api_keys.log_status(config);
        api_keys
    }

    /// Build from explicit (provider, key) pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            keys: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Read a single API key from environment, filtering empty values
    fn read_key(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|k| !k.trim().is_empty())
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(String::as_str)
    }

    /// Log which remote providers have keys (without exposing values)
    fn log_status(&self, config: &CadenceConfig) {
        let missing: Vec<&str> = config
            .providers
            .iter()
            .filter(|(name, p)| p.kind == ProviderKind::OpenaiCompat && !self.keys.contains_key(*name))
            .map(|(name, _)| name.as_str())
            .collect();

        if !missing.is_empty() {
            warn!(providers = ?missing, "Remote providers without API keys will be skipped");
        } else {
            debug!(keys = ?self.keys.keys().collect::<Vec<_>>(), "API keys loaded");
        }
    }

    /// Get a summary of providers with keys
    pub fn summary(&self) -> String {
        if self.keys.is_empty() {
            "None".to_string()
        } else {
            self.keys.keys().cloned().collect::<Vec<_>>().join(", ")
        }
    }
}

/// Configuration validation result
#[derive(Debug)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl Default for ConfigValidation {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Fold another validation into this one
    pub fn merge(&mut self, other: ConfigValidation) {
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {}", err));
            }
        }

        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for warn in &self.warnings {
                lines.push(format!("  - {}", warn));
            }
        }

        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }
}

/// Environment configuration - all env vars in one place
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Config file override (CADENCE_CONFIG)
    pub config_path: Option<PathBuf>,
    /// API keys for remote providers
    pub api_keys: ApiKeys,
}

impl EnvConfig {
    /// Config file path: CADENCE_CONFIG if set, else ~/.cadence/config.toml
    pub fn config_path_from_env() -> PathBuf {
        std::env::var("CADENCE_CONFIG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(CadenceConfig::config_path)
    }

    /// Load all environment configuration (call once at startup)
    pub fn load(config: &CadenceConfig) -> Self {
        info!("Loading environment configuration");

        Self {
            config_path: std::env::var("CADENCE_CONFIG")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            api_keys: ApiKeys::from_env(config),
        }
    }

    /// Validate env against the file config
    pub fn validate(&self, config: &CadenceConfig) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        for (name, provider) in &config.providers {
            if provider.kind == ProviderKind::OpenaiCompat && self.api_keys.get(name).is_none() {
                validation.add_warning(format!(
                    "No API key for provider '{}' (set {})",
                    name,
                    provider.api_key_env.as_deref().unwrap_or("its api_key_env")
                ));
            }
        }

        if let Some(ref path) = self.config_path
            && !path.exists()
        {
            validation.add_warning(format!(
                "CADENCE_CONFIG points to missing file {}",
                path.display()
            ));
        }

        validation
    }
}

pub(crate) fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::ProviderConfig;

    #[test]
    fn test_api_keys_summary() {
        let keys = ApiKeys::default();
        assert_eq!(keys.summary(), "None");
        assert!(keys.get("openai").is_none());
    }

    #[test]
    fn test_api_keys_from_pairs() {
        let keys = ApiKeys::from_pairs([("openai", "sk-test"), ("groq", "gsk-test")]);
        assert_eq!(keys.get("openai"), Some("sk-test"));
        assert_eq!(keys.summary(), "groq, openai");
    }

    #[test]
    fn test_validation_report_ok() {
        let validation = ConfigValidation::new();
        assert!(validation.is_valid());
        assert_eq!(validation.report(), "Configuration OK");
    }

    #[test]
    fn test_validation_merge() {
        let mut a = ConfigValidation::new();
        a.add_warning("w1");
        let mut b = ConfigValidation::new();
        b.add_error("e1");
        a.merge(b);
        assert!(!a.is_valid());
        let report = a.report();
        assert!(report.contains("Errors:"));
        assert!(report.contains("  - e1"));
        assert!(report.contains("  - w1"));
    }

    #[test]
    fn test_env_validation_warns_missing_key() {
        let mut config = CadenceConfig::with_default_providers();
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                kind: ProviderKind::OpenaiCompat,
                base_url: Some("https://api.openai.com/v1".into()),
                api_key_env: Some("CADENCE_TEST_UNSET_KEY".into()),
                ..ProviderConfig::default()
            },
        );
        let env = EnvConfig {
            config_path: None,
            api_keys: ApiKeys::default(),
        };
        let validation = env.validate(&config);
        assert!(validation.is_valid());
        assert!(validation.warnings[0].contains("CADENCE_TEST_UNSET_KEY"));
    }
}
