use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout_secs: 120,
            max_retries: 2,
            retry_delay_ms: 250,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    /// Characters of the first message kept as the title of a lazily created session.
    pub title_max_chars: usize,
    /// Capacity of the controller's broadcast event channel.
    pub event_capacity: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            title_max_chars: 30,
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file, with `DOCCHAT__SECTION__KEY` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::with_name(path))
            .add_source(Environment::with_prefix("DOCCHAT").separator("__"))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    /// Like [`ClientConfig::load`], but a missing file falls back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("DOCCHAT").separator("__"))
            .build()?;
        Ok(s.try_deserialize()?)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.api.base_url = base_url.into();
        self
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> &str {
        self.api.base_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use std::io::Write;

    #[test]
    fn test_defaults_are_complete() {
        let config = ClientConfig::default();
        assert_eq!(config.api.base_url, "http://127.0.0.1:8000");
        assert_eq!(config.conversation.title_max_chars, 30);
        assert!(config.conversation.event_capacity > 0);
    }

    #[test]
    fn test_base_url_strips_trailing_slash() {
        let config = ClientConfig::default().with_base_url("http://example.test/api/");
        assert_eq!(config.base_url(), "http://example.test/api");
    }

    #[test]
    fn test_load_partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docchat.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[api]\nbase_url = \"http://10.0.0.5:9000\"\ntimeout_secs = 5\nmax_retries = 0\nretry_delay_ms = 10").unwrap();

        let config = ClientConfig::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.api.base_url, "http://10.0.0.5:9000");
        assert_eq!(config.api.max_retries, 0);
        assert_eq!(config.conversation.title_max_chars, 30);
    }

    #[test]
    fn test_malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docchat.toml");
        std::fs::write(&path, "[api]\ntimeout_secs = \"soon\"\n").unwrap();

        let err = ClientConfig::load_or_default(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ChatError::Config(_)));
    }

    #[test]
    fn test_load_or_default_tolerates_missing_file() {
        let config = ClientConfig::load_or_default("/nonexistent/docchat-test-config").unwrap();
        assert_eq!(config.conversation.event_capacity, 256);
    }
}
