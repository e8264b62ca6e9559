//! Application configuration
//!
//! Defaults come from the embedded `config.toml`; a handful of environment
//! variables (optionally loaded from `.env` by `main`) override them.

use crate::error::AppError;
use serde::Deserialize;
use std::time::Duration;

const CONFIG_TOML: &str = include_str!("../config.toml");

/// Environment variable overriding the model name
const MODEL_ENV: &str = "VISION_AGENT_MODEL";

/// Environment variable overriding the API base URL
const API_BASE_ENV: &str = "VISION_AGENT_API_BASE";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub gemini: GeminiSettings,
    pub analysis: AnalysisSettings,
    pub transcription: TranscriptionSettings,
}

/// Remote generation service settings
#[derive(Debug, Clone, Deserialize)]
pub struct GeminiSettings {
    pub model: String,
    pub api_base: String,
    /// Longest silence tolerated while waiting for the next streamed chunk
    pub stream_idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Video acquisition limits
#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisSettings {
    pub max_inline_bytes: u64,
    pub fetch_timeout_secs: u64,
}

/// Speech transcription service settings
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionSettings {
    pub api_base: String,
    pub language_code: String,
    pub poll_interval_ms: u64,
    pub operation_timeout_secs: u64,
}

impl GeminiSettings {
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl AnalysisSettings {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

impl TranscriptionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl Config {
    /// Parse a TOML document into a configuration
    pub fn from_toml(source: &str) -> Result<Self, AppError> {
        toml::from_str(source).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.gemini.model = model.trim().to_string();
        }
        if let Some(base) = lookup(API_BASE_ENV).filter(|v| !v.trim().is_empty()) {
            self.gemini.api_base = base.trim().trim_end_matches('/').to_string();
        }
        self
    }
}

/// Load configuration from embedded config.toml plus environment overrides
pub fn load_config() -> Result<Config, AppError> {
    let config = Config::from_toml(CONFIG_TOML)?;
    Ok(config.with_overrides(|key| std::env::var(key).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_config_parses() {
        let config = Config::from_toml(CONFIG_TOML).expect("embedded config must parse");
        assert_eq!(config.gemini.model, "gemini-2.5-flash");
        assert!(config.gemini.api_base.starts_with("https://"));
        assert_eq!(config.analysis.max_inline_bytes, 20 * 1024 * 1024);
        assert_eq!(config.gemini.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.transcription.language_code, "en-US");
        assert_eq!(config.transcription.operation_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_toml(CONFIG_TOML)
            .unwrap()
            .with_overrides(|key| match key {
                "VISION_AGENT_MODEL" => Some("gemini-2.5-pro".to_string()),
                "VISION_AGENT_API_BASE" => Some("http://127.0.0.1:9000/".to_string()),
                _ => None,
            });
        assert_eq!(config.gemini.model, "gemini-2.5-pro");
        assert_eq!(config.gemini.api_base, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_blank_override_ignored() {
        let config = Config::from_toml(CONFIG_TOML)
            .unwrap()
            .with_overrides(|_| Some("   ".to_string()));
        assert_eq!(config.gemini.model, "gemini-2.5-flash");
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = Config::from_toml("[gemini]\nmodel = 3");
        assert!(matches!(result, Err(AppError::Config(_))));
    }
}
