//! Configuration loading for the generation endpoint and chat defaults.
//!
//! Settings come from `<config_dir>/muse/config.toml`, with environment
//! variables taking precedence for the endpoint identity:
//! `MUSE_API_KEY`, `MUSE_MODEL`, `MUSE_COMPLETIONS_URL`.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;

use muse_providers::{ApiKey, EndpointConfig, RequestOptions};

use crate::endpoint::HttpGenerationEndpoint;

/// Model used when neither config file nor environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("no API key configured (set MUSE_API_KEY or [api] key)")]
    MissingApiKey,
}

#[derive(Debug, Default, Deserialize)]
pub struct MuseConfig {
    pub api: Option<ApiSection>,
    pub chat: Option<ChatSection>,
}

#[derive(Default, Deserialize)]
pub struct ApiSection {
    pub key: Option<String>,
    pub model: Option<String>,
    pub completions_url: Option<String>,
}

// Manual Debug impl to prevent leaking API keys in logs.
impl std::fmt::Debug for ApiSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSection")
            .field(
                "key",
                &if self.key.is_some() { "[REDACTED]" } else { "None" },
            )
            .field("model", &self.model)
            .field("completions_url", &self.completions_url)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatSection {
    /// Seeded system prompt for new conversations.
    pub system_prompt: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Where the config file is expected to live.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("muse").join("config.toml"))
}

impl MuseConfig {
    /// Load from the default location, then apply environment overrides.
    /// A missing file is not an error; everything has a default or is
    /// supplied by the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply endpoint-identity overrides from a key/value source
    /// (the process environment in production).
    pub(crate) fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        let api = self.api.get_or_insert_with(Default::default);
        if let Some(key) = get("MUSE_API_KEY") {
            api.key = Some(key);
        }
        if let Some(model) = get("MUSE_MODEL") {
            api.model = Some(model);
        }
        if let Some(url) = get("MUSE_COMPLETIONS_URL") {
            api.completions_url = Some(url);
        }
    }

    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.chat.as_ref()?.system_prompt.as_deref()
    }

    /// Build the production endpoint from this configuration.
    pub fn endpoint(&self) -> Result<HttpGenerationEndpoint, ConfigError> {
        let api = self.api.as_ref();
        let key = api
            .and_then(|a| a.key.clone())
            .ok_or(ConfigError::MissingApiKey)?;
        let model = api
            .and_then(|a| a.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let mut endpoint_config = EndpointConfig::new(ApiKey::new(key), model);
        if let Some(url) = api.and_then(|a| a.completions_url.clone()) {
            endpoint_config = endpoint_config.with_completions_url(url);
        }

        let chat = self.chat.as_ref();
        let options = RequestOptions {
            max_output_tokens: chat.and_then(|c| c.max_output_tokens),
            temperature: chat.and_then(|c| c.temperature),
        };

        Ok(HttpGenerationEndpoint::new(endpoint_config).with_options(options))
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, MuseConfig};

    const SAMPLE: &str = r#"
[api]
key = "sk-test"
model = "gpt-4o"

[chat]
system_prompt = "You help plan marketing campaigns."
max_output_tokens = 2048
temperature = 0.7
"#;

    #[test]
    fn parses_full_config() {
        let config: MuseConfig = toml::from_str(SAMPLE).unwrap();
        let api = config.api.as_ref().unwrap();
        assert_eq!(api.key.as_deref(), Some("sk-test"));
        assert_eq!(api.model.as_deref(), Some("gpt-4o"));
        assert_eq!(
            config.system_prompt(),
            Some("You help plan marketing campaigns.")
        );
        assert!(config.endpoint().is_ok());
    }

    #[test]
    fn empty_config_has_no_endpoint() {
        let config = MuseConfig::default();
        assert!(matches!(config.endpoint(), Err(ConfigError::MissingApiKey)));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config: MuseConfig = toml::from_str(SAMPLE).unwrap();
        config.apply_overrides(|key| match key {
            "MUSE_API_KEY" => Some("sk-override".to_string()),
            "MUSE_MODEL" => Some("gpt-4o-mini".to_string()),
            _ => None,
        });
        let api = config.api.as_ref().unwrap();
        assert_eq!(api.key.as_deref(), Some("sk-override"));
        assert_eq!(api.model.as_deref(), Some("gpt-4o-mini"));
        // Untouched fields survive
        assert!(config.system_prompt().is_some());
    }

    #[test]
    fn overrides_apply_without_a_config_file() {
        let mut config = MuseConfig::default();
        config.apply_overrides(|key| (key == "MUSE_API_KEY").then(|| "sk-env-only".to_string()));
        assert!(config.endpoint().is_ok());
    }

    #[test]
    fn debug_redacts_api_key() {
        let config: MuseConfig = toml::from_str(SAMPLE).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-test"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn load_from_reads_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = MuseConfig::load_from(&path).unwrap();
        assert!(config.endpoint().is_ok());

        let bad = dir.path().join("missing.toml");
        assert!(matches!(
            MuseConfig::load_from(&bad),
            Err(ConfigError::Read { .. })
        ));

        std::fs::write(&path, "not = [valid").unwrap();
        assert!(matches!(
            MuseConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
