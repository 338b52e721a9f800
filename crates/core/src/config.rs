//! JSON-based configuration (§6, §10.3). A missing file is treated as
//! defaults, not an error, so the proxy runs unconfigured out of the box.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Direct,
    Translated,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Direct
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub mode: Mode,
    pub anthropic_base_url: String,
    pub openrouter_base_url: String,
    /// Family name (`sonnet` | `opus` | `haiku`) -> upstream model id.
    pub model_mapping: HashMap<String, String>,
    pub default_model: String,
    pub request_timeout_secs: u64,
    pub bind_address: String,
    pub log_level: String,
    pub store_capacity: usize,
    pub store_retention_hours: u64,
}

impl Default for Config {
    fn default() -> Self {
        let mut model_mapping = HashMap::new();
        model_mapping.insert("sonnet".to_string(), "anthropic/claude-3.5-sonnet".to_string());
        model_mapping.insert("opus".to_string(), "anthropic/claude-3-opus".to_string());
        model_mapping.insert("haiku".to_string(), "anthropic/claude-3.5-haiku".to_string());

        Config {
            mode: Mode::default(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            openrouter_base_url: "https://openrouter.ai/api".to_string(),
            model_mapping,
            default_model: "anthropic/claude-3.5-sonnet".to_string(),
            request_timeout_secs: 120,
            bind_address: "127.0.0.1:8085".to_string(),
            log_level: "info".to_string(),
            store_capacity: 1000,
            store_retention_hours: 24,
        }
    }
}

const RECOGNIZED_FAMILIES: [&str; 3] = ["sonnet", "opus", "haiku"];

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            log::info!("no config file at {}, using defaults", path.display());
            return Ok(Config::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for url in [&self.anthropic_base_url, &self.openrouter_base_url] {
            reqwest::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("invalid upstream base url {url:?}: {e}"))?;
        }
        for family in self.model_mapping.keys() {
            if !RECOGNIZED_FAMILIES.contains(&family.as_str()) {
                anyhow::bail!(
                    "unrecognized model family {family:?}, expected one of {RECOGNIZED_FAMILIES:?}"
                );
            }
        }
        Ok(())
    }

    /// Resolves a client-supplied model name to the upstream model id to
    /// send, per §4.2 step 5. An absent or empty `requested` falls back to
    /// `default_model`.
    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        let requested = match requested {
            Some(r) if !r.is_empty() => r,
            _ => return self.default_model.clone(),
        };
        let lower = requested.to_lowercase();
        for family in RECOGNIZED_FAMILIES {
            if lower.contains(family) {
                if let Some(mapped) = self.model_mapping.get(family) {
                    return mapped.clone();
                }
            }
        }
        requested.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/config.json")).unwrap();
        assert_eq!(config.mode, Mode::Direct);
    }

    #[test]
    fn resolves_known_family() {
        let config = Config::default();
        assert_eq!(config.resolve_model(Some("claude-3-5-sonnet-20241022")), "anthropic/claude-3.5-sonnet");
        assert_eq!(config.resolve_model(Some("gpt-4")), "gpt-4");
    }

    #[test]
    fn absent_model_falls_back_to_default() {
        let config = Config::default();
        assert_eq!(config.resolve_model(None), config.default_model);
        assert_eq!(config.resolve_model(Some("")), config.default_model);
    }
}
