//! Promptgate configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main promptgate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address configuration
    pub server: ServerConfig,

    /// Proxy behavior: templates, timeouts, streaming emulation
    pub proxy: ProxyConfig,

    /// Generation parameters forwarded to the upstream API
    pub generation: GenerationConfig,

    /// Log level override (CLI flag takes precedence)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.fake_streaming.heartbeat_interval_secs < 1 {
            return Err(eyre::eyre!(
                "fake-streaming heartbeat-interval-secs must be at least 1, got {}",
                self.proxy.fake_streaming.heartbeat_interval_secs
            ));
        }
        if self.proxy.request_timeout_secs < 10 {
            return Err(eyre::eyre!(
                "proxy request-timeout-secs must be at least 10, got {}",
                self.proxy.request_timeout_secs
            ));
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(eyre::eyre!(
                "generation temperature must be in [0, 2], got {}",
                self.generation.temperature
            ));
        }
        if !(0.0..=1.0).contains(&self.generation.top_p) {
            return Err(eyre::eyre!(
                "generation top-p must be in [0, 1], got {}",
                self.generation.top_p
            ));
        }
        if self.generation.max_tokens == 0 {
            return Err(eyre::eyre!("generation max-tokens must be positive"));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .promptgate.yml
        let local_config = PathBuf::from(".promptgate.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/promptgate/promptgate.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("promptgate").join("promptgate.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Listen address configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Bind port
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Proxy behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Template applied when the request ends with user input
    #[serde(rename = "template-with-input")]
    pub template_with_input: PathBuf,

    /// Template applied when it does not
    #[serde(rename = "template-without-input")]
    pub template_without_input: PathBuf,

    /// Upstream request timeout in seconds
    #[serde(rename = "request-timeout-secs")]
    pub request_timeout_secs: u64,

    /// Fake streaming emulation
    #[serde(rename = "fake-streaming")]
    pub fake_streaming: FakeStreamingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            template_with_input: PathBuf::from("templates/with_input.yaml"),
            template_without_input: PathBuf::from("templates/without_input.yaml"),
            request_timeout_secs: 60,
            fake_streaming: FakeStreamingConfig::default(),
        }
    }
}

/// Fake streaming emulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeStreamingConfig {
    /// When enabled, streaming requests are served by the emulator instead
    /// of a passthrough relay
    pub enabled: bool,

    /// Seconds between heartbeat chunks while the upstream call is pending
    #[serde(rename = "heartbeat-interval-secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for FakeStreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat_interval_secs: 1,
        }
    }
}

/// Generation parameters sent upstream
///
/// Client-supplied values for these are ignored; the operator decides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f64,

    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    #[serde(rename = "top-p")]
    pub top_p: f64,

    #[serde(rename = "frequency-penalty")]
    pub frequency_penalty: f64,

    #[serde(rename = "presence-penalty")]
    pub presence_penalty: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            max_tokens: 4096,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.proxy.request_timeout_secs, 60);
        assert!(config.proxy.fake_streaming.enabled);
        assert_eq!(config.proxy.fake_streaming.heartbeat_interval_secs, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 9001

proxy:
  template-with-input: /etc/promptgate/with.yaml
  template-without-input: /etc/promptgate/without.yaml
  request-timeout-secs: 120
  fake-streaming:
    enabled: false
    heartbeat-interval-secs: 5

generation:
  temperature: 0.7
  max-tokens: 2048

log-level: debug
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9001);
        assert_eq!(
            config.proxy.template_with_input,
            PathBuf::from("/etc/promptgate/with.yaml")
        );
        assert_eq!(config.proxy.request_timeout_secs, 120);
        assert!(!config.proxy.fake_streaming.enabled);
        assert_eq!(config.proxy.fake_streaming.heartbeat_interval_secs, 5);
        assert_eq!(config.generation.temperature, 0.7);
        assert_eq!(config.generation.max_tokens, 2048);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let yaml = r#"
server:
  port: 3000
"#;

        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.generation.max_tokens, 4096);
        assert!(config.proxy.fake_streaming.enabled);
    }

    #[test]
    fn test_validate_rejects_zero_heartbeat() {
        let mut config = Config::default();
        config.proxy.fake_streaming.heartbeat_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_timeout() {
        let mut config = Config::default();
        config.proxy.request_timeout_secs = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_temperature() {
        let mut config = Config::default();
        config.generation.temperature = 3.5;
        assert!(config.validate().is_err());
    }
}
