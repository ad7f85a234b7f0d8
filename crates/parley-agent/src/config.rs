//! File configuration.
//!
//! A [`ParleyConfig`] is read from TOML (or JSON, chosen by extension) and
//! converted into the runtime settings the core actually consumes:
//! [`GenerationConfig`], [`RetentionPolicy`] and [`AgentConfig`].  Every field
//! has a default, so an empty or missing file yields a working setup.
//!
//! Credentials never live here; the caller supplies them separately.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{AgentError, Result};
use crate::generation::{BackoffPolicy, GenerationConfig};
use crate::llm::registry::Credentials;
use crate::memory::RetentionPolicy;
use crate::runtime::{AgentConfig, DEFAULT_CONTEXT_WINDOW};

/// Configuration file read when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "parley.toml";

/// Greeting used when the configuration does not name one.
pub const DEFAULT_GREETING: &str = "Hello! How can I assist you today?";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    pub provider: ProviderSection,
    pub generation: GenerationSection,
    pub memory: MemorySection,
    pub agent: AgentSection,
}

/// `[provider]`: which backend to talk to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// Registry id; the CLI asks when absent.
    pub id: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// `[generation]`: retry bounds and deadlines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub max_transport_retries: u32,
    pub max_validation_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            max_transport_retries: 2,
            max_validation_retries: 3,
            backoff_base_ms: 500,
            backoff_factor: 2.0,
            backoff_cap_ms: 8_000,
            request_timeout_secs: 120,
        }
    }
}

/// `[memory]`: retention and request window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub max_turns: Option<usize>,
    pub max_tokens: Option<usize>,
    /// Turns sent with each request.
    pub context_window: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            max_turns: None,
            max_tokens: None,
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }
}

/// `[agent]`: conversation presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub greeting: String,
    pub system_prompt: Option<String>,
    /// Stream replies when the backend supports it.
    pub stream: bool,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            greeting: DEFAULT_GREETING.to_owned(),
            system_prompt: None,
            stream: true,
        }
    }
}

impl ParleyConfig {
    /// Load a configuration file.
    ///
    /// A missing file is not an error: defaults are returned.  Files ending
    /// in `.json` are parsed as JSON, anything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::ConfigError`] if the file cannot be read, does
    /// not parse, or fails [`ParleyConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(path = %path.display(), "configuration file does not exist, using defaults");
            return Ok(Self::default());
        }
        Self::read(path)
    }

    /// Like [`ParleyConfig::load`], for a path the user never asked for.
    ///
    /// Its absence is routine, so it is only logged at info level.
    pub fn load_optional(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Self::default());
        }
        Self::read(path)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;

        let config = if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(|e| AgentError::ConfigError {
                reason: format!("failed to parse JSON config: {e}"),
            })?
        } else {
            Self::from_toml_str(&content)?
        };
        config.validate()?;

        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse a TOML document without validating it.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::ConfigError {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(AgentError::ConfigError {
                reason: reason.to_owned(),
            })
        };

        let generation = &self.generation;
        if !generation.backoff_factor.is_finite() || generation.backoff_factor < 1.0 {
            return invalid("generation.backoff_factor must be a finite number >= 1.0");
        }
        if generation.backoff_cap_ms < generation.backoff_base_ms {
            return invalid("generation.backoff_cap_ms must not be below backoff_base_ms");
        }
        if generation.request_timeout_secs == 0 {
            return invalid("generation.request_timeout_secs must be positive");
        }
        if self.memory.context_window == 0 {
            return invalid("memory.context_window must be positive");
        }
        if self.memory.max_turns == Some(0) {
            return invalid("memory.max_turns must be positive when set");
        }
        if self.agent.greeting.trim().is_empty() {
            return invalid("agent.greeting must not be empty");
        }
        Ok(())
    }

    /// Credentials for the configured provider, if one is named.
    ///
    /// The API key is left for the caller to attach.
    pub fn credentials(&self) -> Option<Credentials> {
        let id = self.provider.id.as_deref()?.trim();
        if id.is_empty() {
            return None;
        }
        let mut credentials = Credentials::new(id);
        if let Some(model) = &self.provider.model {
            credentials = credentials.with_model(model.clone());
        }
        if let Some(url) = &self.provider.base_url {
            credentials = credentials.with_base_url(url.clone());
        }
        Some(credentials)
    }
}

impl From<&GenerationSection> for GenerationConfig {
    fn from(section: &GenerationSection) -> Self {
        Self {
            max_transport_retries: section.max_transport_retries,
            max_validation_retries: section.max_validation_retries,
            backoff: BackoffPolicy {
                base: Duration::from_millis(section.backoff_base_ms),
                factor: section.backoff_factor,
                cap: Duration::from_millis(section.backoff_cap_ms),
            },
            request_timeout: Duration::from_secs(section.request_timeout_secs),
        }
    }
}

impl From<&MemorySection> for RetentionPolicy {
    fn from(section: &MemorySection) -> Self {
        Self {
            max_turns: section.max_turns,
            max_tokens: section.max_tokens,
        }
    }
}

impl From<&ParleyConfig> for AgentConfig {
    fn from(config: &ParleyConfig) -> Self {
        Self {
            context_window: config.memory.context_window,
            system_prompt: config.agent.system_prompt.clone(),
        }
    }
}
