//! Provider registry.
//!
//! Maps a provider id to everything needed to talk to it: default model,
//! encoding mode, streaming support, endpoint and whether a credential is
//! required.  Resolution happens once per session and yields an immutable
//! [`BackendDescriptor`] plus a ready adapter.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use url::Url;

use crate::error::{AgentError, Result};
use crate::llm::adapter::EncodedAdapter;
use crate::llm::client::{DEFAULT_REQUEST_TIMEOUT, OpenAiCompatTransport};
use crate::llm::transport::ChatTransport;
use crate::llm::types::{BackendDescriptor, EncodingMode};

/// Default `max_tokens` sent with every request.
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// Key sent to providers that do not check one.
const PLACEHOLDER_API_KEY: &str = "ollama";

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One registered provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEntry {
    pub provider_id: String,
    pub default_model_id: String,
    pub encoding_mode: EncodingMode,
    pub supports_streaming: bool,
    pub base_url: String,
    pub requires_credential: bool,
    pub default_params: Map<String, Value>,
}

impl ProviderEntry {
    /// An OpenAI-compatible entry with the default request parameters.
    pub fn new(
        provider_id: impl Into<String>,
        default_model_id: impl Into<String>,
        encoding_mode: EncodingMode,
        base_url: impl Into<String>,
    ) -> Self {
        let mut default_params = Map::new();
        default_params.insert("max_tokens".into(), json!(DEFAULT_MAX_TOKENS));
        Self {
            provider_id: provider_id.into(),
            default_model_id: default_model_id.into(),
            encoding_mode,
            supports_streaming: true,
            base_url: base_url.into(),
            requires_credential: true,
            default_params,
        }
    }

    pub fn without_credential(mut self) -> Self {
        self.requires_credential = false;
        self
    }

    pub fn without_streaming(mut self) -> Self {
        self.supports_streaming = false;
        self
    }
}

/// What the caller supplies to select a backend.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub provider_id: String,
    pub api_key: Option<String>,
    /// Overrides the entry's endpoint.
    pub base_url: Option<String>,
    /// Overrides the entry's default model.
    pub model_id: Option<String>,
}

impl Credentials {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Self::default()
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_id = Some(model.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("provider_id", &self.provider_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model_id", &self.model_id)
            .finish()
    }
}

/// The outcome of resolving credentials against the registry.
#[derive(Clone, PartialEq)]
pub struct ResolvedBackend {
    pub descriptor: BackendDescriptor,
    pub base_url: String,
    pub api_key: Option<String>,
}

impl fmt::Debug for ResolvedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedBackend")
            .field("descriptor", &self.descriptor)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registered providers, keyed by lowercase id.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    entries: BTreeMap<String, ProviderEntry>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

fn normalize(provider_id: &str) -> String {
    provider_id.trim().to_lowercase()
}

impl ProviderRegistry {
    /// A registry with no providers.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// The built-in providers.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for entry in [
            ProviderEntry::new(
                "openai",
                "gpt-4o-mini",
                EncodingMode::ToolCall,
                "https://api.openai.com/v1",
            ),
            ProviderEntry::new(
                "anthropic",
                "claude-3-5-haiku-20241022",
                EncodingMode::ToolCall,
                "https://api.anthropic.com/v1",
            ),
            ProviderEntry::new(
                "groq",
                "mixtral-8x7b-32768",
                EncodingMode::Json,
                "https://api.groq.com/openai/v1",
            ),
            ProviderEntry::new(
                "ollama",
                "llama3",
                EncodingMode::Json,
                "http://localhost:11434/v1",
            )
            .without_credential(),
            ProviderEntry::new(
                "gemini",
                "gemini-2.0-flash-exp",
                EncodingMode::Json,
                "https://generativelanguage.googleapis.com/v1beta/openai",
            ),
            ProviderEntry::new(
                "openrouter",
                "mistral/ministral-8b",
                EncodingMode::ToolCall,
                "https://openrouter.ai/api/v1",
            ),
            ProviderEntry::new(
                "nebius",
                "Qwen/Qwen3-30B-A3B",
                EncodingMode::ToolCall,
                "https://api.studio.nebius.com/v1",
            ),
        ] {
            registry.register(entry);
        }
        registry
    }

    /// Add or replace an entry.
    pub fn register(&mut self, mut entry: ProviderEntry) {
        entry.provider_id = normalize(&entry.provider_id);
        self.entries.insert(entry.provider_id.clone(), entry);
    }

    pub fn get(&self, provider_id: &str) -> Option<&ProviderEntry> {
        self.entries.get(&normalize(provider_id))
    }

    /// Registered ids in sorted order.
    pub fn provider_ids(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProviderEntry> {
        self.entries.values()
    }

    /// Resolve credentials into a descriptor and endpoint.
    ///
    /// # Errors
    ///
    /// - [`AgentError::UnsupportedProvider`] for an unknown id.
    /// - [`AgentError::MissingCredential`] when a required key is absent or
    ///   blank.
    /// - [`AgentError::ConfigError`] when the endpoint is not a valid
    ///   http(s) URL.
    pub fn resolve(&self, credentials: &Credentials) -> Result<ResolvedBackend> {
        let entry = self
            .get(&credentials.provider_id)
            .ok_or_else(|| AgentError::UnsupportedProvider {
                provider: credentials.provider_id.trim().to_owned(),
            })?;

        let api_key = credentials
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_owned);
        let api_key = match (api_key, entry.requires_credential) {
            (Some(key), _) => Some(key),
            (None, true) => {
                return Err(AgentError::MissingCredential {
                    provider: entry.provider_id.clone(),
                });
            }
            (None, false) => Some(PLACEHOLDER_API_KEY.to_owned()),
        };

        let base_url = credentials
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(entry.base_url.as_str());
        validate_base_url(base_url)?;

        let model_id = credentials
            .model_id
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(entry.default_model_id.as_str())
            .to_owned();

        Ok(ResolvedBackend {
            descriptor: BackendDescriptor {
                provider_id: entry.provider_id.clone(),
                model_id,
                encoding_mode: entry.encoding_mode,
                supports_streaming: entry.supports_streaming,
                default_params: entry.default_params.clone(),
            },
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    /// Resolve credentials and build an adapter over the HTTP transport.
    ///
    /// Performs no network I/O.
    pub fn build_adapter(&self, credentials: &Credentials) -> Result<EncodedAdapter> {
        self.build_adapter_with_timeout(credentials, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn build_adapter_with_timeout(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<EncodedAdapter> {
        self.build_adapter_with(credentials, |resolved| {
            let transport: Arc<dyn ChatTransport> = Arc::new(OpenAiCompatTransport::new(
                resolved.descriptor.provider_id.clone(),
                resolved.base_url.clone(),
                resolved.api_key.clone(),
                timeout,
            )?);
            Ok(transport)
        })
    }

    /// Resolve credentials and build an adapter over a caller-supplied
    /// transport.
    pub fn build_adapter_with<F>(&self, credentials: &Credentials, make_transport: F) -> Result<EncodedAdapter>
    where
        F: FnOnce(&ResolvedBackend) -> Result<Arc<dyn ChatTransport>>,
    {
        let resolved = self.resolve(credentials)?;
        let transport = make_transport(&resolved)?;
        tracing::info!(
            provider = %resolved.descriptor.provider_id,
            model = %resolved.descriptor.model_id,
            mode = %resolved.descriptor.encoding_mode,
            "backend resolved"
        );
        Ok(EncodedAdapter::new(resolved.descriptor, transport))
    }
}

fn validate_base_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw).map_err(|e| AgentError::ConfigError {
        reason: format!("invalid base URL `{raw}`: {e}"),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(AgentError::ConfigError {
            reason: format!("base URL `{raw}` must use http or https, not `{other}`"),
        }),
    }
}
