//! Configuration Module
//!
//! Settings are loaded once at startup from a YAML file (plus a few
//! environment overrides) and stay read-only for the process lifetime.
//! Per-request overrides arrive inline with the request payload and never
//! touch this struct (see `models::ExtensionSettings`).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fallback / CoT handler provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Handler {
    /// Self-hosted OpenAI-compatible backend (TabbyAPI and friends).
    TabbyApi,
    #[default]
    MistralAi,
    OpenRouter,
}

impl Handler {
    /// Provider base URI used when the endpoint settings leave it unset.
    pub fn default_base_uri(&self) -> Option<&'static str> {
        match self {
            Handler::TabbyApi => None,
            Handler::MistralAi => Some("https://api.mistral.ai/v1"),
            Handler::OpenRouter => Some("https://openrouter.ai/api/v1"),
        }
    }
}

impl std::str::FromStr for Handler {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tabby_api" | "tabbyapi" | "tabby" => Ok(Handler::TabbyApi),
            "mistral_ai" | "mistralai" | "mistral" => Ok(Handler::MistralAi),
            "open_router" | "openrouter" => Ok(Handler::OpenRouter),
            other => bail!("unknown handler: {other}"),
        }
    }
}

/// Credentials and model name for one provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EndpointSettings {
    /// Base URI including the version segment (e.g. "https://api.mistral.ai/v1").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_uri: Option<String>,

    #[serde(default)]
    pub api_key: String,

    /// Model used for auxiliary CoT calls against this provider.
    #[serde(default)]
    pub model: String,
}

/// Audit persistence switches.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    /// Persist every generated chain of thought.
    #[serde(default)]
    pub save_cot: bool,

    /// Persist the full augmented conversation of every request.
    #[serde(default)]
    pub save_full: bool,

    /// Directory for the JSONL audit files; records stay in memory when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub audit_dir: Option<String>,
}

/// Routing and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InferenceSettings {
    /// Base address of the primary OpenAI-compatible backend.
    #[serde(default)]
    pub primary_endpoint: String,

    /// Route to a fallback provider when the primary fails its health probe.
    #[serde(default = "default_true")]
    pub use_fallback: bool,

    /// Number of requests with a new user message that reuse the cached CoT
    /// before regeneration. 0 regenerates on every new message.
    #[serde(default)]
    pub cot_rotation: u32,

    /// Provider handling both auxiliary CoT calls and fallback traffic.
    #[serde(default)]
    pub cot_handler: Handler,

    /// Ordered model names cycled through on successive fallback requests.
    #[serde(default)]
    pub fallback_models: Vec<String>,

    #[serde(default)]
    pub tabby_api: EndpointSettings,

    #[serde(default)]
    pub mistral_ai: EndpointSettings,

    #[serde(default)]
    pub open_router: EndpointSettings,
}

fn default_true() -> bool {
    true
}

/// Optional file mirror for the tracker cache (crash resilience).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerCacheSettings {
    pub user_message_path: String,
    pub cot_message_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// CoT prompt template; `{character}` and `{username}` are substituted
    /// per request.
    #[serde(default)]
    pub prompt: String,

    /// Appended as a user turn when the conversation does not already end
    /// on one.
    #[serde(default = "default_prefill")]
    pub prefill: String,

    /// Final user turn framing the injected CoT for the downstream model.
    #[serde(default = "default_postfill")]
    pub postfill: String,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub inference: InferenceSettings,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tracker_cache: Option<TrackerCacheSettings>,
}

fn default_prefill() -> String {
    "[Continue.]".to_string()
}

fn default_postfill() -> String {
    "[Write the next reply as instructed, taking the thoughts in the chain_of_thought block into account.]".to_string()
}

impl Settings {
    /// Load settings from a YAML file and apply environment overrides.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file: {}", path.display()))?;
        let mut settings: Settings = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse settings file: {}", path.display()))?;
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    /// Environment beats the file for secrets and the primary address, so
    /// deployments can keep keys out of the config file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env("COTRELAY_PRIMARY_ENDPOINT") {
            self.inference.primary_endpoint = v;
        }
        if let Some(v) = non_empty_env("COTRELAY_TABBY_API_KEY") {
            self.inference.tabby_api.api_key = v;
        }
        if let Some(v) = non_empty_env("COTRELAY_MISTRAL_API_KEY") {
            self.inference.mistral_ai.api_key = v;
        }
        if let Some(v) = non_empty_env("COTRELAY_OPENROUTER_API_KEY") {
            self.inference.open_router.api_key = v;
        }
    }

    /// Reject configurations the request path must be able to assume away.
    pub fn validate(&self) -> Result<()> {
        if self.inference.primary_endpoint.trim().is_empty() {
            bail!("inference.primary_endpoint must be set");
        }
        if self.inference.use_fallback && self.inference.fallback_models.is_empty() {
            bail!("inference.use_fallback requires a non-empty inference.fallback_models list");
        }
        Ok(())
    }

    /// Endpoint settings for the given handler.
    pub fn endpoint(&self, handler: Handler) -> &EndpointSettings {
        match handler {
            Handler::TabbyApi => &self.inference.tabby_api,
            Handler::MistralAi => &self.inference.mistral_ai,
            Handler::OpenRouter => &self.inference.open_router,
        }
    }

    /// Resolved base URI for the given handler, honoring provider defaults.
    pub fn handler_base_uri(&self, handler: Handler) -> Option<String> {
        let endpoint = self.endpoint(handler);
        endpoint
            .base_uri
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| handler.default_base_uri().map(str::to_string))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
