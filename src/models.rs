//! Wire types for the completion relay.
//!
//! Inbound requests are parsed twice from the same payload: once into
//! [`CompletionRequest`] for validation and reshaping, and once into
//! [`ExtensionSettings`] for the per-request overrides. The raw JSON value is
//! kept alongside so primary-mode forwarding preserves provider extension
//! fields the structs do not model.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Conversation role. Input is matched case-insensitively ("User" and
/// "user" are the same role); output is always lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl Serialize for Role {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(de::Error::unknown_variant(
                other,
                &["system", "user", "assistant"],
            )),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Inbound chat-completion request, reduced to the fields the relay reads
/// and reshapes. Unknown fields survive in the raw payload, not here.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub messages: Vec<Message>,

    #[serde(default)]
    pub stream: bool,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default)]
    pub presence_penalty: f32,

    #[serde(default)]
    pub frequency_penalty: f32,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_top_p() -> f32 {
    1.0
}

impl CompletionRequest {
    /// Last user-role message in the conversation, the anchor for the CoT
    /// regeneration decision.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }
}

/// Per-request override bundle read inline from the completion payload.
/// Every field shadows the corresponding `Settings` value for the duration
/// of the request only.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExtensionSettings {
    pub username: Option<String>,
    pub character: Option<String>,
    pub cot_prompt: Option<String>,
    pub cot_rotation: Option<u32>,
    /// Parsed lazily so an unknown handler fails routing, not body parsing.
    pub fallback_handler: Option<String>,
    pub fallback_models: Option<Vec<String>>,
    #[serde(default)]
    pub force_cot: bool,
}

/// Payload keys consumed by [`ExtensionSettings`]; stripped before the body
/// is forwarded so overrides never leak to a backend.
const EXTENSION_FIELDS: &[&str] = &[
    "username",
    "character",
    "cot_prompt",
    "cot_rotation",
    "fallback_handler",
    "fallback_models",
    "force_cot",
];

pub fn strip_extension_fields(payload: &mut serde_json::Value) {
    if let Some(obj) = payload.as_object_mut() {
        for key in EXTENSION_FIELDS {
            obj.remove(*key);
        }
    }
}

/// Shared fields of every outbound fallback request.
#[derive(Debug, Clone, Serialize)]
pub struct BaseCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
}

impl BaseCompletionRequest {
    /// Carry the caller's sampling parameters over to a fallback provider,
    /// swapping in the rotated model and the augmented conversation.
    pub fn from_inbound(
        inbound: &CompletionRequest,
        model: impl Into<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: inbound.stream,
            max_tokens: inbound.max_tokens,
            temperature: inbound.temperature,
            top_p: inbound.top_p,
            presence_penalty: inbound.presence_penalty,
            frequency_penalty: inbound.frequency_penalty,
        }
    }
}

/// Mistral chat-completion shape: base fields plus Mistral's seed and
/// safety flag spellings.
#[derive(Debug, Clone, Serialize)]
pub struct MistralCompletionRequest {
    #[serde(flatten)]
    pub base: BaseCompletionRequest,
    pub random_seed: u32,
    pub safe_prompt: bool,
}

/// OpenRouter chat-completion shape: base fields plus `seed` and the
/// nucleus-probability floor.
#[derive(Debug, Clone, Serialize)]
pub struct OpenRouterCompletionRequest {
    #[serde(flatten)]
    pub base: BaseCompletionRequest,
    pub seed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
}

/// Outbound request variants keyed by destination provider. Each variant
/// serializes to that provider's exact JSON shape.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProviderRequest {
    Base(BaseCompletionRequest),
    Mistral(MistralCompletionRequest),
    OpenRouter(OpenRouterCompletionRequest),
}

impl ProviderRequest {
    pub fn mistral(base: BaseCompletionRequest) -> Self {
        ProviderRequest::Mistral(MistralCompletionRequest {
            base,
            random_seed: rand::random::<u32>() >> 1,
            safe_prompt: false,
        })
    }

    pub fn open_router(base: BaseCompletionRequest) -> Self {
        ProviderRequest::OpenRouter(OpenRouterCompletionRequest {
            base,
            seed: rand::random::<u32>() >> 1,
            min_p: Some(0.05),
        })
    }
}
