//! Fallback routing.
//!
//! Primary mode forwards the augmented request to the primary endpoint
//! unchanged in shape. Fallback mode picks the configured handler provider,
//! rotates through the fallback-model list round robin, and reshapes the
//! body to the provider's schema.

use thiserror::Error;

use crate::config::{Handler, Settings};
use crate::models::{
    BaseCompletionRequest, CompletionRequest, ExtensionSettings, Message, ProviderRequest,
};
use crate::tracker::Tracker;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("unrecognized fallback handler: {0}")]
    UnknownHandler(String),
    #[error("no base URI configured for fallback handler {0:?}")]
    MissingEndpoint(Handler),
    #[error("fallback requested with an empty fallback-model list")]
    EmptyModelList,
}

/// Destination for the augmented request.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Forward to the primary endpoint, shape untouched.
    Primary,
    /// Forward to the selected fallback provider with a rotated model.
    Fallback {
        handler: Handler,
        base_uri: String,
        api_key: String,
        model: String,
    },
}

/// Resolve the handler for this request, honoring the inline override.
/// An unrecognized override is fatal for the request, never downgraded.
pub fn resolve_handler(
    overrides: &ExtensionSettings,
    settings: &Settings,
) -> Result<Handler, RouteError> {
    match overrides.fallback_handler.as_deref() {
        Some(raw) => raw
            .parse()
            .map_err(|_| RouteError::UnknownHandler(raw.to_string())),
        None => Ok(settings.inference.cot_handler),
    }
}

/// Pick the destination from the probe result and settings. Fallback mode
/// advances the shared response round (round robin over the model list).
pub async fn choose_route(
    alive: bool,
    settings: &Settings,
    overrides: &ExtensionSettings,
    handler: Handler,
    tracker: &Tracker,
) -> Result<Route, RouteError> {
    if alive || !settings.inference.use_fallback {
        return Ok(Route::Primary);
    }

    let models = overrides
        .fallback_models
        .as_ref()
        .unwrap_or(&settings.inference.fallback_models);
    if models.is_empty() {
        // The loader rejects this configuration at startup; only an inline
        // override can get us here.
        return Err(RouteError::EmptyModelList);
    }

    let index = tracker.advance_response_round(models.len()).await;
    let base_uri = settings
        .handler_base_uri(handler)
        .ok_or(RouteError::MissingEndpoint(handler))?;

    Ok(Route::Fallback {
        handler,
        base_uri,
        api_key: settings.endpoint(handler).api_key.clone(),
        model: models[index].clone(),
    })
}

/// Reshape the outbound body to the destination provider's schema. The
/// caller's sampling parameters are preserved; provider-specific fields are
/// added per variant.
pub fn reshape_request(
    handler: Handler,
    inbound: &CompletionRequest,
    model: &str,
    messages: Vec<Message>,
) -> ProviderRequest {
    let base = BaseCompletionRequest::from_inbound(inbound, model, messages);
    match handler {
        Handler::TabbyApi => ProviderRequest::Base(base),
        Handler::MistralAi => ProviderRequest::mistral(base),
        Handler::OpenRouter => ProviderRequest::open_router(base),
    }
}
