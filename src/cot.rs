//! Chain-of-thought generation.
//!
//! Decides per request whether the CoT block must be regenerated, performs
//! the auxiliary chat-completion call when it must, and commits the result
//! to the tracker. The whole phase runs inside one [`Tracker`] session so
//! concurrent requests cannot interleave their decisions, and a request
//! cancelled mid-call drops its session without storing anything.

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Handler, Settings};
use crate::models::{CompletionRequest, ExtensionSettings, Message};
use crate::tracker::Tracker;

#[derive(Error, Debug)]
pub enum CotError {
    #[error("auxiliary completion request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("auxiliary completion returned status {0}")]
    UpstreamStatus(reqwest::StatusCode),
    #[error("auxiliary completion returned no usable content")]
    EmptyCompletion,
    #[error("no base URI configured for CoT handler {0:?}")]
    MissingEndpoint(Handler),
}

/// Substitute the `{character}` and `{username}` placeholders in the CoT
/// prompt template.
fn render_prompt(template: &str, character: &str, username: &str) -> String {
    template
        .replace("{character}", character)
        .replace("{username}", username)
}

/// Auxiliary conversation: the caller's messages followed by one user turn
/// holding the rendered CoT prompt.
fn build_aux_messages(original: &[Message], prompt: String) -> Vec<Message> {
    let mut messages = Vec::with_capacity(original.len() + 1);
    messages.extend_from_slice(original);
    messages.push(Message::user(prompt));
    messages
}

/// First choice's message content, if the completion carries any.
fn extract_completion_text(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Produce the CoT text for this request: the cached block when the
/// regeneration policy allows it, a freshly generated one otherwise.
///
/// A regeneration that yields no usable content is an error; the caller
/// must abort the request rather than forward a stale or missing CoT.
pub async fn ensure_chain_of_thought(
    client: &reqwest::Client,
    settings: &Settings,
    overrides: &ExtensionSettings,
    handler: Handler,
    request: &CompletionRequest,
    last_user_message: &str,
    tracker: &Tracker,
) -> Result<String, CotError> {
    let rotation_limit = overrides
        .cot_rotation
        .unwrap_or(settings.inference.cot_rotation);

    let mut session = tracker.begin_cot().await;
    if !session.decide(last_user_message, rotation_limit, overrides.force_cot) {
        debug!("reusing cached chain of thought");
        return Ok(session.cached_cot());
    }

    let base_uri = settings
        .handler_base_uri(handler)
        .ok_or(CotError::MissingEndpoint(handler))?;
    let endpoint = settings.endpoint(handler);

    let template = overrides.cot_prompt.as_deref().unwrap_or(&settings.prompt);
    let character = overrides.character.as_deref().unwrap_or("Character");
    let username = overrides.username.as_deref().unwrap_or("user");
    let aux_messages = build_aux_messages(
        &request.messages,
        render_prompt(template, character, username),
    );

    let url = format!("{}/chat/completions", base_uri.trim_end_matches('/'));
    let body = serde_json::json!({
        "model": endpoint.model,
        "messages": aux_messages,
        "stream": false,
    });

    info!(handler = ?handler, model = %endpoint.model, "generating chain of thought");
    let response = client
        .post(&url)
        .header("content-type", "application/json")
        .bearer_auth(&endpoint.api_key)
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(CotError::UpstreamStatus(status));
    }

    let payload: serde_json::Value = response.json().await?;
    let text = extract_completion_text(&payload).ok_or(CotError::EmptyCompletion)?;
    let wrapped = format!("<chain_of_thought>{text}</chain_of_thought>");

    session.store(last_user_message, &wrapped).await;
    Ok(wrapped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_prompt_substitutes_both_placeholders() {
        let rendered = render_prompt(
            "Think as {character} about what {username} said.",
            "Aria",
            "sam",
        );
        assert_eq!(rendered, "Think as Aria about what sam said.");
    }

    #[test]
    fn aux_conversation_appends_prompt_as_user_turn() {
        let original = vec![Message::user("Hi"), Message::assistant("Hello")];
        let messages = build_aux_messages(&original, "prompt".into());
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2], Message::user("prompt"));
    }

    #[test]
    fn extract_completion_text_reads_first_choice() {
        let payload = json!({
            "choices": [{"message": {"role": "assistant", "content": "  deep thoughts  "}}]
        });
        assert_eq!(
            extract_completion_text(&payload).as_deref(),
            Some("deep thoughts")
        );
    }

    #[test]
    fn empty_or_missing_content_is_unusable() {
        assert!(extract_completion_text(&json!({"choices": []})).is_none());
        assert!(extract_completion_text(&json!({
            "choices": [{"message": {"content": "   "}}]
        }))
        .is_none());
        assert!(extract_completion_text(&json!({
            "choices": [{"message": {"content": null}}]
        }))
        .is_none());
    }
}
