use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use http::StatusCode;
use tracing::{error, info, warn};

use crate::augment::augment_messages;
use crate::cot::ensure_chain_of_thought;
use crate::fallback::{choose_route, reshape_request, resolve_handler, Route};
use crate::liveness::is_alive;
use crate::models::{strip_extension_fields, CompletionRequest, ExtensionSettings};
use crate::relay::{relay_buffered, relay_streaming, RelayCancellation};
use crate::util::{error_response, AppState};

/// Configure Actix-web routes with AppState. The catch-all pass-through
/// sits last so the augmenting endpoints win.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/v1/thought", web::get().to(last_thought))
            .route("/{path:.*}", web::get().to(generic_get))
            .route("/{path:.*}", web::post().to(generic_post)),
    );
}

fn bearer_token(value: &str) -> Option<String> {
    let value = value.trim();
    if value.len() >= 7 && value[..6].eq_ignore_ascii_case("bearer") {
        Some(value[6..].trim().to_string())
    } else {
        None
    }
}

/// Propagate only Authorization (Bearer tokens rewritten) and x-api-key
/// from the inbound request; every other inbound header stays behind.
fn apply_forward_headers(
    mut rb: reqwest::RequestBuilder,
    req: &HttpRequest,
) -> reqwest::RequestBuilder {
    if let Some(auth) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        rb = match bearer_token(auth) {
            Some(token) => rb.bearer_auth(token),
            None => rb.header("authorization", auth),
        };
    }
    if let Some(key) = req.headers().get("x-api-key").and_then(|v| v.to_str().ok()) {
        rb = rb.header("x-api-key", key);
    }
    rb
}

/// Core operation: parse and validate, run the liveness probe and the CoT
/// phase concurrently, augment the conversation, route, and relay.
async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> impl Responder {
    info!("completion relay was called");

    let mut payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "failed to parse request body");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to parse request body",
            );
        }
    };
    let request: CompletionRequest = match serde_json::from_value(payload.clone()) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "request body is not a completion request");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "request body is not a completion request",
            );
        }
    };
    if request.messages.is_empty() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "request contains no messages",
        );
    }
    let Some(last_user_message) = request.last_user_message().map(|m| m.content.clone()) else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "request contains no user message",
        );
    };
    let overrides: ExtensionSettings = match serde_json::from_value(payload.clone()) {
        Ok(overrides) => overrides,
        Err(e) => {
            error!(error = %e, "invalid extension override fields");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "invalid extension override fields",
            );
        }
    };

    let settings = &state.settings;
    let handler = match resolve_handler(&overrides, settings) {
        Ok(handler) => handler,
        Err(e) => {
            error!(error = %e, "handler resolution failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    // No data dependency between the probe and the CoT phase; both must
    // finish before routing.
    let (alive, cot_result) = tokio::join!(
        is_alive(&state.http, &settings.inference.primary_endpoint),
        ensure_chain_of_thought(
            &state.http,
            settings,
            &overrides,
            handler,
            &request,
            &last_user_message,
            &state.tracker,
        ),
    );
    let cot_text = match cot_result {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "chain of thought generation failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("chain of thought generation failed: {e}"),
            );
        }
    };

    let extended = augment_messages(
        &request.messages,
        &cot_text,
        &settings.prefill,
        &settings.postfill,
    );

    if let Some(audit) = &state.audit {
        if settings.logging.save_cot {
            if let Err(e) = audit.record_thought(&cot_text).await {
                warn!(error = %e, "failed to record chain of thought");
            }
        }
        if settings.logging.save_full {
            if let Err(e) = audit.record_chat(&extended).await {
                warn!(error = %e, "failed to record augmented chat");
            }
        }
    }

    let route = match choose_route(alive, settings, &overrides, handler, &state.tracker).await {
        Ok(route) => route,
        Err(e) => {
            error!(error = %e, "fallback routing failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let mut rb = match route {
        Route::Primary => {
            // Keep the caller's shape: swap in the augmented messages and
            // drop the override keys, everything else passes through.
            let messages_value = match serde_json::to_value(&extended) {
                Ok(value) => value,
                Err(e) => {
                    error!(error = %e, "failed to serialize augmented messages");
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "failed to serialize augmented messages",
                    );
                }
            };
            strip_extension_fields(&mut payload);
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("messages".to_string(), messages_value);
            }
            let url = format!(
                "{}/v1/chat/completions",
                settings.inference.primary_endpoint.trim_end_matches('/')
            );
            apply_forward_headers(
                state
                    .http
                    .post(&url)
                    .header("content-type", "application/json")
                    .json(&payload),
                &req,
            )
        }
        Route::Fallback {
            handler,
            base_uri,
            api_key,
            model,
        } => {
            info!(handler = ?handler, model = %model, "primary offline, routing to fallback");
            let outbound = reshape_request(handler, &request, &model, extended);
            let url = format!("{}/chat/completions", base_uri.trim_end_matches('/'));
            state
                .http
                .post(&url)
                .header("content-type", "application/json")
                .header("x-api-key", api_key.clone())
                .bearer_auth(api_key)
                .json(&outbound)
        }
    };

    if request.stream {
        rb = rb.header("accept", "text/event-stream");
        match rb.send().await {
            Ok(upstream) => relay_streaming(upstream, RelayCancellation::new()),
            Err(e) => {
                warn!(error = %e, "proxied call failed");
                return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        }
    } else {
        match rb.send().await {
            Ok(upstream) => relay_buffered(upstream).await,
            Err(e) => {
                warn!(error = %e, "proxied call failed");
                return error_response(StatusCode::BAD_GATEWAY, &e.to_string());
            }
        }
    }
}

/// Most recently persisted chain of thought, as `{content}`.
async fn last_thought(state: web::Data<AppState>) -> impl Responder {
    if !state.settings.logging.save_cot {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Saving CoT is disabled in settings.",
        );
    }
    let Some(audit) = &state.audit else {
        return error_response(StatusCode::BAD_REQUEST, "CoT audit store is not configured.");
    };

    match audit.latest_thought().await {
        Ok(Some(record)) => {
            HttpResponse::Ok().json(serde_json::json!({ "content": record.content }))
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no chain of thought recorded yet"),
        Err(e) => {
            error!(error = %e, "failed to read latest chain of thought");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Catch-all GET pass-through: liveness-gated, no augmentation.
async fn generic_get(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
) -> impl Responder {
    info!(path = %path, "generic GET was called");

    if !is_alive(&state.http, &state.settings.inference.primary_endpoint).await {
        error!("primary inference endpoint is offline");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "primary inference endpoint is offline",
        );
    }

    let base = state.settings.inference.primary_endpoint.trim_end_matches('/');
    let url = if req.query_string().is_empty() {
        format!("{}/{}", base, path)
    } else {
        format!("{}/{}?{}", base, path, req.query_string())
    };

    let rb = apply_forward_headers(state.http.get(&url), &req);
    match rb.send().await {
        Ok(upstream) => {
            let status = upstream.status();
            let content_type = upstream
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let bytes = upstream.bytes().await.unwrap_or_default();
            let mut builder = HttpResponse::build(
                actix_web::http::StatusCode::from_u16(status.as_u16()).unwrap(),
            );
            if let Some(ct) = content_type {
                builder.insert_header(("content-type", ct));
            }
            builder.body(bytes)
        }
        Err(e) => {
            warn!(error = %e, "generic GET forwarding failed");
            error_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

/// Catch-all POST pass-through: forwards the raw body, piping the response
/// when the payload asks for streaming.
async fn generic_post(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<String>,
    body: web::Bytes,
) -> impl Responder {
    info!(path = %path, "generic POST was called");

    if !is_alive(&state.http, &state.settings.inference.primary_endpoint).await {
        error!("primary inference endpoint is offline");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "primary inference endpoint is offline",
        );
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "failed to parse request body");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to parse request body",
            );
        }
    };
    let stream = payload
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let base = state.settings.inference.primary_endpoint.trim_end_matches('/');
    let url = format!("{}/{}", base, path);
    let rb = apply_forward_headers(
        state
            .http
            .post(&url)
            .header("content-type", "application/json")
            .body(body),
        &req,
    );

    match rb.send().await {
        Ok(upstream) if stream => relay_streaming(upstream, RelayCancellation::new()),
        Ok(upstream) => relay_buffered(upstream).await,
        Err(e) => {
            warn!(error = %e, "generic POST forwarding failed");
            error_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_token_rewrites_and_trims() {
        assert_eq!(bearer_token("Bearer abc123").as_deref(), Some("abc123"));
        assert_eq!(bearer_token("bearer   abc123  ").as_deref(), Some("abc123"));
        assert_eq!(bearer_token("Basic abc123"), None);
        assert_eq!(bearer_token(""), None);
    }
}
