use actix_web::{test, web, App};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use cotrelay::config::Settings;
use cotrelay::server::config_routes;
use cotrelay::util::AppState;

#[derive(Clone, Debug)]
struct Captured {
    headers: Vec<(String, String)>,
    body: Value,
}

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<Captured>>>,
    response: Arc<AsyncMutex<Value>>,
}

async fn handle_completion(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let captured = Captured {
        headers: headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect(),
        body: payload,
    };
    state.requests.lock().await.push(captured);
    let body = state.response.lock().await.clone();
    (StatusCode::OK, Json(body))
}

/// Provider mock answering both auxiliary CoT calls and fallback-routed
/// completion traffic on `/chat/completions`.
struct MockProvider {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<Captured>>>,
    join: JoinHandle<()>,
}

impl MockProvider {
    async fn start() -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            response: Arc::new(AsyncMutex::new(json!({
                "id": "chatcmpl-provider",
                "object": "chat.completion",
                "created": 1,
                "model": "provider-model",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "provider reply"},
                    "finish_reason": "stop"
                }]
            }))),
        };

        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route("/chat/completions", post(handle_completion))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind provider");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("provider server");
        });

        Self {
            base_url,
            requests,
            join,
        }
    }

    /// Captured requests that are not auxiliary CoT calls.
    async fn fallback_requests(&self) -> Vec<Captured> {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|c| c.body["model"] != "aux-model")
            .cloned()
            .collect()
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Address nothing listens on, so the liveness probe fails fast.
async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{}", addr)
}

fn fallback_settings(primary: &str, provider: &str, handler: &str) -> Settings {
    let yaml = format!(
        r#"
prompt: "Think about it."
inference:
  primary_endpoint: "{primary}"
  use_fallback: true
  cot_handler: {handler}
  fallback_models: ["m1", "m2"]
  {handler}:
    base_uri: "{provider}"
    api_key: "provider-key"
    model: "aux-model"
"#
    );
    serde_yaml::from_str(&yaml).expect("settings yaml")
}

fn user_payload(content: &str) -> Value {
    json!({
        "model": "primary-model",
        "messages": [{"role": "user", "content": content}],
        "temperature": 0.5,
        "max_tokens": 256
    })
}

#[actix_web::test]
async fn fallback_rotates_models_round_robin() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let settings = fallback_settings(&primary, &provider.base_url, "mistral_ai");
    let state = AppState::new(settings).expect("state");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    // Distinct messages with cot_rotation 0 so each request regenerates.
    for content in ["first", "second", "third"] {
        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .set_json(user_payload(content))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: Value = serde_json::from_slice(&test::read_body(resp).await).expect("json");
        assert_eq!(body["choices"][0]["message"]["content"], "provider reply");
    }

    let routed = provider.fallback_requests().await;
    let models: Vec<_> = routed.iter().map(|c| c.body["model"].clone()).collect();
    assert_eq!(models, vec![json!("m1"), json!("m2"), json!("m1")]);
}

#[actix_web::test]
async fn fallback_resumes_from_tracked_round() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let settings = fallback_settings(&primary, &provider.base_url, "mistral_ai");
    let state = AppState::new(settings).expect("state");
    // Shared round already sits at index 1 from earlier fallback traffic.
    state.tracker.advance_response_round(2).await;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(user_payload("hello"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let routed = provider.fallback_requests().await;
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0].body["model"], "m2");

    // Counter wrapped: the next fallback request starts over at m1.
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(user_payload("again"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let routed = provider.fallback_requests().await;
    assert_eq!(routed[1].body["model"], "m1");
}

#[actix_web::test]
async fn mistral_fallback_is_reshaped_with_provider_fields() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let settings = fallback_settings(&primary, &provider.base_url, "mistral_ai");
    let postfill = settings.postfill.clone();
    let state = AppState::new(settings).expect("state");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(user_payload("shape check"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let routed = provider.fallback_requests().await;
    assert_eq!(routed.len(), 1);
    let body = &routed[0].body;

    // Mistral spelling of the provider extras, caller sampling preserved.
    assert!(body.get("random_seed").is_some());
    assert_eq!(body["safe_prompt"], false);
    assert!(body.get("seed").is_none());
    assert_eq!(body["temperature"], 0.5);
    assert_eq!(body["max_tokens"], 256);
    assert_eq!(body["stream"], false);

    // Augmented tail survives the reshape.
    let messages = body["messages"].as_array().expect("messages");
    let n = messages.len();
    assert!(messages[n - 2]["content"]
        .as_str()
        .unwrap()
        .starts_with("<chain_of_thought>"));
    assert_eq!(messages[n - 1]["content"], postfill);

    // Provider credential, not the caller's, authenticates the call.
    let auth = routed[0]
        .headers
        .iter()
        .find(|(k, _)| k == "authorization")
        .map(|(_, v)| v.clone());
    assert_eq!(auth.as_deref(), Some("Bearer provider-key"));
    let api_key = routed[0]
        .headers
        .iter()
        .find(|(k, _)| k == "x-api-key")
        .map(|(_, v)| v.clone());
    assert_eq!(api_key.as_deref(), Some("provider-key"));
}

#[actix_web::test]
async fn open_router_fallback_is_reshaped_with_provider_fields() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let settings = fallback_settings(&primary, &provider.base_url, "open_router");
    let state = AppState::new(settings).expect("state");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(user_payload("shape check"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let routed = provider.fallback_requests().await;
    assert_eq!(routed.len(), 1);
    let body = &routed[0].body;
    assert!(body.get("seed").is_some());
    let min_p = body["min_p"].as_f64().expect("min_p");
    assert!((min_p - 0.05).abs() < 1e-6);
    assert!(body.get("random_seed").is_none());
    assert!(body.get("safe_prompt").is_none());
}

#[actix_web::test]
async fn inline_fallback_models_override_settings() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let settings = fallback_settings(&primary, &provider.base_url, "mistral_ai");
    let state = AppState::new(settings).expect("state");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let mut payload = user_payload("hello");
    payload["fallback_models"] = json!(["inline-model"]);
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());

    let routed = provider.fallback_requests().await;
    assert_eq!(routed[0].body["model"], "inline-model");
}

#[actix_web::test]
async fn unknown_fallback_handler_is_fatal_before_any_call() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let settings = fallback_settings(&primary, &provider.base_url, "mistral_ai");
    let state = AppState::new(settings).expect("state");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let mut payload = user_payload("hello");
    payload["fallback_handler"] = json!("perplexity");
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 500);

    assert!(provider.requests.lock().await.is_empty());
}

#[actix_web::test]
async fn catch_all_rejects_when_primary_offline() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let settings = fallback_settings(&primary, &provider.base_url, "mistral_ai");
    let state = AppState::new(settings).expect("state");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::get().uri("/v1/models").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 500);

    let req = test::TestRequest::post()
        .uri("/v1/token/encode")
        .set_json(json!({"text": "hello"}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 500);
}

#[actix_web::test]
async fn disabled_fallback_relays_primary_failure() {
    let provider = MockProvider::start().await;
    let primary = dead_endpoint().await;

    let mut settings = fallback_settings(&primary, &provider.base_url, "mistral_ai");
    settings.inference.use_fallback = false;
    let state = AppState::new(settings).expect("state");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(user_payload("hello"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 502);

    // The CoT call still ran; only the proxied call failed.
    assert_eq!(provider.fallback_requests().await.len(), 0);
    assert_eq!(provider.requests.lock().await.len(), 1);
}
