use actix_web::HttpResponse;
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use crate::audit::{AuditStore, JsonlAuditStore, MemoryAuditStore};
use crate::config::Settings;
use crate::tracker::Tracker;

/// Initialize dotenv and structured tracing based on RUST_LOG.
///
/// An explicit env file can be named via ENV_FILE; otherwise standard
/// `.env` discovery applies.
pub fn init_tracing() {
    if let Ok(path) = std::env::var("ENV_FILE") {
        let path = path.trim();
        if !path.is_empty() && std::path::Path::new(path).is_file() {
            let _ = dotenvy::from_filename(path);
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Shared outbound HTTP client: reused connections, bounded idle pool,
/// idle-timeout recycling. One instance serves every request.
pub fn build_http_client() -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(600))
        .user_agent(format!("cotrelay/{}", env!("CARGO_PKG_VERSION")));

    if let Ok(secs) = std::env::var("COTRELAY_HTTP_TIMEOUT_SECONDS") {
        if let Ok(n) = secs.trim().parse::<u64>() {
            builder = builder.timeout(Duration::from_secs(n));
        }
    }

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Build a CORS configuration from CORS_ALLOWED_ORIGINS ("*" or a
/// comma-separated list). Permissive when unset.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default()
        .allow_any_method()
        .allow_any_header();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for part in origins.split(',') {
                let p = part.trim();
                if !p.is_empty() {
                    cors = cors.allowed_origin(p);
                }
            }
        }
        _ => {
            cors = cors.allow_any_origin();
        }
    }

    cors
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub http: reqwest::Client,
    pub settings: Arc<Settings>,
    pub tracker: Arc<Tracker>,
    /// Present only when at least one logging switch is on.
    pub audit: Option<Arc<dyn AuditStore>>,
}

impl AppState {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let tracker = match settings.tracker_cache.clone() {
            Some(cache) => Tracker::with_cache(cache),
            None => Tracker::new(),
        };

        let audit: Option<Arc<dyn AuditStore>> =
            if settings.logging.save_cot || settings.logging.save_full {
                match settings.logging.audit_dir.as_deref() {
                    Some(dir) => Some(Arc::new(JsonlAuditStore::new(dir)?)),
                    None => Some(Arc::new(MemoryAuditStore::new())),
                }
            } else {
                None
            };

        Ok(Self {
            http: build_http_client(),
            settings: Arc::new(settings),
            tracker: Arc::new(tracker),
            audit,
        })
    }
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    HttpResponse::build(actix_web::http::StatusCode::from_u16(status.as_u16()).unwrap()).json(body)
}
