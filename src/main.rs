use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use tracing::info;

use cotrelay::config::Settings;
use cotrelay::server::config_routes;
use cotrelay::util::{cors_config_from_env, init_tracing, AppState};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the YAML settings file.
    #[arg(long, env = "COTRELAY_CONFIG", default_value = "settings.yaml")]
    config: String,

    /// Bind address for the HTTP server.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8088")]
    bind: String,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    let settings = Settings::load_from_file(&args.config)?;
    let state = AppState::new(settings)?;
    state.tracker.restore().await;
    let data = web::Data::new(state);

    info!(bind = %args.bind, "starting cotrelay");
    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(data.clone())
            .configure(config_routes)
    })
    .bind(&args.bind)
    .with_context(|| format!("failed to bind {}", args.bind))?
    .run()
    .await?;

    Ok(())
}
