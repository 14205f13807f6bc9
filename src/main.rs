use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
mod config;
mod conversation;
mod inference;
mod manager;

use api::AppState;
use config::Config;
use manager::ModelRegistry;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Intel OpenMP aborts when a BLAS backend links a second copy of the
    // runtime. Must be set before any worker thread exists.
    if std::env::var_os("KMP_DUPLICATE_LIB_OK").is_none() {
        std::env::set_var("KMP_DUPLICATE_LIB_OK", "TRUE");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("embed_sidecar=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    info!(
        embed = %config.embed_source().describe(),
        chat = %config.chat_source().describe(),
        device = %config.device,
        "starting embedding + LLM sidecar"
    );

    // -----------------------------
    // Shared state
    // -----------------------------
    let models = Arc::new(ModelRegistry::from_config(&config));

    if config.preload {
        let models = models.clone();
        tokio::task::spawn_blocking(move || models.preload());
    } else {
        info!("models load lazily on first request");
    }

    let state = AppState {
        models,
        temperature: config.temperature,
        seed: config.seed,
    };
    if config.seed.is_none() {
        warn!(
            temperature = config.temperature,
            "sampling without SIDECAR_SEED; answers are not reproducible"
        );
    }

    // -----------------------------
    // Router
    // -----------------------------
    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("listening on http://{addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
