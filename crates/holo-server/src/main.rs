//! Holo streaming server binary.

use holo_server::{app, background, build_orchestrator, config, AppState};
use holo_session::SqliteTurnStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (String, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (path, "cli-arg");
    }

    if let Ok(path) = std::env::var("HOLO_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (path, "env-var");
        }
    }

    ("config.toml".to_string(), "default")
}

#[tokio::main]
async fn main() {
    let (config_path, config_source) = resolve_config_path();

    let config = config::load_config(&config_path)
        .expect("failed to load configuration, the server cannot start without a pipeline section");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = %config_path,
        "resolved startup configuration path"
    );

    let (pool, applied) = holo_db::open_history_db(
        &config.database.path,
        holo_db::HistoryDbSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            max_connections: config.database.pool_max_size,
        },
    )
    .expect("failed to open turn history database, check database.path in config");
    if applied > 0 {
        tracing::info!(count = applied, "applied database migrations");
    }

    let orchestrator = build_orchestrator(&config, Arc::new(SqliteTurnStore::new(pool)))
        .expect("invalid pipeline configuration");

    tokio::spawn(background::start_idle_sweeper(
        orchestrator.clone(),
        config.pipeline.session.idle_timeout_ms,
    ));

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        max_audio_frame_bytes: config.server.max_audio_frame_bytes,
    });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting holo server");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    orchestrator.shutdown().await;
    tracing::info!("holo server shut down");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
