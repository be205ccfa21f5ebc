use anyhow::{Context, Result};
use pylon_core::config::AppConfig;
use server::{admin, proxy_app, AppState};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{net::SocketAddr, path::PathBuf, str::FromStr};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initializes the logging system based on the configuration. `RUST_LOG`
/// overrides the configured level.
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,pylon_core={level},server={level}",
            level = config.logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PYLON_CONFIG") {
        return Some(PathBuf::from(path));
    }
    let default = PathBuf::from("config.yaml");
    default.exists().then_some(default)
}

async fn open_pool(url: &str) -> Result<sqlx::SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url: {url}"))?
        .create_if_missing(true);

    // Make sure the parent directory of a file-backed database exists.
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("connecting to database")
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(config_path().as_deref())?;
    init_logging(&config);

    let pool = open_pool(&config.database.url).await?;
    let state = AppState::initialize(&config, pool).await?;
    state.spawn_workers();

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.proxy_port)
        .parse()
        .context("invalid proxy listen address")?;
    let admin_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.admin_port)
        .parse()
        .context("invalid admin listen address")?;

    let proxy_listener = tokio::net::TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("binding proxy port {proxy_addr}"))?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding admin port {admin_addr}"))?;

    info!(%proxy_addr, "proxy server listening");
    info!(%admin_addr, "admin server listening");
    info!(
        downstream = %state.policy.load().downstream.base_url,
        "forwarding to downstream"
    );

    let proxy = axum::serve(
        proxy_listener,
        proxy_app::router(state.clone())
            .layer(TraceLayer::new_for_http())
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    let admin = axum::serve(
        admin_listener,
        admin::router(state.clone()).layer(TraceLayer::new_for_http()),
    )
    .with_graceful_shutdown(shutdown_signal());

    let (proxy_result, admin_result) = tokio::join!(proxy, admin);
    proxy_result.context("proxy server failed")?;
    admin_result.context("admin server failed")?;

    // Push out whatever the flush worker has not picked up yet.
    state.recorder.flush(&state.pool).await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
