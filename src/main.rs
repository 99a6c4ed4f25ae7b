use std::sync::Arc;

use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use artisched::config::Config;
use artisched::engine::Engine;
use artisched::notify::NotifyHub;
use artisched::service::SchedulingService;
use artisched::{api, observability, reaper};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artisched=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), notify, config.engine_config())?);

    let compactor_engine = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        reaper::run_compactor(compactor_engine, threshold).await;
    });
    let sweeper_engine = engine.clone();
    tokio::spawn(async move {
        reaper::run_idempotency_sweeper(sweeper_engine).await;
    });

    let app = api::router(SchedulingService::new(engine))
        .layer(ConcurrencyLimitLayer::new(config.max_connections))
        .layer(TraceLayer::new_for_http());

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("artisched listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {}", config.max_connections);
    info!("  require_open_hours: {}", config.require_open_hours);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("artisched stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM; axum then drains in-flight requests.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
