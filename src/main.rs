use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use holdfast::booking::FileBookingStore;
use holdfast::config::Config;
use holdfast::http::{self, AppState};
use holdfast::notify::NotifyHub;
use holdfast::reaper;
use holdfast::registry::Registry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    holdfast::observability::init(config.metrics_port);

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let bookings_path = PathBuf::from(&config.data_dir).join("bookings.jsonl");
    let recorded = FileBookingStore::read_live(&bookings_path)?;
    let bookings = Arc::new(FileBookingStore::open(&bookings_path)?);

    let registry = Arc::new(Registry::new(
        PathBuf::from(&config.data_dir).join("holdfast.wal"),
        Arc::new(NotifyHub::new()),
        bookings,
        chrono::Duration::seconds(config.hold_ttl_secs),
    )?);

    let reaper_registry = registry.clone();
    let sweep_interval_secs = config.sweep_interval_secs;
    tokio::spawn(async move {
        reaper::run_reaper(reaper_registry, sweep_interval_secs).await;
    });
    let compactor_registry = registry.clone();
    let compact_threshold = config.compact_threshold;
    tokio::spawn(async move {
        reaper::run_compactor(compactor_registry, compact_threshold).await;
    });

    let app = http::router(AppState { registry });
    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("holdfast listening on {addr}");
    info!("  data_dir: {}", config.data_dir);
    info!("  hold_ttl: {}s", config.hold_ttl_secs);
    info!("  sweep_interval: {}s", config.sweep_interval_secs);
    info!("  compact_threshold: {}", config.compact_threshold);
    info!("  bookings on file: {}", recorded.len());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!(
                "http://0.0.0.0:{p}/metrics"
            ))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight requests
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown.await;
    info!("shutdown signal received, draining requests...");
    let _ = shutdown_tx.send(());

    // Event streams never finish on their own, so the drain is bounded
    match tokio::time::timeout(std::time::Duration::from_secs(10), server).await {
        Ok(Ok(Ok(()))) => info!("all requests drained"),
        Ok(Ok(Err(e))) => tracing::error!("server error: {e}"),
        Ok(Err(e)) => tracing::error!("server task failed: {e}"),
        Err(_) => tracing::warn!("drain timeout, open streams dropped"),
    }

    info!("holdfast stopped");
    Ok(())
}
