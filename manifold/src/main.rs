#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;

use std::sync::Arc;
use std::time::Duration;

use args::Args;
use clap::Parser;
use manifold_config::Config;
use manifold_dispatch::{ModelRegistry, SystemClock};
use manifold_server::Server;
use manifold_translate::TranslatorRegistry;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing();

    // A config or init error is fatal: bail with a non-zero exit
    let config = Config::load(&args.config)?;

    tracing::info!(
        config_path = %args.config.display(),
        providers = config.providers.len(),
        models = config.models.len(),
        "starting manifold"
    );

    let translators = TranslatorRegistry::with_defaults();
    let registry = Arc::new(ModelRegistry::build(
        &config,
        &translators,
        SystemClock::shared(),
        &args.metrics_path,
    )?);

    // Best-effort restore; a missing snapshot is a cold start
    registry.load_metrics();

    // Set up graceful shutdown
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_clone.cancel();
    });

    // Periodic snapshot flush, stopped by the same token
    let flusher = tokio::spawn(flush_loop(
        Arc::clone(&registry),
        Duration::from_secs(args.metrics_flush_seconds.max(1)),
        shutdown.clone(),
    ));

    let server = Server::new(Arc::clone(&registry), args.listen);
    server.serve(shutdown).await?;

    // In-flight requests have drained; write the final snapshot
    flusher.await.ok();
    registry.save_metrics();
    tracing::info!("manifold stopped");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

async fn flush_loop(registry: Arc<ModelRegistry>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => registry.save_metrics(),
            () = shutdown.cancelled() => return,
        }
    }
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
