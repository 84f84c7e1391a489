//! Consume event-log topics into a file or stdout.
use envconfig::Envconfig;
use tokio::signal;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use log_consumer::config::Config;
use log_consumer::consumer::Consumer;
use log_consumer::error::ConsumerError;
use log_consumer::metrics::{serve, setup_metrics_router};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    if config.export_prometheus {
        let router =
            setup_metrics_router().map_err(|e| ConsumerError::Metrics(e.to_string()))?;
        let bind = config.bind();
        tokio::task::spawn(async move {
            if let Err(e) = serve(router, &bind).await {
                error!(error = %e, "Failed to serve metrics");
            }
        });
    }

    let consumer = Consumer::from_config(&config)?;

    let closer = consumer.clone();
    tokio::spawn(async move {
        shutdown().await;
        if let Err(e) = closer.close().await {
            error!(error = %e, "Failed to close consumer");
        }
    });

    consumer.start().await?;

    info!("Consumer exited");
    Ok(())
}
