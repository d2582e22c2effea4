//! Live timing client entry point.
//!
//! Loads `pitwall.yaml` (or the path given as the first argument),
//! subscribes to the configured topics, and streams into the durable
//! history until Ctrl-C or SIGTERM.

use std::path::PathBuf;

use pitwall_client::{FeedClient, FeedEvent};
use pitwall_core::FeedConfig;
use pitwall_core::config::{LogFormat, LoggingConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Default configuration file name.
const DEFAULT_CONFIG: &str = "pitwall.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the durable
/// history cannot be opened.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);
    let config = if path.exists() {
        FeedConfig::from_file(&path)?
    } else {
        FeedConfig::parse("")?
    };

    init_tracing(&config.logging);
    info!(
        config = %path.display(),
        base_url = %config.feed.base_url,
        data_dir = %config.persistence.data_dir.display(),
        topics = config.feed.topics.len(),
        "pitwall-client starting"
    );

    let topics = config.feed.topics.clone();
    let handle = FeedClient::new(config).start(topics)?;

    let mut events = handle.events();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(FeedEvent::Topic { topic, .. }) => debug!(topic = %topic, "topic updated"),
                Ok(FeedEvent::Error(report)) => {
                    debug!(kind = ?report.kind, message = %report.message, "error reported");
                }
                Ok(FeedEvent::Snapshot { .. } | FeedEvent::State(_)) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event reporter lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await;
    info!("shutting down");
    handle.stop().await;
    reporter.abort();
    Ok(())
}

/// Install the tracing subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

/// Resolve on Ctrl-C, or on SIGTERM where available.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
