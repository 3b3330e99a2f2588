//! Entry point of the relay server.
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use backend_lib::{
    config::{LogFormat, Settings, DEFAULT_CONFIG_FILE},
    router, AppState,
};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Realtime event relay: SSE streams in, POST emits out
#[derive(Debug, Parser)]
#[command(name = "relay-server", version, about)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "RELAY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)?;
    if let Some(bind) = cli.bind {
        settings.bind_addr = bind;
    }
    if let Some(level) = cli.log_level {
        settings.log_level = level;
        settings.validate()?;
    }

    init_tracing(&settings);

    let state = Arc::new(AppState::new(settings));
    spawn_rate_limit_cleanup(&state);

    let app = router::create_router(Arc::clone(&state));

    let listener = TcpListener::bind(state.settings.bind_addr).await?;
    info!(addr = %listener.local_addr()?, "listening");

    // open streams never finish on their own, so shutdown gets a grace period
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .into_future();
    tokio::select! {
        result = server => result?,
        () = async {
            stopped(stop_rx).await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        } => {
            warn!(grace = ?SHUTDOWN_GRACE, "streams still open after grace period, exiting");
        },
    }

    info!("shut down");
    Ok(())
}

fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_ascii_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);
    match settings.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn spawn_rate_limit_cleanup(state: &Arc<AppState>) {
    let limiter = Arc::clone(&state.rate_limiter);
    let period = state.settings.rate_limit.window().max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            limiter.cleanup();
        }
    });
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    // a dropped sender also means stop
    let _ = rx.wait_for(|stop| *stop).await;
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        signal.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    first_signal(tokio::signal::ctrl_c(), terminate).await;
    info!("shutdown signal received");
}

/// Resolve when either listener fires. A listener that cannot be
/// installed never fires instead of triggering shutdown.
async fn first_signal<C, T>(ctrl_c: C, terminate: T)
where
    C: Future<Output = std::io::Result<()>>,
    T: Future<Output = std::io::Result<()>>,
{
    let ctrl_c = async {
        if let Err(e) = ctrl_c.await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        if let Err(e) = terminate.await {
            tracing::error!(error = %e, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_failed_listener_does_not_trigger_shutdown() {
        let broken = async { Err(std::io::Error::other("no signal support")) };
        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            first_signal(broken, std::future::pending()),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_either_signal_triggers_shutdown() {
        let fired = async { Ok(()) };
        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            first_signal(std::future::pending(), fired),
        )
        .await;
        assert!(waited.is_ok());
    }
}
