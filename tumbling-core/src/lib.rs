use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use self::error::{Error, Result};

use crate::config::{Settings, config};
use crate::metrics::start_metrics_server;
use crate::sink::JsonLinesLifecycle;
use crate::store::WindowStore;
use crate::timestamp::TimestampAssigner;
use crate::watchdog::IdleWindowWatchdog;
use crate::window::TumblingWindowService;

mod error;

/// Processor configuration loaded from the environment.
pub mod config;

/// Records and output records.
pub mod message;

/// Per partition watermarks and the global watermark derived from them.
pub mod watermark;

/// Buffer of the not yet released windows.
pub mod store;

/// Hook turning released windows into output.
pub mod lifecycle;

/// Event time extraction.
pub mod timestamp;

/// Tumbling window state machine.
pub mod window;

/// Idle window force release.
pub mod watchdog;

pub mod source;
pub mod sink;

mod metrics;

/// Runs the processor: records are read from stdin, windows are written to stdout (late
/// resends going to stderr when configured so) until a shutdown signal or the end of input.
pub async fn run() -> Result<()> {
    let cln_token = CancellationToken::new();
    let shutdown_cln_token = cln_token.clone();

    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cln_token.cancel();
    });

    let result = start_processor(config(), cln_token).await;
    if let Err(e) = &result {
        error!(?e, "Processor failed");
    }

    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    info!("Gracefully Exiting...");
    result
}

async fn start_processor(settings: &Settings, cln_token: CancellationToken) -> Result<()> {
    info!(
        name = %settings.name,
        window = ?settings.window,
        store = ?settings.store,
        timestamp = ?settings.timestamp,
        late_event_mode = ?settings.late_event_mode,
        "Starting tumbling window processor"
    );

    let store = WindowStore::new(&settings.store)?;
    let assigner = TimestampAssigner::try_from(&settings.timestamp)?;
    let lifecycle = JsonLinesLifecycle::new(
        tokio::io::stdout(),
        tokio::io::stderr(),
        settings.late_event_mode,
    );
    let service = Arc::new(TumblingWindowService::new(
        &settings.name,
        &settings.window,
        store,
        assigner,
        lifecycle,
    )?);

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let metrics_handle = tokio::spawn(start_metrics_server(metrics_addr, cln_token.clone()));

    let watchdog = IdleWindowWatchdog::new(
        Arc::clone(&service),
        settings.window.idle_timeout,
        cln_token.child_token(),
    )
    .start();

    let result = source::read_records(
        BufReader::new(tokio::io::stdin()),
        Arc::clone(&service),
        cln_token.clone(),
    )
    .await;
    if let Ok(read) = &result {
        info!(read, "Source stopped");
    }

    watchdog.shutdown().await?;
    service.store().flush().await?;

    cln_token.cancel();
    match metrics_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(?e, "Metrics server stopped with an error"),
        Err(e) => warn!(?e, "Metrics server task failed"),
    }

    info!(
        open_windows = service.store().len(),
        "Stopped tumbling window processor"
    );
    result.map(|_| ())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
