use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::Router;
use axum::body::Body;
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{Error, Result};

// metric names, the registry appends `_total` to counters
const RECORDS_READ: &str = "records_read";
const RECORDS_LATE: &str = "records_late";
const RECORDS_DISCARDED: &str = "records_discarded";
const WINDOWS_RELEASED: &str = "windows_released";
const WINDOWS_OPEN: &str = "windows_open";

// labels
pub(crate) const PROCESSOR_NAME_LABEL: &str = "processor";
pub(crate) const RELEASE_KIND_LABEL: &str = "kind";

struct GlobalRegistry {
    // registration happens once per metric, the lock is never contended on the hot path
    registry: parking_lot::Mutex<Registry>,
}

impl GlobalRegistry {
    fn new() -> Self {
        GlobalRegistry {
            registry: parking_lot::Mutex::new(Registry::with_prefix("tumbling")),
        }
    }
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::new)
}

/// Metrics of the windowing engine, every metric is a family keyed by the labels.
pub(crate) struct WindowMetrics {
    pub(crate) records_read: Family<Vec<(String, String)>, Counter>,
    pub(crate) records_late: Family<Vec<(String, String)>, Counter>,
    pub(crate) records_discarded: Family<Vec<(String, String)>, Counter>,
    pub(crate) windows_released: Family<Vec<(String, String)>, Counter>,
    pub(crate) windows_open: Family<Vec<(String, String)>, Gauge>,
}

impl WindowMetrics {
    fn new() -> Self {
        let metrics = Self {
            records_read: Family::<Vec<(String, String)>, Counter>::default(),
            records_late: Family::<Vec<(String, String)>, Counter>::default(),
            records_discarded: Family::<Vec<(String, String)>, Counter>::default(),
            windows_released: Family::<Vec<(String, String)>, Counter>::default(),
            windows_open: Family::<Vec<(String, String)>, Gauge>::default(),
        };

        let mut registry = global_registry().registry.lock();
        registry.register(
            RECORDS_READ,
            "Total number of records read",
            metrics.records_read.clone(),
        );
        registry.register(
            RECORDS_LATE,
            "Total number of records older than the watermark but within the allowed lateness",
            metrics.records_late.clone(),
        );
        registry.register(
            RECORDS_DISCARDED,
            "Total number of records dropped for being older than the allowed lateness",
            metrics.records_discarded.clone(),
        );
        registry.register(
            WINDOWS_RELEASED,
            "Total number of window releases, labelled by what triggered them",
            metrics.windows_released.clone(),
        );
        registry.register(
            WINDOWS_OPEN,
            "Number of windows currently buffered",
            metrics.windows_open.clone(),
        );
        metrics
    }
}

static WINDOW_METRICS: OnceLock<WindowMetrics> = OnceLock::new();

pub(crate) fn window_metrics() -> &'static WindowMetrics {
    WINDOW_METRICS.get_or_init(WindowMetrics::new)
}

pub(crate) fn processor_labels(name: &str) -> Vec<(String, String)> {
    vec![(PROCESSOR_NAME_LABEL.to_string(), name.to_string())]
}

/// Snapshot of every registered metric in the OpenMetrics text format.
pub(crate) fn encode_metrics() -> Result<String> {
    // make sure the window metrics show up even before the first record
    window_metrics();
    let state = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &state).map_err(|e| Error::Metrics(format!("encoding: {e}")))?;
    Ok(buffer)
}

pub(crate) async fn metrics_handler() -> impl IntoResponse {
    match encode_metrics() {
        Ok(buffer) => {
            debug!("Exposing metrics: {:?}", buffer);
            (
                StatusCode::OK,
                [(
                    axum::http::header::CONTENT_TYPE,
                    "application/openmetrics-text; version=1.0.0; charset=utf-8",
                )],
                Body::from(buffer),
            )
                .into_response()
        }
        Err(e) => {
            error!(?e, "Failed to encode metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap_or_default()
        }
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

fn metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez))
        .route("/readyz", get(livez))
}

/// Serves the metrics and health endpoints until the token is cancelled.
pub(crate) async fn start_metrics_server(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Metrics(format!("Binding metrics server to {addr}: {e}")))?;
    info!(?addr, "Started metrics server");

    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::Metrics(format!("Starting web server for metrics: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_encode_window_metrics() {
        let labels = processor_labels("metrics-test");
        window_metrics().records_read.get_or_create(&labels).inc();
        window_metrics().windows_open.get_or_create(&labels).set(2);

        let encoded = encode_metrics().unwrap();
        assert!(encoded.contains("tumbling_records_read_total{processor=\"metrics-test\"} 1"));
        assert!(encoded.contains("tumbling_windows_open{processor=\"metrics-test\"} 2"));
    }

    #[tokio::test]
    async fn test_metrics_server_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = tokio::spawn(start_metrics_server(addr, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let response = livez().await.into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
