//! Prometheus metrics and exposition server

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{Error, Result};

/// Agent reports applied to device records.
pub static AGENT_REPORTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "riverscout_agent_reports_total",
        "Total agent reports processed"
    )
    .expect("metric registration")
});

/// Network events applied to device records, labeled by kind.
pub static NETWORK_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "riverscout_network_events_total",
        "Total network events processed",
        &["kind"]
    )
    .expect("metric registration")
});

/// Successful promotions to the inventory service.
pub static PROMOTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "riverscout_promotions_total",
        "Total devices promoted to inventory"
    )
    .expect("metric registration")
});

/// Promotion attempts that failed at the inventory boundary.
pub static PROMOTION_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "riverscout_promotion_failures_total",
        "Total promotion attempts that failed"
    )
    .expect("metric registration")
});

/// Completed switch scan cycles.
pub static SWITCH_SCANS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "riverscout_switch_scans_total",
        "Total switch scan cycles run"
    )
    .expect("metric registration")
});

/// Scan cycles that failed to fetch the MAC table.
pub static SCAN_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "riverscout_scan_errors_total",
        "Total switch scan cycles that failed"
    )
    .expect("metric registration")
});

/// Successful topology polls.
pub static TOPOLOGY_POLLS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "riverscout_topology_polls_total",
        "Total successful topology polls"
    )
    .expect("metric registration")
});

/// Switch scan tasks currently running.
pub static RUNNING_SCANNERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "riverscout_running_scanners",
        "Number of switch scan tasks currently running"
    )
    .expect("metric registration")
});

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            let mut buffer = Vec::new();
            if encoder.encode(&metric_families, &mut buffer).is_err() {
                buffer.clear();
            }

            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", encoder.format_type())
                .body(Full::new(Bytes::from(buffer)))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .unwrap(),
    };
    Ok(response)
}

/// Runs the Prometheus exposition server.
pub async fn run_metrics_server(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {e}")))?;

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {addr}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {e}");
            }
        });
    }
}
