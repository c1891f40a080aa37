//! Prometheus metrics for the reconcile loop and the PVC data-sync engine.
//!
//! Exposed over a bare `hyper` server rather than pulling in `axum`, matching
//! the lighter dependency footprint of the operator binary (see Cargo.toml).

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

/// Per-reconciler-kind counters and histograms (one instance per CRD
/// controller, as storage-operator's `ContextData` carries one `ControllerMetrics`).
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new(
                format!("dr_syncer_{controller}_reconcile_total"),
                "Total number of reconcile invocations",
            ),
            &["name", "namespace"],
        )
        .unwrap();
        let action_counter = IntCounterVec::new(
            Opts::new(
                format!("dr_syncer_{controller}_action_total"),
                "Total number of actions taken, by kind",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let read_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("dr_syncer_{controller}_read_seconds"),
                "Time spent determining the next action",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        let write_histogram = HistogramVec::new(
            HistogramOpts::new(
                format!("dr_syncer_{controller}_write_seconds"),
                "Time spent applying the determined action",
            ),
            &["name", "namespace", "action"],
        )
        .unwrap();
        REGISTRY.register(Box::new(reconcile_counter.clone())).ok();
        REGISTRY.register(Box::new(action_counter.clone())).ok();
        REGISTRY.register(Box::new(read_histogram.clone())).ok();
        REGISTRY.register(Box::new(write_histogram.clone())).ok();
        Self {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

/// Rsync transfer / sync-session metrics, registered once at process
/// startup independent of which CRD controller is active.
pub struct SyncMetrics {
    pub sessions_started: IntCounterVec,
    pub sessions_completed: IntCounterVec,
    pub transfer_seconds: HistogramVec,
}

impl SyncMetrics {
    pub fn new() -> Self {
        let sessions_started = IntCounterVec::new(
            Opts::new("dr_syncer_sync_sessions_started_total", "Sync sessions started"),
            &["namespace_mapping"],
        )
        .unwrap();
        let sessions_completed = IntCounterVec::new(
            Opts::new(
                "dr_syncer_sync_sessions_completed_total",
                "Sync sessions completed, by outcome",
            ),
            &["namespace_mapping", "outcome"],
        )
        .unwrap();
        let transfer_seconds = HistogramVec::new(
            HistogramOpts::new(
                "dr_syncer_sync_transfer_seconds",
                "Wall-clock time of the rsync transfer phase",
            ),
            &["namespace_mapping"],
        )
        .unwrap();
        REGISTRY.register(Box::new(sessions_started.clone())).ok();
        REGISTRY.register(Box::new(sessions_completed.clone())).ok();
        REGISTRY.register(Box::new(transfer_seconds.clone())).ok();
        Self {
            sessions_started,
            sessions_completed,
            transfer_seconds,
        }
    }
}

lazy_static! {
    static ref SYNC_METRICS: SyncMetrics = SyncMetrics::new();
}

/// The process-wide [`SyncMetrics`] instance, registered once at first use.
/// Sessions across every declaration share it, the same way `REGISTRY` is
/// shared across every [`ControllerMetrics`] instance.
pub fn sync_metrics() -> &'static SyncMetrics {
    &SYNC_METRICS
}

async fn serve(_req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).ok();
    Ok(Response::new(Full::new(Bytes::from(buffer))))
}

/// Serves `/metrics` on the given port until the process exits. Intended to
/// be spawned as a background task from `main.rs`.
pub async fn run_metrics_server(port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr).await?;
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        tokio::spawn(async move {
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service_fn(serve))
                .await;
        });
    }
}
