//! Prometheus metrics HTTP endpoint
//!
//! Serves the corridor metrics in Prometheus text format at `/metrics` and a
//! liveness check at `/health`.

use crate::infra::metrics::{MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::geofence::GeofencingEngine;
use anyhow::Context;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const TEXT_FORMAT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Text exposition writer, every sample labelled with the site
struct Exposition<'a> {
    out: String,
    site: &'a str,
}

impl<'a> Exposition<'a> {
    fn new(site: &'a str) -> Self {
        Self { out: String::with_capacity(4096), site }
    }

    fn header(&mut self, name: &str, help: &str, kind: &str) {
        let _ = writeln!(self.out, "# HELP {name} {help}\n# TYPE {name} {kind}");
    }

    fn counter(&mut self, name: &str, help: &str, value: u64) {
        self.header(name, help, "counter");
        let _ = writeln!(self.out, "{name}{{site=\"{}\"}} {value}", self.site);
    }

    fn gauge(&mut self, name: &str, help: &str, value: impl std::fmt::Display) {
        self.header(name, help, "gauge");
        let _ = writeln!(self.out, "{name}{{site=\"{}\"}} {value}", self.site);
    }

    /// Cumulative buckets; the last slot of `buckets` is the overflow bucket
    fn histogram(&mut self, name: &str, help: &str, buckets: &[u64; METRICS_NUM_BUCKETS], avg: u64) {
        self.header(name, help, "histogram");
        let site = self.site;
        let bounds = METRICS_BUCKET_BOUNDS.iter().map(|b| b.to_string()).chain(std::iter::once("+Inf".into()));
        let mut running = 0u64;
        for (le, count) in bounds.zip(buckets.iter()) {
            running += count;
            let _ = writeln!(self.out, "{name}_bucket{{site=\"{site}\",le=\"{le}\"}} {running}");
        }
        let _ = writeln!(self.out, "{name}_sum{{site=\"{site}\"}} {}", avg * running);
        let _ = writeln!(self.out, "{name}_count{{site=\"{site}\"}} {running}");
    }
}

/// Format a snapshot in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut exp = Exposition::new(site);

    exp.counter("toll_reports_total", "Position reports accepted", summary.reports_total);
    exp.counter("toll_reports_rejected_total", "Position reports rejected as invalid", summary.reports_rejected);
    exp.gauge("toll_reports_per_sec", "Reports accepted per second", format!("{:.2}", summary.reports_per_sec));
    exp.histogram(
        "toll_observe_latency_us",
        "Report processing latency in microseconds",
        &summary.lat_buckets,
        summary.avg_observe_latency_us,
    );
    exp.gauge("toll_observe_latency_p99_us", "99th percentile report latency", summary.lat_p99_us);

    let counters = [
        ("toll_zone_entries_total", "Journeys opened", summary.zone_entries),
        ("toll_zone_exits_total", "Journeys closed by exit", summary.zone_exits),
        ("toll_zone_changes_total", "Direct zone to zone transitions", summary.zone_changes),
        ("toll_charges_completed_total", "Charges debited at exit", summary.charges_completed),
        ("toll_charges_pending_total", "Charges left pending at exit", summary.charges_pending),
        ("toll_charges_cancelled_total", "Pending charges cancelled", summary.charges_cancelled),
        ("toll_reconciliations_total", "Gate contact reconciliations", summary.reconciliations),
        ("toll_reconciled_charges_total", "Pending charges settled at gates", summary.reconciled_charges),
        (
            "toll_reconciled_amount_minor_total",
            "Amount settled at gates in minor units",
            summary.reconciled_amount_minor,
        ),
        ("toll_stale_journeys_total", "Journeys cancelled by the stale sweep", summary.stale_journeys_cancelled),
        ("toll_journeys_cancelled_total", "Journeys cancelled for any reason", summary.journeys_cancelled),
        ("toll_segments_filtered_total", "GPS segments discarded by the path filter", summary.segments_filtered),
        ("toll_settlement_failures_total", "Wallet faults during settlement", summary.settlement_failures),
        ("toll_lock_conflicts_total", "Lock waits that timed out", summary.lock_conflicts),
        ("toll_lookup_failures_total", "Zone lookups that failed", summary.lookup_failures),
        ("toll_egress_dropped_total", "Outbound events dropped on a full channel", summary.egress_dropped),
    ];
    for (name, help, value) in counters {
        exp.counter(name, help, value);
    }

    exp.gauge("toll_active_journeys", "Vehicles currently inside a zone", summary.active_journeys);
    exp.gauge("toll_pending_charges", "Charges awaiting reconciliation", summary.pending_charges);
    exp.gauge("toll_dispatch_queue_depth", "Messages waiting in dispatcher shards", summary.dispatch_queue_depth);

    exp.out
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    engine: Arc<GeofencingEngine>,
    site_id: Arc<str>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let summary = engine.metrics_snapshot();
            let body = format_prometheus_metrics(&summary, &site_id);
            Ok(response(StatusCode::OK, TEXT_FORMAT, body))
        }
        (&Method::GET, "/health") => Ok(response(StatusCode::OK, "text/plain", "ok")),
        _ => Ok(response(StatusCode::NOT_FOUND, "text/plain", "Not Found")),
    }
}

fn serve(stream: tokio::net::TcpStream, engine: Arc<GeofencingEngine>, site_id: Arc<str>) {
    tokio::spawn(async move {
        let service = service_fn(move |req| handle_request(req, engine.clone(), site_id.clone()));
        if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
            error!(error = %e, "prometheus_http_error");
        }
    });
}

/// Serve `/metrics` and `/health` on `port` until shutdown is signalled
pub async fn start_metrics_server(
    port: u16,
    engine: Arc<GeofencingEngine>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .await
        .with_context(|| format!("Failed to bind metrics port {port}"))?;
    let site_id: Arc<str> = Arc::from(site_id);
    info!(port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => serve(stream, engine.clone(), site_id.clone()),
                Err(e) => error!(error = %e, "prometheus_accept_error"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
