//! Toll corridor replay service
//!
//! Replays position reports and gate contacts from a JSONL stream through the
//! geofencing engine and settlement ledger, writing outbound events to the
//! egress file (and MQTT when enabled).
//!
//! Module structure:
//! - `domain/` - Core types (ids, zones, journeys, charges, events)
//! - `services/` - Geofencing, distance, fare, settlement, dispatcher
//! - `io/` - Replay input, egress file/MQTT, Prometheus endpoint
//! - `infra/` - Config, errors, locks, metrics

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::watch;
use toll_corridor::domain::events::OutboundEvent;
use toll_corridor::infra::{Config, Metrics};
use toll_corridor::io::egress::{run_egress, Egress};
use toll_corridor::io::{create_egress_channel, replay, MqttPublisher};
use toll_corridor::services::collaborators::{InMemoryVehicles, InMemoryWallets, PolygonZoneLookup};
use toll_corridor::services::{create_dispatcher, GeofencingEngine, SettlementLedger};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const DISPATCH_BUFFER: usize = 1000;

/// Toll corridor core - geofencing, fares and settlement
#[derive(Parser, Debug)]
#[command(name = "toll-corridor", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// JSONL input to replay (stdin when omitted)
    #[arg(short, long)]
    input: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controls the level, default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        profile = env!("BUILD_PROFILE"),
        "toll-corridor starting"
    );

    let args = Args::parse();
    let config = Config::load(args.config.as_deref());

    let zones = config.zones().context("Invalid zone configuration")?;
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        zones = zones.len(),
        shards = config.shard_count(),
        sweep_interval_secs = config.sweep_interval_secs(),
        egress_file = %config.egress_file(),
        mqtt_egress = config.mqtt_egress_enabled(),
        prometheus_port = config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Collaborators
    let balances = config.wallets();
    let wallets = Arc::new(InMemoryWallets::with_balances(
        config.lock_timeout(),
        balances.iter().map(|(user, balance)| (user, *balance)),
    ));
    let vehicles = Arc::new(InMemoryVehicles::new(config.vehicles()));
    let ledger = Arc::new(SettlementLedger::new(
        wallets,
        vehicles,
        config.pricing(),
        config.lock_timeout(),
        metrics.clone(),
    ));
    let engine = Arc::new(GeofencingEngine::new(
        Arc::new(PolygonZoneLookup::new(zones)),
        ledger,
        config.geofence_settings(),
        metrics.clone(),
    ));

    // Egress: file always, MQTT when enabled
    let (egress_tx, egress_rx) =
        create_egress_channel(config.egress_channel_size(), config.site_id().to_string(), metrics.clone());
    let mqtt = config.mqtt_egress_enabled().then(|| MqttPublisher::new(&config));
    let egress_task = tokio::spawn(run_egress(
        egress_rx,
        Egress::new(config.egress_file()),
        mqtt,
        shutdown_rx.clone(),
    ));

    // Dispatcher shards
    let (dispatch, workers) = create_dispatcher(
        engine.clone(),
        egress_tx.clone(),
        metrics.clone(),
        config.shard_count(),
        DISPATCH_BUFFER,
    );
    let worker_tasks: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

    // Stale journey sweep
    let sweep_engine = engine.clone();
    let sweep_egress = egress_tx.clone();
    let sweep_secs = config.sweep_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(now_ms) = sweep_engine.sweep_now_ms() else { continue };
            for cancelled in sweep_engine.sweep_stale(now_ms) {
                sweep_egress.send_event(OutboundEvent::JourneyCancelled(cancelled));
            }
        }
    });

    // Metrics reporter
    let report_engine = engine.clone();
    let report_egress = egress_tx.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let summary = report_engine.metrics_snapshot();
            summary.log();
            report_egress.send_metrics(summary);
        }
    });

    // Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_engine = engine.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = toll_corridor::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_engine,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Ctrl+C stops the replay; queued work still drains
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = signal_tx.send(true);
    });

    let stats = match args.input.as_deref() {
        Some(path) => replay::replay_file(path, &dispatch, shutdown_rx.clone()).await,
        None => replay::replay_reader(BufReader::new(tokio::io::stdin()), &dispatch, shutdown_rx.clone()).await,
    };

    drop(dispatch);
    for task in worker_tasks {
        if let Err(e) = task.await {
            error!(error = %e, "dispatch_worker_panicked");
        }
    }

    let summary = engine.metrics_snapshot();
    summary.log();

    let _ = shutdown_tx.send(true);
    drop(egress_tx);
    if let Err(e) = egress_task.await {
        error!(error = %e, "egress_task_panicked");
    }

    let stats = stats?;
    info!(
        lines = stats.lines,
        submitted = stats.submitted,
        malformed = stats.malformed,
        active_journeys = summary.active_journeys,
        pending_charges = summary.pending_charges,
        "toll-corridor shutdown complete"
    );
    Ok(())
}
