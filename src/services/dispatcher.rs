//! Sharded dispatcher - feeds inbound messages to the engine off the reader task
//!
//! Every vehicle hashes to one shard, and each shard is drained by a single
//! worker, so reports for a vehicle are applied in arrival order while
//! different vehicles proceed in parallel. Outbound events go to the egress
//! channel.

use crate::domain::events::OutboundEvent;
use crate::domain::types::{GateContact, PositionReport, VehicleId};
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use crate::services::geofence::GeofencingEngine;
use rustc_hash::FxHasher;
use serde::Deserialize;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One line of inbound traffic
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Report(PositionReport),
    GateContact(GateContact),
}

impl Inbound {
    pub fn vehicle_id(&self) -> &VehicleId {
        match self {
            Inbound::Report(r) => &r.vehicle_id,
            Inbound::GateContact(g) => &g.vehicle_id,
        }
    }
}

#[derive(Debug)]
struct Envelope {
    msg: Inbound,
    /// When the message was enqueued (for queue delay measurement)
    enqueued_at: Instant,
}

fn shard_for(vehicle_id: &VehicleId, shards: usize) -> usize {
    let mut hasher = FxHasher::default();
    vehicle_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

/// Producer side; dropping every clone lets the workers drain and stop
#[derive(Clone)]
pub struct DispatchHandle {
    shards: Vec<mpsc::Sender<Envelope>>,
    metrics: Arc<Metrics>,
}

impl DispatchHandle {
    /// Enqueue a message, waiting for room in its shard
    ///
    /// Returns false if the shard worker has stopped.
    pub async fn submit(&self, msg: Inbound) -> bool {
        let idx = shard_for(msg.vehicle_id(), self.shards.len());
        let Some(tx) = self.shards.get(idx) else { return false };
        let sent = tx.send(Envelope { msg, enqueued_at: Instant::now() }).await.is_ok();
        self.metrics.set_dispatch_queue_depth(self.queue_depth());
        sent
    }

    /// Messages waiting across all shards
    pub fn queue_depth(&self) -> u64 {
        self.shards.iter().map(|tx| (tx.max_capacity() - tx.capacity()) as u64).sum()
    }
}

/// Single writer for one shard
pub struct ShardWorker {
    index: usize,
    engine: Arc<GeofencingEngine>,
    rx: mpsc::Receiver<Envelope>,
    egress: EgressSender,
}

impl ShardWorker {
    /// Run until every `DispatchHandle` is dropped and the queue is empty
    pub async fn run(mut self) {
        info!(shard = self.index, "dispatch_worker_started");
        let mut processed = 0u64;

        while let Some(envelope) = self.rx.recv().await {
            let queue_delay_us = envelope.enqueued_at.elapsed().as_micros() as u64;
            if queue_delay_us > 10_000 {
                warn!(shard = self.index, queue_delay_us, "dispatch_queue_delay_high");
            }
            self.handle(envelope.msg);
            processed += 1;
        }

        info!(shard = self.index, processed, "dispatch_worker_stopped");
    }

    fn handle(&self, msg: Inbound) {
        match msg {
            Inbound::Report(report) => {
                // observe logs its own failures
                if let Ok(event) = self.engine.observe(&report) {
                    for out in event.outbound() {
                        self.egress.send_event(out);
                    }
                }
            }
            Inbound::GateContact(contact) => match self.engine.ledger().reconcile_at_gate(&contact) {
                Ok(summary) => {
                    self.egress.send_event(OutboundEvent::Reconciliation(summary));
                }
                Err(e) => {
                    warn!(
                        vehicle_id = %contact.vehicle_id,
                        gate_id = %contact.gate_id,
                        kind = e.kind(),
                        error = %e,
                        retryable = e.is_retryable(),
                        "gate_contact_failed"
                    );
                }
            },
        }
        debug!(shard = self.index, "dispatch_handled");
    }
}

/// Create the shard channels and their workers
///
/// Returns the producer handle and the workers (to be spawned).
pub fn create_dispatcher(
    engine: Arc<GeofencingEngine>,
    egress: EgressSender,
    metrics: Arc<Metrics>,
    shard_count: usize,
    buffer_size: usize,
) -> (DispatchHandle, Vec<ShardWorker>) {
    let shard_count = shard_count.max(1);
    let mut shards = Vec::with_capacity(shard_count);
    let mut workers = Vec::with_capacity(shard_count);

    for index in 0..shard_count {
        let (tx, rx) = mpsc::channel(buffer_size.max(1));
        shards.push(tx);
        workers.push(ShardWorker { index, engine: engine.clone(), rx, egress: egress.clone() });
    }

    (DispatchHandle { shards, metrics }, workers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::charge::ChargeStatus;
    use crate::domain::types::{Coordinate, Money, UserId, Vehicle, VehicleType};
    use crate::domain::zone::{Zone, ZoneRules};
    use crate::io::egress_channel::{create_egress_channel, EgressMessage};
    use crate::services::collaborators::{InMemoryVehicles, InMemoryWallets, PolygonZoneLookup};
    use crate::services::geofence::GeofenceSettings;
    use crate::services::settlement::{Pricing, SettlementLedger};
    use std::time::Duration;

    const T0: i64 = 1_700_000_000_000;

    fn engine(metrics: Arc<Metrics>) -> Arc<GeofencingEngine> {
        let zone = Zone::rectangle(
            "a",
            "Ring A",
            ZoneRules { rate_per_km: 8.0, minimum_fare: 10.0 },
            Coordinate::new(12.90, 77.60),
            Coordinate::new(12.95, 77.70),
        )
        .unwrap();
        let timeout = Duration::from_millis(50);
        let wallets = Arc::new(InMemoryWallets::with_balances(
            timeout,
            [(&UserId::from("u1"), Money(100_000)), (&UserId::from("u2"), Money(100))],
        ));
        let vehicles = Arc::new(InMemoryVehicles::new([
            Vehicle::new("KA01", "u1", VehicleType::Car),
            Vehicle::new("KA02", "u2", VehicleType::Truck),
        ]));
        let ledger =
            Arc::new(SettlementLedger::new(wallets, vehicles, Pricing::default(), timeout, metrics.clone()));
        Arc::new(GeofencingEngine::new(
            Arc::new(PolygonZoneLookup::new(vec![zone])),
            ledger,
            GeofenceSettings::default(),
            metrics,
        ))
    }

    #[test]
    fn test_shard_is_stable_per_vehicle() {
        let v = VehicleId::from("KA01");
        assert_eq!(shard_for(&v, 8), shard_for(&v, 8));
        assert!(shard_for(&v, 8) < 8);
        assert_eq!(shard_for(&v, 0), 0);
    }

    #[test]
    fn test_inbound_deserializes_tagged_lines() {
        let line = r#"{"type":"report","vehicle_id":"KA01","latitude":12.91,"longitude":77.62,"timestamp":"2024-01-01T10:00:00Z"}"#;
        let msg: Inbound = serde_json::from_str(line).unwrap();
        assert!(matches!(msg, Inbound::Report(_)));

        let line = r#"{"type":"gate_contact","vehicle_id":"KA01","gate_id":"g1","timestamp":"2024-01-01T10:00:00Z"}"#;
        let msg: Inbound = serde_json::from_str(line).unwrap();
        assert_eq!(msg.vehicle_id(), &VehicleId::from("KA01"));
    }

    #[tokio::test]
    async fn test_dispatch_preserves_per_vehicle_order() {
        let metrics = Arc::new(Metrics::new());
        let engine = engine(metrics.clone());
        let (egress, mut egress_rx) = create_egress_channel(64, "test".into(), metrics.clone());
        let (handle, workers) = create_dispatcher(engine.clone(), egress, metrics, 4, 16);
        let joins: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

        for (vehicle, offset) in [("KA01", 0), ("KA02", 1)] {
            let base = T0 + offset;
            assert!(handle.submit(Inbound::Report(PositionReport::new(vehicle, 12.91, 77.62, base))).await);
            assert!(
                handle.submit(Inbound::Report(PositionReport::new(vehicle, 12.92, 77.62, base + 60_000))).await
            );
            assert!(
                handle.submit(Inbound::Report(PositionReport::new(vehicle, 12.80, 77.62, base + 600_000))).await
            );
        }
        drop(handle);
        for join in joins {
            join.await.unwrap();
        }

        let mut per_vehicle: Vec<(String, &'static str)> = Vec::new();
        while let Ok(EgressMessage::Event(payload)) = egress_rx.try_recv() {
            let vehicle = match &payload.event {
                OutboundEvent::ZoneEntry(e) => e.vehicle_id.to_string(),
                OutboundEvent::ZoneExit(e) => e.vehicle_id.to_string(),
                _ => continue,
            };
            per_vehicle.push((vehicle, payload.kind()));
        }

        for vehicle in ["KA01", "KA02"] {
            let kinds: Vec<_> = per_vehicle.iter().filter(|(v, _)| v == vehicle).map(|(_, k)| *k).collect();
            assert_eq!(kinds, vec!["zone_entry", "zone_exit"], "vehicle {vehicle}");
        }
        assert_eq!(engine.active_count(), 0);
        // KA02 cannot cover its fare
        assert_eq!(engine.ledger().pending_count(), 1);
    }

    #[tokio::test]
    async fn test_gate_contact_emits_reconciliation() {
        let metrics = Arc::new(Metrics::new());
        let engine = engine(metrics.clone());
        let (egress, mut egress_rx) = create_egress_channel(64, "test".into(), metrics.clone());
        let (handle, workers) = create_dispatcher(engine.clone(), egress, metrics, 2, 16);
        let joins: Vec<_> = workers.into_iter().map(|w| tokio::spawn(w.run())).collect();

        handle.submit(Inbound::Report(PositionReport::new("KA02", 12.91, 77.62, T0))).await;
        handle.submit(Inbound::Report(PositionReport::new("KA02", 12.80, 77.62, T0 + 600_000))).await;
        let contact: Inbound = serde_json::from_str(
            r#"{"type":"gate_contact","vehicle_id":"KA02","gate_id":"g1","timestamp":"2023-11-14T22:30:00Z"}"#,
        )
        .unwrap();
        handle.submit(contact).await;
        drop(handle);
        for join in joins {
            join.await.unwrap();
        }

        let mut summary = None;
        let mut exit_status = None;
        while let Ok(EgressMessage::Event(payload)) = egress_rx.try_recv() {
            match payload.event {
                OutboundEvent::Reconciliation(s) => summary = Some(s),
                OutboundEvent::ZoneExit(e) => exit_status = Some(e.status),
                _ => {}
            }
        }
        assert_eq!(exit_status, Some(ChargeStatus::Pending));
        let summary = summary.unwrap();
        assert_eq!(summary.processed_count, 0);
        assert_eq!(summary.remaining_pending_count, 1);
    }
}
