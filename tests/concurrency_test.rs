//! Concurrent access to the engine and ledger from plain threads

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::DateTime;
use toll_corridor::domain::charge::ChargeStatus;
use toll_corridor::domain::events::GeofenceEvent;
use toll_corridor::domain::types::{
    Coordinate, GateContact, GateId, Money, PositionReport, UserId, Vehicle, VehicleId, VehicleType,
};
use toll_corridor::domain::zone::{Zone, ZoneRules};
use toll_corridor::infra::{Metrics, TollError};
use toll_corridor::services::collaborators::{InMemoryVehicles, InMemoryWallets, PolygonZoneLookup};
use toll_corridor::services::settlement::Pricing;
use toll_corridor::services::{GeofenceSettings, GeofencingEngine, SettlementLedger};

const T0: i64 = 1_700_000_000_000;
const FLEET: usize = 4;

/// One owner with `FLEET` cars sharing a 40.00 wallet
fn fleet_engine() -> Arc<GeofencingEngine> {
    let metrics = Arc::new(Metrics::new());
    let zone = Zone::rectangle(
        "orr",
        "Outer Ring Road",
        ZoneRules { rate_per_km: 8.0, minimum_fare: 10.0 },
        Coordinate::new(12.90, 77.60),
        Coordinate::new(12.95, 77.70),
    )
    .unwrap();

    let timeout = Duration::from_secs(2);
    let wallets = Arc::new(InMemoryWallets::with_balances(timeout, [(&UserId::from("fleet"), Money::from_major(40.0))]));
    let vehicles = Arc::new(InMemoryVehicles::new(
        (0..FLEET).map(|i| Vehicle::new(&format!("KA{i:02}"), "fleet", VehicleType::Car)),
    ));
    let ledger = Arc::new(SettlementLedger::new(wallets, vehicles, Pricing::default(), timeout, metrics.clone()));
    Arc::new(GeofencingEngine::new(
        Arc::new(PolygonZoneLookup::new(vec![zone])),
        ledger,
        GeofenceSettings { lock_timeout: timeout, ..Default::default() },
        metrics,
    ))
}

#[test]
fn test_racing_reports_open_one_journey() {
    let engine = fleet_engine();
    let barrier = Arc::new(Barrier::new(8));

    let kinds: Vec<&'static str> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = &engine;
                let barrier = barrier.clone();
                s.spawn(move || {
                    barrier.wait();
                    engine.observe(&PositionReport::new("KA00", 12.91, 77.62, T0)).map(|e| e.kind())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
    });

    assert_eq!(kinds.iter().filter(|k| **k == "ENTRY").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "CONTINUING").count(), 7);
    assert_eq!(engine.active_count(), 1);

    let journey = engine.active_journey(&VehicleId::from("KA00")).unwrap();
    assert_eq!(journey.trace.len(), 8);
}

#[test]
fn test_concurrent_exits_never_overdraw_shared_wallet() {
    let engine = fleet_engine();
    for i in 0..FLEET {
        engine.observe(&PositionReport::new(format!("KA{i:02}"), 12.91, 77.62, T0)).unwrap();
    }

    let barrier = Arc::new(Barrier::new(FLEET));
    let exits: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..FLEET)
            .map(|i| {
                let engine = &engine;
                let barrier = barrier.clone();
                s.spawn(move || {
                    barrier.wait();
                    engine.observe(&PositionReport::new(format!("KA{i:02}"), 12.89, 77.62, T0 + 60_000))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let exits: Vec<_> = exits
        .into_iter()
        .map(|e| match e {
            Ok(GeofenceEvent::Exit(exit)) => exit,
            other => panic!("expected EXIT, got {other:?}"),
        })
        .collect();

    // Each trip costs 18.79; 40.00 covers exactly two
    assert!(exits.iter().all(|e| e.fare == Money::from_major(18.79)));
    let completed = exits.iter().filter(|e| e.status == ChargeStatus::Completed).count();
    assert_eq!(completed, 2);

    let ledger = engine.ledger();
    let fleet = UserId::from("fleet");
    assert_eq!(ledger.balance(&fleet).unwrap(), Money::from_major(2.42));
    assert_eq!(ledger.pending_count(), 2);
    assert_eq!(engine.active_count(), 0);
}

#[test]
fn test_concurrent_gate_contacts_settle_each_charge_once() {
    let engine = fleet_engine();
    let ledger = engine.ledger().clone();
    let fleet = UserId::from("fleet");

    for i in 0..FLEET {
        let vehicle = format!("KA{i:02}");
        engine.observe(&PositionReport::new(vehicle.as_str(), 12.91, 77.62, T0 + i as i64)).unwrap();
        engine.observe(&PositionReport::new(vehicle.as_str(), 12.89, 77.62, T0 + 60_000 + i as i64)).unwrap();
    }
    assert_eq!(ledger.pending_count(), 2);
    let owed: Money = ledger.charges_for_user(&fleet).iter().filter(|c| c.is_pending()).map(|c| c.amount).sum();
    ledger.credit(&fleet, owed).unwrap();

    let barrier = Arc::new(Barrier::new(FLEET));
    let summaries: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..FLEET)
            .map(|i| {
                let ledger = &ledger;
                let barrier = barrier.clone();
                s.spawn(move || -> Result<_, TollError> {
                    barrier.wait();
                    ledger.reconcile_at_gate(&GateContact {
                        vehicle_id: VehicleId::from(format!("KA{i:02}").as_str()),
                        gate_id: GateId::from("gate-1"),
                        timestamp: DateTime::from_timestamp_millis(T0 + 600_000).unwrap(),
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap().unwrap()).collect()
    });

    let processed: usize = summaries.iter().map(|s| s.processed_count).sum();
    assert_eq!(processed, 2);
    assert_eq!(ledger.pending_count(), 0);
    assert_eq!(ledger.balance(&fleet).unwrap(), Money::from_major(2.42));
    assert!(ledger.charges_for_user(&fleet).iter().all(|c| c.status == ChargeStatus::Completed));
}
