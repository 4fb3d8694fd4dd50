//! Outbound payloads produced by the core

use crate::domain::charge::ChargeStatus;
use crate::domain::types::{ChargeId, Coordinate, GateId, JourneyId, Money, UserId, VehicleId, ZoneId};
use crate::services::distance::DistanceMethod;
use chrono::{DateTime, Utc};
use serde::Serialize;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneEntryEvent {
    pub journey_id: JourneyId,
    pub vehicle_id: VehicleId,
    pub zone_id: ZoneId,
    pub entry_time: DateTime<Utc>,
    pub entry_point: Coordinate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneExitEvent {
    pub journey_id: JourneyId,
    pub vehicle_id: VehicleId,
    pub zone_id: ZoneId,
    pub charge_id: ChargeId,
    pub distance_km: f64,
    pub distance_method: DistanceMethod,
    pub fare: Money,
    pub status: ChargeStatus,
    pub exit_time: DateTime<Utc>,
}

/// Result of settling pending charges at a gate contact
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationSummary {
    pub user_id: UserId,
    pub vehicle_id: VehicleId,
    pub gate_id: GateId,
    pub processed_count: usize,
    pub total_amount: Money,
    pub remaining_pending_count: usize,
    pub remaining_pending_amount: Money,
    /// Settled charges in settlement order
    pub settled: SmallVec<[ChargeId; 4]>,
}

/// Outcome of one `observe` call
#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceEvent {
    None,
    Entry(ZoneEntryEvent),
    Exit(ZoneExitEvent),
    Continuing { journey_id: JourneyId },
    ZoneChange { exit: ZoneExitEvent, entry: ZoneEntryEvent },
}

impl GeofenceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            GeofenceEvent::None => "NONE",
            GeofenceEvent::Entry(_) => "ENTRY",
            GeofenceEvent::Exit(_) => "EXIT",
            GeofenceEvent::Continuing { .. } => "CONTINUING",
            GeofenceEvent::ZoneChange { .. } => "ZONE_CHANGE",
        }
    }

    /// Payloads worth publishing, in emission order
    pub fn outbound(&self) -> SmallVec<[OutboundEvent; 2]> {
        let mut out = SmallVec::new();
        match self {
            GeofenceEvent::Entry(entry) => out.push(OutboundEvent::ZoneEntry(entry.clone())),
            GeofenceEvent::Exit(exit) => out.push(OutboundEvent::ZoneExit(exit.clone())),
            GeofenceEvent::ZoneChange { exit, entry } => {
                out.push(OutboundEvent::ZoneExit(exit.clone()));
                out.push(OutboundEvent::ZoneEntry(entry.clone()));
            }
            GeofenceEvent::None | GeofenceEvent::Continuing { .. } => {}
        }
        out
    }
}

/// Journey cancelled by an operator or the stale sweep
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JourneyCancelledEvent {
    pub journey_id: JourneyId,
    pub vehicle_id: VehicleId,
    pub zone_id: ZoneId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeCancelledEvent {
    pub charge_id: ChargeId,
    pub journey_id: JourneyId,
    pub user_id: UserId,
    pub amount: Money,
    pub reason: String,
}

/// Envelope for everything leaving the core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    ZoneEntry(ZoneEntryEvent),
    ZoneExit(ZoneExitEvent),
    Reconciliation(ReconciliationSummary),
    JourneyCancelled(JourneyCancelledEvent),
    ChargeCancelled(ChargeCancelledEvent),
}

impl OutboundEvent {
    pub fn type_str(&self) -> &'static str {
        match self {
            OutboundEvent::ZoneEntry(_) => "zone_entry",
            OutboundEvent::ZoneExit(_) => "zone_exit",
            OutboundEvent::Reconciliation(_) => "reconciliation",
            OutboundEvent::JourneyCancelled(_) => "journey_cancelled",
            OutboundEvent::ChargeCancelled(_) => "charge_cancelled",
        }
    }
}
