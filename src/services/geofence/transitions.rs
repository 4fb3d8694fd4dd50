//! State transitions for a single vehicle slot

use super::{GeofencingEngine, VehicleSlot};
use crate::domain::events::{GeofenceEvent, ZoneEntryEvent, ZoneExitEvent};
use crate::domain::journey::Journey;
use crate::domain::types::{GpsFix, VehicleId};
use crate::domain::zone::Zone;
use crate::infra::error::TollError;
use crate::services::distance::journey_distance;
use crate::services::settlement::ExitSettlement;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

fn to_datetime(ts_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts_ms).unwrap_or_default()
}

impl GeofencingEngine {
    /// Apply the decision table; caller holds the slot lock
    pub(super) fn transition(
        &self,
        slot: &mut VehicleSlot,
        vehicle_id: &VehicleId,
        zone: Option<Arc<Zone>>,
        fix: GpsFix,
    ) -> Result<GeofenceEvent, TollError> {
        let same_zone = match (&zone, &slot.active) {
            (Some(z), Some(j)) => Some(z.id == j.zone_id),
            _ => None,
        };

        match (zone, same_zone) {
            (None, None) if slot.active.is_none() => Ok(GeofenceEvent::None),
            (Some(zone), None) => Ok(GeofenceEvent::Entry(self.open(slot, vehicle_id, &zone, fix))),
            (None, _) => {
                let exit = self.close(slot, fix)?;
                Ok(GeofenceEvent::Exit(exit))
            }
            (Some(_), Some(true)) => {
                // Duplicate reports at the same instant land here too
                let journey = slot
                    .active
                    .as_mut()
                    .ok_or_else(|| TollError::InvariantViolation("continuing without journey".into()))?;
                journey.record_fix(fix);
                debug!(vehicle_id = %vehicle_id, journey_id = %journey.id, "journey_continuing");
                Ok(GeofenceEvent::Continuing { journey_id: journey.id.clone() })
            }
            (Some(zone), Some(false)) => {
                let exit = self.close(slot, fix)?;
                let entry = self.open(slot, vehicle_id, &zone, fix);
                self.metrics.record_zone_change();
                info!(
                    vehicle_id = %vehicle_id,
                    from_zone = %exit.zone_id,
                    to_zone = %entry.zone_id,
                    "zone_change"
                );
                Ok(GeofenceEvent::ZoneChange { exit, entry })
            }
        }
    }

    fn open(&self, slot: &mut VehicleSlot, vehicle_id: &VehicleId, zone: &Zone, fix: GpsFix) -> ZoneEntryEvent {
        let journey = Journey::open(vehicle_id.clone(), zone.id.clone(), zone.rules, fix);
        let event = ZoneEntryEvent {
            journey_id: journey.id.clone(),
            vehicle_id: vehicle_id.clone(),
            zone_id: zone.id.clone(),
            entry_time: to_datetime(fix.ts_ms),
            entry_point: fix.coord,
        };
        info!(
            vehicle_id = %vehicle_id,
            journey_id = %journey.id,
            zone_id = %zone.id,
            zone_name = %zone.name,
            "journey_opened"
        );
        self.metrics.record_entry();
        slot.active = Some(journey);
        event
    }

    /// Settle and complete the active journey
    ///
    /// The journey is only taken out of the slot once settlement succeeded.
    fn close(&self, slot: &mut VehicleSlot, exit_fix: GpsFix) -> Result<ZoneExitEvent, TollError> {
        let journey = slot
            .active
            .as_ref()
            .ok_or_else(|| TollError::InvariantViolation("exit without active journey".into()))?;

        let mut trace = journey.trace.clone();
        trace.push(exit_fix);
        let (distance, path) = journey_distance(
            &trace,
            &journey.entry,
            &exit_fix,
            &self.settings.path,
            self.settings.min_path_points,
        );
        if let Some(path) = &path {
            self.metrics.record_segments_filtered(path.filtered_count as u64);
            if path.filtered_count > 0 {
                debug!(
                    journey_id = %journey.id,
                    filtered = path.filtered_count,
                    valid = path.valid_segments,
                    "segments_filtered"
                );
            }
        }

        let settled = self
            .ledger
            .settle_exit(&ExitSettlement {
                journey_id: &journey.id,
                vehicle_id: &journey.vehicle_id,
                rules: &journey.rules,
                distance_km: distance.km,
                at_ms: exit_fix.ts_ms,
            })
            .map_err(|e| {
                error!(journey_id = %journey.id, error = %e, "exit_settlement_failed");
                e
            })?;

        let Some(mut journey) = slot.active.take() else {
            return Err(TollError::InvariantViolation("journey vanished during settlement".into()));
        };
        let event = ZoneExitEvent {
            journey_id: journey.id.clone(),
            vehicle_id: journey.vehicle_id.clone(),
            zone_id: journey.zone_id.clone(),
            charge_id: settled.charge.id.clone(),
            distance_km: distance.km,
            distance_method: distance.method,
            fare: settled.charge.amount,
            status: settled.charge.status,
            exit_time: to_datetime(exit_fix.ts_ms),
        };
        journey.complete(exit_fix, distance, settled.fare, settled.charge.id);

        info!(
            vehicle_id = %journey.vehicle_id,
            journey_id = %journey.id,
            zone_id = %journey.zone_id,
            distance_km = distance.km,
            method = ?distance.method,
            fare = %event.fare,
            status = event.status.as_str(),
            "journey_closed"
        );
        self.metrics.record_exit();
        self.closed.lock().insert(journey.id.clone(), journey);
        Ok(event)
    }
}
