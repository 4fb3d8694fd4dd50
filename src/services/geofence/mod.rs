//! Geofencing engine: per-vehicle zone state machine
//!
//! Each vehicle owns one slot in a keyed lock table. A slot holds at most one
//! active journey, so two concurrent reports for the same vehicle can never
//! both see "no journey" and open two.
//!
//! Decision per report:
//! - outside, no journey: `NONE`
//! - inside, no journey: open, `ENTRY`
//! - outside, journey: settle and close, `EXIT`
//! - inside the journey's zone: `CONTINUING`
//! - inside another zone: close then open, `ZONE_CHANGE`

mod transitions;

use crate::domain::events::{GeofenceEvent, JourneyCancelledEvent};
use crate::domain::journey::{epoch_ms, Journey, JourneyStatus};
use crate::domain::types::{Coordinate, JourneyId, PositionReport, VehicleId};
use crate::domain::zone::Zone;
use crate::infra::error::TollError;
use crate::infra::locks::KeyedLocks;
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::services::collaborators::ZoneLookup;
use crate::services::distance::PathOptions;
use crate::services::settlement::SettlementLedger;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Clock the stale sweep measures journey age against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepClock {
    /// Wall clock, for live feeds
    #[default]
    Wall,
    /// Latest accepted report timestamp, for replays of recorded data
    Report,
}

/// Engine tuning, usually built from `Config`
#[derive(Debug, Clone)]
pub struct GeofenceSettings {
    /// Active journeys older than this are cancelled by the sweep
    pub stale_after: Duration,
    pub sweep_clock: SweepClock,
    /// Wait bound on a vehicle's slot before `ConcurrencyConflict`
    pub lock_timeout: Duration,
    /// Reports stamped further than this ahead of the wall clock are rejected
    pub max_future_skew: Duration,
    /// Treat a failed zone lookup as "outside every zone"
    pub lookup_failure_as_outside: bool,
    /// Fixes needed before path distance is preferred over straight line
    pub min_path_points: usize,
    pub path: PathOptions,
}

impl Default for GeofenceSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(24 * 60 * 60),
            sweep_clock: SweepClock::Wall,
            lock_timeout: Duration::from_millis(250),
            max_future_skew: Duration::from_secs(300),
            lookup_failure_as_outside: false,
            min_path_points: 3,
            path: PathOptions::default(),
        }
    }
}

/// Per-vehicle state
#[derive(Debug, Default)]
pub(crate) struct VehicleSlot {
    pub(crate) active: Option<Journey>,
    /// Timestamp of the last accepted report
    pub(crate) last_ts_ms: Option<i64>,
}

pub struct GeofencingEngine {
    zones: Arc<dyn ZoneLookup>,
    ledger: Arc<SettlementLedger>,
    settings: GeofenceSettings,
    slots: KeyedLocks<VehicleId, VehicleSlot>,
    /// Journeys that left the active state. In-memory stand-in for the
    /// journey store; entries are never evicted.
    closed: Mutex<FxHashMap<JourneyId, Journey>>,
    /// Highest accepted report timestamp, 0 before the first report
    report_clock_ms: AtomicI64,
    metrics: Arc<Metrics>,
}

impl GeofencingEngine {
    pub fn new(
        zones: Arc<dyn ZoneLookup>,
        ledger: Arc<SettlementLedger>,
        settings: GeofenceSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        let slots = KeyedLocks::new(settings.lock_timeout);
        Self {
            zones,
            ledger,
            settings,
            slots,
            closed: Mutex::new(FxHashMap::default()),
            report_clock_ms: AtomicI64::new(0),
            metrics,
        }
    }

    pub fn ledger(&self) -> &Arc<SettlementLedger> {
        &self.ledger
    }

    pub fn settings(&self) -> &GeofenceSettings {
        &self.settings
    }

    /// Metrics snapshot with the live journey and pending-charge gauges filled in
    pub fn metrics_snapshot(&self) -> MetricsSummary {
        self.metrics.report(self.active_count(), self.ledger.pending_count())
    }

    /// Feed one position report through the state machine
    ///
    /// Invalid reports are rejected without touching journey state. When
    /// settlement fails on exit the journey stays active and the error is
    /// returned, so the next report retries the exit.
    pub fn observe(&self, report: &PositionReport) -> Result<GeofenceEvent, TollError> {
        let started = Instant::now();
        let result = self.observe_inner(report);

        match &result {
            Ok(event) => {
                self.metrics.record_report_processed(started.elapsed().as_micros() as u64);
                debug!(vehicle_id = %report.vehicle_id, event = event.kind(), "report_observed");
            }
            Err(e @ TollError::InvalidInput(_)) => {
                self.metrics.record_report_rejected();
                warn!(vehicle_id = %report.vehicle_id, error = %e, "report_rejected");
            }
            Err(e @ TollError::InvariantViolation(_)) => {
                error!(vehicle_id = %report.vehicle_id, error = %e, "invariant_violation");
            }
            Err(e) => {
                warn!(
                    vehicle_id = %report.vehicle_id,
                    kind = e.kind(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "report_failed"
                );
            }
        }
        result
    }

    fn observe_inner(&self, report: &PositionReport) -> Result<GeofenceEvent, TollError> {
        let fix = report.to_fix()?;
        let horizon_ms = epoch_ms() + self.settings.max_future_skew.as_millis() as i64;
        if fix.ts_ms > horizon_ms {
            return Err(TollError::InvalidInput(format!(
                "report at {} is more than {}s ahead of the clock for vehicle {}",
                fix.ts_ms,
                self.settings.max_future_skew.as_secs(),
                report.vehicle_id
            )));
        }
        let zone = self.lookup(report)?;

        let slot = self.slots.slot(&report.vehicle_id);
        let mut slot = slot.try_lock_for(self.settings.lock_timeout).ok_or_else(|| {
            self.metrics.record_lock_conflict();
            TollError::ConcurrencyConflict { resource: format!("vehicle:{}", report.vehicle_id) }
        })?;

        if let Some(last) = slot.last_ts_ms {
            if fix.ts_ms < last {
                return Err(TollError::InvalidInput(format!(
                    "report at {} is older than last accepted {} for vehicle {}",
                    fix.ts_ms, last, report.vehicle_id
                )));
            }
        }

        let event = self.transition(&mut slot, &report.vehicle_id, zone, fix)?;
        slot.last_ts_ms = Some(fix.ts_ms);
        self.report_clock_ms.fetch_max(fix.ts_ms, Ordering::Relaxed);
        Ok(event)
    }

    /// Current time for the stale sweep, `None` on the report clock before any report
    pub fn sweep_now_ms(&self) -> Option<i64> {
        match self.settings.sweep_clock {
            SweepClock::Wall => Some(epoch_ms()),
            SweepClock::Report => Some(self.report_clock_ms.load(Ordering::Relaxed)).filter(|ms| *ms > 0),
        }
    }

    fn lookup(&self, report: &PositionReport) -> Result<Option<Arc<Zone>>, TollError> {
        let point = Coordinate::new(report.latitude, report.longitude);
        match self.zones.zone_at(point) {
            Ok(zone) => Ok(zone),
            Err(e) => {
                self.metrics.record_lookup_failure();
                if self.settings.lookup_failure_as_outside {
                    warn!(vehicle_id = %report.vehicle_id, error = %e, "zone_lookup_failed_as_outside");
                    Ok(None)
                } else {
                    Err(match e {
                        TollError::ZoneLookupFailure { .. } => e,
                        other => TollError::ZoneLookupFailure { reason: other.to_string(), retryable: true },
                    })
                }
            }
        }
    }

    /// Operator cancellation of a vehicle's active journey
    pub fn cancel_journey(&self, vehicle_id: &VehicleId, reason: &str) -> Result<JourneyCancelledEvent, TollError> {
        let slot = self
            .slots
            .existing(vehicle_id)
            .ok_or_else(|| TollError::InvalidInput(format!("no active journey for vehicle {vehicle_id}")))?;
        let mut slot = slot.try_lock_for(self.settings.lock_timeout).ok_or_else(|| {
            self.metrics.record_lock_conflict();
            TollError::ConcurrencyConflict { resource: format!("vehicle:{vehicle_id}") }
        })?;

        let journey = slot
            .active
            .take()
            .ok_or_else(|| TollError::InvalidInput(format!("no active journey for vehicle {vehicle_id}")))?;
        let event = self.retire_cancelled(journey, reason, false);
        Ok(event)
    }

    /// Cancel active journeys older than `stale_after` as of `now_ms`
    ///
    /// Vehicles whose slot is busy are skipped and picked up by the next sweep.
    pub fn sweep_stale(&self, now_ms: i64) -> Vec<JourneyCancelledEvent> {
        let threshold_ms = self.settings.stale_after.as_millis() as i64;
        let mut cancelled = Vec::new();

        for vehicle_id in self.slots.keys() {
            let Some(slot) = self.slots.existing(&vehicle_id) else { continue };
            let Some(mut slot) = slot.try_lock_for(self.settings.lock_timeout) else {
                debug!(vehicle_id = %vehicle_id, "sweep_skipped_busy");
                continue;
            };
            let stale = slot.active.as_ref().is_some_and(|j| j.age_ms(now_ms) > threshold_ms);
            if !stale {
                continue;
            }
            if let Some(journey) = slot.active.take() {
                let reason = format!("stale: no exit within {}s", self.settings.stale_after.as_secs());
                cancelled.push(self.retire_cancelled(journey, &reason, true));
            }
        }

        if !cancelled.is_empty() {
            info!(count = cancelled.len(), "stale_sweep");
        }
        cancelled
    }

    fn retire_cancelled(&self, mut journey: Journey, reason: &str, stale: bool) -> JourneyCancelledEvent {
        journey.cancel(reason);
        self.metrics.record_journey_cancelled(stale);
        info!(
            vehicle_id = %journey.vehicle_id,
            journey_id = %journey.id,
            zone_id = %journey.zone_id,
            reason = %reason,
            "journey_cancelled"
        );
        let event = JourneyCancelledEvent {
            journey_id: journey.id.clone(),
            vehicle_id: journey.vehicle_id.clone(),
            zone_id: journey.zone_id.clone(),
            reason: reason.to_string(),
        };
        self.closed.lock().insert(journey.id.clone(), journey);
        event
    }

    /// Load journeys from persistence
    ///
    /// Refuses the whole batch if any vehicle would end up with two active
    /// journeys, whether within the batch or against current state. A slot
    /// that stays busy past the lock timeout fails the batch with
    /// `ConcurrencyConflict`.
    pub fn hydrate(&self, journeys: Vec<Journey>) -> Result<usize, TollError> {
        let mut seen: FxHashSet<&VehicleId> = FxHashSet::default();
        for journey in journeys.iter().filter(|j| j.is_active()) {
            let occupied = self
                .slots
                .with_lock(&journey.vehicle_id, |slot| slot.active.is_some())
                .ok_or_else(|| self.hydrate_conflict(&journey.vehicle_id))?;
            if !seen.insert(&journey.vehicle_id) || occupied {
                return Err(self.hydrate_refused(journey));
            }
        }

        let count = journeys.len();
        for journey in journeys {
            if journey.status != JourneyStatus::Active {
                self.closed.lock().insert(journey.id.clone(), journey);
                continue;
            }
            let vehicle_id = journey.vehicle_id.clone();
            // A report may have opened a journey since the check above
            let loaded = self.slots.with_lock(&vehicle_id, |slot| {
                if slot.active.is_some() {
                    return Err(self.hydrate_refused(&journey));
                }
                let last_ts = journey.trace.last().map_or(journey.entry.ts_ms, |f| f.ts_ms);
                slot.last_ts_ms = Some(slot.last_ts_ms.map_or(last_ts, |ts| ts.max(last_ts)));
                slot.active = Some(journey);
                Ok(())
            });
            loaded.ok_or_else(|| self.hydrate_conflict(&vehicle_id))??;
        }
        info!(count, "journeys_hydrated");
        Ok(count)
    }

    fn hydrate_refused(&self, journey: &Journey) -> TollError {
        error!(vehicle_id = %journey.vehicle_id, journey_id = %journey.id, "hydrate_refused");
        TollError::InvariantViolation(format!("vehicle {} has more than one active journey", journey.vehicle_id))
    }

    fn hydrate_conflict(&self, vehicle_id: &VehicleId) -> TollError {
        self.metrics.record_lock_conflict();
        TollError::ConcurrencyConflict { resource: format!("vehicle:{vehicle_id}") }
    }

    pub fn active_journey(&self, vehicle_id: &VehicleId) -> Option<Journey> {
        let slot = self.slots.existing(vehicle_id)?;
        let guard = slot.try_lock_for(self.settings.lock_timeout)?;
        guard.active.clone()
    }

    /// Number of vehicles with an active journey (busy slots are skipped)
    pub fn active_count(&self) -> usize {
        self.slots
            .keys()
            .iter()
            .filter_map(|v| self.slots.existing(v))
            .filter(|slot| slot.try_lock_for(self.settings.lock_timeout).is_some_and(|s| s.active.is_some()))
            .count()
    }

    /// A journey that has been completed or cancelled
    pub fn closed_journey(&self, id: &JourneyId) -> Option<Journey> {
        self.closed.lock().get(id).cloned()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.lock().len()
    }
}
