//! Journey data model: one vehicle's continuous presence inside a zone

use crate::domain::types::{ChargeId, GpsFix, JourneyId, VehicleId, ZoneId};
use crate::domain::zone::ZoneRules;
use crate::services::distance::JourneyDistance;
use crate::services::fare::FareBreakdown;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Journey lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JourneyStatus {
    Active,
    Completed,
    Cancelled,
}

impl JourneyStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            JourneyStatus::Active => "active",
            JourneyStatus::Completed => "completed",
            JourneyStatus::Cancelled => "cancelled",
        }
    }
}

/// A vehicle's passage through one zone
#[derive(Debug, Clone, Serialize)]
pub struct Journey {
    pub id: JourneyId,
    pub vehicle_id: VehicleId,
    pub zone_id: ZoneId,
    /// Zone rates as of entry
    pub rules: ZoneRules,
    pub entry: GpsFix,
    pub exit: Option<GpsFix>,
    pub distance: Option<JourneyDistance>,
    pub fare: Option<FareBreakdown>,
    pub charge_id: Option<ChargeId>,
    pub status: JourneyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    /// Accepted fixes since entry, entry fix included
    #[serde(skip)]
    pub trace: Vec<GpsFix>,
}

impl Journey {
    /// Open a new active journey at the given entry fix
    ///
    /// # Example
    ///
    /// ```
    /// use toll_corridor::domain::journey::{Journey, JourneyStatus};
    /// use toll_corridor::domain::types::{GpsFix, VehicleId, ZoneId};
    /// use toll_corridor::domain::zone::ZoneRules;
    ///
    /// let journey = Journey::open(
    ///     VehicleId::from("KA01"),
    ///     ZoneId::from("nh544"),
    ///     ZoneRules { rate_per_km: 8.0, minimum_fare: 10.0 },
    ///     GpsFix::new(11.0, 77.0, 1_700_000_000_000),
    /// );
    /// assert_eq!(journey.status, JourneyStatus::Active);
    /// assert_eq!(journey.trace.len(), 1);
    /// ```
    pub fn open(vehicle_id: VehicleId, zone_id: ZoneId, rules: ZoneRules, entry: GpsFix) -> Self {
        Self {
            id: JourneyId::new(new_uuid_v7()),
            vehicle_id,
            zone_id,
            rules,
            entry,
            exit: None,
            distance: None,
            fare: None,
            charge_id: None,
            status: JourneyStatus::Active,
            cancel_reason: None,
            trace: vec![entry],
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == JourneyStatus::Active
    }

    /// Record a fix observed while inside the zone
    pub fn record_fix(&mut self, fix: GpsFix) {
        self.trace.push(fix);
    }

    /// Age of the journey relative to `now_ms`
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.entry.ts_ms)
    }

    /// Mark completed with the settled distance, fare and charge
    pub fn complete(
        &mut self,
        exit: GpsFix,
        distance: JourneyDistance,
        fare: FareBreakdown,
        charge_id: ChargeId,
    ) {
        self.exit = Some(exit);
        self.distance = Some(distance);
        self.fare = Some(fare);
        self.charge_id = Some(charge_id);
        self.status = JourneyStatus::Completed;
        self.trace.clear();
    }

    /// Mark cancelled with a reason
    pub fn cancel(&mut self, reason: &str) {
        self.status = JourneyStatus::Cancelled;
        self.cancel_reason = Some(reason.to_string());
        self.trace.clear();
    }
}
