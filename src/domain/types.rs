//! Shared types for the toll corridor core

use crate::infra::error::TollError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Registered vehicle identity
    VehicleId
);
string_id!(
    /// Wallet owner identity
    UserId
);
string_id!(
    /// Toll zone identity
    ZoneId
);
string_id!(
    /// Physical toll gate identity
    GateId
);
string_id!(
    /// Journey identity (UUIDv7)
    JourneyId
);
string_id!(
    /// Toll charge identity (UUIDv7)
    ChargeId
);

/// Amount of money in minor currency units (1/100 of a unit)
///
/// Fares are computed in floating point and rounded to 2 decimal places once;
/// every wallet mutation afterwards is exact integer arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Convert from currency units, rounding to the nearest minor unit
    pub fn from_major(amount: f64) -> Self {
        Money((amount * 100.0).round() as i64)
    }

    #[inline]
    pub fn minor(self) -> i64 {
        self.0
    }

    #[inline]
    pub fn as_major(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn saturating_sub(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0))
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_major())
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let major = f64::deserialize(deserializer)?;
        if !major.is_finite() {
            return Err(serde::de::Error::custom("amount must be finite"));
        }
        Ok(Money::from_major(major))
    }
}

/// WGS84 coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Latitude in [-90, 90], longitude in [-180, 180], both finite
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn validated(lat: f64, lon: f64) -> Result<Self, TollError> {
        let coord = Self::new(lat, lon);
        if coord.is_valid() {
            Ok(coord)
        } else {
            Err(TollError::InvalidInput(format!("coordinate out of range: ({lat}, {lon})")))
        }
    }
}

/// A single accepted GPS fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsFix {
    pub coord: Coordinate,
    /// Epoch milliseconds
    pub ts_ms: i64,
}

impl GpsFix {
    pub fn new(lat: f64, lon: f64, ts_ms: i64) -> Self {
        Self { coord: Coordinate::new(lat, lon), ts_ms }
    }
}

/// Inbound position report from a vehicle's tracker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PositionReport {
    pub vehicle_id: VehicleId,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl PositionReport {
    pub fn new(vehicle_id: impl Into<String>, latitude: f64, longitude: f64, ts_ms: i64) -> Self {
        Self {
            vehicle_id: VehicleId::new(vehicle_id),
            latitude,
            longitude,
            timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap_or_default(),
            speed: None,
            heading: None,
            accuracy: None,
        }
    }

    /// Validate the report and reduce it to the fix that the engine consumes
    pub fn to_fix(&self) -> Result<GpsFix, TollError> {
        let coord = Coordinate::validated(self.latitude, self.longitude)?;

        let ts_ms = self.timestamp.timestamp_millis();
        if ts_ms <= 0 {
            return Err(TollError::InvalidInput(format!(
                "timestamp before epoch for vehicle {}",
                self.vehicle_id
            )));
        }

        if let Some(speed) = self.speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(TollError::InvalidInput(format!("invalid speed {speed}")));
            }
        }
        if let Some(heading) = self.heading {
            if !heading.is_finite() || !(0.0..=360.0).contains(&heading) {
                return Err(TollError::InvalidInput(format!("invalid heading {heading}")));
            }
        }
        if let Some(accuracy) = self.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(TollError::InvalidInput(format!("invalid accuracy {accuracy}")));
            }
        }

        Ok(GpsFix { coord, ts_ms })
    }
}

/// Vehicle classification, drives the fare multiplier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VehicleType {
    Motorcycle,
    Car,
    Van,
    Truck,
    Bus,
    Other(String),
}

impl std::str::FromStr for VehicleType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "motorcycle" | "bike" | "two_wheeler" => VehicleType::Motorcycle,
            "car" => VehicleType::Car,
            "van" => VehicleType::Van,
            "truck" => VehicleType::Truck,
            "bus" => VehicleType::Bus,
            other => VehicleType::Other(other.to_string()),
        })
    }
}

impl From<String> for VehicleType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for VehicleType {
    fn from(s: &str) -> Self {
        VehicleType::from(s.to_string())
    }
}

impl From<VehicleType> for String {
    fn from(t: VehicleType) -> Self {
        t.as_str().to_string()
    }
}

impl VehicleType {
    pub fn as_str(&self) -> &str {
        match self {
            VehicleType::Motorcycle => "motorcycle",
            VehicleType::Car => "car",
            VehicleType::Van => "van",
            VehicleType::Truck => "truck",
            VehicleType::Bus => "bus",
            VehicleType::Other(s) => s,
        }
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered vehicle (read-only to this core)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub owner: UserId,
    pub vehicle_type: VehicleType,
}

impl Vehicle {
    pub fn new(id: &str, owner: &str, vehicle_type: VehicleType) -> Self {
        Self { id: VehicleId::from(id), owner: UserId::from(owner), vehicle_type }
    }
}

/// Physical toll gate contact, triggers reconciliation of pending charges
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateContact {
    pub vehicle_id: VehicleId,
    pub gate_id: GateId,
    pub timestamp: DateTime<Utc>,
}
