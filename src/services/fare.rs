//! Fare calculator: distance, zone rules and vehicle type to a fare breakdown
//!
//! Pure, no I/O. The minimum fare is a floor applied last, after the optional
//! discount and tax modifiers.

use crate::domain::types::{Money, VehicleType};
use crate::domain::zone::ZoneRules;
use crate::services::distance::round2;
use rustc_hash::FxHashMap;
use serde::Serialize;

/// Service fee per km, floored at `MIN_SERVICE_FEE`
const SERVICE_FEE_PER_KM: f64 = 0.1;
const MIN_SERVICE_FEE: f64 = 1.0;
const DEFAULT_MULTIPLIER: f64 = 1.0;

/// Optional percentage modifiers, discount applied before tax
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FareModifiers {
    pub discount_percentage: f64,
    pub tax_percentage: f64,
}

/// Vehicle type to fare multiplier
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplierTable {
    by_type: FxHashMap<String, f64>,
}

impl Default for MultiplierTable {
    fn default() -> Self {
        let mut by_type = FxHashMap::default();
        by_type.insert(VehicleType::Motorcycle.as_str().to_string(), 0.5);
        by_type.insert(VehicleType::Car.as_str().to_string(), 1.0);
        by_type.insert(VehicleType::Van.as_str().to_string(), 1.5);
        by_type.insert(VehicleType::Truck.as_str().to_string(), 2.0);
        by_type.insert(VehicleType::Bus.as_str().to_string(), 2.5);
        Self { by_type }
    }
}

impl MultiplierTable {
    /// Default table with per-type overrides (keys parsed as vehicle types)
    pub fn with_overrides<'a>(overrides: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut table = Self::default();
        for (key, multiplier) in overrides {
            let vehicle_type: VehicleType = key.into();
            table.by_type.insert(vehicle_type.as_str().to_string(), multiplier);
        }
        table
    }

    /// Multiplier for `vehicle_type`, 1.0 when unknown
    pub fn get(&self, vehicle_type: &VehicleType) -> f64 {
        self.by_type.get(vehicle_type.as_str()).copied().unwrap_or(DEFAULT_MULTIPLIER)
    }
}

/// Every intermediate of the fare computation, monetary values rounded to 2 dp
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FareBreakdown {
    pub distance_km: f64,
    pub rate_per_km: f64,
    pub vehicle_type: VehicleType,
    pub base_fare: f64,
    pub distance_charge: f64,
    pub vehicle_multiplier: f64,
    pub vehicle_adjusted: f64,
    pub service_fee: f64,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub tax_amount: f64,
    pub final_fare: f64,
    /// The minimum fare floor set the final amount
    pub minimum_applied: bool,
}

impl FareBreakdown {
    /// Final fare in exact minor units
    pub fn amount(&self) -> Money {
        Money::from_major(self.final_fare)
    }
}

pub fn calculate_fare(
    distance_km: f64,
    vehicle_type: &VehicleType,
    rules: &ZoneRules,
    modifiers: &FareModifiers,
    multipliers: &MultiplierTable,
) -> FareBreakdown {
    let distance_km = if distance_km.is_finite() { distance_km.max(0.0) } else { 0.0 };

    let base_fare = rules.minimum_fare;
    let distance_charge = distance_km * rules.rate_per_km;
    let vehicle_multiplier = multipliers.get(vehicle_type);
    let vehicle_adjusted = distance_charge * vehicle_multiplier;
    let service_fee = (distance_km * SERVICE_FEE_PER_KM).max(MIN_SERVICE_FEE);
    let subtotal = vehicle_adjusted + service_fee;

    let discount_amount = if modifiers.discount_percentage > 0.0 {
        subtotal * modifiers.discount_percentage / 100.0
    } else {
        0.0
    };
    let discounted = subtotal - discount_amount;
    let tax_amount = if modifiers.tax_percentage > 0.0 {
        discounted * modifiers.tax_percentage / 100.0
    } else {
        0.0
    };
    let modified = discounted + tax_amount;

    let minimum_applied = modified < base_fare;
    let final_fare = round2(modified.max(base_fare));

    FareBreakdown {
        distance_km,
        rate_per_km: rules.rate_per_km,
        vehicle_type: vehicle_type.clone(),
        base_fare: round2(base_fare),
        distance_charge: round2(distance_charge),
        vehicle_multiplier,
        vehicle_adjusted: round2(vehicle_adjusted),
        service_fee: round2(service_fee),
        subtotal: round2(subtotal),
        discount_amount: round2(discount_amount),
        tax_amount: round2(tax_amount),
        final_fare,
        minimum_applied,
    }
}
