//! Domain models - core corridor types
//!
//! - `types` - ids, coordinates, money, reports and vehicles
//! - `zone` - toll zones and polygon membership
//! - `journey` - a vehicle's passage through a zone
//! - `charge` - toll charges and their status
//! - `events` - payloads leaving the core

pub mod charge;
pub mod events;
pub mod journey;
pub mod types;
pub mod zone;
