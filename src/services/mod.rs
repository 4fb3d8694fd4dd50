//! Services - business logic and state management
//!
//! - `geofence` - per-vehicle zone state machine
//! - `distance` - path and straight-line journey distance
//! - `fare` - fare breakdown from distance, vehicle type and zone rules
//! - `settlement` - charges, wallet debits and gate reconciliation
//! - `collaborators` - zone lookup, wallet and vehicle directory seams
//! - `dispatcher` - sharded async feed into the engine

pub mod collaborators;
pub mod dispatcher;
pub mod distance;
pub mod fare;
pub mod geofence;
pub mod settlement;

pub use dispatcher::{create_dispatcher, DispatchHandle, Inbound, ShardWorker};
pub use geofence::{GeofenceSettings, GeofencingEngine, SweepClock};
pub use settlement::{Pricing, SettlementLedger};
