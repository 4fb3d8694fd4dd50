//! Toll corridor core
//!
//! Geofencing, distance, fare and settlement for distance-based road tolling.
//! Exposes modules for integration testing and the replay binary.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
