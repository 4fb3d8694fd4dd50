//! Infrastructure - configuration, errors, locks and metrics

pub mod config;
pub mod error;
pub mod locks;
pub mod metrics;

pub use config::Config;
pub use error::{TollError, WalletError};
pub use metrics::Metrics;
