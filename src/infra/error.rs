//! Error taxonomy for the toll corridor core
//!
//! Insufficient funds is not listed here: it is an expected outcome that
//! produces a pending charge, reported by the wallet primitive as
//! [`WalletError::InsufficientFunds`].

use crate::domain::types::{ChargeId, Money, UserId, VehicleId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TollError {
    /// Malformed coordinates, timestamps or identifiers; the report is dropped
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("zone lookup failed: {reason}")]
    ZoneLookupFailure { reason: String, retryable: bool },

    /// Lock contention on wallet or per-vehicle state
    #[error("concurrency conflict on {resource}")]
    ConcurrencyConflict { resource: String },

    /// Fatal, requires operator intervention
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("unknown vehicle {0}")]
    UnknownVehicle(VehicleId),

    #[error("unknown charge {0}")]
    UnknownCharge(ChargeId),

    /// Unexpected settlement fault; the journey stays active
    #[error("settlement failed: {0}")]
    Settlement(String),
}

impl TollError {
    /// Whether the caller should retry the same input later
    pub fn is_retryable(&self) -> bool {
        match self {
            TollError::ZoneLookupFailure { retryable, .. } => *retryable,
            TollError::ConcurrencyConflict { .. } | TollError::Settlement(_) => true,
            TollError::InvalidInput(_)
            | TollError::InvariantViolation(_)
            | TollError::UnknownVehicle(_)
            | TollError::UnknownCharge(_) => false,
        }
    }

    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            TollError::InvalidInput(_) => "invalid_input",
            TollError::ZoneLookupFailure { .. } => "zone_lookup_failure",
            TollError::ConcurrencyConflict { .. } => "concurrency_conflict",
            TollError::InvariantViolation(_) => "invariant_violation",
            TollError::UnknownVehicle(_) => "unknown_vehicle",
            TollError::UnknownCharge(_) => "unknown_charge",
            TollError::Settlement(_) => "settlement",
        }
    }
}

/// Outcomes of the wallet debit/credit primitive
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WalletError {
    #[error("insufficient funds for {user}: required {required}, available {available}")]
    InsufficientFunds { user: UserId, required: Money, available: Money },

    #[error("no wallet for {0}")]
    UnknownWallet(UserId),

    #[error("invalid amount {0}")]
    InvalidAmount(Money),

    #[error("wallet {0} is locked")]
    Contended(UserId),
}

impl From<WalletError> for TollError {
    /// Used only for wallet faults; callers branch on `InsufficientFunds` first
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::Contended(user) => {
                TollError::ConcurrencyConflict { resource: format!("wallet:{user}") }
            }
            other => TollError::Settlement(other.to_string()),
        }
    }
}
