//! Toll charge ledger entry

use crate::domain::journey::new_uuid_v7;
use crate::domain::types::{ChargeId, GateId, JourneyId, Money, UserId, VehicleId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChargeStatus {
    Completed,
    Pending,
    Cancelled,
}

impl ChargeStatus {
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeStatus::Completed => "completed",
            ChargeStatus::Pending => "pending",
            ChargeStatus::Cancelled => "cancelled",
        }
    }
}

/// A billable record produced when a journey completes
#[derive(Debug, Clone, Serialize)]
pub struct TollCharge {
    pub id: ChargeId,
    pub journey_id: JourneyId,
    pub user_id: UserId,
    pub vehicle_id: VehicleId,
    pub amount: Money,
    pub status: ChargeStatus,
    /// Balance missing at creation time (pending charges only)
    pub shortfall: Money,
    /// Epoch ms
    pub created_at: i64,
    /// Monotonic ledger sequence, breaks `created_at` ties for FIFO order
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settled_gate: Option<GateId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl TollCharge {
    pub fn completed(
        journey_id: JourneyId,
        user_id: UserId,
        vehicle_id: VehicleId,
        amount: Money,
        now_ms: i64,
        seq: u64,
    ) -> Self {
        Self {
            id: ChargeId::new(new_uuid_v7()),
            journey_id,
            user_id,
            vehicle_id,
            amount,
            status: ChargeStatus::Completed,
            shortfall: Money::ZERO,
            created_at: now_ms,
            seq,
            settled_at: Some(now_ms),
            settled_gate: None,
            cancel_reason: None,
        }
    }

    pub fn pending(
        journey_id: JourneyId,
        user_id: UserId,
        vehicle_id: VehicleId,
        amount: Money,
        balance: Money,
        now_ms: i64,
        seq: u64,
    ) -> Self {
        Self {
            id: ChargeId::new(new_uuid_v7()),
            journey_id,
            user_id,
            vehicle_id,
            amount,
            status: ChargeStatus::Pending,
            shortfall: amount.saturating_sub(balance),
            created_at: now_ms,
            seq,
            settled_at: None,
            settled_gate: None,
            cancel_reason: None,
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.status == ChargeStatus::Pending
    }

    /// FIFO ordering key
    #[inline]
    pub fn fifo_key(&self) -> (i64, u64) {
        (self.created_at, self.seq)
    }
}
