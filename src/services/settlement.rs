//! Toll settlement ledger
//!
//! Turns completed journeys into charges and reconciles pending charges at
//! gate contacts. All work for one user runs under that user's lock, and each
//! wallet debit is its own atomic step, so a late failure during
//! reconciliation never undoes charges already completed.
//!
//! Lock order: user lock, then wallet, then the book. The book lock is never
//! held across a wallet call.

use crate::domain::charge::{ChargeStatus, TollCharge};
use crate::domain::events::{ChargeCancelledEvent, ReconciliationSummary};
use crate::domain::types::{ChargeId, GateContact, JourneyId, Money, UserId, Vehicle, VehicleId};
use crate::domain::zone::ZoneRules;
use crate::infra::error::{TollError, WalletError};
use crate::infra::locks::KeyedLocks;
use crate::infra::metrics::Metrics;
use crate::services::collaborators::{VehicleDirectory, WalletLedger};
use crate::services::fare::{calculate_fare, FareBreakdown, FareModifiers, MultiplierTable};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pricing knobs applied to every fare
#[derive(Debug, Clone, Default)]
pub struct Pricing {
    pub modifiers: FareModifiers,
    pub multipliers: MultiplierTable,
}

/// What the ledger needs to know about a journey being closed
#[derive(Debug, Clone)]
pub struct ExitSettlement<'a> {
    pub journey_id: &'a JourneyId,
    pub vehicle_id: &'a VehicleId,
    pub rules: &'a ZoneRules,
    pub distance_km: f64,
    /// Epoch ms of the exit report
    pub at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct SettledExit {
    pub charge: TollCharge,
    pub fare: FareBreakdown,
    /// The journey had already been settled; nothing changed
    pub replayed: bool,
}

/// Outstanding balance for one user
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub user_id: UserId,
    pub pending_count: usize,
    pub total_pending_amount: Money,
    pub current_balance: Money,
    pub can_process_all: bool,
    pub charges: Vec<TollCharge>,
}

/// Dry-run fare and affordability check
#[derive(Debug, Clone, Serialize)]
pub struct FareQuote {
    pub fare: FareBreakdown,
    pub amount: Money,
    pub balance: Money,
    pub can_afford: bool,
    pub balance_after: Money,
}

#[derive(Debug, Default, Serialize)]
pub struct CancellationReport {
    pub cancelled: Vec<ChargeCancelledEvent>,
    pub failed: Vec<(ChargeId, String)>,
}

/// In-memory stand-in for the charge store. Settled and cancelled charges
/// stay in `charges` for queries; only `pending` shrinks.
#[derive(Default)]
struct Book {
    charges: FxHashMap<ChargeId, TollCharge>,
    by_journey: FxHashMap<JourneyId, ChargeId>,
    /// Pending charges per user, FIFO by (created_at, seq)
    pending: FxHashMap<UserId, BTreeMap<(i64, u64), ChargeId>>,
}

impl Book {
    fn insert(&mut self, charge: TollCharge) {
        if charge.is_pending() {
            self.pending
                .entry(charge.user_id.clone())
                .or_default()
                .insert(charge.fifo_key(), charge.id.clone());
        }
        self.by_journey.insert(charge.journey_id.clone(), charge.id.clone());
        self.charges.insert(charge.id.clone(), charge);
    }

    fn pending_for(&self, user: &UserId) -> Vec<TollCharge> {
        self.pending
            .get(user)
            .map(|queue| queue.values().filter_map(|id| self.charges.get(id)).cloned().collect())
            .unwrap_or_default()
    }

    /// Leave the pending state, returning the charge for final edits
    fn take_pending(&mut self, id: &ChargeId) -> Option<&mut TollCharge> {
        let charge = self.charges.get_mut(id)?;
        if !charge.is_pending() {
            return None;
        }
        if let Some(queue) = self.pending.get_mut(&charge.user_id) {
            queue.remove(&charge.fifo_key());
            if queue.is_empty() {
                self.pending.remove(&charge.user_id);
            }
        }
        Some(charge)
    }
}

pub struct SettlementLedger {
    wallets: Arc<dyn WalletLedger>,
    vehicles: Arc<dyn VehicleDirectory>,
    pricing: Pricing,
    users: KeyedLocks<UserId, ()>,
    book: Mutex<Book>,
    seq: AtomicU64,
    metrics: Arc<Metrics>,
}

impl SettlementLedger {
    pub fn new(
        wallets: Arc<dyn WalletLedger>,
        vehicles: Arc<dyn VehicleDirectory>,
        pricing: Pricing,
        lock_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            wallets,
            vehicles,
            pricing,
            users: KeyedLocks::new(lock_timeout),
            book: Mutex::new(Book::default()),
            seq: AtomicU64::new(1),
            metrics,
        }
    }

    fn vehicle(&self, id: &VehicleId) -> Result<Vehicle, TollError> {
        self.vehicles.vehicle(id).ok_or_else(|| TollError::UnknownVehicle(id.clone()))
    }

    fn with_user<R>(
        &self,
        user: &UserId,
        f: impl FnOnce() -> Result<R, TollError>,
    ) -> Result<R, TollError> {
        match self.users.with_lock(user, |_| f()) {
            Some(result) => result,
            None => {
                self.metrics.record_lock_conflict();
                warn!(user_id = %user, "wallet_lock_timeout");
                Err(TollError::ConcurrencyConflict { resource: format!("wallet:{user}") })
            }
        }
    }

    fn fare_for(&self, vehicle: &Vehicle, rules: &ZoneRules, distance_km: f64) -> FareBreakdown {
        calculate_fare(
            distance_km,
            &vehicle.vehicle_type,
            rules,
            &self.pricing.modifiers,
            &self.pricing.multipliers,
        )
    }

    /// Charge a completed journey, exactly once per journey
    ///
    /// Debits the owner's wallet when it covers the fare, otherwise records a
    /// pending charge and leaves the wallet untouched. A second call for the
    /// same journey returns the existing charge with `replayed` set.
    pub fn settle_exit(&self, exit: &ExitSettlement<'_>) -> Result<SettledExit, TollError> {
        let vehicle = self.vehicle(exit.vehicle_id)?;
        let fare = self.fare_for(&vehicle, exit.rules, exit.distance_km);
        let amount = fare.amount();
        let user = vehicle.owner.clone();

        self.with_user(&user, || {
            if let Some(existing) = self.charge_for_journey(exit.journey_id) {
                debug!(journey_id = %exit.journey_id, charge_id = %existing.id, "settlement_replayed");
                return Ok(SettledExit { charge: existing, fare: fare.clone(), replayed: true });
            }

            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let charge = match self.wallets.debit(&user, amount) {
                Ok(balance) => {
                    info!(
                        journey_id = %exit.journey_id,
                        user_id = %user,
                        amount = %amount,
                        balance = %balance,
                        "charge_completed"
                    );
                    TollCharge::completed(
                        exit.journey_id.clone(),
                        user.clone(),
                        exit.vehicle_id.clone(),
                        amount,
                        exit.at_ms,
                        seq,
                    )
                }
                Err(WalletError::InsufficientFunds { available, .. }) => {
                    info!(
                        journey_id = %exit.journey_id,
                        user_id = %user,
                        amount = %amount,
                        balance = %available,
                        "charge_pending"
                    );
                    TollCharge::pending(
                        exit.journey_id.clone(),
                        user.clone(),
                        exit.vehicle_id.clone(),
                        amount,
                        available,
                        exit.at_ms,
                        seq,
                    )
                }
                Err(e) => {
                    self.metrics.record_settlement_failure();
                    error!(journey_id = %exit.journey_id, user_id = %user, error = %e, "settlement_failed");
                    return Err(e.into());
                }
            };

            self.metrics.record_charge(charge.status == ChargeStatus::Completed);
            self.book.lock().insert(charge.clone());
            Ok(SettledExit { charge, fare: fare.clone(), replayed: false })
        })
    }

    /// Settle the owner's pending charges oldest first, stopping at the first
    /// one the balance cannot cover
    pub fn reconcile_at_gate(&self, contact: &GateContact) -> Result<ReconciliationSummary, TollError> {
        let vehicle = self.vehicle(&contact.vehicle_id)?;
        let user = vehicle.owner;
        let at_ms = contact.timestamp.timestamp_millis();

        let summary = self.with_user(&user, || {
            let queue: SmallVec<[(ChargeId, Money); 8]> = {
                let book = self.book.lock();
                book.pending_for(&user).into_iter().map(|c| (c.id, c.amount)).collect()
            };

            let mut settled: SmallVec<[ChargeId; 4]> = SmallVec::new();
            let mut total_amount = Money::ZERO;

            for (id, amount) in &queue {
                match self.wallets.debit(&user, *amount) {
                    Ok(balance) => {
                        let mut book = self.book.lock();
                        if let Some(charge) = book.take_pending(id) {
                            charge.status = ChargeStatus::Completed;
                            charge.settled_at = Some(at_ms);
                            charge.settled_gate = Some(contact.gate_id.clone());
                        }
                        debug!(charge_id = %id, amount = %amount, balance = %balance, "pending_settled");
                        settled.push(id.clone());
                        total_amount += *amount;
                    }
                    Err(WalletError::InsufficientFunds { available, .. }) => {
                        debug!(charge_id = %id, amount = %amount, balance = %available, "reconciliation_stopped");
                        break;
                    }
                    Err(e) => {
                        // Completed charges stay completed; the rest wait for the next contact
                        self.metrics.record_settlement_failure();
                        error!(charge_id = %id, user_id = %user, error = %e, "reconciliation_fault");
                        break;
                    }
                }
            }

            let remaining = self.book.lock().pending_for(&user);
            Ok(ReconciliationSummary {
                user_id: user.clone(),
                vehicle_id: contact.vehicle_id.clone(),
                gate_id: contact.gate_id.clone(),
                processed_count: settled.len(),
                total_amount,
                remaining_pending_count: remaining.len(),
                remaining_pending_amount: remaining.iter().map(|c| c.amount).sum(),
                settled,
            })
        })?;

        self.metrics.record_reconciliation(
            summary.processed_count as u64,
            summary.total_amount.minor().max(0) as u64,
        );
        info!(
            user_id = %summary.user_id,
            gate_id = %summary.gate_id,
            processed = %summary.processed_count,
            total = %summary.total_amount,
            remaining = %summary.remaining_pending_count,
            remaining_amount = %summary.remaining_pending_amount,
            "reconciliation"
        );
        Ok(summary)
    }

    /// Operator cancellation of a pending charge
    pub fn cancel_pending(&self, id: &ChargeId, reason: &str) -> Result<ChargeCancelledEvent, TollError> {
        let user = self
            .charge(id)
            .map(|c| c.user_id)
            .ok_or_else(|| TollError::UnknownCharge(id.clone()))?;

        let event = self.with_user(&user, || {
            let mut book = self.book.lock();
            let status = book.charges.get(id).map(|c| c.status);
            let charge = match (status, book.take_pending(id)) {
                (_, Some(charge)) => charge,
                (None, None) => return Err(TollError::UnknownCharge(id.clone())),
                (Some(status), None) => {
                    return Err(TollError::InvalidInput(format!(
                        "charge {id} is {}, only pending charges can be cancelled",
                        status.as_str()
                    )))
                }
            };
            charge.status = ChargeStatus::Cancelled;
            charge.cancel_reason = Some(reason.to_string());
            Ok(ChargeCancelledEvent {
                charge_id: charge.id.clone(),
                journey_id: charge.journey_id.clone(),
                user_id: charge.user_id.clone(),
                amount: charge.amount,
                reason: reason.to_string(),
            })
        })?;

        self.metrics.record_charge_cancelled();
        info!(charge_id = %id, user_id = %event.user_id, reason = %reason, "charge_cancelled");
        Ok(event)
    }

    /// Cancel several pending charges, collecting per-charge failures
    pub fn cancel_pending_batch(&self, ids: &[ChargeId], reason: &str) -> CancellationReport {
        let mut report = CancellationReport::default();
        for id in ids {
            match self.cancel_pending(id, reason) {
                Ok(event) => report.cancelled.push(event),
                Err(e) => report.failed.push((id.clone(), e.to_string())),
            }
        }
        report
    }

    pub fn pending_summary(&self, user: &UserId) -> Result<PendingSummary, TollError> {
        let charges = self.book.lock().pending_for(user);
        let current_balance = match self.wallets.balance(user) {
            Ok(balance) => balance,
            Err(WalletError::UnknownWallet(_)) => Money::ZERO,
            Err(e) => return Err(e.into()),
        };
        let total_pending_amount: Money = charges.iter().map(|c| c.amount).sum();
        Ok(PendingSummary {
            user_id: user.clone(),
            pending_count: charges.len(),
            total_pending_amount,
            current_balance,
            can_process_all: current_balance >= total_pending_amount,
            charges,
        })
    }

    /// Price a hypothetical trip without touching any state
    pub fn quote(&self, vehicle_id: &VehicleId, rules: &ZoneRules, distance_km: f64) -> Result<FareQuote, TollError> {
        let vehicle = self.vehicle(vehicle_id)?;
        let fare = self.fare_for(&vehicle, rules, distance_km);
        let amount = fare.amount();
        let balance = self.wallets.balance(&vehicle.owner)?;
        Ok(FareQuote {
            fare,
            amount,
            balance,
            can_afford: balance >= amount,
            balance_after: balance.saturating_sub(amount),
        })
    }

    /// Apply a completed top-up to the user's wallet
    pub fn credit(&self, user: &UserId, amount: Money) -> Result<Money, TollError> {
        self.with_user(user, || {
            let balance = self.wallets.credit(user, amount)?;
            info!(user_id = %user, amount = %amount, balance = %balance, "wallet_topped_up");
            Ok(balance)
        })
    }

    pub fn balance(&self, user: &UserId) -> Result<Money, TollError> {
        Ok(self.wallets.balance(user)?)
    }

    pub fn charge(&self, id: &ChargeId) -> Option<TollCharge> {
        self.book.lock().charges.get(id).cloned()
    }

    pub fn charge_for_journey(&self, journey_id: &JourneyId) -> Option<TollCharge> {
        let book = self.book.lock();
        book.by_journey.get(journey_id).and_then(|id| book.charges.get(id)).cloned()
    }

    /// All charges for a user, oldest first
    pub fn charges_for_user(&self, user: &UserId) -> Vec<TollCharge> {
        let mut charges: Vec<TollCharge> =
            self.book.lock().charges.values().filter(|c| &c.user_id == user).cloned().collect();
        charges.sort_by_key(|c| c.fifo_key());
        charges
    }

    pub fn pending_count(&self) -> usize {
        self.book.lock().pending.values().map(|q| q.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{GateId, VehicleType};
    use crate::services::collaborators::{InMemoryVehicles, InMemoryWallets};
    use chrono::DateTime;

    const RULES: ZoneRules = ZoneRules { rate_per_km: 8.0, minimum_fare: 10.0 };

    struct Fixture {
        ledger: SettlementLedger,
        wallets: Arc<InMemoryWallets>,
    }

    fn fixture(balance: Money) -> Fixture {
        let wallets = Arc::new(InMemoryWallets::new(Duration::from_millis(100)));
        wallets.open(&UserId::from("u1"), balance);
        let vehicles = Arc::new(InMemoryVehicles::new([
            Vehicle::new("KA01", "u1", VehicleType::Car),
            Vehicle::new("KA02", "u1", VehicleType::Motorcycle),
        ]));
        let ledger = SettlementLedger::new(
            wallets.clone(),
            vehicles,
            Pricing::default(),
            Duration::from_millis(100),
            Arc::new(Metrics::new()),
        );
        Fixture { ledger, wallets }
    }

    fn exit<'a>(journey: &'a JourneyId, vehicle: &'a VehicleId, km: f64, at_ms: i64) -> ExitSettlement<'a> {
        ExitSettlement { journey_id: journey, vehicle_id: vehicle, rules: &RULES, distance_km: km, at_ms }
    }

    fn contact(at_ms: i64) -> GateContact {
        GateContact {
            vehicle_id: VehicleId::from("KA01"),
            gate_id: GateId::from("g1"),
            timestamp: DateTime::from_timestamp_millis(at_ms).unwrap(),
        }
    }

    #[test]
    fn test_completed_debit_is_exact() {
        let f = fixture(Money::from_major(100.0));
        let (j, v) = (JourneyId::from("j1"), VehicleId::from("KA01"));

        let settled = f.ledger.settle_exit(&exit(&j, &v, 10.0, 1_000)).unwrap();
        assert_eq!(settled.charge.status, ChargeStatus::Completed);
        assert_eq!(settled.charge.amount, Money(8100));
        assert!(!settled.replayed);
        assert_eq!(f.wallets.balance(&UserId::from("u1")).unwrap(), Money(1900));
    }

    #[test]
    fn test_insufficient_balance_creates_pending() {
        let f = fixture(Money::from_major(5.0));
        let (j, v) = (JourneyId::from("j1"), VehicleId::from("KA01"));

        // 2.375 km car: 19 + 1 = 20.00
        let settled = f.ledger.settle_exit(&exit(&j, &v, 2.375, 1_000)).unwrap();
        assert_eq!(settled.charge.amount, Money(2000));
        assert_eq!(settled.charge.status, ChargeStatus::Pending);
        assert_eq!(settled.charge.shortfall, Money(1500));
        assert_eq!(f.wallets.balance(&UserId::from("u1")).unwrap(), Money(500));
    }

    #[test]
    fn test_settle_exit_is_idempotent() {
        let f = fixture(Money::from_major(100.0));
        let (j, v) = (JourneyId::from("j1"), VehicleId::from("KA01"));

        let first = f.ledger.settle_exit(&exit(&j, &v, 10.0, 1_000)).unwrap();
        let second = f.ledger.settle_exit(&exit(&j, &v, 10.0, 2_000)).unwrap();

        assert!(second.replayed);
        assert_eq!(first.charge.id, second.charge.id);
        assert_eq!(f.ledger.charges_for_user(&UserId::from("u1")).len(), 1);
        assert_eq!(f.wallets.balance(&UserId::from("u1")).unwrap(), Money(1900));
    }

    #[test]
    fn test_reconciliation_fifo_stops_at_first_shortfall() {
        let f = fixture(Money::ZERO);
        let v = VehicleId::from("KA01");
        let (j1, j2, j3) = (JourneyId::from("j1"), JourneyId::from("j2"), JourneyId::from("j3"));

        // 20.00, 20.00, 20.00 pending at T1 < T2 < T3
        let c1 = f.ledger.settle_exit(&exit(&j1, &v, 2.375, 1_000)).unwrap().charge;
        let c2 = f.ledger.settle_exit(&exit(&j2, &v, 2.375, 2_000)).unwrap().charge;
        let c3 = f.ledger.settle_exit(&exit(&j3, &v, 2.375, 3_000)).unwrap().charge;
        assert!(c1.is_pending() && c2.is_pending() && c3.is_pending());

        f.ledger.credit(&UserId::from("u1"), Money::from_major(45.0)).unwrap();
        let summary = f.ledger.reconcile_at_gate(&contact(10_000)).unwrap();

        assert_eq!(summary.processed_count, 2);
        assert_eq!(summary.settled.as_slice(), &[c1.id.clone(), c2.id.clone()]);
        assert_eq!(summary.total_amount, Money(4000));
        assert_eq!(summary.remaining_pending_count, 1);
        assert_eq!(summary.remaining_pending_amount, Money(2000));
        assert_eq!(f.wallets.balance(&UserId::from("u1")).unwrap(), Money(500));
        assert!(f.ledger.charge(&c3.id).unwrap().is_pending());
        assert_eq!(f.ledger.charge(&c1.id).unwrap().settled_gate, Some(GateId::from("g1")));
    }

    #[test]
    fn test_reconciliation_does_not_skip_ahead() {
        let f = fixture(Money::ZERO);
        let (car, bike) = (VehicleId::from("KA01"), VehicleId::from("KA02"));
        let (j1, j2) = (JourneyId::from("j1"), JourneyId::from("j2"));

        // 81.00 then 41.00
        f.ledger.settle_exit(&exit(&j1, &car, 10.0, 1_000)).unwrap();
        let small = f.ledger.settle_exit(&exit(&j2, &bike, 10.0, 2_000)).unwrap().charge;
        assert_eq!(small.amount, Money(4100));

        f.ledger.credit(&UserId::from("u1"), Money::from_major(50.0)).unwrap();
        let summary = f.ledger.reconcile_at_gate(&contact(5_000)).unwrap();

        assert_eq!(summary.processed_count, 0);
        assert_eq!(summary.remaining_pending_count, 2);
        assert_eq!(f.wallets.balance(&UserId::from("u1")).unwrap(), Money(5000));
    }

    #[test]
    fn test_balance_never_negative() {
        let f = fixture(Money::from_major(90.0));
        let v = VehicleId::from("KA01");
        for i in 0..5 {
            let j = JourneyId::new(format!("j{i}"));
            f.ledger.settle_exit(&exit(&j, &v, 10.0, 1_000 + i)).unwrap();
            assert!(!f.wallets.balance(&UserId::from("u1")).unwrap().is_negative());
        }
        f.ledger.reconcile_at_gate(&contact(9_000)).unwrap();
        assert_eq!(f.wallets.balance(&UserId::from("u1")).unwrap(), Money(900));
        assert_eq!(f.ledger.pending_count(), 4);
    }

    #[test]
    fn test_cancel_pending() {
        let f = fixture(Money::ZERO);
        let (j, v) = (JourneyId::from("j1"), VehicleId::from("KA01"));
        let charge = f.ledger.settle_exit(&exit(&j, &v, 10.0, 1_000)).unwrap().charge;

        let event = f.ledger.cancel_pending(&charge.id, "disputed").unwrap();
        assert_eq!(event.amount, Money(8100));
        assert_eq!(f.ledger.charge(&charge.id).unwrap().status, ChargeStatus::Cancelled);
        assert_eq!(f.ledger.pending_count(), 0);

        // cancelled is terminal
        assert!(matches!(f.ledger.cancel_pending(&charge.id, "again"), Err(TollError::InvalidInput(_))));
        assert!(matches!(
            f.ledger.cancel_pending(&ChargeId::from("nope"), "x"),
            Err(TollError::UnknownCharge(_))
        ));
    }

    #[test]
    fn test_cancel_refuses_completed() {
        let f = fixture(Money::from_major(100.0));
        let (j, v) = (JourneyId::from("j1"), VehicleId::from("KA01"));
        let charge = f.ledger.settle_exit(&exit(&j, &v, 10.0, 1_000)).unwrap().charge;

        let report = f.ledger.cancel_pending_batch(&[charge.id.clone()], "x");
        assert!(report.cancelled.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(f.ledger.charge(&charge.id).unwrap().status, ChargeStatus::Completed);
    }

    #[test]
    fn test_pending_summary_and_quote() {
        let f = fixture(Money::from_major(30.0));
        let v = VehicleId::from("KA01");
        let j = JourneyId::from("j1");
        f.ledger.settle_exit(&exit(&j, &v, 10.0, 1_000)).unwrap();

        let summary = f.ledger.pending_summary(&UserId::from("u1")).unwrap();
        assert_eq!(summary.pending_count, 1);
        assert_eq!(summary.total_pending_amount, Money(8100));
        assert_eq!(summary.current_balance, Money(3000));
        assert!(!summary.can_process_all);

        let quote = f.ledger.quote(&VehicleId::from("KA02"), &RULES, 2.0).unwrap();
        // 8.0 + 1.0 < 10 floor
        assert_eq!(quote.amount, Money(1000));
        assert!(quote.can_afford);
        assert_eq!(quote.balance_after, Money(2000));
    }

    #[test]
    fn test_unknown_vehicle() {
        let f = fixture(Money::ZERO);
        let (j, v) = (JourneyId::from("j1"), VehicleId::from("ghost"));
        assert!(matches!(
            f.ledger.settle_exit(&exit(&j, &v, 1.0, 1_000)),
            Err(TollError::UnknownVehicle(_))
        ));
    }

    #[test]
    fn test_wallet_fault_is_settlement_error() {
        let wallets = Arc::new(InMemoryWallets::new(Duration::from_millis(100)));
        let vehicles = Arc::new(InMemoryVehicles::new([Vehicle::new("KA01", "nobody", VehicleType::Car)]));
        let ledger = SettlementLedger::new(
            wallets,
            vehicles,
            Pricing::default(),
            Duration::from_millis(100),
            Arc::new(Metrics::new()),
        );
        let (j, v) = (JourneyId::from("j1"), VehicleId::from("KA01"));
        let err = ledger.settle_exit(&exit(&j, &v, 1.0, 1_000)).unwrap_err();
        assert!(matches!(err, TollError::Settlement(_)));
        assert!(ledger.charge_for_journey(&j).is_none());
    }

    /// Wallet that faults once `ok_debits` further debits have gone through
    struct FaultAfter {
        inner: InMemoryWallets,
        ok_debits: AtomicU64,
        armed: std::sync::atomic::AtomicBool,
    }

    impl WalletLedger for FaultAfter {
        fn balance(&self, user: &UserId) -> Result<Money, WalletError> {
            self.inner.balance(user)
        }

        fn debit(&self, user: &UserId, amount: Money) -> Result<Money, WalletError> {
            if self.armed.load(Ordering::SeqCst) {
                let left = self.ok_debits.load(Ordering::SeqCst);
                if left == 0 {
                    return Err(WalletError::Contended(user.clone()));
                }
                self.ok_debits.store(left - 1, Ordering::SeqCst);
            }
            self.inner.debit(user, amount)
        }

        fn credit(&self, user: &UserId, amount: Money) -> Result<Money, WalletError> {
            self.inner.credit(user, amount)
        }
    }

    #[test]
    fn test_reconciliation_fault_keeps_settled_charges() {
        let wallets = Arc::new(FaultAfter {
            inner: InMemoryWallets::new(Duration::from_millis(100)),
            ok_debits: AtomicU64::new(1),
            armed: std::sync::atomic::AtomicBool::new(false),
        });
        wallets.inner.open(&UserId::from("u1"), Money::ZERO);
        let metrics = Arc::new(Metrics::new());
        let ledger = SettlementLedger::new(
            wallets.clone(),
            Arc::new(InMemoryVehicles::new([Vehicle::new("KA01", "u1", VehicleType::Car)])),
            Pricing::default(),
            Duration::from_millis(100),
            metrics.clone(),
        );
        let v = VehicleId::from("KA01");
        let charges: Vec<_> = (1..=3)
            .map(|i| {
                let j = JourneyId::new(format!("j{i}"));
                ledger.settle_exit(&exit(&j, &v, 2.375, i * 1_000)).unwrap().charge
            })
            .collect();
        ledger.credit(&UserId::from("u1"), Money::from_major(100.0)).unwrap();

        // First debit succeeds, the second faults
        wallets.armed.store(true, Ordering::SeqCst);
        let summary = ledger.reconcile_at_gate(&contact(10_000)).unwrap();

        assert_eq!(summary.processed_count, 1);
        assert_eq!(summary.settled.as_slice(), &[charges[0].id.clone()]);
        assert_eq!(summary.remaining_pending_count, 2);
        assert_eq!(ledger.charge(&charges[0].id).unwrap().status, ChargeStatus::Completed);
        assert!(ledger.charge(&charges[1].id).unwrap().is_pending());
        assert!(ledger.charge(&charges[2].id).unwrap().is_pending());
        assert_eq!(ledger.balance(&UserId::from("u1")).unwrap(), Money(8000));
        assert_eq!(metrics.settlement_failures(), 1);

        // The next contact picks up where the fault stopped
        wallets.armed.store(false, Ordering::SeqCst);
        let summary = ledger.reconcile_at_gate(&contact(20_000)).unwrap();
        assert_eq!(summary.settled.as_slice(), &[charges[1].id.clone(), charges[2].id.clone()]);
        assert_eq!(ledger.balance(&UserId::from("u1")).unwrap(), Money(4000));
        assert_eq!(ledger.pending_count(), 0);
    }
}
