//! External collaborators consumed by the core, with in-memory implementations

use crate::domain::types::{Coordinate, Money, UserId, Vehicle, VehicleId};
use crate::domain::zone::Zone;
use crate::infra::error::{TollError, WalletError};
use crate::infra::locks::KeyedLocks;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Point-in-zone membership test
pub trait ZoneLookup: Send + Sync {
    /// Zone containing `point`, first match wins when zones overlap
    fn zone_at(&self, point: Coordinate) -> Result<Option<Arc<Zone>>, TollError>;
}

/// Atomic wallet primitive, owned outside the core
pub trait WalletLedger: Send + Sync {
    fn balance(&self, user: &UserId) -> Result<Money, WalletError>;

    /// Debit iff balance covers `amount`; returns the new balance
    fn debit(&self, user: &UserId, amount: Money) -> Result<Money, WalletError>;

    fn credit(&self, user: &UserId, amount: Money) -> Result<Money, WalletError>;
}

/// Read-only vehicle registry
pub trait VehicleDirectory: Send + Sync {
    fn vehicle(&self, id: &VehicleId) -> Option<Vehicle>;
}

/// Linear scan over configured polygons
#[derive(Default)]
pub struct PolygonZoneLookup {
    zones: Vec<Arc<Zone>>,
}

impl PolygonZoneLookup {
    pub fn new(zones: Vec<Zone>) -> Self {
        Self { zones: zones.into_iter().map(Arc::new).collect() }
    }

    pub fn zones(&self) -> &[Arc<Zone>] {
        &self.zones
    }
}

impl ZoneLookup for PolygonZoneLookup {
    fn zone_at(&self, point: Coordinate) -> Result<Option<Arc<Zone>>, TollError> {
        Ok(self.zones.iter().find(|z| z.contains(point)).cloned())
    }
}

/// Wallets held in memory, each behind its own lock
pub struct InMemoryWallets {
    accounts: KeyedLocks<UserId, Option<Money>>,
}

impl InMemoryWallets {
    pub fn new(lock_timeout: Duration) -> Self {
        Self { accounts: KeyedLocks::new(lock_timeout) }
    }

    /// Open (or overwrite) a wallet with an initial balance
    pub fn open(&self, user: &UserId, balance: Money) {
        self.accounts.with_lock(user, |slot| *slot = Some(balance));
    }

    pub fn with_balances<'a>(
        lock_timeout: Duration,
        balances: impl IntoIterator<Item = (&'a UserId, Money)>,
    ) -> Self {
        let wallets = Self::new(lock_timeout);
        for (user, balance) in balances {
            wallets.open(user, balance);
        }
        wallets
    }

    fn locked<R>(
        &self,
        user: &UserId,
        f: impl FnOnce(&mut Money) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let slot = self.accounts.existing(user).ok_or_else(|| WalletError::UnknownWallet(user.clone()))?;
        let mut guard = slot
            .try_lock_for(self.accounts.timeout())
            .ok_or_else(|| WalletError::Contended(user.clone()))?;
        match guard.as_mut() {
            Some(balance) => f(balance),
            None => Err(WalletError::UnknownWallet(user.clone())),
        }
    }
}

impl WalletLedger for InMemoryWallets {
    fn balance(&self, user: &UserId) -> Result<Money, WalletError> {
        self.locked(user, |balance| Ok(*balance))
    }

    fn debit(&self, user: &UserId, amount: Money) -> Result<Money, WalletError> {
        if amount.is_negative() {
            return Err(WalletError::InvalidAmount(amount));
        }
        self.locked(user, |balance| {
            if *balance < amount {
                return Err(WalletError::InsufficientFunds {
                    user: user.clone(),
                    required: amount,
                    available: *balance,
                });
            }
            *balance = balance.saturating_sub(amount);
            debug!(user_id = %user, amount = %amount, balance = %balance, "wallet_debited");
            Ok(*balance)
        })
    }

    fn credit(&self, user: &UserId, amount: Money) -> Result<Money, WalletError> {
        if amount.is_negative() {
            return Err(WalletError::InvalidAmount(amount));
        }
        self.locked(user, |balance| {
            *balance = balance.checked_add(amount).ok_or(WalletError::InvalidAmount(amount))?;
            debug!(user_id = %user, amount = %amount, balance = %balance, "wallet_credited");
            Ok(*balance)
        })
    }
}

#[derive(Default)]
pub struct InMemoryVehicles {
    by_id: RwLock<FxHashMap<VehicleId, Vehicle>>,
}

impl InMemoryVehicles {
    pub fn new(vehicles: impl IntoIterator<Item = Vehicle>) -> Self {
        let by_id = vehicles.into_iter().map(|v| (v.id.clone(), v)).collect();
        Self { by_id: RwLock::new(by_id) }
    }

    pub fn register(&self, vehicle: Vehicle) {
        self.by_id.write().insert(vehicle.id.clone(), vehicle);
    }
}

impl VehicleDirectory for InMemoryVehicles {
    fn vehicle(&self, id: &VehicleId) -> Option<Vehicle> {
        self.by_id.read().get(id).cloned()
    }
}
