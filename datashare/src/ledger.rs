//! Balance bookkeeping: subscription pools and the per-user credit ledger.
//!
//! The ledger performs no external I/O; every operation is synchronous and
//! runs under a single lock, which is what makes the pool and parcel
//! invariants (`remaining + used == total`, FIFO drain order) hold without
//! any cooperation from callers.

use std::fmt::Display;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::carrier::LiveBalance;
use crate::job::{JobId, UserId};
use crate::store::{Page, Pagination};

/// Balances below this are treated as zero when deciding parcel depletion.
const DEPLETION_EPSILON: f64 = 1e-9;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct PoolId(i32);

impl From<i32> for PoolId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PoolId({})", self.0)
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct ParcelId(i32);

impl From<i32> for ParcelId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

/// The unit a user's credit parcels are denominated in. A user holds parcels
/// of exactly one denomination at a time.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Denomination {
    Gigabytes,
    Currency,
}

impl Display for Denomination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denomination::Gigabytes => write!(f, "GB"),
            Denomination::Currency => write!(f, "currency"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PoolStatus {
    Active,
    Expired,
    Cancelled,
}

/// The operator's bulk allowance with the carrier, sliced up by
/// subscription-funded jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionPool {
    pub id: PoolId,
    pub user: UserId,
    pub plan: String,
    pub total_gb: f64,
    pub remaining_gb: f64,
    pub used_gb: f64,
    pub status: PoolStatus,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParcelStatus {
    Active,
    Depleted,
    Expired,
}

/// One unit of a user's prepaid balance, consumed oldest-first.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditParcel {
    pub id: ParcelId,
    pub user: UserId,
    pub denomination: Denomination,
    pub original: f64,
    pub remaining: f64,
    pub consumed: f64,
    pub status: ParcelStatus,
    pub note: Option<String>,
    pub credited_by: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EntryType {
    Credit,
    Debit,
    Refund,
}

/// Append-only audit record of one ledger operation. Never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub id: i64,
    pub user: UserId,
    pub entry_type: EntryType,
    pub denomination: Denomination,
    pub amount: f64,
    pub balance_before: f64,
    pub balance_after: f64,
    pub performed_by: UserId,
    pub note: String,
    pub job: Option<JobId>,
    pub recorded_at: DateTime<Utc>,
}

/// Balance movement reported back from a debit or refund.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BalanceChange {
    pub before: f64,
    pub after: f64,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Ledger in bad state")]
    BadState,
    #[error("Insufficient balance. Available: {available}, needed: {requested}")]
    InsufficientBalance { available: f64, requested: f64 },
    #[error("User already holds active {active} credit")]
    DenominationConflict { active: Denomination },
    #[error("No subscription pool {0}")]
    PoolNotFound(PoolId),
    #[error("Subscription pool {0} is not active")]
    PoolNotActive(PoolId),
}

#[derive(Default)]
struct LedgerState {
    pools: Vec<SubscriptionPool>,
    parcels: Vec<CreditParcel>,
    entries: Vec<LedgerEntry>,
    pool_counter: i32,
    parcel_counter: i32,
    entry_counter: i64,
}

/// The two balance representations behind one lock.
///
/// Cloning is cheap and all clones share state.
#[derive(Clone, Default)]
pub struct Ledger {
    inner: Arc<RwLock<LedgerState>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- subscription pools ----

    pub fn create_pool(
        &self,
        user: UserId,
        plan: impl Into<String>,
        total_gb: f64,
        expires_at: DateTime<Utc>,
    ) -> Result<PoolId, LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        state.pool_counter += 1;
        let id = PoolId(state.pool_counter);
        state.pools.push(SubscriptionPool {
            id,
            user,
            plan: plan.into(),
            total_gb,
            remaining_gb: total_gb,
            used_gb: 0.0,
            status: PoolStatus::Active,
            activated_at: Utc::now(),
            expires_at,
        });
        Ok(id)
    }

    /// Looks up a pool, transitioning it to expired if its expiry date has
    /// passed since the last read.
    pub fn pool(&self, id: PoolId) -> Result<Option<SubscriptionPool>, LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        let now = Utc::now();
        Ok(state.pools.iter_mut().find(|pool| pool.id == id).map(|pool| {
            if pool.status == PoolStatus::Active && pool.expires_at < now {
                pool.status = PoolStatus::Expired;
            }
            pool.clone()
        }))
    }

    /// Commits a confirmed debit against the pool.
    pub fn debit_pool(&self, id: PoolId, amount_gb: f64) -> Result<(), LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        let now = Utc::now();
        let pool = state
            .pools
            .iter_mut()
            .find(|pool| pool.id == id)
            .ok_or(LedgerError::PoolNotFound(id))?;
        if pool.status == PoolStatus::Active && pool.expires_at < now {
            pool.status = PoolStatus::Expired;
        }
        if pool.status != PoolStatus::Active {
            return Err(LedgerError::PoolNotActive(id));
        }
        if amount_gb > pool.remaining_gb {
            return Err(LedgerError::InsufficientBalance {
                available: pool.remaining_gb,
                requested: amount_gb,
            });
        }
        pool.remaining_gb -= amount_gb;
        pool.used_gb += amount_gb;
        Ok(())
    }

    pub fn cancel_pool(&self, id: PoolId) -> Result<(), LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        let pool = state
            .pools
            .iter_mut()
            .find(|pool| pool.id == id)
            .ok_or(LedgerError::PoolNotFound(id))?;
        pool.status = PoolStatus::Cancelled;
        Ok(())
    }

    /// Overwrites the pool's figures with the carrier's authoritative live
    /// balance. Best-effort reconciliation; the caller decides when to run it.
    pub fn sync_pool_live(&self, id: PoolId, live: &LiveBalance) -> Result<(), LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        let pool = state
            .pools
            .iter_mut()
            .find(|pool| pool.id == id)
            .ok_or(LedgerError::PoolNotFound(id))?;
        pool.total_gb = live.total_gb;
        pool.remaining_gb = live.remaining_gb;
        pool.used_gb = live.used_gb;
        Ok(())
    }

    // ---- credit parcels ----

    /// Aggregate balance across the user's active parcels of the given
    /// denomination.
    pub fn balance(&self, user: UserId, denomination: Denomination) -> Result<f64, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::BadState)?;
        Ok(Self::balance_locked(&state, user, denomination))
    }

    fn balance_locked(state: &LedgerState, user: UserId, denomination: Denomination) -> f64 {
        state
            .parcels
            .iter()
            .filter(|parcel| {
                parcel.user == user
                    && parcel.denomination == denomination
                    && parcel.status == ParcelStatus::Active
            })
            .map(|parcel| parcel.remaining)
            .sum()
    }

    /// The denomination of the user's active parcels, if any.
    pub fn denomination_of(&self, user: UserId) -> Result<Option<Denomination>, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::BadState)?;
        Ok(state
            .parcels
            .iter()
            .find(|parcel| parcel.user == user && parcel.status == ParcelStatus::Active)
            .map(|parcel| parcel.denomination))
    }

    /// Grants a new parcel to the user. Fails if the user still holds active
    /// parcels of the other denomination.
    pub fn credit(
        &self,
        user: UserId,
        denomination: Denomination,
        amount: f64,
        performed_by: UserId,
        note: impl Into<String>,
    ) -> Result<ParcelId, LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        if let Some(active) = state
            .parcels
            .iter()
            .find(|parcel| parcel.user == user && parcel.status == ParcelStatus::Active)
            .map(|parcel| parcel.denomination)
        {
            if active != denomination {
                return Err(LedgerError::DenominationConflict { active });
            }
        }
        let note = note.into();
        let before = Self::balance_locked(&state, user, denomination);
        let id = Self::push_parcel(&mut state, user, denomination, amount, performed_by, &note);
        Self::push_entry(
            &mut state,
            user,
            EntryType::Credit,
            denomination,
            amount,
            before,
            before + amount,
            performed_by,
            note,
            None,
        );
        Ok(id)
    }

    /// FIFO debit: drains active parcels oldest-first, marking each depleted
    /// the instant its balance reaches zero. One ledger entry for the whole
    /// operation.
    pub fn debit(
        &self,
        user: UserId,
        denomination: Denomination,
        amount: f64,
        performed_by: UserId,
        note: impl Into<String>,
        job: Option<JobId>,
    ) -> Result<BalanceChange, LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        let before = Self::balance_locked(&state, user, denomination);
        if before < amount {
            return Err(LedgerError::InsufficientBalance {
                available: before,
                requested: amount,
            });
        }

        let mut left = amount;
        let mut parcels: Vec<&mut CreditParcel> = state
            .parcels
            .iter_mut()
            .filter(|parcel| {
                parcel.user == user
                    && parcel.denomination == denomination
                    && parcel.status == ParcelStatus::Active
                    && parcel.remaining > 0.0
            })
            .collect();
        parcels.sort_by_key(|parcel| parcel.created_at);
        for parcel in parcels {
            if left <= 0.0 {
                break;
            }
            let take = parcel.remaining.min(left);
            parcel.remaining -= take;
            parcel.consumed += take;
            if parcel.remaining <= DEPLETION_EPSILON {
                parcel.remaining = 0.0;
                parcel.status = ParcelStatus::Depleted;
            }
            left -= take;
        }

        Self::push_entry(
            &mut state,
            user,
            EntryType::Debit,
            denomination,
            amount,
            before,
            before - amount,
            performed_by,
            note.into(),
            job,
        );
        Ok(BalanceChange {
            before,
            after: before - amount,
        })
    }

    /// Returns a previously debited amount: reactivate the oldest depleted
    /// parcel, else top up the oldest active parcel, else mint a new parcel.
    /// Approximates "undo the last debit" without per-debit attribution.
    pub fn refund(
        &self,
        user: UserId,
        denomination: Denomination,
        amount: f64,
        performed_by: UserId,
        note: impl Into<String>,
        job: Option<JobId>,
    ) -> Result<BalanceChange, LedgerError> {
        let mut state = self.inner.write().map_err(|_| LedgerError::BadState)?;
        let note = note.into();
        let before = Self::balance_locked(&state, user, denomination);

        let oldest = |state: &mut LedgerState, status: ParcelStatus| -> Option<usize> {
            state
                .parcels
                .iter()
                .enumerate()
                .filter(|(_, parcel)| {
                    parcel.user == user
                        && parcel.denomination == denomination
                        && parcel.status == status
                })
                .min_by_key(|(_, parcel)| parcel.created_at)
                .map(|(index, _)| index)
        };

        if let Some(index) = oldest(&mut state, ParcelStatus::Depleted) {
            let parcel = &mut state.parcels[index];
            parcel.remaining += amount;
            parcel.consumed -= amount;
            parcel.status = ParcelStatus::Active;
        } else if let Some(index) = oldest(&mut state, ParcelStatus::Active) {
            let parcel = &mut state.parcels[index];
            parcel.remaining += amount;
            parcel.consumed -= amount;
        } else {
            Self::push_parcel(
                &mut state,
                user,
                denomination,
                amount,
                performed_by,
                &format!("Refund: {note}"),
            );
        }

        Self::push_entry(
            &mut state,
            user,
            EntryType::Refund,
            denomination,
            amount,
            before,
            before + amount,
            performed_by,
            note,
            job,
        );
        Ok(BalanceChange {
            before,
            after: before + amount,
        })
    }

    pub fn parcels(&self, user: UserId) -> Result<Vec<CreditParcel>, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::BadState)?;
        Ok(state
            .parcels
            .iter()
            .filter(|parcel| parcel.user == user)
            .cloned()
            .collect())
    }

    /// Paginated entry history, newest first.
    pub fn entries(&self, user: UserId, page: Pagination) -> Result<Page<LedgerEntry>, LedgerError> {
        let state = self.inner.read().map_err(|_| LedgerError::BadState)?;
        let mut entries: Vec<LedgerEntry> = state
            .entries
            .iter()
            .filter(|entry| entry.user == user)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at).then(b.id.cmp(&a.id)));
        Ok(Page::paginate(entries, page))
    }

    fn push_parcel(
        state: &mut LedgerState,
        user: UserId,
        denomination: Denomination,
        amount: f64,
        credited_by: UserId,
        note: &str,
    ) -> ParcelId {
        state.parcel_counter += 1;
        let id = ParcelId(state.parcel_counter);
        state.parcels.push(CreditParcel {
            id,
            user,
            denomination,
            original: amount,
            remaining: amount,
            consumed: 0.0,
            status: ParcelStatus::Active,
            note: Some(note.to_owned()),
            credited_by,
            created_at: Utc::now(),
        });
        id
    }

    #[allow(clippy::too_many_arguments)]
    fn push_entry(
        state: &mut LedgerState,
        user: UserId,
        entry_type: EntryType,
        denomination: Denomination,
        amount: f64,
        balance_before: f64,
        balance_after: f64,
        performed_by: UserId,
        note: String,
        job: Option<JobId>,
    ) {
        state.entry_counter += 1;
        state.entries.push(LedgerEntry {
            id: state.entry_counter,
            user,
            entry_type,
            denomination,
            amount,
            balance_before,
            balance_after,
            performed_by,
            note,
            job,
            recorded_at: Utc::now(),
        });
    }
}
