use std::fmt::Display;
use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc, RwLock,
};

use chrono::{DateTime, Utc};

use crate::job::{JobId, UserId};
use crate::store::{Page, Pagination, StoreError};

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct TransferId(i32);

impl From<i32> for TransferId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransferId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FundingKind {
    Subscription,
    Credit,
}

/// Immutable record of one attempted carrier call, successful or not.
///
/// One record is written for every attempt. The single exception is the
/// token-expiry path: a 401 means the call never meaningfully reached the
/// carrier, and the worker discards the record it just wrote before pausing
/// the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: TransferId,
    pub user: UserId,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub amount_gb: f64,
    pub transaction_id: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub carrier_response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub requires_new_token: bool,
    pub funding: FundingKind,
    pub job: Option<JobId>,
    pub created_at: DateTime<Utc>,
}

pub struct NewTransfer {
    pub user: UserId,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub amount_gb: f64,
    pub transaction_id: String,
    pub success: bool,
    pub status_code: Option<u16>,
    pub carrier_response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub requires_new_token: bool,
    pub funding: FundingKind,
    pub job: Option<JobId>,
}

/// Append-only in memory log of [`TransferRecord`]s.
#[derive(Clone, Default)]
pub struct TransferLog {
    records: Arc<RwLock<Vec<TransferRecord>>>,
    id_counter: Arc<AtomicI32>,
}

impl TransferLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, new: NewTransfer) -> Result<TransferRecord, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::BadState)?;
        let record = TransferRecord {
            id: TransferId(self.id_counter.fetch_add(1, Ordering::SeqCst) + 1),
            user: new.user,
            recipient_name: new.recipient_name,
            recipient_phone: new.recipient_phone,
            amount_gb: new.amount_gb,
            transaction_id: new.transaction_id,
            success: new.success,
            status_code: new.status_code,
            carrier_response: new.carrier_response,
            error: new.error,
            requires_new_token: new.requires_new_token,
            funding: new.funding,
            job: new.job,
            created_at: Utc::now(),
        };
        records.push(record.clone());
        Ok(record)
    }

    /// Removes a record written for a call that never reached the carrier
    /// (the 401 special case). Returns whether anything was removed.
    pub fn discard(&self, id: TransferId) -> Result<bool, StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::BadState)?;
        let before = records.len();
        records.retain(|record| record.id != id);
        Ok(records.len() < before)
    }

    pub fn get(&self, id: TransferId) -> Result<Option<TransferRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::BadState)?;
        Ok(records.iter().find(|record| record.id == id).cloned())
    }

    /// Paginated history for one user, newest first.
    pub fn list(&self, user: UserId, page: Pagination) -> Result<Page<TransferRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::BadState)?;
        let mut matching: Vec<TransferRecord> = records
            .iter()
            .filter(|record| record.user == user)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.0.cmp(&a.id.0)));
        Ok(Page::paginate(matching, page))
    }

    #[cfg(test)]
    pub(crate) fn all(&self) -> Vec<TransferRecord> {
        self.records.read().unwrap().clone()
    }
}
