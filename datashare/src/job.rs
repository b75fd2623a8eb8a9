use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{Denomination, PoolId};
use crate::transfer::TransferId;

pub mod builder;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Identifier of the user owning a job, parcel, or ledger entry.
///
/// User management itself lives outside this crate; the id is carried opaquely.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct UserId(i32);

impl From<i32> for UserId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<UserId> for i32 {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

/// Identifier of a higher-level request record maintained by the embedding
/// application (see [`crate::worker::RequestSink`]).
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct RequestId(i32);

impl From<i32> for RequestId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

/// Where the data for a job comes from, and therefore which balance is
/// debited when it settles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Funding {
    /// Drawn from a shared subscription pool; the pool is debited only after
    /// the carrier confirms the transfer.
    Subscription { pool: PoolId },
    /// Drawn from the user's prepaid credit; `reserved` is the amount debited
    /// from the ledger at enqueue time and refunded on terminal failure.
    Credit {
        denomination: Denomination,
        reserved: f64,
    },
}

impl Funding {
    pub fn is_credit(&self) -> bool {
        matches!(self, Funding::Credit { .. })
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Paused,
}

/// The recorded outcome of a settled job, kept alongside the job for the
/// dashboard's benefit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub success: bool,
    pub transaction_id: Option<String>,
    pub message: String,
    pub status_code: Option<u16>,
    pub requires_new_token: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub user: UserId,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub amount_gb: f64,
    pub funding: Funding,
    pub status: JobStatus,
    pub priority: u16,
    pub attempt: u16,
    pub max_attempts: u16,
    pub request: Option<RequestId>,
    pub transfer: Option<TransferId>,
    pub outcome: Option<JobOutcome>,
    pub error: Option<String>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// A job as handed to the store by [`builder::JobBuilder`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub user: UserId,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub amount_gb: f64,
    pub funding: Funding,
    pub priority: u16,
    pub max_attempts: u16,
    pub request: Option<RequestId>,
}

impl NewJob {
    pub const DEFAULT_MAX_ATTEMPTS: u16 = 2;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_id_display() {
        assert_eq!(JobId::from(42).to_string(), "JobId(42)");
        assert_eq!(i32::from(JobId::from(42)), 42);
    }

    #[test]
    fn final_attempt() {
        let mut job = crate::store::memory::test_job();
        job.attempt = 1;
        job.max_attempts = 2;
        assert!(!job.is_final_attempt());
        job.attempt = 2;
        assert!(job.is_final_attempt());
    }
}
