use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, JobOutcome, JobStatus, NewJob, UserId};
use crate::transfer::TransferId;

pub mod memory;

/// The queue's persistence seam.
///
/// The worker and the [`crate::queue::Queue`] façade run entirely against this
/// trait; [`memory::InMemoryStore`] is the provided implementation. A store
/// backed by a database must keep [`JobStore::claim_next`] atomic: the
/// status flip and the attempt increment are one operation, which is what
/// prevents two overlapping ticks from claiming the same job.
#[async_trait]
pub trait JobStore: Clone {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError>;
    async fn insert_many(&self, jobs: Vec<NewJob>) -> Result<Vec<JobId>, StoreError>;
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Atomically claims the next due pending job: highest priority first,
    /// then oldest, skipping jobs scheduled in the future. The claimed job is
    /// flipped to `processing` with its attempt counter incremented in the
    /// same step.
    async fn claim_next(&self) -> Result<Option<Job>, StoreError>;

    async fn mark_completed(
        &self,
        id: JobId,
        transfer: TransferId,
        outcome: JobOutcome,
    ) -> Result<(), StoreError>;

    /// Returns a failed job to `pending`, to be claimed again once
    /// `next_attempt_at` has passed. The attempt already counted at claim
    /// time stays counted.
    async fn mark_retryable(
        &self,
        id: JobId,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn mark_failed(
        &self,
        id: JobId,
        transfer: Option<TransferId>,
        outcome: JobOutcome,
    ) -> Result<(), StoreError>;

    /// Token-invalid protocol: parks the claimed job and every pending job in
    /// one operation, un-counting the claimed attempt (a token failure is not
    /// the job's fault). Returns the number of jobs paused.
    async fn pause_for_token(&self, id: JobId, error: &str) -> Result<u64, StoreError>;

    /// Returns every paused job to `pending` in one batch. Returns the number
    /// resumed; zero paused jobs is a no-op.
    async fn resume_paused(&self) -> Result<u64, StoreError>;

    /// Startup sweep: requeues `processing` jobs whose claim is older than
    /// the threshold, recovering work orphaned by a crash mid-attempt.
    async fn requeue_stale_processing(&self, older_than: TimeDelta) -> Result<u64, StoreError>;

    async fn counts(&self, user: UserId) -> Result<StatusCounts, StoreError>;
    async fn list(
        &self,
        user: UserId,
        filter: JobFilter,
        page: Pagination,
    ) -> Result<Page<Job>, StoreError>;

    /// Moves all of the user's failed jobs back to `pending` with attempt
    /// counters reset. Returns the number retried.
    async fn retry_failed(&self, user: UserId) -> Result<u64, StoreError>;

    /// Force-fails all of the user's pending jobs with a cancellation marker.
    /// Returns the cancelled jobs so the caller can release any credit
    /// reservations.
    async fn cancel_pending(&self, user: UserId) -> Result<Vec<Job>, StoreError>;

    /// Deletes terminal jobs processed longer ago than the threshold.
    async fn prune(
        &self,
        statuses: &[JobStatus],
        older_than: TimeDelta,
    ) -> Result<u64, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store in bad state")]
    BadState,
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
}

/// Per-status job counts for one user, as shown on the dashboard.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

impl Pagination {
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
        }
    }
}

/// One page of results plus the pagination bookkeeping the dashboard renders.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub pages: usize,
}

impl<T> Page<T> {
    pub(crate) fn paginate(items: Vec<T>, page: Pagination) -> Self {
        let total = items.len();
        let pages = total.div_ceil(page.limit);
        let items = items
            .into_iter()
            .skip((page.page - 1) * page.limit)
            .take(page.limit)
            .collect();
        Self {
            items,
            page: page.page,
            limit: page.limit,
            total,
            pages,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paginate_clamps_and_counts() {
        let page = Page::paginate((0..45).collect::<Vec<_>>(), Pagination::new(2, 20));
        assert_eq!(page.items, (20..40).collect::<Vec<_>>());
        assert_eq!(page.total, 45);
        assert_eq!(page.pages, 3);

        let page = Page::paginate((0..5).collect::<Vec<_>>(), Pagination::new(4, 2));
        assert!(page.items.is_empty());
        assert_eq!(page.pages, 3);
    }
}
