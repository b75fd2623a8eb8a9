//! Provides an in memory implementation of [`JobStore`].
//!
//! It is designed to be a correct implementation for single-process use and
//! for test setups; it is not optimized for large queues.

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{JobFilter, JobStore, Page, Pagination, StatusCounts, StoreError};
use crate::job::{Job, JobId, JobOutcome, JobStatus, NewJob, UserId};
use crate::transfer::TransferId;

/// An in memory implementation of [`JobStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI32>,
}

impl InMemoryStore {
    /// Creates a new instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_locked(&self, jobs: &mut Vec<Job>, new: NewJob) -> JobId {
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::SeqCst) + 1);
        let now = Utc::now();
        jobs.push(Job {
            id,
            user: new.user,
            recipient_name: new.recipient_name,
            recipient_phone: new.recipient_phone,
            amount_gb: new.amount_gb,
            funding: new.funding,
            status: JobStatus::Pending,
            priority: new.priority,
            attempt: 0,
            max_attempts: new.max_attempts,
            request: new.request,
            transfer: None,
            outcome: None,
            error: None,
            inserted_at: now,
            scheduled_at: now,
            attempted_at: None,
            processed_at: None,
        });
        id
    }

    fn with_job<T>(
        &self,
        id: JobId,
        apply: impl FnOnce(&mut Job) -> T,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) => Ok(apply(job)),
        }
    }
}

impl Job {
    fn mark_claimed(&mut self) {
        self.status = JobStatus::Processing;
        self.attempt += 1;
        self.attempted_at = Some(Utc::now());
    }

    fn mark_completed(&mut self, transfer: TransferId, outcome: JobOutcome) {
        self.status = JobStatus::Completed;
        self.transfer = Some(transfer);
        self.outcome = Some(outcome);
        self.error = None;
        self.processed_at = Some(Utc::now());
    }

    fn mark_retryable(&mut self, next_attempt_at: DateTime<Utc>, error: &str) {
        self.status = JobStatus::Pending;
        self.scheduled_at = next_attempt_at;
        self.error = Some(error.to_owned());
    }

    fn mark_failed(&mut self, transfer: Option<TransferId>, outcome: JobOutcome) {
        self.status = JobStatus::Failed;
        self.transfer = transfer;
        self.error = Some(outcome.message.clone());
        self.outcome = Some(outcome);
        self.processed_at = Some(Utc::now());
    }

    fn mark_paused(&mut self, error: &str) {
        self.status = JobStatus::Paused;
        self.error = Some(error.to_owned());
    }

    fn mark_resumed(&mut self) {
        self.status = JobStatus::Pending;
        self.error = None;
        self.scheduled_at = Utc::now();
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(self.insert_locked(&mut jobs, job))
    }

    async fn insert_many(&self, new_jobs: Vec<NewJob>) -> Result<Vec<JobId>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(new_jobs
            .into_iter()
            .map(|job| self.insert_locked(&mut jobs, job))
            .collect())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let now = Utc::now();
        let mut due: Vec<&mut Job> = jobs
            .iter_mut()
            .filter(|job| job.status == JobStatus::Pending && job.scheduled_at <= now)
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.inserted_at.cmp(&b.inserted_at))
        });
        Ok(due.first_mut().map(|job| {
            job.mark_claimed();
            job.clone()
        }))
    }

    async fn mark_completed(
        &self,
        id: JobId,
        transfer: TransferId,
        outcome: JobOutcome,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| job.mark_completed(transfer, outcome))
    }

    async fn mark_retryable(
        &self,
        id: JobId,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| job.mark_retryable(next_attempt_at, error))
    }

    async fn mark_failed(
        &self,
        id: JobId,
        transfer: Option<TransferId>,
        outcome: JobOutcome,
    ) -> Result<(), StoreError> {
        self.with_job(id, |job| job.mark_failed(transfer, outcome))
    }

    async fn pause_for_token(&self, id: JobId, error: &str) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut paused = 0;
        let mut found = false;
        for job in jobs.iter_mut() {
            if job.id == id {
                // The claimed attempt never meaningfully reached the carrier.
                job.attempt = job.attempt.saturating_sub(1);
                job.mark_paused(error);
                found = true;
                paused += 1;
            } else if job.status == JobStatus::Pending {
                job.mark_paused(error);
                paused += 1;
            }
        }
        if !found {
            return Err(StoreError::JobNotFound(id));
        }
        Ok(paused)
    }

    async fn resume_paused(&self) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut resumed = 0;
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Paused {
                job.mark_resumed();
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn requeue_stale_processing(&self, older_than: TimeDelta) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let cutoff = Utc::now() - older_than;
        let mut requeued = 0;
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Processing
                && job.attempted_at.is_some_and(|at| at < cutoff)
            {
                job.status = JobStatus::Pending;
                job.scheduled_at = Utc::now();
                job.error = Some("Requeued after interrupted attempt".to_owned());
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn counts(&self, user: UserId) -> Result<StatusCounts, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut counts = StatusCounts::default();
        for job in jobs.iter().filter(|job| job.user == user) {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Paused => counts.paused += 1,
            }
            counts.total += 1;
        }
        Ok(counts)
    }

    async fn list(
        &self,
        user: UserId,
        filter: JobFilter,
        page: Pagination,
    ) -> Result<Page<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut matching: Vec<Job> = jobs
            .iter()
            .filter(|job| {
                job.user == user && filter.status.map_or(true, |status| job.status == status)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.inserted_at.cmp(&a.inserted_at));
        Ok(Page::paginate(matching, page))
    }

    async fn retry_failed(&self, user: UserId) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut retried = 0;
        for job in jobs.iter_mut() {
            if job.user == user && job.status == JobStatus::Failed {
                job.status = JobStatus::Pending;
                job.attempt = 0;
                job.error = None;
                job.scheduled_at = Utc::now();
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn cancel_pending(&self, user: UserId) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut cancelled = Vec::new();
        for job in jobs.iter_mut() {
            if job.user == user && job.status == JobStatus::Pending {
                job.mark_failed(
                    None,
                    JobOutcome {
                        success: false,
                        transaction_id: None,
                        message: "Cancelled by user".to_owned(),
                        status_code: None,
                        requires_new_token: false,
                    },
                );
                cancelled.push(job.clone());
            }
        }
        Ok(cancelled)
    }

    async fn prune(
        &self,
        statuses: &[JobStatus],
        older_than: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let cutoff = Utc::now() - older_than;
        let before = jobs.len();
        jobs.retain(|job| {
            !(statuses.contains(&job.status) && job.processed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
pub(crate) fn test_job() -> Job {
    let now = Utc::now();
    Job {
        id: JobId::from(0),
        user: UserId::from(1),
        recipient_name: "Ama".to_owned(),
        recipient_phone: "0244123456".to_owned(),
        amount_gb: 1.0,
        funding: crate::job::Funding::Subscription {
            pool: crate::ledger::PoolId::from(1),
        },
        status: JobStatus::Pending,
        priority: 0,
        attempt: 0,
        max_attempts: NewJob::DEFAULT_MAX_ATTEMPTS,
        request: None,
        transfer: None,
        outcome: None,
        error: None,
        inserted_at: now,
        scheduled_at: now,
        attempted_at: None,
        processed_at: None,
    }
}

#[cfg(test)]
pub(crate) fn new_job(user: i32) -> NewJob {
    NewJob {
        user: UserId::from(user),
        recipient_name: "Ama".to_owned(),
        recipient_phone: "0244123456".to_owned(),
        amount_gb: 1.0,
        funding: crate::job::Funding::Subscription {
            pool: crate::ledger::PoolId::from(1),
        },
        priority: 0,
        max_attempts: NewJob::DEFAULT_MAX_ATTEMPTS,
        request: None,
    }
}
