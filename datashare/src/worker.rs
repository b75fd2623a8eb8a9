//! The single logical worker that drains the queue.
//!
//! Exactly one job is in `processing` at any instant: the worker is one
//! spawned task, and the store's claim operation flips status and increments
//! the attempt counter atomically, so an overlapping poll tick and enqueue
//! nudge cannot double-claim. Throughput is deliberately bounded: a fixed
//! delay separates consecutive jobs so the carrier's own abuse controls are
//! never tripped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffStrategy, Strategy};
use crate::carrier::{Carrier, TransferOutcome};
use crate::job::{Funding, Job, JobOutcome, RequestId};
use crate::ledger::Ledger;
use crate::queue::funding_kind;
use crate::store::JobStore;
use crate::transfer::{NewTransfer, TransferId, TransferLog};

#[derive(Debug)]
pub(crate) enum WakeMessage {
    Wake,
}

/// Claims older than this are treated as orphaned by a crash and requeued at
/// startup.
const STALE_CLAIM_AFTER: TimeDelta = TimeDelta::minutes(10);

const TOKEN_PAUSE_ERROR: &str = "Token expired - waiting for new token";

/// Pacing and retry settings for the worker loop.
pub struct WorkerConfig {
    /// How often the queue is polled for due jobs in the absence of nudges.
    pub poll_interval: Duration,
    /// Fixed gap between consecutive jobs, keeping the carrier call rate
    /// down.
    pub delay_between_jobs: Duration,
    /// Schedule for retrying a failed attempt. The default retries on the
    /// next poll tick, matching the poll interval.
    pub retry_strategy: Box<dyn Strategy + Send + Sync>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            delay_between_jobs: Duration::from_secs(2),
            retry_strategy: Box::new(BackoffStrategy::constant(TimeDelta::seconds(3))),
        }
    }
}

impl WorkerConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_delay_between_jobs(mut self, delay: Duration) -> Self {
        self.delay_between_jobs = delay;
        self
    }

    pub fn with_retry_strategy(
        mut self,
        strategy: impl Strategy + Send + Sync + 'static,
    ) -> Self {
        self.retry_strategy = Box::new(strategy);
        self
    }
}

/// Sink for the higher-level request records some jobs are linked to.
///
/// Request CRUD lives in the embedding application; the worker only needs to
/// tell it when a linked job settles.
#[async_trait]
pub trait RequestSink: Send + Sync {
    async fn request_completed(&self, request: RequestId, transfer: TransferId);
    async fn request_failed(&self, request: RequestId);
}

pub(crate) struct Worker<S, C> {
    store: S,
    carrier: Arc<C>,
    ledger: Ledger,
    transfers: TransferLog,
    receiver: mpsc::UnboundedReceiver<WakeMessage>,
    token_paused: Arc<AtomicBool>,
    requests: Option<Arc<dyn RequestSink>>,
    config: WorkerConfig,
}

/// Handle to the spawned worker task.
pub struct WorkerHandle {
    cancellation_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub async fn graceful_shutdown(&mut self) -> Result<(), crate::DatashareError> {
        self.cancellation_token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| crate::DatashareError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

impl<S, C> Worker<S, C>
where
    S: JobStore + Send + Sync + 'static,
    C: Carrier + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: S,
        carrier: Arc<C>,
        ledger: Ledger,
        transfers: TransferLog,
        receiver: mpsc::UnboundedReceiver<WakeMessage>,
        token_paused: Arc<AtomicBool>,
        requests: Option<Arc<dyn RequestSink>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            carrier,
            ledger,
            transfers,
            receiver,
            token_paused,
            requests,
            config,
        }
    }

    pub(crate) fn spawn(mut self) -> WorkerHandle {
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn({
            let cancellation_token = cancellation_token.clone();
            async move {
                tracing::debug!("Queue worker started");
                match self.store.requeue_stale_processing(STALE_CLAIM_AFTER).await {
                    Ok(0) => {}
                    Ok(requeued) => {
                        tracing::warn!(requeued, "Requeued stale processing jobs at startup")
                    }
                    Err(error) => {
                        tracing::error!(?error, "Failed to sweep stale processing jobs")
                    }
                }
                loop {
                    self.drain(&cancellation_token).await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {},
                        message = self.receiver.recv() => {
                            if message.is_none() {
                                tracing::debug!("All queue handles dropped, stopping worker");
                                break;
                            }
                        },
                        _ = cancellation_token.cancelled() => break,
                    }
                }
                tracing::debug!("Queue worker shut down");
            }
        });
        WorkerHandle {
            cancellation_token,
            handle: Some(handle),
        }
    }

    /// Processes due jobs one at a time until the queue is empty, paused for
    /// a token, or shut down.
    async fn drain(&self, cancellation_token: &CancellationToken) {
        loop {
            if cancellation_token.is_cancelled() || self.token_paused.load(Ordering::SeqCst) {
                return;
            }
            let job = match self.store.claim_next().await {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(error) => {
                    tracing::error!(?error, "Failed to claim next job");
                    return;
                }
            };
            self.process(job).await;

            // Pace consecutive carrier calls.
            tokio::time::sleep(self.config.delay_between_jobs).await;
        }
    }

    async fn process(&self, job: Job) {
        let job_id = job.id;
        tracing::debug!(
            %job_id,
            amount_gb = job.amount_gb,
            recipient = %job.recipient_phone,
            attempt = job.attempt,
            "Processing job"
        );

        // Subscription-funded jobs re-verify the pool before any carrier
        // call; the pool may have expired or drained since enqueue.
        if let Funding::Subscription { pool } = job.funding {
            match self.ledger.pool(pool) {
                Ok(Some(found)) if found.status == crate::ledger::PoolStatus::Active => {
                    if found.remaining_gb < job.amount_gb {
                        self.fail_without_carrier_call(
                            &job,
                            format!(
                                "Insufficient data. Remaining: {}GB, needed: {}GB",
                                found.remaining_gb, job.amount_gb
                            ),
                        )
                        .await;
                        return;
                    }
                }
                Ok(_) => {
                    self.fail_without_carrier_call(&job, "Subscription no longer active".to_owned())
                        .await;
                    return;
                }
                Err(error) => {
                    tracing::error!(?error, %job_id, "Ledger unavailable, job will retry");
                    self.retry_or_fail(&job, None, "Ledger unavailable").await;
                    return;
                }
            }
        }

        let outcome = self
            .carrier
            .transfer(&job.recipient_phone, job.amount_gb)
            .await;

        // Always persist the attempt before acting on it, so no transfer is
        // ever silently lost.
        let record = match self.transfers.record(transfer_from_outcome(&job, &outcome)) {
            Ok(record) => record,
            Err(error) => {
                tracing::error!(?error, %job_id, "Failed to record transfer");
                return;
            }
        };

        if outcome.success {
            self.complete(&job, record.id, &outcome).await;
        } else if outcome.requires_new_token {
            self.pause_for_token(&job, record.id).await;
        } else {
            let error = outcome
                .error
                .as_deref()
                .unwrap_or("Transfer failed")
                .to_owned();
            self.retry_or_fail(&job, Some((record.id, &outcome)), &error)
                .await;
        }
    }

    async fn complete(&self, job: &Job, transfer: TransferId, outcome: &TransferOutcome) {
        if let Funding::Subscription { pool } = job.funding {
            if let Err(error) = self.ledger.debit_pool(pool, job.amount_gb) {
                tracing::error!(?error, %pool, job_id = %job.id, "Failed to debit pool after confirmed send");
            }
        }

        let message = format!("Sent {}GB to {}", job.amount_gb, job.recipient_phone);
        let result = JobOutcome {
            success: true,
            transaction_id: Some(outcome.transaction_id.clone()),
            message,
            status_code: outcome.status_code,
            requires_new_token: false,
        };
        if let Err(error) = self.store.mark_completed(job.id, transfer, result).await {
            tracing::error!(?error, job_id = %job.id, "Failed to mark job complete");
            return;
        }
        if let (Some(requests), Some(request)) = (&self.requests, job.request) {
            requests.request_completed(request, transfer).await;
        }
        tracing::debug!(job_id = %job.id, "Job completed");
    }

    /// The token-expiry special case: the attempt never meaningfully reached
    /// the carrier, so its transfer record is discarded, the claimed attempt
    /// is un-counted, and the whole queue parks until an operator installs a
    /// fresh token.
    async fn pause_for_token(&self, job: &Job, transfer: TransferId) {
        if let Err(error) = self.transfers.discard(transfer) {
            tracing::error!(?error, job_id = %job.id, "Failed to discard token-failure transfer record");
        }
        match self.store.pause_for_token(job.id, TOKEN_PAUSE_ERROR).await {
            Ok(paused) => {
                self.token_paused.store(true, Ordering::SeqCst);
                tracing::warn!(
                    paused,
                    job_id = %job.id,
                    "Carrier token expired, queue paused until a new token is supplied"
                );
            }
            Err(error) => {
                tracing::error!(?error, job_id = %job.id, "Failed to pause queue for token");
            }
        }
    }

    async fn retry_or_fail(
        &self,
        job: &Job,
        transfer: Option<(TransferId, &TransferOutcome)>,
        error: &str,
    ) {
        if !job.is_final_attempt() {
            let delay = self.config.retry_strategy.backoff(job.attempt);
            if let Err(store_error) = self
                .store
                .mark_retryable(job.id, Utc::now() + delay, error)
                .await
            {
                tracing::error!(?store_error, job_id = %job.id, "Failed to mark job retryable");
                return;
            }
            tracing::warn!(
                job_id = %job.id,
                attempt = job.attempt,
                max_attempts = job.max_attempts,
                %error,
                "Job will retry"
            );
            return;
        }

        let result = JobOutcome {
            success: false,
            transaction_id: transfer.map(|(_, outcome)| outcome.transaction_id.clone()),
            message: error.to_owned(),
            status_code: transfer.and_then(|(_, outcome)| outcome.status_code),
            requires_new_token: false,
        };
        if let Err(store_error) = self
            .store
            .mark_failed(job.id, transfer.map(|(id, _)| id), result)
            .await
        {
            tracing::error!(?store_error, job_id = %job.id, "Failed to mark job failed");
            return;
        }

        if let Funding::Credit {
            denomination,
            reserved,
        } = job.funding
        {
            if let Err(ledger_error) = self.ledger.refund(
                job.user,
                denomination,
                reserved,
                job.user,
                format!("Send failed: {error}"),
                Some(job.id),
            ) {
                tracing::error!(?ledger_error, job_id = %job.id, "Refund failed");
            }
        }

        if let (Some(requests), Some(request)) = (&self.requests, job.request) {
            requests.request_failed(request).await;
        }
        tracing::error!(
            job_id = %job.id,
            attempts = job.attempt,
            %error,
            "Job failed after exhausting attempts"
        );
    }

    /// Terminal failure decided before any carrier call (pool gone or
    /// drained). A synthetic failed transfer record is still written so the
    /// attempt is visible in history.
    async fn fail_without_carrier_call(&self, job: &Job, error: String) {
        let record = self.transfers.record(NewTransfer {
            user: job.user,
            recipient_name: job.recipient_name.clone(),
            recipient_phone: job.recipient_phone.clone(),
            amount_gb: job.amount_gb,
            transaction_id: crate::carrier::generate_transaction_id(),
            success: false,
            status_code: None,
            carrier_response: None,
            error: Some(error.clone()),
            requires_new_token: false,
            funding: funding_kind(&job.funding),
            job: Some(job.id),
        });
        let transfer = match record {
            Ok(record) => Some(record.id),
            Err(store_error) => {
                tracing::error!(?store_error, job_id = %job.id, "Failed to record synthetic transfer");
                None
            }
        };

        let result = JobOutcome {
            success: false,
            transaction_id: None,
            message: error.clone(),
            status_code: None,
            requires_new_token: false,
        };
        if let Err(store_error) = self.store.mark_failed(job.id, transfer, result).await {
            tracing::error!(?store_error, job_id = %job.id, "Failed to mark job failed");
            return;
        }

        if let Funding::Credit {
            denomination,
            reserved,
        } = job.funding
        {
            if let Err(ledger_error) = self.ledger.refund(
                job.user,
                denomination,
                reserved,
                job.user,
                format!("Failed: {error}"),
                Some(job.id),
            ) {
                tracing::error!(?ledger_error, job_id = %job.id, "Refund failed");
            }
        }

        if let (Some(requests), Some(request)) = (&self.requests, job.request) {
            requests.request_failed(request).await;
        }
        tracing::error!(job_id = %job.id, %error, "Job failed before carrier call");
    }
}

fn transfer_from_outcome(job: &Job, outcome: &TransferOutcome) -> NewTransfer {
    NewTransfer {
        user: job.user,
        recipient_name: job.recipient_name.clone(),
        recipient_phone: job.recipient_phone.clone(),
        amount_gb: job.amount_gb,
        transaction_id: outcome.transaction_id.clone(),
        success: outcome.success,
        status_code: outcome.status_code,
        carrier_response: outcome.body.clone(),
        error: outcome.error.clone(),
        requires_new_token: outcome.requires_new_token,
        funding: funding_kind(&job.funding),
        job: Some(job.id),
    }
}

#[cfg(test)]
mod test {
    use std::sync::Mutex;

    use chrono::TimeDelta;

    use super::*;
    use crate::carrier::test::MockCarrier;
    use crate::job::builder::JobBuilder;
    use crate::job::{JobId, JobStatus, UserId};
    use crate::ledger::{Denomination, EntryType, PoolId};
    use crate::queue::Queue;
    use crate::store::memory::InMemoryStore;
    use crate::store::Pagination;
    use crate::Datashare;

    fn fast_config() -> WorkerConfig {
        WorkerConfig::default()
            .with_poll_interval(Duration::from_millis(20))
            .with_delay_between_jobs(Duration::from_millis(1))
            .with_retry_strategy(BackoffStrategy::constant(TimeDelta::zero()))
    }

    fn harness() -> (Datashare<InMemoryStore, MockCarrier>, MockCarrier) {
        let carrier = MockCarrier::new();
        let datashare = Datashare::new(InMemoryStore::new(), carrier.clone())
            .with_worker_config(fast_config());
        (datashare, carrier)
    }

    fn user(id: i32) -> UserId {
        UserId::from(id)
    }

    async fn wait_for_status(
        queue: &Queue<InMemoryStore, MockCarrier>,
        id: JobId,
        status: JobStatus,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if queue.job(id).await.unwrap().map(|job| job.status) == Some(status) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!("job never reached {status:?}");
        });
    }

    fn pool_of(queue: &Queue<InMemoryStore, MockCarrier>, amount: f64) -> PoolId {
        queue
            .ledger()
            .create_pool(
                user(1),
                "Sharer",
                amount,
                chrono::Utc::now() + TimeDelta::days(30),
            )
            .unwrap()
    }

    #[tokio::test]
    async fn subscription_success_debits_pool_and_completes() {
        let (mut datashare, carrier) = harness();
        datashare.start().unwrap();
        let queue = datashare.queue().clone();
        let pool = pool_of(&queue, 10.0);
        carrier.push_outcome(MockCarrier::success());

        let id = JobBuilder::new(user(1))
            .with_recipient("Ama", "0244123456")
            .with_amount(5.0)
            .funded_by_pool(pool)
            .enqueue(&queue)
            .await
            .unwrap();

        wait_for_status(&queue, id, JobStatus::Completed).await;

        let pool = queue.ledger().pool(pool).unwrap().unwrap();
        assert_eq!(pool.remaining_gb, 5.0);
        assert_eq!(pool.used_gb, 5.0);

        let job = queue.job(id).await.unwrap().unwrap();
        let outcome = job.outcome.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message, "Sent 5GB to 0244123456");

        let records = queue.transfers().all();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].job, Some(id));

        datashare.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn exhausted_credit_job_is_failed_and_refunded_once() {
        let (mut datashare, carrier) = harness();
        datashare.start().unwrap();
        let queue = datashare.queue().clone();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 5.0, user(9), "grant")
            .unwrap();
        carrier.push_outcome(MockCarrier::failure("order rejected"));
        carrier.push_outcome(MockCarrier::failure("order rejected"));

        let id = JobBuilder::new(user(1))
            .with_recipient("Ama", "0244123456")
            .with_amount(5.0)
            .funded_by_credit(Denomination::Gigabytes, 5.0)
            .enqueue(&queue)
            .await
            .unwrap();

        wait_for_status(&queue, id, JobStatus::Failed).await;

        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.error.as_deref(), Some("order rejected"));

        // The enqueue reservation came back, via exactly one refund entry of
        // the job's amount.
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            5.0
        );
        let entries = queue
            .ledger()
            .entries(user(1), Pagination::default())
            .unwrap();
        let refunds: Vec<_> = entries
            .items
            .iter()
            .filter(|entry| entry.entry_type == EntryType::Refund)
            .collect();
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].amount, 5.0);
        assert_eq!(refunds[0].job, Some(id));

        // Both attempts left a transfer record.
        assert_eq!(queue.transfers().all().len(), 2);
        assert_eq!(carrier.call_count(), 2);

        datashare.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn token_rejection_pauses_whole_queue_and_resume_drains_it() {
        // Enqueue before starting so the 401 and the still-pending job are
        // in the same processing cycle.
        let (mut datashare, carrier) = harness();
        let queue = datashare.queue().clone();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 10.0, user(9), "grant")
            .unwrap();
        carrier.push_outcome(MockCarrier::token_rejected());

        let build = |amount: f64| {
            JobBuilder::new(user(1))
                .with_recipient("Ama", "0244123456")
                .with_amount(amount)
                .funded_by_credit(Denomination::Gigabytes, amount)
        };
        let first = build(2.0).enqueue(&queue).await.unwrap();
        let second = build(3.0).enqueue(&queue).await.unwrap();

        datashare.start().unwrap();
        wait_for_status(&queue, first, JobStatus::Paused).await;
        wait_for_status(&queue, second, JobStatus::Paused).await;
        assert!(queue.is_token_paused());

        // The 401 attempt was un-counted and its transfer record discarded.
        let job = queue.job(first).await.unwrap().unwrap();
        assert_eq!(job.attempt, 0);
        assert!(queue.transfers().all().is_empty());

        // No carrier calls while token-paused.
        let calls = carrier.call_count();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(carrier.call_count(), calls);

        // Operator installs a valid token; both jobs drain.
        carrier.push_outcome(MockCarrier::success());
        carrier.push_outcome(MockCarrier::success());
        assert_eq!(queue.resume_paused().await.unwrap(), 2);

        wait_for_status(&queue, first, JobStatus::Completed).await;
        wait_for_status(&queue, second, JobStatus::Completed).await;
        assert!(!queue.is_token_paused());
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            5.0
        );

        datashare.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn retryable_failure_then_success() {
        let (mut datashare, carrier) = harness();
        datashare.start().unwrap();
        let queue = datashare.queue().clone();
        let pool = pool_of(&queue, 10.0);
        carrier.push_outcome(MockCarrier::failure("temporary glitch"));
        carrier.push_outcome(MockCarrier::success());

        let id = JobBuilder::new(user(1))
            .with_recipient("Ama", "0244123456")
            .with_amount(4.0)
            .funded_by_pool(pool)
            .enqueue(&queue)
            .await
            .unwrap();

        wait_for_status(&queue, id, JobStatus::Completed).await;
        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.attempt, 2);
        // Failed attempt recorded alongside the successful one.
        assert_eq!(queue.transfers().all().len(), 2);

        datashare.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn drained_pool_fails_job_without_carrier_call() {
        // Enqueue both before starting: each passes the enqueue-time pool
        // check alone, but the first send drains the pool below what the
        // second needs.
        let (mut datashare, carrier) = harness();
        let queue = datashare.queue().clone();
        let pool = pool_of(&queue, 10.0);
        carrier.push_outcome(MockCarrier::success());

        let build = |amount: f64| {
            JobBuilder::new(user(1))
                .with_recipient("Ama", "0244123456")
                .with_amount(amount)
                .funded_by_pool(pool)
        };
        let first = build(6.0).enqueue(&queue).await.unwrap();
        let second = build(5.0).enqueue(&queue).await.unwrap();

        datashare.start().unwrap();
        wait_for_status(&queue, first, JobStatus::Completed).await;
        wait_for_status(&queue, second, JobStatus::Failed).await;

        // Only the first job reached the carrier.
        assert_eq!(carrier.call_count(), 1);
        let job = queue.job(second).await.unwrap().unwrap();
        assert!(job.error.unwrap().contains("Insufficient data"));

        // The pre-carrier failure still wrote a synthetic failed record.
        let records = queue.transfers().all();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|record| record.job == Some(second)
            && !record.success
            && record.status_code.is_none()));

        datashare.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn at_most_one_job_processing_at_a_time() {
        let (mut datashare, carrier) = harness();
        datashare.start().unwrap();
        let queue = datashare.queue().clone();
        let pool = pool_of(&queue, 100.0);
        carrier.set_delay(Duration::from_millis(30));
        for _ in 0..3 {
            carrier.push_outcome(MockCarrier::success());
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                JobBuilder::new(user(1))
                    .with_recipient("Ama", "0244123456")
                    .with_amount(1.0)
                    .funded_by_pool(pool)
                    .enqueue(&queue)
                    .await
                    .unwrap(),
            );
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let counts = queue.status(user(1)).await.unwrap();
            assert!(counts.processing <= 1, "more than one job processing");
            if counts.completed == 3 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "jobs never drained");
            tokio::time::sleep(Duration::from_millis(3)).await;
        }

        datashare.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn higher_priority_jobs_drain_first() {
        // Enqueue before starting so the first drain sees both jobs.
        let (mut datashare, carrier) = harness();
        let queue = datashare.queue().clone();
        let pool = pool_of(&queue, 10.0);
        carrier.push_outcome(MockCarrier::success());
        carrier.push_outcome(MockCarrier::success());

        JobBuilder::new(user(1))
            .with_recipient("Ama", "0244123456")
            .with_amount(1.0)
            .funded_by_pool(pool)
            .enqueue(&queue)
            .await
            .unwrap();
        let urgent = JobBuilder::new(user(1))
            .with_recipient("Kofi", "0201234567")
            .with_amount(2.0)
            .funded_by_pool(pool)
            .with_priority(5)
            .enqueue(&queue)
            .await
            .unwrap();

        datashare.start().unwrap();
        wait_for_status(&queue, urgent, JobStatus::Completed).await;

        let calls = carrier.calls.lock().unwrap().clone();
        assert_eq!(calls[0], ("0201234567".to_owned(), 2.0));

        datashare.graceful_shutdown().await.unwrap();
    }

    struct RecordingSink {
        completed: Mutex<Vec<RequestId>>,
        failed: Mutex<Vec<RequestId>>,
    }

    #[async_trait]
    impl RequestSink for &'static RecordingSink {
        async fn request_completed(&self, request: RequestId, _transfer: TransferId) {
            self.completed.lock().unwrap().push(request);
        }

        async fn request_failed(&self, request: RequestId) {
            self.failed.lock().unwrap().push(request);
        }
    }

    #[tokio::test]
    async fn linked_requests_are_notified_on_settlement() {
        let sink: &'static RecordingSink = Box::leak(Box::new(RecordingSink {
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
        }));

        let carrier = MockCarrier::new();
        let mut datashare = Datashare::new(InMemoryStore::new(), carrier.clone())
            .with_worker_config(fast_config())
            .with_request_sink(sink);
        datashare.start().unwrap();
        let queue = datashare.queue().clone();
        let pool = pool_of(&queue, 10.0);

        carrier.push_outcome(MockCarrier::success());
        let done = JobBuilder::new(user(1))
            .with_recipient("Ama", "0244123456")
            .with_amount(1.0)
            .funded_by_pool(pool)
            .linked_to_request(RequestId::from(11))
            .enqueue(&queue)
            .await
            .unwrap();
        wait_for_status(&queue, done, JobStatus::Completed).await;

        carrier.push_outcome(MockCarrier::failure("no"));
        carrier.push_outcome(MockCarrier::failure("no"));
        let lost = JobBuilder::new(user(1))
            .with_recipient("Ama", "0244123456")
            .with_amount(1.0)
            .funded_by_pool(pool)
            .linked_to_request(RequestId::from(12))
            .enqueue(&queue)
            .await
            .unwrap();
        wait_for_status(&queue, lost, JobStatus::Failed).await;

        assert_eq!(*sink.completed.lock().unwrap(), vec![RequestId::from(11)]);
        assert_eq!(*sink.failed.lock().unwrap(), vec![RequestId::from(12)]);

        datashare.graceful_shutdown().await.unwrap();
    }
}

