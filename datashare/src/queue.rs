//! The queue façade: everything the dashboard/API layer calls.
//!
//! Enqueueing, bulk enqueueing, the synchronous single-shot send path, queue
//! status/listing, retry/cancel, and the token-pause resume protocol all live
//! here. The actual draining of the queue is [`crate::worker::Worker`]'s job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::carrier::Carrier;
use crate::job::{Funding, Job, JobId, NewJob, UserId};
use crate::ledger::{Ledger, LedgerError, PoolId, PoolStatus};
use crate::store::{JobFilter, JobStore, Page, Pagination, StatusCounts};
use crate::transfer::{FundingKind, NewTransfer, TransferLog, TransferRecord};
use crate::worker::WakeMessage;
use crate::DatashareError;

type Result<T> = std::result::Result<T, DatashareError>;

/// Shared handle onto the job queue.
///
/// Cloning is cheap; all clones share the same store, ledger, and pause flag.
pub struct Queue<S, C> {
    store: S,
    carrier: Arc<C>,
    ledger: Ledger,
    transfers: TransferLog,
    wake: mpsc::UnboundedSender<WakeMessage>,
    token_paused: Arc<AtomicBool>,
}

impl<S: Clone, C> Clone for Queue<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            carrier: Arc::clone(&self.carrier),
            ledger: self.ledger.clone(),
            transfers: self.transfers.clone(),
            wake: self.wake.clone(),
            token_paused: Arc::clone(&self.token_paused),
        }
    }
}

impl<S, C> Queue<S, C>
where
    S: JobStore + Sync + Send,
    C: Carrier,
{
    pub(crate) fn new(
        store: S,
        carrier: Arc<C>,
        ledger: Ledger,
        transfers: TransferLog,
        wake: mpsc::UnboundedSender<WakeMessage>,
        token_paused: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            carrier,
            ledger,
            transfers,
            wake,
            token_paused,
        }
    }

    /// Adds a job to the queue and nudges the worker.
    ///
    /// Validation failures and, for credit-funded jobs, an insufficient
    /// balance are rejected here, before a job or transfer record exists.
    /// Credit-funded jobs debit their reservation from the ledger now and are
    /// refunded on terminal failure.
    pub async fn enqueue(&self, mut job: NewJob) -> Result<JobId> {
        job.recipient_phone = self
            .carrier
            .validate(&job.recipient_phone, job.amount_gb)?;
        self.reserve(&job)?;

        let id = self.store.insert(job.clone()).await?;
        tracing::debug!(
            %id,
            amount_gb = job.amount_gb,
            recipient = %job.recipient_phone,
            "Job enqueued"
        );
        self.nudge();
        Ok(id)
    }

    /// Adds a batch of jobs in one insert, all starting pending. The whole
    /// batch is validated (and pool balances checked in aggregate) before
    /// anything is inserted; jobs still drain one at a time.
    pub async fn enqueue_bulk(&self, mut jobs: Vec<NewJob>) -> Result<Vec<JobId>> {
        for job in jobs.iter_mut() {
            job.recipient_phone = self
                .carrier
                .validate(&job.recipient_phone, job.amount_gb)?;
        }

        // Aggregate pool demand up front so a batch cannot half-land.
        let mut pool_demand: Vec<(PoolId, f64)> = Vec::new();
        for job in &jobs {
            if let Funding::Subscription { pool } = job.funding {
                match pool_demand.iter_mut().find(|(id, _)| *id == pool) {
                    Some((_, amount)) => *amount += job.amount_gb,
                    None => pool_demand.push((pool, job.amount_gb)),
                }
            }
        }
        for (pool, amount) in pool_demand {
            self.check_pool(pool, amount)?;
        }

        let mut reserved: Vec<&NewJob> = Vec::new();
        for job in &jobs {
            if let Err(error) = self.reserve(job) {
                for done in reserved {
                    if let Funding::Credit {
                        denomination,
                        reserved: amount,
                    } = done.funding
                    {
                        let _ = self.ledger.refund(
                            done.user,
                            denomination,
                            amount,
                            done.user,
                            "Bulk enqueue aborted",
                            None,
                        );
                    }
                }
                return Err(error);
            }
            reserved.push(job);
        }

        let ids = self.store.insert_many(jobs).await?;
        tracing::debug!(count = ids.len(), "Jobs enqueued (bulk)");
        self.nudge();
        Ok(ids)
    }

    /// The immediate single-shot path: bypasses the queue entirely, calling
    /// the carrier synchronously. The balance is checked (not debited) before
    /// the call; a transfer record is always written; the debit happens only
    /// after confirmed success.
    pub async fn send_now(
        &self,
        user: UserId,
        recipient_name: &str,
        recipient_phone: &str,
        amount_gb: f64,
        funding: Funding,
    ) -> Result<TransferRecord> {
        let phone = self.carrier.validate(recipient_phone, amount_gb)?;

        match funding {
            Funding::Subscription { pool } => self.check_pool(pool, amount_gb)?,
            Funding::Credit {
                denomination,
                reserved,
            } => {
                let balance = self.ledger.balance(user, denomination)?;
                if balance < reserved {
                    return Err(LedgerError::InsufficientBalance {
                        available: balance,
                        requested: reserved,
                    }
                    .into());
                }
            }
        }

        let outcome = self.carrier.transfer(&phone, amount_gb).await;

        let record = self.transfers.record(NewTransfer {
            user,
            recipient_name: recipient_name.to_owned(),
            recipient_phone: phone.clone(),
            amount_gb,
            transaction_id: outcome.transaction_id.clone(),
            success: outcome.success,
            status_code: outcome.status_code,
            carrier_response: outcome.body.clone(),
            error: outcome.error.clone(),
            requires_new_token: outcome.requires_new_token,
            funding: funding_kind(&funding),
            job: None,
        })?;

        if outcome.success {
            match funding {
                Funding::Subscription { pool } => {
                    if let Err(error) = self.ledger.debit_pool(pool, amount_gb) {
                        tracing::error!(?error, %pool, "Failed to debit pool after confirmed send");
                    }
                }
                Funding::Credit {
                    denomination,
                    reserved,
                } => {
                    if let Err(error) = self.ledger.debit(
                        user,
                        denomination,
                        reserved,
                        user,
                        format!("Sent {amount_gb}GB to {phone}"),
                        None,
                    ) {
                        tracing::error!(?error, %user, "Failed to debit credit after confirmed send");
                    }
                }
            }
        }

        Ok(record)
    }

    /// Per-status job counts for the user's dashboard.
    pub async fn status(&self, user: UserId) -> Result<StatusCounts> {
        Ok(self.store.counts(user).await?)
    }

    pub async fn jobs(
        &self,
        user: UserId,
        filter: JobFilter,
        page: Pagination,
    ) -> Result<Page<Job>> {
        Ok(self.store.list(user, filter, page).await?)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.store.get(id).await?)
    }

    /// Moves all of the user's failed jobs back to pending with attempt
    /// counters reset. Credit-funded jobs were refunded when they failed, so
    /// their reservations are re-debited here; the whole retry is rejected if
    /// the balance no longer covers them.
    pub async fn retry_failed(&self, user: UserId) -> Result<u64> {
        let failed = self
            .store
            .list(
                user,
                JobFilter::with_status(crate::job::JobStatus::Failed),
                Pagination::new(1, usize::MAX),
            )
            .await?;

        let credit_jobs: Vec<&Job> = failed
            .items
            .iter()
            .filter(|job| job.funding.is_credit())
            .collect();
        for job in &credit_jobs {
            if let Funding::Credit {
                denomination,
                reserved,
            } = job.funding
            {
                let balance = self.ledger.balance(user, denomination)?;
                if balance < reserved {
                    return Err(LedgerError::InsufficientBalance {
                        available: balance,
                        requested: reserved,
                    }
                    .into());
                }
                self.ledger.debit(
                    user,
                    denomination,
                    reserved,
                    user,
                    format!("Reserved for retry of {}", job.id),
                    Some(job.id),
                )?;
            }
        }

        let retried = self.store.retry_failed(user).await?;
        if retried > 0 {
            tracing::debug!(retried, %user, "Failed jobs returned to queue");
            self.nudge();
        }
        Ok(retried)
    }

    /// Force-fails all of the user's pending jobs with a cancellation marker.
    /// Credit reservations held by the cancelled jobs are released.
    pub async fn cancel_pending(&self, user: UserId) -> Result<u64> {
        let cancelled = self.store.cancel_pending(user).await?;
        for job in &cancelled {
            if let Funding::Credit {
                denomination,
                reserved,
            } = job.funding
            {
                self.ledger.refund(
                    job.user,
                    denomination,
                    reserved,
                    job.user,
                    "Cancelled by user",
                    Some(job.id),
                )?;
            }
        }
        if !cancelled.is_empty() {
            tracing::debug!(cancelled = cancelled.len(), %user, "Pending jobs cancelled");
        }
        Ok(cancelled.len() as u64)
    }

    /// Resume protocol: returns every paused job to pending in one batch and
    /// clears the queue-wide token pause. Called after an operator installs a
    /// valid token. A no-op when nothing is paused.
    pub async fn resume_paused(&self) -> Result<u64> {
        let resumed = self.store.resume_paused().await?;
        self.token_paused.store(false, Ordering::SeqCst);
        if resumed > 0 {
            tracing::debug!(resumed, "Token refreshed, paused jobs resumed");
            self.nudge();
        }
        Ok(resumed)
    }

    /// Whether the queue is parked waiting for a fresh carrier token.
    pub fn is_token_paused(&self) -> bool {
        self.token_paused.load(Ordering::SeqCst)
    }

    /// Reconciles a pool against the carrier's live balance. Best-effort: a
    /// carrier failure is returned but leaves the pool untouched.
    pub async fn reconcile_pool(&self, pool: PoolId) -> Result<()> {
        let live = self.carrier.fetch_live_balance().await?;
        self.ledger.sync_pool_live(pool, &live)?;
        tracing::debug!(%pool, remaining_gb = live.remaining_gb, "Pool reconciled with live balance");
        Ok(())
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn transfers(&self) -> &TransferLog {
        &self.transfers
    }

    fn reserve(&self, job: &NewJob) -> Result<()> {
        match job.funding {
            Funding::Subscription { pool } => self.check_pool(pool, job.amount_gb),
            Funding::Credit {
                denomination,
                reserved,
            } => {
                self.ledger.debit(
                    job.user,
                    denomination,
                    reserved,
                    job.user,
                    format!(
                        "Reserved for {}GB to {}",
                        job.amount_gb, job.recipient_phone
                    ),
                    None,
                )?;
                Ok(())
            }
        }
    }

    fn check_pool(&self, pool: PoolId, amount_gb: f64) -> Result<()> {
        let found = self
            .ledger
            .pool(pool)?
            .ok_or(LedgerError::PoolNotFound(pool))?;
        if found.status != PoolStatus::Active {
            return Err(LedgerError::PoolNotActive(pool).into());
        }
        if found.remaining_gb < amount_gb {
            return Err(LedgerError::InsufficientBalance {
                available: found.remaining_gb,
                requested: amount_gb,
            }
            .into());
        }
        Ok(())
    }

    fn nudge(&self) {
        if let Err(error) = self.wake.send(WakeMessage::Wake) {
            tracing::warn!(?error, "Worker is not running, job will wait for startup");
        }
    }
}

pub(crate) fn funding_kind(funding: &Funding) -> FundingKind {
    match funding {
        Funding::Subscription { .. } => FundingKind::Subscription,
        Funding::Credit { .. } => FundingKind::Credit,
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use chrono::{TimeDelta, Utc};
    use tokio::sync::mpsc;

    use super::*;
    use crate::carrier::test::MockCarrier;
    use crate::job::JobStatus;
    use crate::ledger::Denomination;
    use crate::store::memory::{new_job, InMemoryStore};

    fn queue() -> (
        Queue<InMemoryStore, MockCarrier>,
        Arc<MockCarrier>,
        mpsc::UnboundedReceiver<WakeMessage>,
    ) {
        let carrier = Arc::new(MockCarrier::new());
        let (wake, rx) = mpsc::unbounded_channel();
        let queue = Queue::new(
            InMemoryStore::new(),
            Arc::clone(&carrier),
            Ledger::new(),
            TransferLog::new(),
            wake,
            Arc::new(AtomicBool::new(false)),
        );
        (queue, carrier, rx)
    }

    fn user(id: i32) -> UserId {
        UserId::from(id)
    }

    fn credit_job(user_id: i32, amount: f64) -> NewJob {
        NewJob {
            amount_gb: amount,
            funding: Funding::Credit {
                denomination: Denomination::Gigabytes,
                reserved: amount,
            },
            ..new_job(user_id)
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_phone() {
        let (queue, _, _rx) = queue();
        let job = NewJob {
            recipient_phone: "12".to_owned(),
            ..new_job(1)
        };
        assert_matches!(
            queue.enqueue(job).await,
            Err(DatashareError::Carrier(
                crate::carrier::CarrierError::Validation(_)
            ))
        );
        assert_eq!(queue.status(user(1)).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn enqueue_credit_reserves_balance() {
        let (queue, _, mut rx) = queue();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 10.0, user(9), "grant")
            .unwrap();

        queue.enqueue(credit_job(1, 4.0)).await.unwrap();

        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            6.0
        );
        assert_matches!(rx.try_recv(), Ok(WakeMessage::Wake));
    }

    #[tokio::test]
    async fn enqueue_credit_insufficient_rejected_before_insert() {
        let (queue, _, _rx) = queue();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 3.0, user(9), "grant")
            .unwrap();

        assert_matches!(
            queue.enqueue(credit_job(1, 5.0)).await,
            Err(DatashareError::Ledger(LedgerError::InsufficientBalance {
                available,
                requested,
            })) if available == 3.0 && requested == 5.0
        );
        assert_eq!(queue.status(user(1)).await.unwrap().total, 0);
        assert!(queue.transfers().all().is_empty());
    }

    #[tokio::test]
    async fn enqueue_subscription_checks_pool() {
        let (queue, _, _rx) = queue();
        let pool = queue
            .ledger()
            .create_pool(user(1), "Sharer", 2.0, Utc::now() + TimeDelta::days(30))
            .unwrap();

        let job = NewJob {
            funding: Funding::Subscription { pool },
            amount_gb: 5.0,
            ..new_job(1)
        };
        assert_matches!(
            queue.enqueue(job).await,
            Err(DatashareError::Ledger(LedgerError::InsufficientBalance { .. }))
        );
    }

    #[tokio::test]
    async fn bulk_enqueue_checks_aggregate_pool_demand() {
        let (queue, _, _rx) = queue();
        let pool = queue
            .ledger()
            .create_pool(user(1), "Sharer", 10.0, Utc::now() + TimeDelta::days(30))
            .unwrap();

        let job = |amount| NewJob {
            funding: Funding::Subscription { pool },
            amount_gb: amount,
            ..new_job(1)
        };

        // 6 + 6 exceeds the pool even though each alone fits.
        assert_matches!(
            queue.enqueue_bulk(vec![job(6.0), job(6.0)]).await,
            Err(DatashareError::Ledger(LedgerError::InsufficientBalance { .. }))
        );
        assert_eq!(queue.status(user(1)).await.unwrap().total, 0);

        let ids = queue.enqueue_bulk(vec![job(6.0), job(4.0)]).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(queue.status(user(1)).await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn bulk_enqueue_rolls_back_reservations_on_failure() {
        let (queue, _, _rx) = queue();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 5.0, user(9), "grant")
            .unwrap();

        // The second reservation fails; the first must be released.
        assert_matches!(
            queue
                .enqueue_bulk(vec![credit_job(1, 4.0), credit_job(1, 4.0)])
                .await,
            Err(DatashareError::Ledger(LedgerError::InsufficientBalance { .. }))
        );
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            5.0
        );
        assert_eq!(queue.status(user(1)).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn send_now_debits_only_after_success() {
        let (queue, carrier, _rx) = queue();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 10.0, user(9), "grant")
            .unwrap();

        carrier.push_outcome(MockCarrier::failure("carrier declined"));
        let record = queue
            .send_now(
                user(1),
                "Ama",
                "0244123456",
                2.0,
                Funding::Credit {
                    denomination: Denomination::Gigabytes,
                    reserved: 2.0,
                },
            )
            .await
            .unwrap();
        assert!(!record.success);
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            10.0
        );

        carrier.push_outcome(MockCarrier::success());
        let record = queue
            .send_now(
                user(1),
                "Ama",
                "0244123456",
                2.0,
                Funding::Credit {
                    denomination: Denomination::Gigabytes,
                    reserved: 2.0,
                },
            )
            .await
            .unwrap();
        assert!(record.success);
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            8.0
        );
        // Both attempts left a record.
        assert_eq!(queue.transfers().all().len(), 2);
    }

    #[tokio::test]
    async fn send_now_insufficient_balance_makes_no_carrier_call() {
        let (queue, carrier, _rx) = queue();

        assert_matches!(
            queue
                .send_now(
                    user(1),
                    "Ama",
                    "0244123456",
                    5.0,
                    Funding::Credit {
                        denomination: Denomination::Gigabytes,
                        reserved: 5.0,
                    },
                )
                .await,
            Err(DatashareError::Ledger(LedgerError::InsufficientBalance { .. }))
        );
        assert_eq!(carrier.call_count(), 0);
        assert!(queue.transfers().all().is_empty());
    }

    #[tokio::test]
    async fn cancel_pending_releases_reservations() {
        let (queue, _, _rx) = queue();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 10.0, user(9), "grant")
            .unwrap();
        queue.enqueue(credit_job(1, 4.0)).await.unwrap();
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            6.0
        );

        assert_eq!(queue.cancel_pending(user(1)).await.unwrap(), 1);
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            10.0
        );
    }

    #[tokio::test]
    async fn retry_failed_re_reserves_credit() {
        let (queue, _, _rx) = queue();
        queue
            .ledger()
            .credit(user(1), Denomination::Gigabytes, 10.0, user(9), "grant")
            .unwrap();
        let id = queue.enqueue(credit_job(1, 4.0)).await.unwrap();

        // Fail the job by hand, refunding as the worker would.
        let job = queue.job(id).await.unwrap().unwrap();
        claim_and_fail(&queue, &job).await;
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            10.0
        );

        assert_eq!(queue.retry_failed(user(1)).await.unwrap(), 1);
        assert_eq!(
            queue.ledger().balance(user(1), Denomination::Gigabytes).unwrap(),
            6.0
        );
        let job = queue.job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
    }

    async fn claim_and_fail(queue: &Queue<InMemoryStore, MockCarrier>, job: &Job) {
        queue.store.claim_next().await.unwrap().unwrap();
        queue
            .store
            .mark_failed(
                job.id,
                None,
                crate::job::JobOutcome {
                    success: false,
                    transaction_id: None,
                    message: "failed".to_owned(),
                    status_code: Some(400),
                    requires_new_token: false,
                },
            )
            .await
            .unwrap();
        if let Funding::Credit {
            denomination,
            reserved,
        } = job.funding
        {
            queue
                .ledger()
                .refund(job.user, denomination, reserved, job.user, "Send failed", Some(job.id))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn reconcile_pool_adopts_live_figures() {
        let (queue, carrier, _rx) = queue();
        let pool = queue
            .ledger()
            .create_pool(user(1), "Sharer", 100.0, Utc::now() + TimeDelta::days(30))
            .unwrap();
        queue.ledger().debit_pool(pool, 10.0).unwrap();

        carrier.set_live_balance(crate::carrier::LiveBalance {
            msisdn: "0244000000".to_owned(),
            plan: "Sharer".to_owned(),
            total_gb: 100.0,
            remaining_gb: 82.5,
            used_gb: 17.5,
            usage_percent: 18,
            expires_on: None,
        });
        queue.reconcile_pool(pool).await.unwrap();

        let pool = queue.ledger().pool(pool).unwrap().unwrap();
        assert_eq!(pool.remaining_gb, 82.5);
        assert_eq!(pool.used_gb, 17.5);
    }

    #[tokio::test]
    async fn resume_with_nothing_paused_is_noop() {
        let (queue, _, mut rx) = queue();
        assert_eq!(queue.resume_paused().await.unwrap(), 0);
        assert_matches!(rx.try_recv(), Err(mpsc::error::TryRecvError::Empty));
    }
}
