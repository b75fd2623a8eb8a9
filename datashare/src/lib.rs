//! Single-flight job queue, carrier token lifecycle, and balance ledger for
//! redistributing bulk mobile-data allowances.
//!
//! An operator holds a large data bundle with a carrier and resells slices of
//! it. The hard part is turning each redistribution request into exactly one
//! externally confirmed carrier transaction while the carrier only accepts
//! one call at a time behind a short-lived, OTP-refreshed bearer token. This
//! crate provides the core that does that:
//!
//! - [`queue::Queue`]: enqueueing (single, bulk, and an immediate
//!   single-shot path), status, retry/cancel, and the token-pause resume
//!   protocol;
//! - [`worker`]: the single logical worker draining the queue one job at a
//!   time with a fixed inter-job delay;
//! - [`carrier::CarrierClient`]: the HTTP adapter owning the bearer-token
//!   lifecycle (OTP login, manual override, expiry tracking) and the
//!   transfer/balance calls;
//! - [`ledger::Ledger`]: subscription pools and the FIFO credit-parcel
//!   ledger the queue debits and refunds.
//!
//! # Example
//!
//! ```no_run
//! use datashare::prelude::*;
//!
//! # async fn example() -> Result<(), DatashareError> {
//! let carrier = CarrierClient::new(CarrierConfig::new(
//!     "https://portal.example.com",
//!     "ops@example.com",
//!     "password",
//!     "0244000000",
//!     "233244000000",
//! ))?;
//! let mut datashare = Datashare::new(InMemoryStore::new(), carrier);
//! datashare.start()?;
//!
//! let queue = datashare.queue().clone();
//! let user = UserId::from(1);
//! queue.ledger().credit(user, Denomination::Gigabytes, 50.0, user, "opening grant")?;
//!
//! JobBuilder::new(user)
//!     .with_recipient("Ama", "0244123456")
//!     .with_amount(5.0)
//!     .funded_by_credit(Denomination::Gigabytes, 5.0)
//!     .enqueue(&queue)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod carrier;
pub mod job;
pub mod ledger;
pub mod prelude;
pub mod pruner;
pub mod queue;
pub mod store;
pub mod transfer;
pub mod worker;

use carrier::{Carrier, CarrierError};
use ledger::{Ledger, LedgerError};
use pruner::{PrunerConfig, PrunerRunner};
use queue::Queue;
use store::{JobStore, StoreError};
use transfer::TransferLog;
use worker::{RequestSink, WakeMessage, Worker, WorkerConfig, WorkerHandle};

/// Wires the store, carrier, ledger, and worker together.
///
/// Construct with [`Datashare::new`], optionally configure, then call
/// [`Datashare::start`] to spawn the worker (and pruner, if configured).
pub struct Datashare<S: JobStore, C: Carrier> {
    store: S,
    carrier: Arc<C>,
    queue: Queue<S, C>,
    receiver: Option<mpsc::UnboundedReceiver<WakeMessage>>,
    token_paused: Arc<AtomicBool>,
    request_sink: Option<Arc<dyn RequestSink>>,
    worker_config: WorkerConfig,
    pruner_config: Option<PrunerConfig>,
    worker_handle: Option<WorkerHandle>,
    pruner_token: CancellationToken,
}

impl<S, C> Datashare<S, C>
where
    S: JobStore + Send + Sync + 'static,
    C: Carrier + 'static,
{
    pub fn new(store: S, carrier: C) -> Self {
        let carrier = Arc::new(carrier);
        let ledger = Ledger::new();
        let transfers = TransferLog::new();
        let token_paused = Arc::new(AtomicBool::new(false));
        let (wake, receiver) = mpsc::unbounded_channel();
        let queue = Queue::new(
            store.clone(),
            Arc::clone(&carrier),
            ledger,
            transfers,
            wake,
            Arc::clone(&token_paused),
        );
        Self {
            store,
            carrier,
            queue,
            receiver: Some(receiver),
            token_paused,
            request_sink: None,
            worker_config: WorkerConfig::default(),
            pruner_config: None,
            worker_handle: None,
            pruner_token: CancellationToken::new(),
        }
    }

    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Registers the sink notified when jobs linked to higher-level request
    /// records settle.
    pub fn with_request_sink(mut self, sink: impl RequestSink + 'static) -> Self {
        self.request_sink = Some(Arc::new(sink));
        self
    }

    pub fn with_job_pruner(mut self, config: PrunerConfig) -> Self {
        self.pruner_config = Some(config);
        self
    }

    /// Spawns the worker (and the pruner, if configured). Idempotence is not
    /// supported: starting twice is an error.
    pub fn start(&mut self) -> Result<(), DatashareError> {
        let receiver = self
            .receiver
            .take()
            .ok_or(DatashareError::AlreadyStarted)?;
        let worker = Worker::new(
            self.store.clone(),
            Arc::clone(&self.carrier),
            self.queue.ledger().clone(),
            self.queue.transfers().clone(),
            receiver,
            Arc::clone(&self.token_paused),
            self.request_sink.clone(),
            std::mem::take(&mut self.worker_config),
        );
        self.worker_handle = Some(worker.spawn());
        if let Some(config) = self.pruner_config.take() {
            PrunerRunner::new(self.store.clone(), config).spawn(self.pruner_token.clone());
        }
        Ok(())
    }

    /// The queue façade handed to the dashboard/API layer.
    pub fn queue(&self) -> &Queue<S, C> {
        &self.queue
    }

    /// The carrier adapter, for the token-admin surface. After a successful
    /// [`carrier::CarrierClient::complete_login`] or
    /// [`carrier::CarrierClient::set_manual_token`], call
    /// [`Queue::resume_paused`] to release a token-paused queue.
    pub fn carrier(&self) -> &C {
        &self.carrier
    }

    pub async fn graceful_shutdown(mut self) -> Result<(), DatashareError> {
        tracing::debug!("Shutting down datashare tasks");
        self.pruner_token.cancel();
        match self.worker_handle.as_mut() {
            Some(handle) => handle.graceful_shutdown().await,
            None => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum DatashareError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("Worker already started")]
    AlreadyStarted,
    #[error("Error communicating with the job store")]
    Store(#[from] StoreError),
    #[error("Ledger operation rejected")]
    Ledger(#[from] LedgerError),
    #[error("Carrier operation failed")]
    Carrier(#[from] CarrierError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::test::MockCarrier;
    use crate::store::memory::InMemoryStore;

    #[tokio::test]
    async fn setup_and_shutdown() {
        let mut datashare = Datashare::new(InMemoryStore::new(), MockCarrier::new());
        datashare.start().unwrap();
        assert!(matches!(
            datashare.start(),
            Err(DatashareError::AlreadyStarted)
        ));
        datashare.graceful_shutdown().await.unwrap();
    }
}
