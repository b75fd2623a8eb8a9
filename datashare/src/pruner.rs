//! Scheduled cleanup of settled jobs.
//!
//! Completed and failed jobs accumulate forever otherwise; the pruner runs on
//! a [`cron::Schedule`] and deletes terminal jobs whose processing finished
//! longer ago than the configured age.
//!
//! # Example
//!
//! ```
//! use datashare::pruner::PrunerConfig;
//! use chrono::TimeDelta;
//! use std::str::FromStr;
//!
//! // Hourly, keeping a week of history.
//! let config = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_max_age(TimeDelta::days(7));
//! ```

use std::ops::Sub;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::job::JobStatus;
use crate::store::JobStore;

/// When and how aggressively settled jobs are cleaned up.
pub struct PrunerConfig {
    schedule: cron::Schedule,
    max_age: TimeDelta,
    statuses: Vec<JobStatus>,
}

impl PrunerConfig {
    /// Construct a new instance of [`PrunerConfig`] scheduled to run on the
    /// provided cron schedule, pruning completed and failed jobs older than
    /// seven days.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            max_age: TimeDelta::days(7),
            statuses: vec![JobStatus::Completed, JobStatus::Failed],
        }
    }

    pub fn with_max_age(mut self, max_age: TimeDelta) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_statuses(mut self, statuses: Vec<JobStatus>) -> Self {
        self.statuses = statuses;
        self
    }
}

pub(crate) struct PrunerRunner<S: JobStore> {
    config: PrunerConfig,
    store: S,
}

impl<S> PrunerRunner<S>
where
    S: JobStore + Send + Sync + 'static,
{
    pub fn new(store: S, config: PrunerConfig) -> Self {
        Self { store, config }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for pruner, stopping");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.prune().await;
                            let delay = next - Utc::now();
                            if delay > TimeDelta::zero() {
                                tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the job pruner");
                            break;
                        },
                    }
                }
            }
        });
    }

    async fn prune(&self) {
        match self
            .store
            .prune(&self.config.statuses, self.config.max_age)
            .await
        {
            Ok(0) => {}
            Ok(deleted) => tracing::debug!(deleted, "Pruned settled jobs"),
            Err(error) => tracing::error!(?error, "Failed to clean up jobs with error {error}"),
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;
    use crate::store::memory::{new_job, InMemoryStore};
    use crate::store::StoreError;
    use crate::transfer::TransferId;

    #[tokio::test]
    async fn pruner_runs_on_schedule() -> Result<(), StoreError> {
        let store = InMemoryStore::new();
        let id = store.insert(new_job(1)).await?;
        store.claim_next().await?;
        store
            .mark_completed(
                id,
                TransferId::from(1),
                crate::job::JobOutcome {
                    success: true,
                    transaction_id: None,
                    message: "done".to_owned(),
                    status_code: Some(200),
                    requires_new_token: false,
                },
            )
            .await?;

        // Every second, no minimum age.
        let config = PrunerConfig::new(cron::Schedule::from_str("* * * * * *").unwrap())
            .with_max_age(TimeDelta::zero() - TimeDelta::seconds(1))
            .with_statuses(vec![JobStatus::Completed]);
        let cancellation_token = CancellationToken::new();
        PrunerRunner::new(store.clone(), config).spawn(cancellation_token.clone());

        tokio::time::timeout(std::time::Duration::from_secs(3), async {
            loop {
                if store.get(id).await.unwrap().is_none() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("pruner should have removed the settled job");

        cancellation_token.cancel();
        Ok(())
    }
}
