use crate::carrier::{Carrier, CarrierError};
use crate::job::{Funding, JobId, NewJob, RequestId, UserId};
use crate::ledger::{Denomination, PoolId};
use crate::queue::Queue;
use crate::store::JobStore;
use crate::DatashareError;

/// Builder for enqueueing a job.
///
/// # Example
///
/// ```no_run
/// # use datashare::prelude::*;
/// # async fn example<S: datashare::store::JobStore + Send + Sync, C: datashare::carrier::Carrier>(
/// #     queue: &datashare::queue::Queue<S, C>,
/// #     pool: datashare::ledger::PoolId,
/// # ) -> Result<(), datashare::DatashareError> {
/// let job_id = JobBuilder::new(1.into())
///     .with_recipient("Ama", "0244123456")
///     .with_amount(5.0)
///     .funded_by_pool(pool)
///     .with_priority(1)
///     .enqueue(queue)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    user: UserId,
    recipient_name: Option<String>,
    recipient_phone: Option<String>,
    amount_gb: Option<f64>,
    funding: Option<Funding>,
    priority: u16,
    max_attempts: u16,
    request: Option<RequestId>,
}

impl JobBuilder {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            recipient_name: None,
            recipient_phone: None,
            amount_gb: None,
            funding: None,
            priority: 0,
            max_attempts: NewJob::DEFAULT_MAX_ATTEMPTS,
            request: None,
        }
    }

    pub fn with_recipient(self, name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            recipient_name: Some(name.into()),
            recipient_phone: Some(phone.into()),
            ..self
        }
    }

    pub fn with_amount(self, amount_gb: f64) -> Self {
        Self {
            amount_gb: Some(amount_gb),
            ..self
        }
    }

    /// Fund from a shared subscription pool, debited after confirmed success.
    pub fn funded_by_pool(self, pool: PoolId) -> Self {
        Self {
            funding: Some(Funding::Subscription { pool }),
            ..self
        }
    }

    /// Fund from the user's prepaid credit. `reserved` is debited at enqueue
    /// time and refunded on terminal failure; for currency credit it is the
    /// price of the bundle rather than the data amount.
    pub fn funded_by_credit(self, denomination: Denomination, reserved: f64) -> Self {
        Self {
            funding: Some(Funding::Credit {
                denomination,
                reserved,
            }),
            ..self
        }
    }

    pub fn with_priority(self, priority: u16) -> Self {
        Self { priority, ..self }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Links the job to a higher-level request record maintained by the
    /// embedding application.
    pub fn linked_to_request(self, request: RequestId) -> Self {
        Self {
            request: Some(request),
            ..self
        }
    }

    /// Finishes the builder without enqueueing, for use with
    /// [`Queue::enqueue_bulk`].
    pub fn build(self) -> Result<NewJob, DatashareError> {
        let missing = |field: &str| {
            DatashareError::Carrier(CarrierError::Validation(format!("{field} is required")))
        };
        Ok(NewJob {
            user: self.user,
            recipient_name: self.recipient_name.ok_or_else(|| missing("recipient"))?,
            recipient_phone: self.recipient_phone.ok_or_else(|| missing("recipient"))?,
            amount_gb: self.amount_gb.ok_or_else(|| missing("amount"))?,
            funding: self.funding.ok_or_else(|| missing("funding source"))?,
            priority: self.priority,
            max_attempts: self.max_attempts,
            request: self.request,
        })
    }

    pub async fn enqueue<S, C>(self, queue: &Queue<S, C>) -> Result<JobId, DatashareError>
    where
        S: JobStore + Send + Sync,
        C: Carrier,
    {
        queue.enqueue(self.build()?).await
    }
}
