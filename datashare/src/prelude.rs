//! The purpose of this module is to alleviate the need to import many of the
//! `datashare` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use datashare::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::carrier::token::TokenStatus;
pub use crate::carrier::{Carrier, CarrierClient, CarrierConfig, CarrierError, TransferOutcome};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Funding, Job, JobId, JobStatus, RequestId, UserId};
pub use crate::ledger::{Denomination, Ledger, LedgerError, PoolId, SubscriptionPool};
pub use crate::pruner::PrunerConfig;
pub use crate::queue::Queue;
pub use crate::store::memory::InMemoryStore;
pub use crate::store::{JobFilter, JobStore, Pagination, StatusCounts};
pub use crate::transfer::{TransferLog, TransferRecord};
pub use crate::worker::{RequestSink, WorkerConfig};
pub use crate::Datashare;
pub use crate::DatashareError;
