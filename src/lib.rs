//! Durable job-queue dispatcher.
//!
//! relayq delivers documents off named queues with competing consumers: any
//! number of dispatchers poll the same backing store and claim jobs through
//! conditional updates, so a job is only ever processed by one server at a
//! time. Each run drains one queue with a bounded worker pool, reports every
//! attempt to a completion sink, and reschedules failures with exponential
//! backoff. A job that exhausts its retries can optionally suspend its whole
//! queue until an operator steps in.
//!
//! Storage is pluggable through the gateway traits in [`store`]:
//! [`store::PostgresStore`] backs jobs and queues with Postgres,
//! [`store::MemoryStore`] keeps everything in process for tests and
//! embedding.

pub mod cache;
pub mod dequeue;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod queue;
pub mod retry;
pub mod schedule;
pub mod store;
pub mod telemetry;

#[cfg(test)]
mod tests;

pub use cache::QueueActivityCache;
pub use dispatch::{
    DeliveryService, DispatchOptions, DispatchReport, DispatchTrigger, Dispatcher,
    DispatcherConfig,
};
pub use error::{DispatchError, ProcessError, StoreError};
pub use job::{DispatchOutcome, Job, JobStatus, LogSeverity};
pub use queue::{DeliveryQueue, QueueState};
pub use retry::RetryStrategy;
pub use schedule::{QueueSchedule, ScheduleKind};
pub use store::{
    CompletionSink, DocumentStore, JobStore, MemoryStore, PostgresStore, QueueStore,
};
