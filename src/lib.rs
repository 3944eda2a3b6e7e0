//! Multi-model rate limiting and admission control for workloads calling
//! rate-limited backends.
//!
//! Callers submit jobs tagged with a job type. The limiter reserves tokens,
//! requests, concurrency and memory on the first model in the escalation
//! order with capacity, runs the caller's job body, then reconciles the
//! counters to the usage the body actually reports. Job types share the
//! capacity pool through ratios that can adjust themselves under load, and
//! instances pointed at the same [`distributed`] backend split global limits
//! cooperatively.
//!
//! [`RateLimiter`] is the entry point; see its documentation for an example.

#![deny(missing_docs)]

mod availability;
mod clock;
mod config;
pub mod distributed;
mod error;
mod job;
mod job_types;
mod model;
mod orchestrator;
mod semaphore;
mod usage;
mod window;

pub use availability::{AvailabilitySnapshot, ChangeReason, Slots};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AvailabilityCallback, JobTypeConfig, LimiterOptions, MemoryConfig, ModelConfig,
    OverageCallback, RatioAdjustmentConfig, RatioConfig, ResourceEstimate,
};
pub use error::{BoxError, Error, Result};
pub use job::{JobContext, JobRequest, JobResult, JobVerdict, Outcome};
pub use job_types::{JobTypeStats, RatioAdjustment, RatioChange};
pub use model::ModelStats;
pub use orchestrator::{LimiterStats, RateLimiter};
pub use semaphore::{FifoSemaphore, SemaphoreStats};
pub use usage::{Pricing, UsageEntry, UsageReport};
pub use window::{Dimension, WindowCounter, WindowReservation, WindowStats, DAY_MS, MINUTE_MS};
