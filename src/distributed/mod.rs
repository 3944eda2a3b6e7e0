//! Cooperative capacity splitting across limiter instances.
//!
//! Instances sharing a backend register themselves, heartbeat by
//! re-registering, and receive per-model pool allocations carved from the
//! global limits. The sum of the pools never exceeds the configured global
//! capacity, so a fleet of limiters stays inside one shared budget.

mod memory;
mod redis;

pub use self::redis::{RedisBackend, RedisBackendConfig};
pub use memory::InMemoryBackend;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{JobTypeConfig, ModelConfig, ResourceEstimate};
use crate::error::Result;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 5_000;
/// Instances silent for longer than this are evicted on the next sweep.
pub const DEFAULT_INSTANCE_TIMEOUT_MS: u64 = 15_000;

/// One instance's share of a model's global capacity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolAllocation {
    /// Concurrency slots this instance may run against the model. 0 means
    /// the model has no globally limited dimension to derive slots from.
    #[serde(default)]
    pub total_slots: u64,
    /// Per-instance tokens-per-minute budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
    /// Per-instance requests-per-minute budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    /// Per-instance tokens-per-day budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_day: Option<u64>,
    /// Per-instance requests-per-day budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u64>,
}

/// The full allocation a backend pushes to an instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AllocationInfo {
    /// Per-model pools.
    #[serde(default)]
    pub pools: HashMap<String, PoolAllocation>,
    /// Whether the pools track live usage rather than static fair shares.
    #[serde(default)]
    pub dynamic_limits: bool,
}

/// The record an instance writes into the shared registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRegistration {
    /// The registering instance.
    pub instance_id: String,
    /// Wall-clock millis of the last heartbeat.
    pub last_heartbeat: u64,
    /// In-flight jobs per model, informational.
    #[serde(default)]
    pub in_flight_by_model: HashMap<String, u64>,
}

/// A reservation about to be admitted, offered to the backend for a global
/// admission decision and usage debit.
#[derive(Debug, Clone)]
pub struct ReservationOutline {
    /// The instance asking.
    pub instance_id: String,
    /// The model being reserved.
    pub model_id: String,
    /// The estimated debit.
    pub estimate: ResourceEstimate,
    /// Minute window the local debit landed in.
    pub minute_window: u64,
    /// Daily window the local debit landed in.
    pub day_window: u64,
}

/// Reconciliation of a finished reservation against the shared counters.
#[derive(Debug, Clone)]
pub struct UsageDelta {
    /// The instance reporting.
    pub instance_id: String,
    /// The model the job ran on.
    pub model_id: String,
    /// What was debited at admission time.
    pub estimate: ResourceEstimate,
    /// Tokens the job actually consumed.
    pub actual_tokens: u64,
    /// Requests the job actually made.
    pub actual_requests: u64,
    /// Minute window of the original debit.
    pub minute_window: u64,
    /// Daily window of the original debit.
    pub day_window: u64,
}

/// Observer for allocation pushes.
pub type AllocationCallback = Box<dyn Fn(AllocationInfo) + Send + Sync>;

/// Keeps an allocation subscription alive; dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a cancellation action.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving allocation pushes.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Global limits and average per-job estimates, the inputs a backend needs
/// to carve per-instance pools.
#[derive(Debug, Clone, Default)]
pub struct GlobalLimits {
    /// Global model limits, the same configuration every instance runs with.
    pub models: HashMap<String, ModelConfig>,
    /// Mean per-job estimate across job types.
    pub mean_estimate: ResourceEstimate,
}

impl GlobalLimits {
    /// Derive the backend inputs from the limiter configuration.
    pub fn new(
        models: HashMap<String, ModelConfig>,
        estimations: &HashMap<String, JobTypeConfig>,
    ) -> Self {
        Self {
            models,
            mean_estimate: mean_estimate(estimations),
        }
    }
}

/// Arithmetic mean of the per-job estimates across job types.
pub(crate) fn mean_estimate(estimations: &HashMap<String, JobTypeConfig>) -> ResourceEstimate {
    let count = estimations.len() as u64;
    if count == 0 {
        return ResourceEstimate::default();
    }
    let mut total = ResourceEstimate::default();
    for job_type in estimations.values() {
        let estimate = job_type.estimate();
        total.tokens += estimate.tokens;
        total.requests += estimate.requests;
        total.memory_kb += estimate.memory_kb;
    }
    ResourceEstimate {
        tokens: total.tokens / count,
        requests: total.requests / count,
        memory_kb: total.memory_kb / count,
    }
}

/// A shared store the limiter coordinates through.
///
/// Registration doubles as the heartbeat: every call refreshes the caller's
/// record, sweeps out stale instances and atomically recomputes pool
/// allocations for everyone. Subscribers of other instances learn about the
/// new allocation through their subscription.
#[async_trait]
pub trait DistributedBackend: Send + Sync {
    /// Register or refresh this instance and return its current allocation.
    async fn register(&self, registration: &InstanceRegistration) -> Result<AllocationInfo>;

    /// Remove this instance from the registry.
    async fn unregister(&self, instance_id: &str) -> Result<()>;

    /// Ask for global admission of a reservation and debit its estimate.
    ///
    /// Backends that do not distribute admission may answer `true` without
    /// any bookkeeping.
    async fn acquire(&self, outline: &ReservationOutline) -> Result<bool>;

    /// Reconcile a finished reservation against the shared counters.
    async fn release(&self, delta: &UsageDelta) -> Result<()>;

    /// Receive allocation pushes for this instance.
    async fn subscribe(
        &self,
        instance_id: &str,
        callback: AllocationCallback,
    ) -> Result<Subscription>;

    /// How often the limiter should re-register.
    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_estimate_averages_across_types() {
        let mut estimations = HashMap::new();
        estimations.insert(
            "small".to_string(),
            JobTypeConfig {
                estimated_used_tokens: 100,
                estimated_number_of_requests: 1,
                estimated_used_memory_kb: Some(10),
                ..JobTypeConfig::default()
            },
        );
        estimations.insert(
            "large".to_string(),
            JobTypeConfig {
                estimated_used_tokens: 300,
                estimated_number_of_requests: 3,
                estimated_used_memory_kb: Some(30),
                ..JobTypeConfig::default()
            },
        );

        let mean = mean_estimate(&estimations);
        assert_eq!(mean.tokens, 200);
        assert_eq!(mean.requests, 2);
        assert_eq!(mean.memory_kb, 20);
    }

    #[test]
    fn allocation_round_trips_through_json() {
        let mut pools = HashMap::new();
        pools.insert(
            "small".to_string(),
            PoolAllocation {
                total_slots: 3,
                tokens_per_minute: Some(100),
                requests_per_minute: None,
                tokens_per_day: None,
                requests_per_day: Some(50),
            },
        );
        let info = AllocationInfo {
            pools,
            dynamic_limits: true,
        };

        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("tokens_per_day"), "absent limits are omitted");
        let parsed: AllocationInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, info);
    }
}
