//! Limiter configuration and fail-fast validation.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::availability::{AvailabilitySnapshot, ChangeReason};
use crate::clock::Clock;
use crate::distributed::DistributedBackend;
use crate::error::{Error, Result};
use crate::job_types::RatioAdjustment;
use crate::usage::Pricing;
use crate::window::Dimension;

/// Tolerance when checking that ratios sum to 1.
pub(crate) const RATIO_EPSILON: f64 = 1e-4;

/// Observer for availability changes.
///
/// Called with the new snapshot, the event that caused it, the model involved
/// (when the event is model-scoped) and, for ratio adjustments, the adjustment
/// itself.
pub type AvailabilityCallback = Box<
    dyn Fn(&AvailabilitySnapshot, ChangeReason, Option<&str>, Option<&RatioAdjustment>)
        + Send
        + Sync,
>;

/// Observer for committed usage exceeding a configured limit.
///
/// Called with the model, the dimension that overran and the overshoot
/// amount. Overruns are reported once and never retried or undone.
pub type OverageCallback = Box<dyn Fn(&str, Dimension, u64) + Send + Sync>;

/// Limits and pricing for one model.
///
/// Every limit is optional; an absent limit means the dimension is not
/// enforced for this model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Token budget per minute window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_minute: Option<u64>,
    /// Token budget per daily window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_per_day: Option<u64>,
    /// Request budget per minute window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    /// Request budget per daily window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u64>,
    /// Concurrent in-flight request ceiling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u64>,
    /// Memory ceiling in KB for in-flight jobs on this model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_capacity: Option<u64>,
    /// Floor on the slot pool when a distributed allocation scales it down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_capacity: Option<u64>,
    /// Cost vector per million tokens.
    pub pricing: Pricing,
}

/// A job type's share of the capacity pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatioConfig {
    /// Starting fraction of total capacity, in (0, 1].
    pub initial_value: f64,
    /// Whether this type may donate or receive capacity during dynamic
    /// adjustment. Non-flexible ratios are preserved exactly.
    pub flexible: bool,
}

/// Expected per-job resource consumption for one job type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobTypeConfig {
    /// Estimated tokens consumed per job.
    pub estimated_used_tokens: u64,
    /// Estimated backend requests per job.
    pub estimated_number_of_requests: u64,
    /// Estimated memory per in-flight job, in KB. Required when any model
    /// configures a memory ceiling.
    pub estimated_used_memory_kb: Option<u64>,
    /// Optional explicit capacity share.
    pub ratio: Option<RatioConfig>,
    /// Per-model bound on how long a job of this type waits for capacity
    /// before escalating to the next model. Absent models use the default
    /// wait (until shortly after the next minute boundary).
    #[serde(default)]
    pub max_wait_ms: HashMap<String, u64>,
}

/// Per-job resource amounts debited at reservation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEstimate {
    /// Tokens to reserve against the token windows.
    pub tokens: u64,
    /// Requests to reserve against the request windows.
    pub requests: u64,
    /// Memory to reserve, in KB.
    pub memory_kb: u64,
}

impl JobTypeConfig {
    /// The reservation this job type debits per job.
    pub fn estimate(&self) -> ResourceEstimate {
        ResourceEstimate {
            tokens: self.estimated_used_tokens,
            requests: self.estimated_number_of_requests,
            memory_kb: self.estimated_used_memory_kb.unwrap_or(0),
        }
    }
}

/// Process-memory based resizing of the memory semaphores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Fraction of free system memory the limiter may hand out.
    pub free_memory_ratio: f64,
    /// How often to re-sample free memory.
    pub recalculation_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            free_memory_ratio: 0.8,
            recalculation_interval_ms: 30_000,
        }
    }
}

/// Tuning for dynamic job-type ratio adjustment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatioAdjustmentConfig {
    /// Load at or above which a flexible type receives capacity.
    pub high_load_threshold: f64,
    /// Load at or below which a flexible type donates capacity.
    pub low_load_threshold: f64,
    /// Cap on how much ratio a single donor gives up per cycle.
    pub max_adjustment: f64,
    /// Floor below which no flexible ratio is pushed.
    pub min_ratio: f64,
    /// Timer period for adjustment. 0 disables the timer; adjustment then
    /// only runs on the release trigger.
    pub adjustment_interval_ms: u64,
    /// Run an adjustment after this many releases.
    pub releases_per_adjustment: u64,
}

impl Default for RatioAdjustmentConfig {
    fn default() -> Self {
        Self {
            high_load_threshold: 0.8,
            low_load_threshold: 0.3,
            max_adjustment: 0.1,
            min_ratio: 0.05,
            adjustment_interval_ms: 10_000,
            releases_per_adjustment: 10,
        }
    }
}

/// Everything needed to construct a [`RateLimiter`](crate::RateLimiter).
///
/// Built with the `with_` methods and validated once at construction;
/// validation failures surface as [`Error::Config`] before any job runs.
#[derive(Default)]
pub struct LimiterOptions {
    /// Configured models by id.
    pub models: HashMap<String, ModelConfig>,
    /// The order in which models are tried. Required with more than one
    /// model.
    pub escalation_order: Vec<String>,
    /// Per-job-type resource estimates.
    pub resource_estimations: HashMap<String, JobTypeConfig>,
    /// Memory recalculation tuning.
    pub memory: MemoryConfig,
    /// Ratio adjustment tuning.
    pub ratio_adjustment: RatioAdjustmentConfig,
    /// Distributed backend. Absent means single-instance operation.
    pub backend: Option<Arc<dyn DistributedBackend>>,
    /// Prefix attached to emitted log events.
    pub label: Option<String>,
    /// Availability observer.
    pub on_available_slots_change: Option<AvailabilityCallback>,
    /// Overage observer.
    pub on_overage: Option<OverageCallback>,
    /// Time source override, used by tests to drive window rollover.
    pub clock: Option<Arc<dyn Clock>>,
    /// Stable identity in the distributed registry. Generated when absent.
    pub instance_id: Option<String>,
}

impl LimiterOptions {
    /// Start an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a model.
    pub fn model(mut self, id: impl Into<String>, config: ModelConfig) -> Self {
        self.models.insert(id.into(), config);
        self
    }

    /// Set the escalation order.
    pub fn escalation_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.escalation_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Add a job type with its resource estimates.
    pub fn job_type(mut self, name: impl Into<String>, config: JobTypeConfig) -> Self {
        self.resource_estimations.insert(name.into(), config);
        self
    }

    /// Set memory recalculation tuning.
    pub fn memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Set ratio adjustment tuning.
    pub fn ratio_adjustment(mut self, config: RatioAdjustmentConfig) -> Self {
        self.ratio_adjustment = config;
        self
    }

    /// Attach a distributed backend.
    pub fn backend(mut self, backend: Arc<dyn DistributedBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the logging label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Observe availability changes.
    pub fn on_available_slots_change(mut self, callback: AvailabilityCallback) -> Self {
        self.on_available_slots_change = Some(callback);
        self
    }

    /// Observe counter overruns.
    pub fn on_overage(mut self, callback: OverageCallback) -> Self {
        self.on_overage = Some(callback);
        self
    }

    /// Override the time source.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Fix the instance id used in the distributed registry.
    pub fn instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = Some(id.into());
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::Config("at least one model is required".into()));
        }

        if self.models.len() > 1 && self.escalation_order.is_empty() {
            return Err(Error::Config(
                "escalation_order is required with multiple models".into(),
            ));
        }

        for id in &self.escalation_order {
            if !self.models.contains_key(id) {
                return Err(Error::Config(format!(
                    "escalation_order references unknown model '{id}'"
                )));
            }
        }

        let mut explicit_sum = 0.0;
        for (name, job_type) in &self.resource_estimations {
            if let Some(ratio) = &job_type.ratio {
                if ratio.initial_value <= 0.0 || ratio.initial_value > 1.0 {
                    return Err(Error::Config(format!(
                        "job type '{name}' ratio must be in (0, 1], got {}",
                        ratio.initial_value
                    )));
                }
                explicit_sum += ratio.initial_value;
            }
        }
        if explicit_sum > 1.0 + RATIO_EPSILON {
            return Err(Error::Config(format!(
                "job type ratios sum to {explicit_sum}, must not exceed 1"
            )));
        }

        let memory_limited = self.models.values().any(|m| m.max_capacity.is_some());
        if memory_limited {
            for (name, job_type) in &self.resource_estimations {
                if job_type.estimated_used_memory_kb.is_none() {
                    return Err(Error::Config(format!(
                        "memory limits are configured but job type '{name}' \
                         has no memory estimate"
                    )));
                }
            }
        }

        Ok(())
    }
}
