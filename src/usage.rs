//! Usage reports and cost accounting.

use serde::{Deserialize, Serialize};

/// Tokens and requests consumed by one model invocation.
///
/// Produced by the job body once the backend call completes. The limiter
/// trusts this report when reconciling counters, so it should reflect what
/// the backend actually billed. `request_count` is authoritative for the
/// request dimensions; it is never inferred from token fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    /// The model the usage was incurred against.
    pub model_id: String,
    /// Uncached prompt tokens.
    pub input_tokens: u64,
    /// Prompt tokens served from cache.
    pub cached_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Requests made against the backend, usually 1.
    pub request_count: u64,
}

impl UsageReport {
    /// A single-request report.
    pub fn new(model_id: impl Into<String>, input: u64, cached: u64, output: u64) -> Self {
        Self {
            model_id: model_id.into(),
            input_tokens: input,
            cached_tokens: cached,
            output_tokens: output,
            request_count: 1,
        }
    }

    /// Override the request count for multi-call jobs.
    pub fn with_request_count(mut self, requests: u64) -> Self {
        self.request_count = requests;
        self
    }

    /// Total tokens across input, cache and output.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.cached_tokens + self.output_tokens
    }
}

/// Per-token pricing for one model, denominated per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Price per million uncached input tokens.
    pub input: f64,
    /// Price per million cached input tokens.
    pub cached: f64,
    /// Price per million output tokens.
    pub output: f64,
}

impl Pricing {
    /// Cost of a usage report under this pricing.
    pub fn cost_of(&self, usage: &UsageReport) -> f64 {
        (usage.input_tokens as f64 * self.input
            + usage.cached_tokens as f64 * self.cached
            + usage.output_tokens as f64 * self.output)
            / 1_000_000.0
    }
}

/// One model's contribution to a job, including delegation hops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// The model this entry was incurred against.
    pub model_id: String,
    /// What the body reported for this model.
    pub usage: UsageReport,
    /// Cost under the model's pricing.
    pub cost: f64,
}
