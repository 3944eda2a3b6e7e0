//! Derived "slots available" tracking with diff-based change notification.

use std::sync::Mutex;

use crate::config::{AvailabilityCallback, ResourceEstimate};
use crate::job_types::RatioAdjustment;
use crate::model::ModelStats;
use crate::window::Dimension;

/// The event that triggered an availability recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    /// A tokens-per-minute counter moved.
    TokensMinute,
    /// A tokens-per-day counter moved.
    TokensDay,
    /// A requests-per-minute counter moved.
    RequestsMinute,
    /// A requests-per-day counter moved.
    RequestsDay,
    /// The concurrency semaphore moved.
    ConcurrentRequests,
    /// The memory semaphore moved.
    Memory,
    /// A distributed pool allocation was applied.
    Distributed,
    /// Job-type ratios were adjusted.
    Adjustment,
}

impl From<Dimension> for ChangeReason {
    fn from(dimension: Dimension) -> Self {
        match dimension {
            Dimension::TokensMinute => Self::TokensMinute,
            Dimension::TokensDay => Self::TokensDay,
            Dimension::RequestsMinute => Self::RequestsMinute,
            Dimension::RequestsDay => Self::RequestsDay,
        }
    }
}

/// How many more jobs of the estimated size can be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slots {
    /// Every configured dimension bounds admission to this count.
    Finite(u64),
    /// No dimension is configured; admission is not bounded by the limiter.
    Unbounded,
}

impl Slots {
    /// The finite count, treating unbounded as `None`.
    pub fn finite(self) -> Option<u64> {
        match self {
            Self::Finite(count) => Some(count),
            Self::Unbounded => None,
        }
    }
}

/// Availability across every configured dimension, summed over models.
///
/// A `None` field means no model configures that dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    /// Jobs of the estimated size admissible right now.
    pub slots: Slots,
    /// Tokens left in the minute windows.
    pub tokens_per_minute: Option<u64>,
    /// Tokens left in the daily windows.
    pub tokens_per_day: Option<u64>,
    /// Requests left in the minute windows.
    pub requests_per_minute: Option<u64>,
    /// Requests left in the daily windows.
    pub requests_per_day: Option<u64>,
    /// Free concurrency permits.
    pub concurrent_requests: Option<u64>,
    /// Free reservable memory in KB.
    pub memory_kb: Option<u64>,
}

/// Everything the derivation needs, read through a getter so the tracker
/// never holds a reference back into the limiter.
pub(crate) struct AvailabilityInputs {
    pub(crate) models: Vec<ModelStats>,
    pub(crate) mean_estimate: ResourceEstimate,
}

type InputSource = Box<dyn Fn() -> AvailabilityInputs + Send + Sync>;

/// Watches limiter state and reports availability changes.
pub(crate) struct AvailabilityTracker {
    source: InputSource,
    callback: Option<AvailabilityCallback>,
    previous: Mutex<Option<AvailabilitySnapshot>>,
}

impl AvailabilityTracker {
    pub(crate) fn new(source: InputSource, callback: Option<AvailabilityCallback>) -> Self {
        Self {
            source,
            callback,
            previous: Mutex::new(None),
        }
    }

    /// The current snapshot, recomputed from live state.
    pub(crate) fn snapshot(&self) -> AvailabilitySnapshot {
        derive((self.source)())
    }

    /// Recompute and notify the observer when the snapshot changed.
    ///
    /// Adjustment events always notify so the observer sees the adjustment
    /// payload, even when no derived number moved.
    pub(crate) fn notify(
        &self,
        reason: ChangeReason,
        model_id: Option<&str>,
        adjustment: Option<&RatioAdjustment>,
    ) {
        let snapshot = self.snapshot();
        let changed = {
            let mut previous = self.previous.lock().expect("tracker mutex poisoned");
            let changed = previous.as_ref() != Some(&snapshot);
            *previous = Some(snapshot);
            changed
        };

        if !changed && reason != ChangeReason::Adjustment {
            return;
        }
        if let Some(callback) = &self.callback {
            callback(&snapshot, reason, model_id, adjustment);
        }
    }
}

/// Slots for one model: the minimum over its configured dimensions of how
/// many estimated jobs still fit. `None` when nothing is configured.
fn model_slots(stats: &ModelStats, estimate: ResourceEstimate) -> Option<u64> {
    let mut slots: Option<u64> = None;
    let mut bound = |available: u64, per_job: u64| {
        if per_job == 0 {
            return;
        }
        let fit = available / per_job;
        slots = Some(slots.map_or(fit, |s| s.min(fit)));
    };

    if let Some(window) = stats.tokens_minute {
        bound(window.available().unwrap_or(0), estimate.tokens);
    }
    if let Some(window) = stats.tokens_day {
        bound(window.available().unwrap_or(0), estimate.tokens);
    }
    if let Some(window) = stats.requests_minute {
        bound(window.available().unwrap_or(0), estimate.requests);
    }
    if let Some(window) = stats.requests_day {
        bound(window.available().unwrap_or(0), estimate.requests);
    }
    if let Some(semaphore) = stats.concurrency {
        bound(semaphore.available, 1);
    }
    if let Some(semaphore) = stats.memory {
        bound(semaphore.available, estimate.memory_kb);
    }

    slots
}

fn derive(inputs: AvailabilityInputs) -> AvailabilitySnapshot {
    let mut snapshot = AvailabilitySnapshot {
        slots: Slots::Finite(0),
        tokens_per_minute: None,
        tokens_per_day: None,
        requests_per_minute: None,
        requests_per_day: None,
        concurrent_requests: None,
        memory_kb: None,
    };

    let mut total_slots: u64 = 0;
    let mut unbounded = false;

    for stats in &inputs.models {
        match model_slots(stats, inputs.mean_estimate) {
            Some(slots) => total_slots += slots,
            None => unbounded = true,
        }

        let mut add = |field: &mut Option<u64>, available: Option<u64>| {
            if let Some(available) = available {
                *field = Some(field.unwrap_or(0) + available);
            }
        };
        add(
            &mut snapshot.tokens_per_minute,
            stats.tokens_minute.and_then(|w| w.available()),
        );
        add(
            &mut snapshot.tokens_per_day,
            stats.tokens_day.and_then(|w| w.available()),
        );
        add(
            &mut snapshot.requests_per_minute,
            stats.requests_minute.and_then(|w| w.available()),
        );
        add(
            &mut snapshot.requests_per_day,
            stats.requests_day.and_then(|w| w.available()),
        );
        add(
            &mut snapshot.concurrent_requests,
            stats.concurrency.map(|s| s.available),
        );
        add(&mut snapshot.memory_kb, stats.memory.map(|s| s.available));
    }

    snapshot.slots = if unbounded {
        Slots::Unbounded
    } else {
        Slots::Finite(total_slots)
    };
    snapshot
}
