//! An in-process backend for single-machine clusters and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::window::{Dimension, DAY_MS, MINUTE_MS};

use super::{
    AllocationCallback, AllocationInfo, DistributedBackend, GlobalLimits, InstanceRegistration,
    PoolAllocation, ReservationOutline, Subscription, UsageDelta,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_INSTANCE_TIMEOUT_MS,
};

type UsageKey = (String, Dimension, u64);

#[derive(Default)]
struct Store {
    instances: HashMap<String, InstanceRegistration>,
    allocations: HashMap<String, AllocationInfo>,
    usage: HashMap<UsageKey, u64>,
    subscribers: HashMap<u64, (String, Arc<AllocationCallback>)>,
    next_subscriber: u64,
}

/// A backend holding the shared registry in process memory.
///
/// Clones share one store, so several limiter instances in one process (or
/// one test) coordinate exactly like they would through an external store.
/// Every mutation happens under a single lock, which is the same atomicity
/// the Redis backend gets from its server-side script.
#[derive(Clone)]
pub struct InMemoryBackend {
    limits: Arc<GlobalLimits>,
    clock: Arc<dyn Clock>,
    instance_timeout_ms: u64,
    heartbeat_interval_ms: u64,
    store: Arc<Mutex<Store>>,
}

impl InMemoryBackend {
    /// Create a backend carving pools from the given global limits.
    pub fn new(limits: GlobalLimits) -> Self {
        Self {
            limits: Arc::new(limits),
            clock: Arc::new(SystemClock),
            instance_timeout_ms: DEFAULT_INSTANCE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Override the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the eviction timeout.
    pub fn with_instance_timeout(mut self, timeout: Duration) -> Self {
        self.instance_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Override the heartbeat cadence.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().expect("backend store mutex poisoned")
    }

    /// Live instance ids in the registry. Test visibility.
    pub fn live_instances(&self) -> Vec<String> {
        self.lock().instances.keys().cloned().collect()
    }

    /// Committed usage for a model dimension in the current window. Test
    /// visibility.
    pub fn committed_usage(&self, model_id: &str, dimension: Dimension) -> u64 {
        let window = self.current_window(dimension);
        self.lock()
            .usage
            .get(&(model_id.to_string(), dimension, window))
            .copied()
            .unwrap_or(0)
    }

    fn current_window(&self, dimension: Dimension) -> u64 {
        self.clock.now_ms() / window_ms(dimension)
    }

    /// Evict stale instances, rebuild every allocation and hand back the
    /// callbacks to notify. Runs entirely under the store lock.
    fn sweep_and_recompute(
        &self,
        store: &mut Store,
        now: u64,
    ) -> Vec<(Arc<AllocationCallback>, AllocationInfo)> {
        let timeout = self.instance_timeout_ms;
        store.instances.retain(|instance_id, record| {
            let alive = now.saturating_sub(record.last_heartbeat) <= timeout;
            if !alive {
                debug!(instance = %instance_id, "evicting silent instance");
            }
            alive
        });
        store
            .allocations
            .retain(|instance_id, _| store.instances.contains_key(instance_id));

        // Old windows no longer feed any computation.
        let minute = now / MINUTE_MS;
        let day = now / DAY_MS;
        store.usage.retain(|(_, dimension, window), _| match dimension {
            Dimension::TokensMinute | Dimension::RequestsMinute => *window + 1 >= minute,
            Dimension::TokensDay | Dimension::RequestsDay => *window + 1 >= day,
        });

        let allocation = self.compute_allocation(store, now);
        for instance_id in store.instances.keys() {
            store
                .allocations
                .insert(instance_id.clone(), allocation.clone());
        }

        store
            .subscribers
            .values()
            .filter(|(instance_id, _)| store.instances.contains_key(instance_id))
            .map(|(_, callback)| (callback.clone(), allocation.clone()))
            .collect()
    }

    /// The per-instance fair share of every model's global limits.
    fn compute_allocation(&self, store: &Store, now: u64) -> AllocationInfo {
        let live = store.instances.len().max(1) as u64;
        let mean = self.limits.mean_estimate;

        let mut pools = HashMap::new();
        for (model_id, model) in &self.limits.models {
            let mut slots: Option<u64> = None;
            let mut share = |limit: Option<u64>, dimension: Dimension, per_job: u64| {
                let limit = limit?;
                let window = now / window_ms(dimension);
                let used = store
                    .usage
                    .get(&(model_id.clone(), dimension, window))
                    .copied()
                    .unwrap_or(0);
                let fair = limit / live;
                let remaining = limit.saturating_sub(used) / live;
                let instance_share = fair.max(remaining);
                if per_job > 0 {
                    let fit = instance_share / per_job;
                    slots = Some(slots.map_or(fit, |s| s.min(fit)));
                }
                Some(instance_share)
            };

            let pool = PoolAllocation {
                total_slots: 0,
                tokens_per_minute: share(
                    model.tokens_per_minute,
                    Dimension::TokensMinute,
                    mean.tokens,
                ),
                requests_per_minute: share(
                    model.requests_per_minute,
                    Dimension::RequestsMinute,
                    mean.requests,
                ),
                tokens_per_day: share(model.tokens_per_day, Dimension::TokensDay, mean.tokens),
                requests_per_day: share(
                    model.requests_per_day,
                    Dimension::RequestsDay,
                    mean.requests,
                ),
            };
            pools.insert(
                model_id.clone(),
                PoolAllocation {
                    // A model with limited dimensions always grants at least
                    // one slot; the windows gate actual throughput.
                    total_slots: slots.map_or(0, |slots| slots.max(1)),
                    ..pool
                },
            );
        }

        AllocationInfo {
            pools,
            dynamic_limits: true,
        }
    }

    fn global_limit(&self, model_id: &str, dimension: Dimension) -> Option<u64> {
        let model = self.limits.models.get(model_id)?;
        match dimension {
            Dimension::TokensMinute => model.tokens_per_minute,
            Dimension::RequestsMinute => model.requests_per_minute,
            Dimension::TokensDay => model.tokens_per_day,
            Dimension::RequestsDay => model.requests_per_day,
        }
    }
}

fn window_ms(dimension: Dimension) -> u64 {
    match dimension {
        Dimension::TokensMinute | Dimension::RequestsMinute => MINUTE_MS,
        Dimension::TokensDay | Dimension::RequestsDay => DAY_MS,
    }
}

fn debit_plan(outline: &ReservationOutline) -> [(Dimension, u64, u64); 4] {
    [
        (
            Dimension::TokensMinute,
            outline.minute_window,
            outline.estimate.tokens,
        ),
        (
            Dimension::RequestsMinute,
            outline.minute_window,
            outline.estimate.requests,
        ),
        (
            Dimension::TokensDay,
            outline.day_window,
            outline.estimate.tokens,
        ),
        (
            Dimension::RequestsDay,
            outline.day_window,
            outline.estimate.requests,
        ),
    ]
}

#[async_trait]
impl DistributedBackend for InMemoryBackend {
    async fn register(&self, registration: &InstanceRegistration) -> Result<AllocationInfo> {
        let now = self.clock.now_ms();
        let (allocation, notify) = {
            let mut store = self.lock();
            store
                .instances
                .insert(registration.instance_id.clone(), registration.clone());
            let notify = self.sweep_and_recompute(&mut store, now);
            let allocation = store
                .allocations
                .get(&registration.instance_id)
                .cloned()
                .unwrap_or_default();
            (allocation, notify)
        };

        for (callback, allocation) in notify {
            callback(allocation);
        }
        Ok(allocation)
    }

    async fn unregister(&self, instance_id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let notify = {
            let mut store = self.lock();
            store.instances.remove(instance_id);
            store.allocations.remove(instance_id);
            self.sweep_and_recompute(&mut store, now)
        };
        for (callback, allocation) in notify {
            callback(allocation);
        }
        Ok(())
    }

    async fn acquire(&self, outline: &ReservationOutline) -> Result<bool> {
        let mut store = self.lock();

        // Admit only when every globally limited dimension has room, then
        // debit them all.
        for (dimension, window, amount) in debit_plan(outline) {
            if let Some(limit) = self.global_limit(&outline.model_id, dimension) {
                let used = store
                    .usage
                    .get(&(outline.model_id.clone(), dimension, window))
                    .copied()
                    .unwrap_or(0);
                if used + amount > limit {
                    return Ok(false);
                }
            }
        }
        for (dimension, window, amount) in debit_plan(outline) {
            if amount > 0 {
                *store
                    .usage
                    .entry((outline.model_id.clone(), dimension, window))
                    .or_insert(0) += amount;
            }
        }
        if let Some(record) = store.instances.get_mut(&outline.instance_id) {
            *record
                .in_flight_by_model
                .entry(outline.model_id.clone())
                .or_insert(0) += 1;
        }
        Ok(true)
    }

    async fn release(&self, delta: &UsageDelta) -> Result<()> {
        let mut store = self.lock();

        let adjustments = [
            (
                Dimension::TokensMinute,
                delta.minute_window,
                delta.estimate.tokens,
                delta.actual_tokens,
            ),
            (
                Dimension::RequestsMinute,
                delta.minute_window,
                delta.estimate.requests,
                delta.actual_requests,
            ),
            (
                Dimension::TokensDay,
                delta.day_window,
                delta.estimate.tokens,
                delta.actual_tokens,
            ),
            (
                Dimension::RequestsDay,
                delta.day_window,
                delta.estimate.requests,
                delta.actual_requests,
            ),
        ];
        for (dimension, window, estimated, actual) in adjustments {
            if estimated == actual {
                continue;
            }
            let entry = store
                .usage
                .entry((delta.model_id.clone(), dimension, window))
                .or_insert(0);
            if actual >= estimated {
                *entry += actual - estimated;
            } else {
                *entry = entry.saturating_sub(estimated - actual);
            }
        }
        if let Some(record) = store.instances.get_mut(&delta.instance_id) {
            if let Some(in_flight) = record.in_flight_by_model.get_mut(&delta.model_id) {
                *in_flight = in_flight.saturating_sub(1);
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        instance_id: &str,
        callback: AllocationCallback,
    ) -> Result<Subscription> {
        let id = {
            let mut store = self.lock();
            let id = store.next_subscriber;
            store.next_subscriber += 1;
            store
                .subscribers
                .insert(id, (instance_id.to_string(), Arc::new(callback)));
            id
        };

        let store = self.store.clone();
        Ok(Subscription::new(move || {
            if let Ok(mut store) = store.lock() {
                store.subscribers.remove(&id);
            }
        }))
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
