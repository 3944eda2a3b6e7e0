//! The multi-model orchestrator: escalation, delegation and reconciliation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conv::ConvAsUtil;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::availability::{
    AvailabilityInputs, AvailabilitySnapshot, AvailabilityTracker, ChangeReason,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{JobTypeConfig, LimiterOptions, OverageCallback, ResourceEstimate};
use crate::distributed::{
    mean_estimate, AllocationInfo, DistributedBackend, InstanceRegistration, ReservationOutline,
    Subscription, UsageDelta,
};
use crate::error::{Error, Result};
use crate::job::{JobContext, JobRequest, JobResult, JobVerdict, Outcome};
use crate::job_types::{JobTypeManager, JobTypeStats};
use crate::model::{ModelLimiter, ModelStats, Reservation};
use crate::usage::{Pricing, UsageEntry};
use crate::window::MINUTE_MS;

/// Capacity used for the job-type pool when no configured dimension bounds
/// admission.
const UNBOUNDED_CAPACITY: u64 = 1_000_000;

/// Every counter the limiter maintains, in one snapshot.
#[derive(Debug, Clone)]
pub struct LimiterStats {
    /// The derived availability snapshot.
    pub availability: AvailabilitySnapshot,
    /// Per-model counters.
    pub models: HashMap<String, ModelStats>,
    /// Per-job-type shares and load.
    pub job_types: BTreeMap<String, JobTypeStats>,
}

/// A multi-model rate limiter and admission controller.
///
/// Jobs are tagged with a job type and dispatched to the first model in the
/// escalation order with capacity, after reserving tokens, requests,
/// concurrency and memory from their estimates. When the body reports what
/// it actually consumed, the counters are reconciled to the real numbers.
///
/// ```no_run
/// use admission_limiter::{
///     JobRequest, JobTypeConfig, JobVerdict, LimiterOptions, ModelConfig, RateLimiter,
///     UsageReport,
/// };
///
/// # async fn example() -> Result<(), admission_limiter::Error> {
/// let limiter = RateLimiter::new(
///     LimiterOptions::new()
///         .model(
///             "small",
///             ModelConfig {
///                 requests_per_minute: Some(60),
///                 ..ModelConfig::default()
///             },
///         )
///         .job_type(
///             "chat",
///             JobTypeConfig {
///                 estimated_used_tokens: 1_000,
///                 estimated_number_of_requests: 1,
///                 ..JobTypeConfig::default()
///             },
///         ),
/// )?;
///
/// let result = limiter
///     .queue_job(JobRequest::new("job-1", "chat"), |ctx| async move {
///         // Call the model here.
///         JobVerdict::complete("done", UsageReport::new(&ctx.model_id, 800, 0, 120))
///     })
///     .await?;
/// assert_eq!(result.model_used, "small");
/// # Ok(())
/// # }
/// ```
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("label", &self.inner.label)
            .field("instance_id", &self.inner.instance_id)
            .finish_non_exhaustive()
    }
}

struct Inner {
    label: String,
    instance_id: String,
    clock: Arc<dyn Clock>,
    models: HashMap<String, Arc<ModelLimiter>>,
    pricing: HashMap<String, Pricing>,
    escalation_order: Vec<String>,
    estimations: HashMap<String, JobTypeConfig>,
    mean_estimate: ResourceEstimate,
    job_types: Arc<JobTypeManager>,
    tracker: AvailabilityTracker,
    backend: Option<Arc<dyn DistributedBackend>>,
    on_overage: Option<OverageCallback>,
    last_allocation: Mutex<Option<AllocationInfo>>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<Subscription>>,
    has_memory_limits: bool,
    memory_ratio: f64,
    memory_interval_ms: u64,
    adjustment_interval_ms: u64,
}

impl RateLimiter {
    /// Validate the options and build the limiter.
    pub fn new(options: LimiterOptions) -> Result<Self> {
        options.validate()?;

        let clock = options
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let distributed = options.backend.is_some();

        let models: HashMap<String, Arc<ModelLimiter>> = options
            .models
            .iter()
            .map(|(id, config)| {
                let limiter = ModelLimiter::new(id.clone(), config, distributed, clock.clone());
                (id.clone(), limiter)
            })
            .collect();
        let pricing = options
            .models
            .iter()
            .map(|(id, config)| (id.clone(), config.pricing))
            .collect();

        let escalation_order = if options.escalation_order.is_empty() {
            options.models.keys().cloned().collect()
        } else {
            options.escalation_order
        };

        let mean = mean_estimate(&options.resource_estimations);
        let capacity = capacity_from_limits(models.values(), mean);
        let job_types = JobTypeManager::new(
            &options.resource_estimations,
            options.ratio_adjustment,
            capacity,
        );

        let tracked: Vec<Arc<ModelLimiter>> = models.values().cloned().collect();
        let tracker = AvailabilityTracker::new(
            Box::new(move || AvailabilityInputs {
                models: tracked.iter().map(|model| model.stats()).collect(),
                mean_estimate: mean,
            }),
            options.on_available_slots_change,
        );

        let has_memory_limits = options.models.values().any(|m| m.max_capacity.is_some());
        let inner = Arc::new(Inner {
            label: options.label.unwrap_or_else(|| "admission-limiter".to_string()),
            instance_id: options
                .instance_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            clock,
            models,
            pricing,
            escalation_order,
            estimations: options.resource_estimations,
            mean_estimate: mean,
            job_types,
            tracker,
            backend: options.backend,
            on_overage: options.on_overage,
            last_allocation: Mutex::new(None),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            has_memory_limits,
            memory_ratio: options.memory.free_memory_ratio,
            memory_interval_ms: options.memory.recalculation_interval_ms,
            adjustment_interval_ms: options.ratio_adjustment.adjustment_interval_ms,
        });

        let weak = Arc::downgrade(&inner);
        inner
            .job_types
            .set_adjustment_notifier(Box::new(move |adjustment| {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .tracker
                        .notify(ChangeReason::Adjustment, None, Some(adjustment));
                }
            }));

        Ok(Self { inner })
    }

    /// Register with the backend and spawn the background timers.
    ///
    /// Safe to call without a backend; only the local timers start then.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        info!(label = %inner.label, instance = %inner.instance_id, "starting");

        if inner.adjustment_interval_ms > 0 {
            let weak = Arc::downgrade(inner);
            let period = Duration::from_millis(inner.adjustment_interval_ms);
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    let Some(inner) = weak.upgrade() else { break };
                    inner.job_types.adjust_ratios();
                }
            });
            inner.tasks.lock().expect("task list poisoned").push(handle);
        }

        if inner.has_memory_limits && inner.memory_interval_ms > 0 {
            let weak = Arc::downgrade(inner);
            let period = Duration::from_millis(inner.memory_interval_ms);
            let ratio = inner.memory_ratio;
            let handle = tokio::spawn(async move {
                let mut system = System::new();
                loop {
                    tokio::time::sleep(period).await;
                    let Some(inner) = weak.upgrade() else { break };
                    system.refresh_memory();
                    let free_kb = system.available_memory() / 1024;
                    let budget: u64 = (free_kb as f64 * ratio)
                        .floor()
                        .approx()
                        .unwrap_or(u64::MAX);
                    for model in inner.models.values() {
                        model.set_memory_budget(budget);
                    }
                    inner.tracker.notify(ChangeReason::Memory, None, None);
                }
            });
            inner.tasks.lock().expect("task list poisoned").push(handle);
        }

        if let Some(backend) = &inner.backend {
            let allocation = backend.register(&inner.registration()).await?;
            inner.apply_allocation(allocation);

            let weak = Arc::downgrade(inner);
            let subscription = backend
                .subscribe(
                    &inner.instance_id,
                    Box::new(move |allocation| {
                        if let Some(inner) = weak.upgrade() {
                            inner.apply_allocation(allocation);
                        }
                    }),
                )
                .await?;
            *inner.subscription.lock().expect("subscription poisoned") = Some(subscription);

            let weak = Arc::downgrade(inner);
            let backend = backend.clone();
            let period = backend.heartbeat_interval();
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(period).await;
                    let Some(inner) = weak.upgrade() else { break };
                    if inner.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    match backend.register(&inner.registration()).await {
                        Ok(allocation) => inner.apply_allocation(allocation),
                        // Keep the previous allocation; a transient store
                        // outage must not flap the pools.
                        Err(error) => {
                            warn!(%error, "heartbeat failed, keeping previous allocation");
                        }
                    }
                }
            });
            inner.tasks.lock().expect("task list poisoned").push(handle);
        }

        Ok(())
    }

    /// Drain every queue with a terminal miss and deregister.
    ///
    /// Jobs already executing finish and reconcile normally; new submissions
    /// fail with [`Error::Shutdown`].
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(label = %inner.label, "stopping");

        for model in inner.models.values() {
            model.close();
        }
        inner.job_types.close();

        for handle in inner.tasks.lock().expect("task list poisoned").drain(..) {
            handle.abort();
        }
        if let Some(subscription) = inner
            .subscription
            .lock()
            .expect("subscription poisoned")
            .take()
        {
            subscription.unsubscribe();
        }
        if let Some(backend) = &inner.backend {
            if let Err(error) = backend.unregister(&inner.instance_id).await {
                warn!(%error, "deregistration failed");
            }
        }
    }

    /// Run a job under the limiter.
    ///
    /// Blocks for a job-type slot, reserves capacity on the first available
    /// model in the escalation order, runs the body and reconciles whatever
    /// it reports. A body that delegates is re-invoked under the next model,
    /// with its partial usage kept and billed.
    pub async fn queue_job<F, Fut, T>(&self, request: JobRequest, job: F) -> Result<JobResult<T>>
    where
        F: Fn(JobContext) -> Fut,
        Fut: Future<Output = JobVerdict<T>>,
    {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        let estimate = inner
            .estimations
            .get(&request.job_type)
            .ok_or_else(|| Error::Config(format!("unknown job type '{}'", request.job_type)))?
            .estimate();

        let slot = inner.job_types.acquire(&request.job_type).await?;
        debug!(
            label = %inner.label,
            job = %request.job_id,
            job_type = %request.job_type,
            "job admitted"
        );

        let mut tried = HashSet::new();
        let mut entries: Vec<UsageEntry> = Vec::new();

        let outcome = loop {
            let Some((model_id, mut reservation)) = inner
                .reserve_next(&request.job_type, estimate, &mut tried)
                .await
            else {
                break if inner.stopped.load(Ordering::SeqCst) {
                    Err(Error::Shutdown)
                } else {
                    Err(Error::ModelsExhausted)
                };
            };
            inner.notify_model(&model_id);

            let context = JobContext {
                job_id: request.job_id.clone(),
                model_id: model_id.clone(),
                args: request.args.clone(),
            };
            let verdict = job(context).await;
            let actual = verdict.usage;
            if !actual.model_id.is_empty() && actual.model_id != model_id {
                warn!(
                    job = %request.job_id,
                    reported = %actual.model_id,
                    reserved = %model_id,
                    "usage reported against a different model"
                );
            }

            // Reconcile first; nothing is released until the counters hold
            // the real usage.
            let model = inner.models.get(&model_id).expect("model ids are validated");
            let overages = model.commit(&actual, &mut reservation);
            for (dimension, overshoot) in overages {
                warn!(
                    label = %inner.label,
                    model = %model_id,
                    ?dimension,
                    overshoot,
                    "limit exceeded after reconciliation"
                );
                if let Some(on_overage) = &inner.on_overage {
                    on_overage(&model_id, dimension, overshoot);
                }
            }
            if let Some(backend) = &inner.backend {
                let delta = inner.usage_delta(&model_id, &reservation, &actual);
                if let Err(error) = backend.release(&delta).await {
                    warn!(%error, "failed to report usage to the backend");
                }
            }
            reservation.release();
            inner.notify_model(&model_id);

            let cost = inner
                .pricing
                .get(&model_id)
                .map_or(0.0, |pricing| pricing.cost_of(&actual));
            entries.push(UsageEntry {
                model_id: model_id.clone(),
                usage: actual,
                cost,
            });

            match verdict.outcome {
                Outcome::Complete(value) => break Ok((value, model_id)),
                Outcome::Delegate => {
                    debug!(job = %request.job_id, model = %model_id, "delegating");
                    tried.insert(model_id);
                }
                Outcome::Fail(error) => break Err(Error::JobRejected(error)),
            }
        };

        slot.release();

        let (value, model_used) = outcome?;
        let total_cost = entries.iter().map(|entry| entry.cost).sum();
        Ok(JobResult {
            value,
            job_id: request.job_id,
            model_used,
            usage: entries,
            total_cost,
        })
    }

    /// Whether any job type could be admitted on any model right now.
    pub fn has_capacity(&self) -> bool {
        let inner = &self.inner;
        inner.estimations.iter().any(|(job_type, config)| {
            inner.job_types.has_capacity(job_type)
                && inner.escalation_order.iter().any(|model_id| {
                    inner
                        .models
                        .get(model_id)
                        .is_some_and(|model| model.has_capacity_for(config.estimate()))
                })
        })
    }

    /// Whether one model could take a mean-sized job right now.
    pub fn has_capacity_for_model(&self, model_id: &str) -> bool {
        self.inner
            .models
            .get(model_id)
            .is_some_and(|model| model.has_capacity_for(self.inner.mean_estimate))
    }

    /// The first model in the escalation order, minus `excluded`, with
    /// capacity for a mean-sized job.
    pub fn available_model(&self, excluded: &HashSet<String>) -> Option<String> {
        self.inner
            .escalation_order
            .iter()
            .find(|model_id| !excluded.contains(*model_id) && self.has_capacity_for_model(model_id))
            .cloned()
    }

    /// Apply a pool allocation pushed by the distributed layer.
    ///
    /// Duplicate deliveries are detected against the previous allocation and
    /// ignored.
    pub fn set_distributed_availability(&self, allocation: AllocationInfo) {
        self.inner.apply_allocation(allocation);
    }

    /// The current derived availability.
    pub fn availability(&self) -> AvailabilitySnapshot {
        self.inner.tracker.snapshot()
    }

    /// Counters across models, job types and the derived availability.
    pub fn stats(&self) -> LimiterStats {
        let inner = &self.inner;
        LimiterStats {
            availability: inner.tracker.snapshot(),
            models: inner
                .models
                .iter()
                .map(|(id, model)| (id.clone(), model.stats()))
                .collect(),
            job_types: inner.job_types.stats(),
        }
    }

    /// This instance's identity in the distributed registry.
    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }
}

impl Inner {
    /// Walk the escalation order, waiting up to each candidate's bound.
    ///
    /// Models that time out or are refused by the backend land in `tried`
    /// and are not offered again to this job.
    async fn reserve_next(
        &self,
        job_type: &str,
        estimate: ResourceEstimate,
        tried: &mut HashSet<String>,
    ) -> Option<(String, Reservation)> {
        let order: Vec<String> = self
            .escalation_order
            .iter()
            .filter(|id| !tried.contains(*id))
            .cloned()
            .collect();

        for model_id in order {
            if self.stopped.load(Ordering::SeqCst) {
                return None;
            }
            let model = self.models.get(&model_id).expect("model ids are validated");
            let max_wait = self
                .estimations
                .get(job_type)
                .and_then(|config| config.max_wait_ms.get(&model_id))
                .map(|ms| Duration::from_millis(*ms))
                .unwrap_or_else(|| self.default_wait());

            let Some(reservation) = model.reserve_timeout(estimate, max_wait).await else {
                debug!(model = %model_id, "no capacity within the wait bound");
                tried.insert(model_id);
                continue;
            };

            if let Some(backend) = &self.backend {
                let outline = ReservationOutline {
                    instance_id: self.instance_id.clone(),
                    model_id: model_id.clone(),
                    estimate,
                    minute_window: reservation
                        .minute_window()
                        .unwrap_or_else(|| self.clock.now_ms() / MINUTE_MS),
                    day_window: reservation
                        .day_window()
                        .unwrap_or_else(|| self.clock.now_ms() / crate::window::DAY_MS),
                };
                match backend.acquire(&outline).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(model = %model_id, "backend refused admission");
                        reservation.release();
                        tried.insert(model_id);
                        continue;
                    }
                    // Admit on the local reservation alone; a store outage
                    // must not stall every job.
                    Err(error) => {
                        warn!(%error, model = %model_id, "backend admission check failed");
                    }
                }
            }

            return Some((model_id, reservation));
        }
        None
    }

    /// Until shortly after the next minute boundary, clamped to [5s, 65s].
    fn default_wait(&self) -> Duration {
        let to_boundary = MINUTE_MS - self.clock.now_ms() % MINUTE_MS;
        Duration::from_millis((to_boundary + 5_000).clamp(5_000, 65_000))
    }

    fn usage_delta(
        &self,
        model_id: &str,
        reservation: &Reservation,
        actual: &crate::usage::UsageReport,
    ) -> UsageDelta {
        UsageDelta {
            instance_id: self.instance_id.clone(),
            model_id: model_id.to_string(),
            estimate: reservation.estimate(),
            actual_tokens: actual.total_tokens(),
            actual_requests: actual.request_count,
            minute_window: reservation
                .minute_window()
                .unwrap_or_else(|| self.clock.now_ms() / MINUTE_MS),
            day_window: reservation
                .day_window()
                .unwrap_or_else(|| self.clock.now_ms() / crate::window::DAY_MS),
        }
    }

    fn registration(&self) -> InstanceRegistration {
        InstanceRegistration {
            instance_id: self.instance_id.clone(),
            last_heartbeat: self.clock.now_ms(),
            in_flight_by_model: self
                .models
                .iter()
                .map(|(id, model)| {
                    let in_flight = model
                        .stats()
                        .concurrency
                        .map_or(0, |semaphore| semaphore.in_use);
                    (id.clone(), in_flight)
                })
                .collect(),
        }
    }

    fn apply_allocation(&self, allocation: AllocationInfo) {
        {
            let mut last = self.last_allocation.lock().expect("allocation poisoned");
            if last.as_ref() == Some(&allocation) {
                debug!(label = %self.label, "ignoring duplicate allocation push");
                return;
            }
            *last = Some(allocation.clone());
        }

        for (model_id, pool) in &allocation.pools {
            if let Some(model) = self.models.get(model_id) {
                model.set_pool(pool);
            }
        }
        self.job_types
            .set_total_capacity(capacity_from_limits(self.models.values(), self.mean_estimate));
        self.tracker.notify(ChangeReason::Distributed, None, None);
    }

    /// Fire availability events for every dimension a model configures. The
    /// tracker diffs snapshots, so at most one reaches the observer.
    fn notify_model(&self, model_id: &str) {
        let Some(model) = self.models.get(model_id) else {
            return;
        };
        let stats = model.stats();
        let mut reasons = Vec::new();
        if stats.tokens_minute.is_some() {
            reasons.push(ChangeReason::TokensMinute);
        }
        if stats.requests_minute.is_some() {
            reasons.push(ChangeReason::RequestsMinute);
        }
        if stats.tokens_day.is_some() {
            reasons.push(ChangeReason::TokensDay);
        }
        if stats.requests_day.is_some() {
            reasons.push(ChangeReason::RequestsDay);
        }
        if stats.concurrency.is_some() {
            reasons.push(ChangeReason::ConcurrentRequests);
        }
        if stats.memory.is_some() {
            reasons.push(ChangeReason::Memory);
        }
        for reason in reasons {
            self.tracker.notify(reason, Some(model_id), None);
        }
    }
}

/// Total job slots the configured limits support: per model, the minimum
/// over configured dimensions of `limit / mean estimate`, summed. Models
/// with no configured dimension make the pool effectively unbounded.
fn capacity_from_limits<'m>(
    models: impl Iterator<Item = &'m Arc<ModelLimiter>>,
    mean: ResourceEstimate,
) -> u64 {
    let mut total: u64 = 0;
    let mut unbounded = false;

    for model in models {
        let stats = model.stats();
        let mut slots: Option<u64> = None;
        let mut bound = |budget: u64, per_job: u64| {
            if per_job == 0 {
                return;
            }
            let fit = budget / per_job;
            slots = Some(slots.map_or(fit, |s| s.min(fit)));
        };

        if let Some(window) = stats.tokens_minute {
            bound(window.limit.unwrap_or(u64::MAX), mean.tokens);
        }
        if let Some(window) = stats.tokens_day {
            bound(window.limit.unwrap_or(u64::MAX), mean.tokens);
        }
        if let Some(window) = stats.requests_minute {
            bound(window.limit.unwrap_or(u64::MAX), mean.requests);
        }
        if let Some(window) = stats.requests_day {
            bound(window.limit.unwrap_or(u64::MAX), mean.requests);
        }
        if let Some(semaphore) = stats.concurrency {
            bound(semaphore.max, 1);
        }
        if let Some(semaphore) = stats.memory {
            bound(semaphore.max, mean.memory_kb);
        }

        match slots {
            Some(slots) => total += slots,
            None => unbounded = true,
        }
    }

    if unbounded {
        total.max(UNBOUNDED_CAPACITY)
    } else {
        total
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ModelConfig;
    use crate::usage::UsageReport;

    use super::*;

    fn options(rpm: u64) -> LimiterOptions {
        LimiterOptions::new()
            .model(
                "small",
                ModelConfig {
                    requests_per_minute: Some(rpm),
                    ..ModelConfig::default()
                },
            )
            .job_type(
                "chat",
                JobTypeConfig {
                    estimated_used_tokens: 0,
                    estimated_number_of_requests: 1,
                    ..JobTypeConfig::default()
                },
            )
    }

    #[tokio::test]
    async fn completes_a_job_and_reports_the_model() {
        let limiter = RateLimiter::new(options(10)).unwrap();

        let result = limiter
            .queue_job(JobRequest::new("j1", "chat"), |ctx| async move {
                assert_eq!(ctx.model_id, "small");
                JobVerdict::complete(42, UsageReport::new(&ctx.model_id, 10, 0, 5))
            })
            .await
            .unwrap();

        assert_eq!(result.value, 42);
        assert_eq!(result.model_used, "small");
        assert_eq!(result.usage.len(), 1);
        assert_eq!(result.job_id, "j1");
    }

    #[tokio::test]
    async fn unknown_job_type_is_rejected_up_front() {
        let limiter = RateLimiter::new(options(10)).unwrap();
        let error = limiter
            .queue_job(JobRequest::new("j1", "nope"), |ctx| async move {
                JobVerdict::complete((), UsageReport::new(&ctx.model_id, 0, 0, 0))
            })
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Config(_)));
    }

    #[tokio::test]
    async fn failing_body_surfaces_its_error() {
        let limiter = RateLimiter::new(options(10)).unwrap();
        let error = limiter
            .queue_job(JobRequest::new("j1", "chat"), |ctx| async move {
                JobVerdict::<()>::fail("model refused", UsageReport::new(&ctx.model_id, 1, 0, 0))
            })
            .await
            .unwrap_err();
        assert!(matches!(error, Error::JobRejected(_)));

        // The failed attempt still freed its slot and permits.
        assert!(limiter.has_capacity());
    }

    #[tokio::test]
    async fn no_new_jobs_after_stop() {
        let limiter = RateLimiter::new(options(10)).unwrap();
        limiter.stop().await;

        let error = limiter
            .queue_job(JobRequest::new("j1", "chat"), |ctx| async move {
                JobVerdict::complete((), UsageReport::new(&ctx.model_id, 0, 0, 0))
            })
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Shutdown));
    }

    #[tokio::test]
    async fn duplicate_allocations_are_ignored() {
        use crate::distributed::PoolAllocation;

        let limiter = RateLimiter::new(options(10)).unwrap();

        let mut pools = HashMap::new();
        pools.insert(
            "small".to_string(),
            PoolAllocation {
                total_slots: 2,
                requests_per_minute: Some(5),
                ..PoolAllocation::default()
            },
        );
        let allocation = AllocationInfo {
            pools,
            dynamic_limits: true,
        };

        limiter.set_distributed_availability(allocation.clone());
        let after_first = limiter.stats();
        limiter.set_distributed_availability(allocation);
        let after_second = limiter.stats();

        assert_eq!(
            after_first.models["small"].requests_minute,
            after_second.models["small"].requests_minute,
        );
        assert_eq!(
            after_first.models["small"]
                .requests_minute
                .unwrap()
                .limit,
            Some(5)
        );
    }

    #[tokio::test]
    async fn capacity_derives_from_the_tightest_dimension() {
        let limiter = RateLimiter::new(
            LimiterOptions::new()
                .model(
                    "small",
                    ModelConfig {
                        requests_per_minute: Some(7),
                        tokens_per_minute: Some(10_000),
                        ..ModelConfig::default()
                    },
                )
                .job_type(
                    "chat",
                    JobTypeConfig {
                        estimated_used_tokens: 100,
                        estimated_number_of_requests: 1,
                        ..JobTypeConfig::default()
                    },
                ),
        )
        .unwrap();

        let stats = limiter.stats();
        assert_eq!(stats.job_types["chat"].allocated_slots, 7);
    }
}
