//! Weighted capacity shares per job type, with dynamic ratio adjustment.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use conv::ConvAsUtil;
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::{JobTypeConfig, RatioAdjustmentConfig, ResourceEstimate, RATIO_EPSILON};
use crate::error::{Error, Result};

/// One ratio moved by a dynamic adjustment cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioChange {
    /// The adjusted job type.
    pub job_type: String,
    /// Ratio before the cycle.
    pub from: f64,
    /// Ratio after the cycle.
    pub to: f64,
}

/// The outcome of one dynamic adjustment cycle.
///
/// Passed through verbatim to the availability callback.
#[derive(Debug, Clone, PartialEq)]
pub struct RatioAdjustment {
    /// Every ratio the cycle moved, donors and receivers alike.
    pub changes: Vec<RatioChange>,
}

/// A job type's current share and load.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobTypeStats {
    /// Jobs currently holding a slot.
    pub in_flight: u64,
    /// Slots allocated from the capacity pool.
    pub allocated_slots: u64,
    /// Current fraction of total capacity.
    pub current_ratio: f64,
    /// Whether dynamic adjustment may move this ratio.
    pub flexible: bool,
    /// Queued acquirers.
    pub waiting: usize,
    /// The per-job estimate jobs of this type reserve with.
    pub resources: ResourceEstimate,
}

/// A held job-type slot. Dropping it releases the slot.
#[derive(Debug)]
pub(crate) struct JobSlot {
    manager: Option<Arc<JobTypeManager>>,
    job_type: String,
}

impl JobSlot {
    /// Return the slot, waking the next waiter of the same type.
    pub(crate) fn release(self) {
        drop(self);
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.release_slot(&self.job_type);
        }
    }
}

struct TypeState {
    in_flight: u64,
    allocated_slots: u64,
    current_ratio: f64,
    flexible: bool,
    estimate: ResourceEstimate,
    waiters: VecDeque<oneshot::Sender<JobSlot>>,
}

struct Inner {
    total_capacity: u64,
    closed: bool,
    releases_since_adjustment: u64,
    types: BTreeMap<String, TypeState>,
}

type AdjustmentNotifier = Box<dyn Fn(&RatioAdjustment) + Send + Sync>;

/// Splits a capacity pool across job types according to their ratios.
///
/// Each type owns a FIFO queue of waiting acquirers. A released slot is
/// handed straight to the next waiter of the same type without the in-flight
/// count ever dipping, so other callers never observe a transient free slot.
pub(crate) struct JobTypeManager {
    weak: Weak<JobTypeManager>,
    config: RatioAdjustmentConfig,
    state: Mutex<Inner>,
    notifier: Mutex<Option<AdjustmentNotifier>>,
}

impl std::fmt::Debug for JobTypeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTypeManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobTypeManager {
    /// Build the manager from per-type configuration.
    ///
    /// Types with an explicit ratio take it; the rest share the remainder
    /// evenly. When every type is explicit and the sum falls short of 1, the
    /// ratios are scaled up to sum to 1.
    pub(crate) fn new(
        estimations: &HashMap<String, JobTypeConfig>,
        config: RatioAdjustmentConfig,
        total_capacity: u64,
    ) -> Arc<Self> {
        let explicit_sum: f64 = estimations
            .values()
            .filter_map(|jt| jt.ratio.as_ref())
            .map(|ratio| ratio.initial_value)
            .sum();
        let implicit = estimations
            .values()
            .filter(|jt| jt.ratio.is_none())
            .count();

        let mut types = BTreeMap::new();
        for (name, job_type) in estimations {
            let (ratio, flexible) = match &job_type.ratio {
                Some(ratio) => {
                    let value = if implicit == 0 && explicit_sum < 1.0 - RATIO_EPSILON {
                        ratio.initial_value / explicit_sum
                    } else {
                        ratio.initial_value
                    };
                    (value, ratio.flexible)
                }
                // Implicit types share what the explicit ones left over, and
                // participate in dynamic adjustment.
                None => ((1.0 - explicit_sum).max(0.0) / implicit as f64, true),
            };

            types.insert(
                name.clone(),
                TypeState {
                    in_flight: 0,
                    allocated_slots: allocated(ratio, total_capacity),
                    current_ratio: ratio,
                    flexible,
                    estimate: job_type.estimate(),
                    waiters: VecDeque::new(),
                },
            );
        }

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            config,
            state: Mutex::new(Inner {
                total_capacity,
                closed: false,
                releases_since_adjustment: 0,
                types,
            }),
            notifier: Mutex::new(None),
        })
    }

    /// Observe adjustment cycles, called outside the manager's lock.
    pub(crate) fn set_adjustment_notifier(&self, notifier: AdjustmentNotifier) {
        *self.notifier.lock().expect("notifier mutex poisoned") = Some(notifier);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.state.lock().expect("job type mutex poisoned")
    }

    fn new_slot(&self, job_type: &str) -> JobSlot {
        JobSlot {
            manager: Some(self.weak.upgrade().expect("manager is alive while in use")),
            job_type: job_type.to_string(),
        }
    }

    /// Acquire a slot, suspending until one is allocated to this type.
    ///
    /// A caller arriving while others are queued joins the back of the queue
    /// even when a slot is free.
    pub(crate) async fn acquire(&self, job_type: &str) -> Result<JobSlot> {
        let rx = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(Error::Shutdown);
            }
            let state = known_type(&mut inner, job_type)?;
            if state.waiters.is_empty() && state.in_flight < state.allocated_slots {
                state.in_flight += 1;
                return Ok(self.new_slot(job_type));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Acquire a slot without waiting.
    pub(crate) fn try_acquire(&self, job_type: &str) -> Option<JobSlot> {
        let mut inner = self.lock();
        if inner.closed {
            return None;
        }
        let state = inner.types.get_mut(job_type)?;
        if state.waiters.is_empty() && state.in_flight < state.allocated_slots {
            state.in_flight += 1;
            Some(self.new_slot(job_type))
        } else {
            None
        }
    }

    /// Whether an acquire would succeed right now.
    pub(crate) fn has_capacity(&self, job_type: &str) -> bool {
        let inner = self.lock();
        !inner.closed
            && inner.types.get(job_type).is_some_and(|state| {
                state.waiters.is_empty() && state.in_flight < state.allocated_slots
            })
    }

    fn release_slot(&self, job_type: &str) {
        let adjustment = {
            let mut inner = self.lock();
            let closed = inner.closed;
            let Some(state) = inner.types.get_mut(job_type) else {
                return;
            };

            // Hand the slot to the next waiter of this type rather than
            // decrementing; in-flight never dips below what is running.
            let mut handed_off = false;
            if !closed && state.in_flight <= state.allocated_slots {
                while let Some(head) = state.waiters.front() {
                    if head.is_closed() {
                        state.waiters.pop_front();
                        continue;
                    }
                    let tx = state.waiters.pop_front().expect("head checked above");
                    match tx.send(self.new_slot(job_type)) {
                        Ok(()) => {
                            handed_off = true;
                            break;
                        }
                        Err(mut slot) => {
                            // Receiver left between the check and the send;
                            // keep the slot and try the next waiter.
                            slot.manager = None;
                        }
                    }
                }
            }
            if !handed_off {
                state.in_flight = state.in_flight.saturating_sub(1);
            }

            inner.releases_since_adjustment += 1;
            if self.config.releases_per_adjustment > 0
                && inner.releases_since_adjustment >= self.config.releases_per_adjustment
            {
                inner.releases_since_adjustment = 0;
                self.adjust_locked(&mut inner)
            } else {
                None
            }
        };

        self.notify(adjustment);
    }

    /// Resize the capacity pool and recompute every allocation.
    pub(crate) fn set_total_capacity(&self, total: u64) {
        let mut inner = self.lock();
        if inner.total_capacity == total {
            return;
        }
        inner.total_capacity = total;
        let names: Vec<String> = inner.types.keys().cloned().collect();
        for name in names {
            let state = inner.types.get_mut(&name).expect("known name");
            state.allocated_slots = allocated(state.current_ratio, total);
            self.pump_type(state, &name);
        }
    }

    /// Run one adjustment cycle immediately.
    pub(crate) fn adjust_ratios(&self) -> Option<RatioAdjustment> {
        let adjustment = {
            let mut inner = self.lock();
            if inner.closed {
                return None;
            }
            self.adjust_locked(&mut inner)
        };
        self.notify(adjustment.clone());
        adjustment
    }

    /// Move ratio from idle flexible types to overloaded flexible ones.
    fn adjust_locked(&self, inner: &mut Inner) -> Option<RatioAdjustment> {
        let total = inner.total_capacity;

        let mut donors: Vec<(String, f64)> = Vec::new();
        let mut receivers: Vec<(String, f64)> = Vec::new();
        for (name, state) in &inner.types {
            if !state.flexible {
                continue;
            }
            let load = state.in_flight as f64 / state.allocated_slots.max(1) as f64;
            if load <= self.config.low_load_threshold
                && state.current_ratio > self.config.min_ratio
            {
                // A donor may not give away what its own in-flight work
                // still occupies.
                let occupied = if total == 0 {
                    0.0
                } else {
                    state.in_flight as f64 / total as f64
                };
                let give = self
                    .config
                    .max_adjustment
                    .min(state.current_ratio - self.config.min_ratio)
                    .min(state.current_ratio - occupied);
                if give > 0.0 {
                    donors.push((name.clone(), give));
                }
            } else if load >= self.config.high_load_threshold {
                let queued = state.waiters.len() as u64;
                let unmet = (state.in_flight + queued).saturating_sub(state.allocated_slots) + 1;
                receivers.push((name.clone(), unmet as f64));
            }
        }

        if donors.is_empty() || receivers.is_empty() {
            return None;
        }

        let pool: f64 = donors.iter().map(|(_, give)| give).sum();
        let total_demand: f64 = receivers.iter().map(|(_, demand)| demand).sum();

        let mut changes = Vec::with_capacity(donors.len() + receivers.len());
        for (name, give) in &donors {
            let state = inner.types.get_mut(name).expect("donor exists");
            let from = state.current_ratio;
            state.current_ratio -= give;
            changes.push(RatioChange {
                job_type: name.clone(),
                from,
                to: state.current_ratio,
            });
        }
        for (name, demand) in &receivers {
            let state = inner.types.get_mut(name).expect("receiver exists");
            let from = state.current_ratio;
            state.current_ratio += pool * demand / total_demand;
            changes.push(RatioChange {
                job_type: name.clone(),
                from,
                to: state.current_ratio,
            });
        }

        // Fold the floating-point residual into the largest receiver so the
        // ratios sum to exactly 1.
        let sum: f64 = inner.types.values().map(|state| state.current_ratio).sum();
        let residual = 1.0 - sum;
        if residual != 0.0 {
            let largest = receivers
                .iter()
                .map(|(name, _)| name.clone())
                .max_by(|a, b| {
                    let ra = inner.types[a].current_ratio;
                    let rb = inner.types[b].current_ratio;
                    ra.partial_cmp(&rb).expect("ratios are finite")
                })
                .expect("receivers is non-empty");
            let state = inner.types.get_mut(&largest).expect("receiver exists");
            state.current_ratio += residual;
            for change in &mut changes {
                if change.job_type == largest {
                    change.to = state.current_ratio;
                }
            }
        }

        let names: Vec<String> = inner.types.keys().cloned().collect();
        for name in names {
            let state = inner.types.get_mut(&name).expect("known name");
            state.allocated_slots = allocated(state.current_ratio, total);
            self.pump_type(state, &name);
        }

        debug!(?changes, "job type ratios adjusted");
        Some(RatioAdjustment { changes })
    }

    /// Admit waiters into newly available allocation.
    fn pump_type(&self, state: &mut TypeState, job_type: &str) {
        while state.in_flight < state.allocated_slots {
            let Some(head) = state.waiters.front() else {
                break;
            };
            if head.is_closed() {
                state.waiters.pop_front();
                continue;
            }
            let tx = state.waiters.pop_front().expect("head checked above");
            state.in_flight += 1;
            if let Err(mut slot) = tx.send(self.new_slot(job_type)) {
                slot.manager = None;
                state.in_flight -= 1;
            }
        }
    }

    fn notify(&self, adjustment: Option<RatioAdjustment>) {
        let Some(adjustment) = adjustment else { return };
        let notifier = self.notifier.lock().expect("notifier mutex poisoned");
        if let Some(notifier) = notifier.as_ref() {
            notifier(&adjustment);
        }
    }

    /// Fail all queued acquirers and reject everything from now on.
    pub(crate) fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        for state in inner.types.values_mut() {
            state.waiters.clear();
        }
    }

    /// Per-type shares and load.
    pub(crate) fn stats(&self) -> BTreeMap<String, JobTypeStats> {
        let inner = self.lock();
        inner
            .types
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    JobTypeStats {
                        in_flight: state.in_flight,
                        allocated_slots: state.allocated_slots,
                        current_ratio: state.current_ratio,
                        flexible: state.flexible,
                        waiting: state.waiters.len(),
                        resources: state.estimate,
                    },
                )
            })
            .collect()
    }
}

fn known_type<'i>(inner: &'i mut Inner, job_type: &str) -> Result<&'i mut TypeState> {
    inner
        .types
        .get_mut(job_type)
        .ok_or_else(|| Error::Config(format!("unknown job type '{job_type}'")))
}

fn allocated(ratio: f64, total_capacity: u64) -> u64 {
    (ratio * total_capacity as f64)
        .floor()
        .approx()
        .expect("slot allocation fits in u64")
}

#[cfg(test)]
mod tests {
    use crate::config::RatioConfig;

    use super::*;

    fn job_type(ratio: Option<RatioConfig>) -> JobTypeConfig {
        JobTypeConfig {
            estimated_used_tokens: 100,
            estimated_number_of_requests: 1,
            ratio,
            ..JobTypeConfig::default()
        }
    }

    fn flexible(value: f64) -> Option<RatioConfig> {
        Some(RatioConfig {
            initial_value: value,
            flexible: true,
        })
    }

    fn fixed(value: f64) -> Option<RatioConfig> {
        Some(RatioConfig {
            initial_value: value,
            flexible: false,
        })
    }

    fn manager(
        types: Vec<(&str, Option<RatioConfig>)>,
        config: RatioAdjustmentConfig,
        capacity: u64,
    ) -> Arc<JobTypeManager> {
        let estimations = types
            .into_iter()
            .map(|(name, ratio)| (name.to_string(), job_type(ratio)))
            .collect();
        JobTypeManager::new(&estimations, config, capacity)
    }

    fn ratio_sum(manager: &JobTypeManager) -> f64 {
        manager.stats().values().map(|s| s.current_ratio).sum()
    }

    #[tokio::test]
    async fn implicit_types_share_the_remainder() {
        let manager = manager(
            vec![("a", flexible(0.5)), ("b", None), ("c", None)],
            RatioAdjustmentConfig::default(),
            100,
        );

        let stats = manager.stats();
        assert_eq!(stats["a"].current_ratio, 0.5);
        assert_eq!(stats["b"].current_ratio, 0.25);
        assert_eq!(stats["c"].current_ratio, 0.25);
        assert_eq!(stats["a"].allocated_slots, 50);
        assert_eq!(stats["b"].allocated_slots, 25);
    }

    #[tokio::test]
    async fn all_explicit_below_one_is_normalized() {
        let manager = manager(
            vec![("a", flexible(0.2)), ("b", flexible(0.2))],
            RatioAdjustmentConfig::default(),
            10,
        );

        let stats = manager.stats();
        assert!((stats["a"].current_ratio - 0.5).abs() < 1e-9);
        assert!((stats["b"].current_ratio - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rounding_slack_stays_unallocated() {
        let manager = manager(
            vec![("a", None), ("b", None), ("c", None)],
            RatioAdjustmentConfig::default(),
            10,
        );

        let total: u64 = manager.stats().values().map(|s| s.allocated_slots).sum();
        assert_eq!(total, 9, "floor(10/3) per type");
    }

    #[tokio::test]
    async fn acquire_respects_allocation() {
        let manager = manager(
            vec![("a", flexible(0.5)), ("b", flexible(0.5))],
            RatioAdjustmentConfig::default(),
            4,
        );

        let _one = manager.acquire("a").await.unwrap();
        let _two = manager.acquire("a").await.unwrap();
        assert!(manager.try_acquire("a").is_none(), "allocation exhausted");
        assert!(manager.has_capacity("b"), "other type unaffected");
    }

    #[tokio::test]
    async fn unknown_type_is_a_config_error() {
        let manager = manager(
            vec![("a", None)],
            RatioAdjustmentConfig::default(),
            4,
        );
        assert!(matches!(
            manager.acquire("nope").await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn release_hands_the_slot_to_the_next_waiter() {
        let manager = manager(
            vec![("a", None)],
            RatioAdjustmentConfig::default(),
            1,
        );

        let held = manager.acquire("a").await.unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("a").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(manager.stats()["a"].waiting, 1);

        held.release();
        let slot = waiter.await.unwrap().unwrap();

        // The slot moved from one holder to the next without ever dipping.
        assert_eq!(manager.stats()["a"].in_flight, 1);
        slot.release();
        assert_eq!(manager.stats()["a"].in_flight, 0);
    }

    #[tokio::test]
    async fn overloaded_type_receives_ratio_from_an_idle_one() {
        let config = RatioAdjustmentConfig {
            adjustment_interval_ms: 0,
            releases_per_adjustment: 5,
            min_ratio: 0.1,
            ..RatioAdjustmentConfig::default()
        };
        let manager = manager(
            vec![("busy", flexible(0.5)), ("idle", flexible(0.5))],
            config,
            10,
        );

        // Load "busy" to 100% with more work queued behind it.
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(manager.acquire("busy").await.unwrap());
        }
        let mut queued = Vec::new();
        for _ in 0..5 {
            let manager = manager.clone();
            queued.push(tokio::spawn(
                async move { manager.acquire("busy").await },
            ));
            tokio::task::yield_now().await;
        }

        // Five releases with five more acquirers queued trigger one cycle.
        for slot in held.drain(..) {
            slot.release();
        }

        let stats = manager.stats();
        assert!(stats["busy"].current_ratio > 0.5, "receiver grew");
        assert!(stats["idle"].current_ratio < 0.5, "donor shrank");
        assert!(stats["idle"].current_ratio >= 0.1, "donor stays above floor");
        assert!((ratio_sum(&manager) - 1.0).abs() < 1e-4);

        for waiter in queued {
            waiter.await.unwrap().unwrap().release();
        }
    }

    #[tokio::test]
    async fn no_adjustment_without_donors_or_receivers() {
        let config = RatioAdjustmentConfig {
            releases_per_adjustment: 1,
            ..RatioAdjustmentConfig::default()
        };
        let manager = manager(
            vec![("a", flexible(0.5)), ("b", flexible(0.5))],
            config,
            10,
        );

        // Both idle: donors but no receivers.
        assert!(manager.adjust_ratios().is_none());
        let stats = manager.stats();
        assert_eq!(stats["a"].current_ratio, 0.5);
        assert_eq!(stats["b"].current_ratio, 0.5);
    }

    #[tokio::test]
    async fn non_flexible_ratios_are_preserved_exactly() {
        let config = RatioAdjustmentConfig {
            releases_per_adjustment: 1,
            min_ratio: 0.05,
            ..RatioAdjustmentConfig::default()
        };
        let manager = manager(
            vec![
                ("pinned", fixed(0.3)),
                ("busy", flexible(0.4)),
                ("idle", flexible(0.3)),
            ],
            config,
            10,
        );

        let pinned_before = manager.stats()["pinned"].current_ratio;

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(manager.acquire("busy").await.unwrap());
        }
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("busy").await })
        };
        tokio::task::yield_now().await;

        for _ in 0..3 {
            manager.adjust_ratios();
        }

        let stats = manager.stats();
        assert_eq!(
            stats["pinned"].current_ratio.to_bits(),
            pinned_before.to_bits(),
            "non-flexible ratio must not move at all"
        );
        assert!(stats["busy"].current_ratio > 0.4);
        assert!((ratio_sum(&manager) - 1.0).abs() < 1e-4);

        drop(held);
        drop(waiter);
    }

    #[tokio::test]
    async fn grown_allocation_admits_queued_waiters() {
        let manager = manager(
            vec![("a", None)],
            RatioAdjustmentConfig::default(),
            1,
        );

        let _held = manager.acquire("a").await.unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("a").await })
        };
        tokio::task::yield_now().await;

        manager.set_total_capacity(2);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(manager.stats()["a"].in_flight, 2);
    }

    #[tokio::test]
    async fn close_fails_queued_acquirers() {
        let manager = manager(
            vec![("a", None)],
            RatioAdjustmentConfig::default(),
            1,
        );

        let _held = manager.acquire("a").await.unwrap();
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire("a").await })
        };
        tokio::task::yield_now().await;

        manager.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Shutdown)));
        assert!(matches!(
            manager.acquire("a").await,
            Err(Error::Shutdown)
        ));
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_allocation() {
        let manager = manager(
            vec![("a", flexible(0.5)), ("b", flexible(0.5))],
            RatioAdjustmentConfig {
                releases_per_adjustment: 1,
                ..RatioAdjustmentConfig::default()
            },
            10,
        );

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(manager.acquire("a").await.unwrap());
        }
        for slot in held.drain(..) {
            slot.release();
            for stats in manager.stats().values() {
                assert!(stats.in_flight <= stats.allocated_slots);
            }
        }
    }
}
