//! Per-model reservation of window quotas, concurrency and memory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::config::{ModelConfig, ResourceEstimate};
use crate::distributed::PoolAllocation;
use crate::semaphore::{FifoSemaphore, SemaphoreStats};
use crate::usage::UsageReport;
use crate::window::{Dimension, WindowCounter, WindowReservation, WindowStats, DAY_MS, MINUTE_MS};

/// All counters for one model in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStats {
    /// Tokens-per-minute window, when limited.
    pub tokens_minute: Option<WindowStats>,
    /// Requests-per-minute window, when limited.
    pub requests_minute: Option<WindowStats>,
    /// Tokens-per-day window, when limited.
    pub tokens_day: Option<WindowStats>,
    /// Requests-per-day window, when limited.
    pub requests_day: Option<WindowStats>,
    /// Concurrency semaphore, when limited.
    pub concurrency: Option<SemaphoreStats>,
    /// Memory semaphore, when limited.
    pub memory: Option<SemaphoreStats>,
}

/// Capacity reserved on one model for one job.
///
/// Window debits are snapshotted with the window they happened in, so a
/// release or reconciliation that crosses a rollover leaves the fresh window
/// untouched. Dropping an unreleased reservation returns everything it holds.
#[derive(Debug)]
pub(crate) struct Reservation {
    limiter: Option<Arc<ModelLimiter>>,
    estimate: ResourceEstimate,
    tokens_minute: Option<WindowReservation>,
    requests_minute: Option<WindowReservation>,
    tokens_day: Option<WindowReservation>,
    requests_day: Option<WindowReservation>,
    memory_held: bool,
    concurrency_held: bool,
    committed: bool,
}

impl Reservation {
    /// The model this reservation is held against.
    pub(crate) fn model_id(&self) -> &str {
        self.limiter
            .as_ref()
            .map(|limiter| limiter.id.as_str())
            .unwrap_or_default()
    }

    pub(crate) fn estimate(&self) -> ResourceEstimate {
        self.estimate
    }

    /// Minute window the reservation was debited in, for mirroring usage to
    /// a shared store.
    pub(crate) fn minute_window(&self) -> Option<u64> {
        self.tokens_minute
            .or(self.requests_minute)
            .map(|r| r.window_id())
    }

    /// Daily window the reservation was debited in.
    pub(crate) fn day_window(&self) -> Option<u64> {
        self.tokens_day.or(self.requests_day).map(|r| r.window_id())
    }

    /// Return held permits, and the window debits too unless they were
    /// reconciled by a commit.
    pub(crate) fn release(self) {
        drop(self);
    }

    /// Release without waking the model's queue. Used by the queue pump
    /// itself when a granted waiter turns out to have left.
    fn cancel_quiet(mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.undo(&mut self);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(limiter) = self.limiter.take() {
            limiter.undo(self);
            limiter.pump();
        }
    }
}

#[derive(Debug)]
struct Waiter {
    estimate: ResourceEstimate,
    tx: oneshot::Sender<Reservation>,
}

#[derive(Debug, Default)]
struct Queue {
    closed: bool,
    waiters: VecDeque<Waiter>,
}

/// Reservation engine for a single model.
///
/// Aggregates the four window counters with the concurrency and memory
/// semaphores, and owns the FIFO queue of jobs waiting for this model.
#[derive(Debug)]
pub(crate) struct ModelLimiter {
    weak: Weak<ModelLimiter>,
    id: String,
    min_capacity: u64,
    max_concurrent: Option<u64>,
    max_memory_kb: Option<u64>,
    tokens_minute: WindowCounter,
    requests_minute: WindowCounter,
    tokens_day: WindowCounter,
    requests_day: WindowCounter,
    concurrency: Option<FifoSemaphore>,
    memory: Option<FifoSemaphore>,
    queue: Mutex<Queue>,
    boundary_waker_armed: AtomicBool,
}

impl ModelLimiter {
    /// Build the limiter for one model.
    ///
    /// `distributed` creates a concurrency semaphore even without a local
    /// concurrency limit, so a pool allocation has something to retune.
    pub(crate) fn new(
        id: impl Into<String>,
        config: &ModelConfig,
        distributed: bool,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let concurrency = match (config.max_concurrent_requests, distributed) {
            (Some(max), _) => Some(FifoSemaphore::new(max)),
            (None, true) => Some(FifoSemaphore::new(u64::MAX)),
            (None, false) => None,
        };

        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            id: id.into(),
            min_capacity: config.min_capacity.unwrap_or(1),
            max_concurrent: config.max_concurrent_requests,
            max_memory_kb: config.max_capacity,
            tokens_minute: WindowCounter::new(config.tokens_per_minute, MINUTE_MS, clock.clone()),
            requests_minute: WindowCounter::new(
                config.requests_per_minute,
                MINUTE_MS,
                clock.clone(),
            ),
            tokens_day: WindowCounter::new(config.tokens_per_day, DAY_MS, clock.clone()),
            requests_day: WindowCounter::new(config.requests_per_day, DAY_MS, clock.clone()),
            concurrency,
            memory: config.max_capacity.map(FifoSemaphore::new),
            queue: Mutex::new(Queue::default()),
            boundary_waker_armed: AtomicBool::new(false),
        })
    }

    /// A strong handle to this limiter, for reservations and spawned wakes.
    fn handle(&self) -> Arc<ModelLimiter> {
        self.weak.upgrade().expect("limiter is alive while in use")
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().expect("model queue mutex poisoned")
    }

    fn counters(&self) -> [(&WindowCounter, Dimension); 4] {
        [
            (&self.tokens_minute, Dimension::TokensMinute),
            (&self.requests_minute, Dimension::RequestsMinute),
            (&self.tokens_day, Dimension::TokensDay),
            (&self.requests_day, Dimension::RequestsDay),
        ]
    }

    fn amount_for(dimension: Dimension, estimate: ResourceEstimate) -> u64 {
        match dimension {
            Dimension::TokensMinute | Dimension::TokensDay => estimate.tokens,
            Dimension::RequestsMinute | Dimension::RequestsDay => estimate.requests,
        }
    }

    /// Reserve every resource for one job, atomically.
    ///
    /// Counters are tried in a fixed order; the first miss rolls back
    /// everything already taken and returns `None`.
    pub(crate) fn try_reserve(&self, estimate: ResourceEstimate) -> Option<Reservation> {
        let mut reservation = Reservation {
            limiter: None,
            estimate,
            tokens_minute: None,
            requests_minute: None,
            tokens_day: None,
            requests_day: None,
            memory_held: false,
            concurrency_held: false,
            committed: false,
        };

        for (counter, dimension) in self.counters() {
            let amount = Self::amount_for(dimension, estimate);
            match counter.try_reserve(amount) {
                Some(window) => match dimension {
                    Dimension::TokensMinute => reservation.tokens_minute = Some(window),
                    Dimension::RequestsMinute => reservation.requests_minute = Some(window),
                    Dimension::TokensDay => reservation.tokens_day = Some(window),
                    Dimension::RequestsDay => reservation.requests_day = Some(window),
                },
                None => {
                    self.undo(&mut reservation);
                    return None;
                }
            }
        }

        if let Some(memory) = &self.memory {
            if memory.try_acquire(estimate.memory_kb) {
                reservation.memory_held = true;
            } else {
                self.undo(&mut reservation);
                return None;
            }
        }

        if let Some(concurrency) = &self.concurrency {
            if concurrency.try_acquire(1) {
                reservation.concurrency_held = true;
            } else {
                self.undo(&mut reservation);
                return None;
            }
        }

        reservation.limiter = Some(self.handle());
        Some(reservation)
    }

    /// Roll back whatever a reservation still holds. Window debits survive
    /// when the reservation was committed; they are real usage then.
    fn undo(&self, reservation: &mut Reservation) {
        if !reservation.committed {
            if let Some(window) = reservation.tokens_minute.take() {
                self.tokens_minute.release(window);
            }
            if let Some(window) = reservation.requests_minute.take() {
                self.requests_minute.release(window);
            }
            if let Some(window) = reservation.tokens_day.take() {
                self.tokens_day.release(window);
            }
            if let Some(window) = reservation.requests_day.take() {
                self.requests_day.release(window);
            }
        }
        if reservation.memory_held {
            reservation.memory_held = false;
            if let Some(memory) = &self.memory {
                memory.release(reservation.estimate.memory_kb);
            }
        }
        if reservation.concurrency_held {
            reservation.concurrency_held = false;
            if let Some(concurrency) = &self.concurrency {
                concurrency.release(1);
            }
        }
    }

    /// Wait up to `max_wait` for a full reservation.
    ///
    /// `max_wait` of zero is a single immediate attempt. Waiters are served
    /// strictly in arrival order; an expired waiter is skipped by the queue
    /// without any release, since it never acquired.
    pub(crate) async fn reserve_timeout(
        &self,
        estimate: ResourceEstimate,
        max_wait: Duration,
    ) -> Option<Reservation> {
        let rx = {
            let mut queue = self.lock_queue();
            if queue.closed {
                return None;
            }
            if queue.waiters.is_empty() {
                if let Some(reservation) = self.try_reserve(estimate) {
                    return Some(reservation);
                }
            }
            if max_wait.is_zero() {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            queue.waiters.push_back(Waiter { estimate, tx });
            rx
        };

        if let Some(wait_ms) = self.window_block_ms(estimate) {
            self.arm_boundary_waker(wait_ms);
        }

        match timeout(max_wait, rx).await {
            Ok(Ok(reservation)) => Some(reservation),
            // Closed by shutdown, or the wait expired. Dropping the receiver
            // is enough; the pump skips us and keeps the capacity.
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Serve queued waiters in arrival order until the head cannot be
    /// satisfied.
    pub(crate) fn pump(&self) {
        loop {
            let stalled_grant = {
                let mut queue = self.lock_queue();
                loop {
                    let Some(head) = queue.waiters.front() else {
                        break None;
                    };
                    if head.tx.is_closed() {
                        queue.waiters.pop_front();
                        continue;
                    }
                    let estimate = head.estimate;
                    match self.try_reserve(estimate) {
                        None => {
                            if let Some(wait_ms) = self.window_block_ms(estimate) {
                                self.arm_boundary_waker(wait_ms);
                            }
                            break None;
                        }
                        Some(reservation) => {
                            let waiter = queue.waiters.pop_front().expect("head checked above");
                            if let Err(reservation) = waiter.tx.send(reservation) {
                                break Some(reservation);
                            }
                        }
                    }
                }
            };

            match stalled_grant {
                // A granted waiter vanished between the closed check and the
                // send. Take the grant back outside the queue lock and retry.
                Some(reservation) => reservation.cancel_quiet(),
                None => return,
            }
        }
    }

    /// Milliseconds until the earliest rollover of a window that blocks this
    /// estimate, if a window is what blocks it.
    fn window_block_ms(&self, estimate: ResourceEstimate) -> Option<u64> {
        let mut earliest = None;
        for (counter, dimension) in self.counters() {
            let amount = Self::amount_for(dimension, estimate);
            if amount == 0 {
                continue;
            }
            if let Some(available) = counter.available() {
                if available < amount {
                    let wait_ms = counter.ms_until_rollover();
                    earliest = Some(earliest.map_or(wait_ms, |e: u64| e.min(wait_ms)));
                }
            }
        }
        earliest
    }

    /// Schedule one pump at the next relevant window boundary.
    fn arm_boundary_waker(&self, wait_ms: u64) {
        if self.boundary_waker_armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.boundary_waker_armed.store(false, Ordering::SeqCst);
            return;
        };
        let limiter = self.handle();
        handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            limiter.boundary_waker_armed.store(false, Ordering::SeqCst);
            trace!(model = %limiter.id, "window boundary wake");
            limiter.pump();
        });
    }

    /// Reconcile actual usage into the windows the reservation debited.
    ///
    /// Returns the dimensions pushed past their limit and by how much. The
    /// overrun stays committed; the counter never takes back work a job
    /// already did.
    pub(crate) fn commit(
        &self,
        actual: &UsageReport,
        reservation: &mut Reservation,
    ) -> Vec<(Dimension, u64)> {
        debug_assert_eq!(
            reservation.model_id(),
            self.id,
            "reservation committed against the wrong model"
        );

        let mut overages = Vec::new();
        let pairs = [
            (
                &self.tokens_minute,
                Dimension::TokensMinute,
                reservation.tokens_minute,
                actual.total_tokens(),
            ),
            (
                &self.requests_minute,
                Dimension::RequestsMinute,
                reservation.requests_minute,
                actual.request_count,
            ),
            (
                &self.tokens_day,
                Dimension::TokensDay,
                reservation.tokens_day,
                actual.total_tokens(),
            ),
            (
                &self.requests_day,
                Dimension::RequestsDay,
                reservation.requests_day,
                actual.request_count,
            ),
        ];
        for (counter, dimension, window, amount) in pairs {
            let Some(window) = window else { continue };
            if let Some(overshoot) = counter.commit(amount, window) {
                debug!(
                    model = %self.id,
                    ?dimension,
                    overshoot,
                    "committed usage exceeded the limit"
                );
                overages.push((dimension, overshoot));
            }
        }

        reservation.committed = true;
        overages
    }

    /// Whether a full reservation would currently succeed.
    pub(crate) fn has_capacity_for(&self, estimate: ResourceEstimate) -> bool {
        if self.lock_queue().closed {
            return false;
        }
        for (counter, dimension) in self.counters() {
            let amount = Self::amount_for(dimension, estimate);
            if let Some(available) = counter.available() {
                if available < amount {
                    return false;
                }
            }
        }
        if let Some(memory) = &self.memory {
            if !memory.has_capacity_for(estimate.memory_kb) {
                return false;
            }
        }
        if let Some(concurrency) = &self.concurrency {
            if !concurrency.has_capacity_for(1) {
                return false;
            }
        }
        true
    }

    /// Retune per-instance limits from a distributed pool allocation.
    ///
    /// The slot pool is clamped after scaling: never below `min_capacity`,
    /// never above a locally configured concurrency ceiling.
    pub(crate) fn set_pool(&self, pool: &PoolAllocation) {
        if pool.tokens_per_minute.is_some() {
            self.tokens_minute.set_limit(pool.tokens_per_minute);
        }
        if pool.requests_per_minute.is_some() {
            self.requests_minute.set_limit(pool.requests_per_minute);
        }
        if pool.tokens_per_day.is_some() {
            self.tokens_day.set_limit(pool.tokens_per_day);
        }
        if pool.requests_per_day.is_some() {
            self.requests_day.set_limit(pool.requests_per_day);
        }

        if pool.total_slots > 0 {
            if let Some(concurrency) = &self.concurrency {
                let slots = pool.total_slots.max(self.min_capacity);
                let slots = self.max_concurrent.map_or(slots, |cap| slots.min(cap));
                concurrency.resize(slots);
            }
        }

        self.pump();
    }

    /// Resize the memory semaphore, clamped to the configured ceiling.
    pub(crate) fn set_memory_budget(&self, budget_kb: u64) {
        if let Some(memory) = &self.memory {
            let ceiling = self.max_memory_kb.unwrap_or(budget_kb);
            memory.resize(budget_kb.min(ceiling));
            self.pump();
        }
    }

    /// Fail all queued waiters and reject everything from now on.
    pub(crate) fn close(&self) {
        let mut queue = self.lock_queue();
        queue.closed = true;
        queue.waiters.clear();
        drop(queue);

        if let Some(concurrency) = &self.concurrency {
            concurrency.close();
        }
        if let Some(memory) = &self.memory {
            memory.close();
        }
    }

    /// Queued waiter count.
    pub(crate) fn waiting(&self) -> usize {
        self.lock_queue().waiters.len()
    }

    /// Current counters across every limited dimension.
    pub(crate) fn stats(&self) -> ModelStats {
        let window = |counter: &WindowCounter| {
            let stats = counter.stats();
            stats.limit.is_some().then_some(stats)
        };
        let semaphore = |semaphore: &Option<FifoSemaphore>| {
            semaphore
                .as_ref()
                .map(FifoSemaphore::stats)
                .filter(|stats| stats.max != u64::MAX)
        };

        ModelStats {
            tokens_minute: window(&self.tokens_minute),
            requests_minute: window(&self.requests_minute),
            tokens_day: window(&self.tokens_day),
            requests_day: window(&self.requests_day),
            concurrency: semaphore(&self.concurrency),
            memory: semaphore(&self.memory),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;

    use super::*;

    fn estimate(tokens: u64, requests: u64) -> ResourceEstimate {
        ResourceEstimate {
            tokens,
            requests,
            memory_kb: 0,
        }
    }

    fn limiter(config: ModelConfig, clock: Arc<ManualClock>) -> Arc<ModelLimiter> {
        ModelLimiter::new("m", &config, false, clock as Arc<dyn Clock>)
    }

    #[tokio::test]
    async fn partial_reservation_rolls_back() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                tokens_per_minute: Some(100),
                requests_per_minute: Some(1),
                ..ModelConfig::default()
            },
            clock,
        );

        let held = limiter.try_reserve(estimate(10, 1)).unwrap();

        // Requests are exhausted, so the token debit must be rolled back.
        assert!(limiter.try_reserve(estimate(10, 1)).is_none());
        assert_eq!(limiter.tokens_minute.stats().used, 10);

        held.release();
        assert_eq!(limiter.tokens_minute.stats().used, 0);
    }

    #[tokio::test]
    async fn concurrency_miss_rolls_back_memory_and_windows() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                tokens_per_minute: Some(100),
                max_concurrent_requests: Some(1),
                max_capacity: Some(1_000),
                ..ModelConfig::default()
            },
            clock,
        );

        let busy = ResourceEstimate {
            tokens: 10,
            requests: 1,
            memory_kb: 100,
        };
        let held = limiter.try_reserve(busy).unwrap();

        assert!(limiter.try_reserve(busy).is_none());
        assert_eq!(limiter.tokens_minute.stats().used, 10);
        let memory = limiter.memory.as_ref().unwrap().stats();
        assert_eq!(memory.in_use, 100, "only the held job keeps memory");

        held.release();
        assert_eq!(limiter.memory.as_ref().unwrap().stats().in_use, 0);
    }

    #[tokio::test]
    async fn waiters_complete_in_arrival_order() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                max_concurrent_requests: Some(1),
                ..ModelConfig::default()
            },
            clock,
        );

        let held = limiter.try_reserve(estimate(0, 1)).unwrap();

        let first = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .reserve_timeout(estimate(0, 1), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .reserve_timeout(estimate(0, 1), Duration::from_secs(5))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(limiter.waiting(), 2);

        held.release();
        let granted = first.await.unwrap().expect("first waiter served");
        assert_eq!(limiter.waiting(), 1);

        granted.release();
        assert!(second.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn zero_wait_is_a_single_attempt() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                requests_per_minute: Some(1),
                ..ModelConfig::default()
            },
            clock,
        );

        let _held = limiter.try_reserve(estimate(0, 1)).unwrap();
        let missed = limiter.reserve_timeout(estimate(0, 1), Duration::ZERO).await;
        assert!(missed.is_none());
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_waiter_is_skipped_without_release() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                max_concurrent_requests: Some(1),
                ..ModelConfig::default()
            },
            clock,
        );

        let held = limiter.try_reserve(estimate(0, 1)).unwrap();

        let expired = limiter
            .reserve_timeout(estimate(0, 1), Duration::from_millis(10))
            .await;
        assert!(expired.is_none());

        held.release();
        assert_eq!(
            limiter.concurrency.as_ref().unwrap().stats().in_use,
            0,
            "expired waiter acquired nothing"
        );
        assert!(limiter.try_reserve(estimate(0, 1)).is_some());
    }

    #[tokio::test]
    async fn exact_usage_reconciles_to_the_estimate() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                tokens_per_minute: Some(100),
                requests_per_minute: Some(10),
                ..ModelConfig::default()
            },
            clock,
        );

        let mut reservation = limiter.try_reserve(estimate(30, 1)).unwrap();
        let actual = UsageReport::new("m", 10, 10, 10);
        let overages = limiter.commit(&actual, &mut reservation);
        assert!(overages.is_empty());
        reservation.release();

        assert_eq!(limiter.tokens_minute.stats().used, 30);
        assert_eq!(limiter.requests_minute.stats().used, 1);
    }

    #[tokio::test]
    async fn overage_is_reported_per_dimension() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                tokens_per_minute: Some(50),
                ..ModelConfig::default()
            },
            clock,
        );

        let mut reservation = limiter.try_reserve(estimate(50, 1)).unwrap();
        let actual = UsageReport::new("m", 80, 0, 0);
        let overages = limiter.commit(&actual, &mut reservation);
        assert_eq!(overages, vec![(Dimension::TokensMinute, 30)]);
        reservation.release();

        assert_eq!(limiter.tokens_minute.stats().used, 80, "overrun stays");
    }

    #[tokio::test]
    async fn commit_after_rollover_leaves_new_window_clean() {
        let clock = Arc::new(ManualClock::at(59_900));
        let limiter = limiter(
            ModelConfig {
                tokens_per_minute: Some(100),
                ..ModelConfig::default()
            },
            clock.clone(),
        );

        let mut reservation = limiter.try_reserve(estimate(50, 1)).unwrap();
        clock.set(60_100);

        let actual = UsageReport::new("m", 70, 0, 0);
        assert!(limiter.commit(&actual, &mut reservation).is_empty());
        reservation.release();

        assert_eq!(limiter.tokens_minute.stats().used, 0);
    }

    #[tokio::test]
    async fn reservation_drop_releases_everything() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                tokens_per_minute: Some(100),
                max_concurrent_requests: Some(2),
                ..ModelConfig::default()
            },
            clock,
        );

        {
            let _reservation = limiter.try_reserve(estimate(40, 1)).unwrap();
            assert_eq!(limiter.tokens_minute.stats().used, 40);
        }
        assert_eq!(limiter.tokens_minute.stats().used, 0);
        assert_eq!(limiter.concurrency.as_ref().unwrap().stats().in_use, 0);
    }

    #[tokio::test]
    async fn close_drains_waiters_with_a_miss() {
        let clock = Arc::new(ManualClock::at(0));
        let limiter = limiter(
            ModelConfig {
                max_concurrent_requests: Some(1),
                ..ModelConfig::default()
            },
            clock,
        );

        let _held = limiter.try_reserve(estimate(0, 1)).unwrap();
        let waiter = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .reserve_timeout(estimate(0, 1), Duration::from_secs(30))
                    .await
            })
        };
        tokio::task::yield_now().await;

        limiter.close();
        assert!(waiter.await.unwrap().is_none());
        assert!(!limiter.has_capacity_for(estimate(0, 1)));
    }

    #[tokio::test]
    async fn pool_allocation_retunes_limits() {
        let limiter = ModelLimiter::new(
            "m",
            &ModelConfig {
                tokens_per_minute: Some(1_000),
                requests_per_minute: Some(100),
                min_capacity: Some(2),
                ..ModelConfig::default()
            },
            true,
            Arc::new(ManualClock::at(0)) as Arc<dyn Clock>,
        );

        limiter.set_pool(&PoolAllocation {
            total_slots: 1,
            tokens_per_minute: Some(100),
            requests_per_minute: Some(10),
            tokens_per_day: None,
            requests_per_day: None,
        });

        assert_eq!(limiter.tokens_minute.limit(), Some(100));
        assert_eq!(limiter.requests_minute.limit(), Some(10));
        let concurrency = limiter.concurrency.as_ref().unwrap().stats();
        assert_eq!(concurrency.max, 2, "slot pool clamped to the floor");
    }
}
