//! A weighted counting semaphore with strict FIFO fairness.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

/// Counters describing a semaphore's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreStats {
    /// Permits not currently held. Reports 0 while holders exceed a reduced
    /// maximum.
    pub available: u64,
    /// Maximum permits.
    pub max: u64,
    /// Permits currently held.
    pub in_use: u64,
    /// Queued acquirers.
    pub waiting: usize,
}

/// A weighted semaphore granting permits in strict arrival order.
///
/// A small request never overtakes a larger one at the head of the queue: if
/// the head needs 5 permits and only 1 is free, everything behind it waits.
/// Resizing upward serves waiters in order with the new permits; resizing
/// downward never revokes permits already held.
#[derive(Debug)]
pub struct FifoSemaphore {
    state: Arc<Mutex<State>>,
}

#[derive(Debug)]
struct State {
    max: u64,
    in_use: u64,
    closed: bool,
    waiters: VecDeque<Waiter>,
}

#[derive(Debug)]
struct Waiter {
    weight: u64,
    tx: oneshot::Sender<Permit>,
}

/// Capacity granted to a queued waiter, in flight between the grant and the
/// acquirer observing it.
///
/// Dropping an unclaimed permit (the acquirer gave up between the grant and
/// the hand-off) returns the capacity and wakes the queue, so a cancelled
/// waiter can never strand permits.
#[derive(Debug)]
struct Permit {
    weight: u64,
    state: Option<Arc<Mutex<State>>>,
}

impl Permit {
    /// Take ownership of the granted capacity; the holder is now responsible
    /// for calling `release`.
    fn claim(mut self) {
        self.state = None;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let mut guard = lock(&state);
            guard.in_use = guard.in_use.saturating_sub(self.weight);
            pump(&state, &mut guard);
        }
    }
}

fn lock(state: &Arc<Mutex<State>>) -> MutexGuard<'_, State> {
    state.lock().expect("semaphore mutex poisoned")
}

/// Serve queued waiters in order until the head no longer fits.
fn pump(state: &Arc<Mutex<State>>, guard: &mut MutexGuard<'_, State>) {
    while let Some(head) = guard.waiters.front() {
        if head.tx.is_closed() {
            // The acquirer timed out or was dropped; skip without charging.
            guard.waiters.pop_front();
            continue;
        }
        if guard.in_use + head.weight > guard.max {
            break;
        }

        let waiter = guard.waiters.pop_front().expect("head checked above");
        guard.in_use += waiter.weight;
        let permit = Permit {
            weight: waiter.weight,
            state: Some(state.clone()),
        };
        if let Err(permit) = waiter.tx.send(permit) {
            // Receiver disappeared between the closed check and the send.
            permit.claim();
            guard.in_use -= waiter.weight;
        }
    }
}

impl FifoSemaphore {
    /// Create a semaphore with `max` permits.
    pub fn new(max: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                max,
                in_use: 0,
                closed: false,
                waiters: VecDeque::new(),
            })),
        }
    }

    /// Acquire `weight` permits, suspending until they are granted.
    ///
    /// Returns `false` when the semaphore is closed. A caller that arrives
    /// while others are queued is enqueued behind them, never fast-pathed.
    pub async fn acquire(&self, weight: u64) -> bool {
        let rx = {
            let mut guard = lock(&self.state);
            if guard.closed {
                return false;
            }
            if guard.waiters.is_empty() && guard.in_use + weight <= guard.max {
                guard.in_use += weight;
                return true;
            }
            let (tx, rx) = oneshot::channel();
            guard.waiters.push_back(Waiter { weight, tx });
            rx
        };

        match rx.await {
            Ok(permit) => {
                permit.claim();
                true
            }
            Err(_) => false,
        }
    }

    /// Acquire `weight` permits without waiting.
    ///
    /// Fails while waiters are queued; the free permits belong to them.
    pub fn try_acquire(&self, weight: u64) -> bool {
        let mut guard = lock(&self.state);
        if guard.closed || !guard.waiters.is_empty() || guard.in_use + weight > guard.max {
            return false;
        }
        guard.in_use += weight;
        true
    }

    /// Whether `weight` permits could be acquired right now.
    pub fn has_capacity_for(&self, weight: u64) -> bool {
        let guard = lock(&self.state);
        !guard.closed && guard.waiters.is_empty() && guard.in_use + weight <= guard.max
    }

    /// Return `weight` permits and serve the queue.
    pub fn release(&self, weight: u64) {
        let mut guard = lock(&self.state);
        guard.in_use = guard.in_use.saturating_sub(weight);
        pump(&self.state, &mut guard);
    }

    /// Change the maximum permit count.
    ///
    /// Growing serves queued waiters with the new permits. Shrinking below
    /// the held count never revokes permits; the deficit drains as holders
    /// release.
    pub fn resize(&self, new_max: u64) {
        let mut guard = lock(&self.state);
        guard.max = new_max;
        pump(&self.state, &mut guard);
    }

    /// Close the semaphore, failing all queued and future acquirers.
    pub fn close(&self) {
        let mut guard = lock(&self.state);
        guard.closed = true;
        // Dropping the senders completes every waiter with a miss.
        guard.waiters.clear();
    }

    /// Current counters.
    pub fn stats(&self) -> SemaphoreStats {
        let guard = lock(&self.state);
        SemaphoreStats {
            available: guard.max.saturating_sub(guard.in_use),
            max: guard.max,
            in_use: guard.in_use,
            waiting: guard.waiters.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn grants_up_to_max() {
        let semaphore = FifoSemaphore::new(3);

        assert!(semaphore.try_acquire(2));
        assert!(semaphore.try_acquire(1));
        assert!(!semaphore.try_acquire(1));

        semaphore.release(2);
        assert!(semaphore.try_acquire(2));
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let semaphore = Arc::new(FifoSemaphore::new(1));
        assert!(semaphore.acquire(1).await);

        let waiter = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(1).await })
        };

        tokio::task::yield_now().await;
        assert_eq!(semaphore.stats().waiting, 1);

        semaphore.release(1);
        assert!(waiter.await.unwrap());
        assert_eq!(semaphore.stats().in_use, 1);
    }

    #[tokio::test]
    async fn small_requests_do_not_overtake_the_head() {
        let semaphore = Arc::new(FifoSemaphore::new(5));
        assert!(semaphore.acquire(5).await);

        // Head needs 5, a later request needs 1.
        let large = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(5).await })
        };
        tokio::task::yield_now().await;
        let small = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(1).await })
        };
        tokio::task::yield_now().await;

        // One permit frees up; the head still does not fit, so nothing moves.
        semaphore.release(1);
        assert_eq!(semaphore.stats().waiting, 2);
        assert!(!semaphore.has_capacity_for(1), "queued head owns the slack");

        // The rest frees up; the head is served first, then the small one
        // waits for the next release.
        semaphore.release(4);
        assert!(large.await.unwrap());
        assert_eq!(semaphore.stats().waiting, 1);

        semaphore.release(5);
        assert!(small.await.unwrap());
    }

    #[tokio::test]
    async fn try_acquire_respects_the_queue() {
        let semaphore = Arc::new(FifoSemaphore::new(2));
        assert!(semaphore.acquire(2).await);

        let waiter = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(2).await })
        };
        tokio::task::yield_now().await;

        semaphore.release(1);
        assert!(!semaphore.try_acquire(1), "waiter is ahead");

        semaphore.release(1);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn resize_up_serves_waiters_in_order() {
        let semaphore = Arc::new(FifoSemaphore::new(0));

        let first = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(2).await })
        };
        tokio::task::yield_now().await;
        let second = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(1).await })
        };
        tokio::task::yield_now().await;

        semaphore.resize(2);
        assert!(first.await.unwrap());
        assert_eq!(semaphore.stats().waiting, 1);

        semaphore.resize(3);
        assert!(second.await.unwrap());
    }

    #[tokio::test]
    async fn resize_down_never_revokes() {
        let semaphore = FifoSemaphore::new(4);
        assert!(semaphore.try_acquire(4));

        semaphore.resize(2);
        let stats = semaphore.stats();
        assert_eq!(stats.in_use, 4, "holders keep their permits");
        assert_eq!(stats.available, 0);

        semaphore.release(4);
        assert_eq!(semaphore.stats().available, 2);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let semaphore = Arc::new(FifoSemaphore::new(1));
        assert!(semaphore.acquire(1).await);

        // This waiter gives up before being served.
        let cancelled = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move {
                timeout(Duration::from_millis(10), semaphore.acquire(1)).await
            })
        };
        assert!(cancelled.await.unwrap().is_err());

        let waiter = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(1).await })
        };
        tokio::task::yield_now().await;

        semaphore.release(1);
        assert!(waiter.await.unwrap());
        assert_eq!(semaphore.stats().in_use, 1, "no capacity stranded");
    }

    #[tokio::test]
    async fn close_fails_all_waiters() {
        let semaphore = Arc::new(FifoSemaphore::new(1));
        assert!(semaphore.acquire(1).await);

        let waiter = {
            let semaphore = semaphore.clone();
            tokio::spawn(async move { semaphore.acquire(1).await })
        };
        tokio::task::yield_now().await;

        semaphore.close();
        assert!(!waiter.await.unwrap());
        assert!(!semaphore.try_acquire(1));
        assert!(!semaphore.acquire(1).await);
    }
}
