//! Lazy-reset counters over fixed wall-clock windows.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::clock::Clock;

/// Milliseconds in a minute window.
pub const MINUTE_MS: u64 = 60_000;
/// Milliseconds in a daily window.
pub const DAY_MS: u64 = 86_400_000;

/// A rate-limited dimension tracked by a window counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Tokens per minute.
    TokensMinute,
    /// Requests per minute.
    RequestsMinute,
    /// Tokens per day.
    TokensDay,
    /// Requests per day.
    RequestsDay,
}

/// Proof that a window counter was debited, bound to the window it happened in.
///
/// Releases and reconciliations present this snapshot back to the counter so
/// that work spanning a window rollover is dropped instead of corrupting the
/// fresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowReservation {
    pub(crate) window_id: u64,
    pub(crate) amount: u64,
}

impl WindowReservation {
    /// The window this reservation was debited in.
    pub fn window_id(&self) -> u64 {
        self.window_id
    }
}

/// Usage and limit of a counter in its current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    /// Committed usage in the current window.
    pub used: u64,
    /// The configured limit, if any.
    pub limit: Option<u64>,
    /// Window length in milliseconds.
    pub window_ms: u64,
}

impl WindowStats {
    /// Headroom left in the current window. `None` when unlimited.
    pub fn available(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.used))
    }
}

/// A counter over a fixed time window with lazy reset.
///
/// The counter stores a `(window_id, count)` pair where
/// `window_id = now_ms / window_ms`. A read or write in a newer window resets
/// the count to zero first; no timer is involved in the rollover.
#[derive(Debug)]
pub struct WindowCounter {
    window_ms: u64,
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    limit: Option<u64>,
    window_id: u64,
    count: u64,
}

impl WindowCounter {
    /// Create a counter. `limit: None` means the dimension is tracked but
    /// never rejects.
    pub fn new(limit: Option<u64>, window_ms: u64, clock: Arc<dyn Clock>) -> Self {
        assert!(window_ms > 0, "window must be non-empty");

        let window_id = clock.now_ms() / window_ms;
        Self {
            window_ms,
            clock,
            state: Mutex::new(State {
                limit,
                window_id,
                count: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("window counter mutex poisoned")
    }

    /// Roll the state into the current window. Returns the current window id.
    fn roll(&self, state: &mut State) -> u64 {
        let window_id = self.clock.now_ms() / self.window_ms;
        if state.window_id != window_id {
            trace!(
                from = state.window_id,
                to = window_id,
                dropped = state.count,
                "window rolled"
            );
            state.window_id = window_id;
            state.count = 0;
        }
        window_id
    }

    /// Reserve `amount` in the current window.
    ///
    /// Succeeds iff the committed count plus `amount` stays within the limit.
    pub fn try_reserve(&self, amount: u64) -> Option<WindowReservation> {
        let mut state = self.lock();
        let window_id = self.roll(&mut state);

        match state.limit {
            Some(limit) if state.count + amount > limit => None,
            _ => {
                state.count += amount;
                Some(WindowReservation { window_id, amount })
            }
        }
    }

    /// Return a reservation unused.
    ///
    /// A no-op when the reservation's window has already rolled over, since
    /// the counter reset and there is nothing left to return.
    pub fn release(&self, reservation: WindowReservation) {
        let mut state = self.lock();
        self.roll(&mut state);

        if state.window_id == reservation.window_id {
            state.count = state.count.saturating_sub(reservation.amount);
        }
    }

    /// Replace a reservation's estimate with the actual amount used.
    ///
    /// Applies `actual - estimated` under the reservation's window. Across a
    /// rollover this is a no-op. A positive delta may push the count past the
    /// limit; the overshoot is returned for reporting and is never undone.
    pub fn commit(&self, actual: u64, reservation: WindowReservation) -> Option<u64> {
        let mut state = self.lock();
        self.roll(&mut state);

        if state.window_id != reservation.window_id {
            return None;
        }

        if actual >= reservation.amount {
            state.count += actual - reservation.amount;
        } else {
            state.count = state.count.saturating_sub(reservation.amount - actual);
        }

        match state.limit {
            Some(limit) if state.count > limit => Some(state.count - limit),
            _ => None,
        }
    }

    /// Usage and limit in the current window.
    pub fn stats(&self) -> WindowStats {
        let mut state = self.lock();
        self.roll(&mut state);

        WindowStats {
            used: state.count,
            limit: state.limit,
            window_ms: self.window_ms,
        }
    }

    /// Headroom in the current window. `None` when unlimited.
    pub fn available(&self) -> Option<u64> {
        self.stats().available()
    }

    /// Replace the limit without touching in-flight reservations.
    pub fn set_limit(&self, limit: Option<u64>) {
        self.lock().limit = limit;
    }

    /// The configured limit.
    pub fn limit(&self) -> Option<u64> {
        self.lock().limit
    }

    /// Milliseconds until the current window rolls over.
    pub fn ms_until_rollover(&self) -> u64 {
        self.window_ms - self.clock.now_ms() % self.window_ms
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;

    use super::*;

    fn counter(limit: u64, clock: &Arc<ManualClock>) -> WindowCounter {
        WindowCounter::new(Some(limit), MINUTE_MS, clock.clone() as Arc<dyn Clock>)
    }

    #[test]
    fn reserve_up_to_limit() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = counter(10, &clock);

        assert!(counter.try_reserve(6).is_some());
        assert!(counter.try_reserve(4).is_some());
        assert!(counter.try_reserve(1).is_none(), "limit reached");
        assert_eq!(counter.available(), Some(0));
    }

    #[test]
    fn release_returns_capacity_in_same_window() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = counter(10, &clock);

        let reservation = counter.try_reserve(10).unwrap();
        counter.release(reservation);

        assert_eq!(counter.available(), Some(10));
    }

    #[test]
    fn release_across_rollover_is_a_noop() {
        let clock = Arc::new(ManualClock::at(59_900));
        let counter = counter(10, &clock);

        let reservation = counter.try_reserve(10).unwrap();
        clock.set(60_100);

        counter.release(reservation);
        assert_eq!(counter.stats().used, 0, "new window stays at zero");
        assert_eq!(counter.available(), Some(10));
    }

    #[test]
    fn commit_adjusts_by_actual_minus_estimated() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = counter(100, &clock);

        let reservation = counter.try_reserve(50).unwrap();
        assert_eq!(counter.commit(30, reservation), None);
        assert_eq!(counter.stats().used, 30);

        let reservation = counter.try_reserve(10).unwrap();
        assert_eq!(counter.commit(40, reservation), None);
        assert_eq!(counter.stats().used, 70);
    }

    #[test]
    fn commit_overrun_is_tolerated_and_reported() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = counter(10, &clock);

        let reservation = counter.try_reserve(10).unwrap();
        assert_eq!(counter.commit(25, reservation), Some(15));
        assert_eq!(counter.stats().used, 25, "overrun stays committed");
        assert_eq!(counter.available(), Some(0));
    }

    #[test]
    fn commit_across_rollover_is_a_noop() {
        let clock = Arc::new(ManualClock::at(59_900));
        let counter = counter(100, &clock);

        let reservation = counter.try_reserve(50).unwrap();
        clock.set(60_100);

        assert_eq!(counter.commit(80, reservation), None);
        assert_eq!(counter.stats().used, 0, "rolled window is not re-debited");
    }

    #[test]
    fn exact_commit_restores_pre_job_state() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = counter(100, &clock);
        let before = counter.stats();

        let reservation = counter.try_reserve(25).unwrap();
        counter.commit(25, reservation);

        // The estimate matched reality, so only the committed usage remains.
        assert_eq!(counter.stats().used, before.used + 25);
        let reservation = counter.try_reserve(25).unwrap();
        counter.release(reservation);
        assert_eq!(counter.stats().used, before.used + 25);
    }

    #[test]
    fn unlimited_counter_always_reserves() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = WindowCounter::new(None, MINUTE_MS, clock as Arc<dyn Clock>);

        assert!(counter.try_reserve(u64::MAX / 2).is_some());
        assert_eq!(counter.available(), None);
    }

    #[test]
    fn set_limit_applies_to_new_reservations() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = counter(10, &clock);

        let held = counter.try_reserve(8).unwrap();
        counter.set_limit(Some(5));

        assert!(counter.try_reserve(1).is_none(), "already past new limit");

        // The in-flight reservation still releases cleanly.
        counter.release(held);
        assert!(counter.try_reserve(5).is_some());
    }

    #[test]
    fn rollover_boundary_arithmetic() {
        let clock = Arc::new(ManualClock::at(59_000));
        let counter = counter(10, &clock);

        assert_eq!(counter.ms_until_rollover(), 1_000);
        clock.set(60_000);
        assert_eq!(counter.ms_until_rollover(), MINUTE_MS);
    }

    #[test]
    fn usage_is_monotone_within_a_window() {
        let clock = Arc::new(ManualClock::at(0));
        let counter = counter(100, &clock);

        let mut last = 0;
        for _ in 0..10 {
            let reservation = counter.try_reserve(5).unwrap();
            counter.commit(5, reservation);
            let used = counter.stats().used;
            assert!(used >= last);
            last = used;
        }

        clock.advance(MINUTE_MS);
        assert_eq!(counter.stats().used, 0, "reset on first read after rollover");
    }
}
