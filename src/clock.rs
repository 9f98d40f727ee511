//! Injectable clock: wall time for persistence, monotonic time for budgets.
//!
//! Production code uses [`SystemClock`]; tests drive a [`ManualClock`] so
//! scheduler windows and retry floors are deterministic.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Wall + monotonic time source.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Monotonic instant for measuring elapsed time.
    fn monotonic(&self) -> Instant;
}

/// Real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-advanced clock for tests.
///
/// Wall time moves only through [`ManualClock::advance`] and
/// [`ManualClock::set`]; the monotonic reading is anchored at creation and
/// offset by the same amount, so elapsed-time budgets follow wall time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    now: DateTime<Utc>,
    anchor: Instant,
    offset: Duration,
}

impl ManualClock {
    /// Create a clock frozen at the given wall time.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                now,
                anchor: Instant::now(),
                offset: Duration::ZERO,
            })),
        }
    }

    /// Advance both wall and monotonic time.
    pub fn advance(&self, by: Duration) {
        let mut state = self.lock();
        state.now = state
            .now
            .checked_add_signed(
                chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero()),
            )
            .unwrap_or(state.now);
        state.offset = state.offset.saturating_add(by);
    }

    /// Jump wall time to an absolute instant (monotonic time is unchanged).
    pub fn set(&self, now: DateTime<Utc>) {
        self.lock().now = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        // A poisoned lock only happens if a test panicked mid-advance.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn monotonic(&self) -> Instant {
        let state = self.lock();
        state.anchor.checked_add(state.offset).unwrap_or(state.anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let t0 = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        let clock = ManualClock::new(t0);
        assert_eq!(clock.now_utc(), t0);

        clock.advance(Duration::from_secs(120));
        assert_eq!(
            clock.now_utc(),
            t0 + chrono::Duration::seconds(120),
            "wall time should move with advance"
        );
    }

    #[test]
    fn test_manual_clock_set_jumps_wall_time_only() {
        let t0 = DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        let clock = ManualClock::new(t0);
        let mono_before = clock.monotonic();

        let t1 = DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .expect("valid")
            .with_timezone(&Utc);
        clock.set(t1);

        assert_eq!(clock.now_utc(), t1);
        assert_eq!(clock.monotonic(), mono_before);
    }
}
