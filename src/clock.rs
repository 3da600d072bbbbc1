//! Injectable time and randomness for timing-sensitive code.
//!
//! Heartbeats, jittered token refresh and the human-like reply delays all go
//! through [`Clock`] and [`Jitter`] so tests can observe requested sleeps
//! without waiting for them.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Wall clock plus an async sleep primitive.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Source of bounded random offsets.
pub trait Jitter: Send + Sync {
    /// Uniform value in `[low, high]` (inclusive). Returns `low` when the range is empty.
    fn between(&self, low: u64, high: u64) -> u64;
}

/// Production clock backed by `SystemTime` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        crate::util::unix_millis()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Production jitter backed by the thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn between(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return low;
        }
        let span = high - low + 1;
        let reject_threshold = (u64::MAX / span) * span;
        loop {
            let value = rand::random::<u64>();
            if value < reject_threshold {
                return low + value % span;
            }
        }
    }
}

/// Clock that never blocks: every `sleep` advances virtual time and is recorded.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_millis),
            sleeps: Mutex::new(Vec::new()),
        })
    }

    pub fn advance(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps.lock().iter().sum()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Jitter that always answers with the same position inside the range.
#[derive(Debug, Clone, Copy)]
pub enum FixedJitter {
    Low,
    High,
}

impl Jitter for FixedJitter {
    fn between(&self, low: u64, high: u64) -> u64 {
        match self {
            Self::Low => low,
            Self::High => high.max(low),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_jitter_stays_in_range() {
        let jitter = RandomJitter;
        for _ in 0..500 {
            let value = jitter.between(10, 20);
            assert!((10..=20).contains(&value));
        }
        assert_eq!(jitter.between(7, 7), 7);
        assert_eq!(jitter.between(9, 3), 9);
    }

    #[test]
    fn fixed_jitter_picks_bounds() {
        assert_eq!(FixedJitter::Low.between(5, 9), 5);
        assert_eq!(FixedJitter::High.between(5, 9), 9);
        assert_eq!(FixedJitter::High.between(9, 5), 9);
    }

    #[tokio::test]
    async fn manual_clock_records_sleeps_and_advances() {
        let clock = ManualClock::new(1_000);
        clock.sleep(Duration::from_millis(250)).await;
        clock.sleep(Duration::from_secs(2)).await;
        assert_eq!(clock.now_millis(), 3_250);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(250), Duration::from_secs(2)]
        );
        assert_eq!(clock.total_slept(), Duration::from_millis(2_250));
    }
}
