//! Polling helpers for conditions that become true asynchronously.
//!
//! None of these return errors: a `false` result means the deadline passed
//! and it is up to the caller to turn that into a test failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `predicate` every [`DEFAULT_POLL_INTERVAL`] until it returns true or
/// `timeout` elapses.
pub async fn wait_for(predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    Waiter::new(timeout).until(predicate).await
}

pub async fn wait_for_with_interval(
    predicate: impl FnMut() -> bool,
    timeout: Duration,
    interval: Duration,
) -> bool {
    Waiter::new(timeout).interval(interval).until(predicate).await
}

/// True if `predicate` holds at every poll for the whole of `duration`.
pub async fn ensure_always(predicate: impl FnMut() -> bool, duration: Duration) -> bool {
    Waiter::new(duration).ensure_always(predicate).await
}

/// True if `predicate` never holds during `duration`.
pub async fn ensure_never(mut predicate: impl FnMut() -> bool, duration: Duration) -> bool {
    Waiter::new(duration).ensure_always(|| !predicate()).await
}

#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    timeout: Duration,
    interval: Duration,
}

impl Waiter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the poll interval, clamped to [`MIN_POLL_INTERVAL`].
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.interval
    }

    pub async fn until(&self, mut predicate: impl FnMut() -> bool) -> bool {
        self.until_async(|| std::future::ready(predicate())).await
    }

    /// Like [`Waiter::until`] for predicates that need to await, e.g. a
    /// connection attempt.
    pub async fn until_async<F, Fut>(&self, mut predicate: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            if predicate().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }

    pub async fn ensure_always(&self, mut predicate: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + self.timeout;
        loop {
            if !predicate() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant as StdInstant;

    use rstest::rstest;

    use super::*;

    #[tokio::test]
    async fn true_predicate_succeeds_with_zero_timeout() {
        assert!(wait_for(|| true, Duration::ZERO).await);
    }

    #[tokio::test]
    async fn false_predicate_waits_out_the_timeout() {
        let start = StdInstant::now();
        let ok = wait_for_with_interval(
            || false,
            Duration::from_millis(300),
            Duration::from_millis(50),
        )
        .await;

        let elapsed = start.elapsed();
        assert!(!ok);
        assert!(elapsed >= Duration::from_millis(300), "returned early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "overshot: {elapsed:?}");
    }

    #[tokio::test]
    async fn returns_once_the_condition_flips() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let ok = wait_for_with_interval(
            move || counter.fetch_add(1, Ordering::SeqCst) >= 3,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;

        assert!(ok);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[rstest]
    #[case(Duration::ZERO, MIN_POLL_INTERVAL)]
    #[case(Duration::from_millis(1), MIN_POLL_INTERVAL)]
    #[case(Duration::from_millis(250), Duration::from_millis(250))]
    fn interval_is_clamped(#[case] requested: Duration, #[case] expected: Duration) {
        let waiter = Waiter::new(Duration::from_secs(1)).interval(requested);
        assert_eq!(waiter.poll_interval(), expected);
    }

    #[tokio::test]
    async fn async_predicate_is_awaited() {
        let waiter = Waiter::new(Duration::from_secs(1)).interval(Duration::from_millis(10));
        let mut polls = 0;
        let ok = waiter
            .until_async(|| {
                polls += 1;
                let done = polls > 2;
                async move { done }
            })
            .await;
        assert!(ok);
    }

    #[tokio::test]
    async fn ensure_always_fails_fast() {
        let start = StdInstant::now();
        assert!(!ensure_always(|| false, Duration::from_secs(10)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn ensure_never_holds_for_the_window() {
        let waiter = Waiter::new(Duration::from_millis(100)).interval(Duration::from_millis(20));
        assert!(waiter.ensure_always(|| true).await);
        assert!(ensure_never(|| false, Duration::from_millis(50)).await);
    }
}
