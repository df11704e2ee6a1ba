//! Abstraction for sleeping/waiting
//!
//! Enables fast, deterministic tests of the interval loop without real time
//! delays

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that records every requested duration and parks each sleep
/// until the test calls [`GatedSleeper::release`].
///
/// One `release` wakes one pending (or future) sleep, so a test can step the
/// interval loop tick by tick: check traffic in, advance the clock, release,
/// observe the new block table.
#[derive(Debug, Clone)]
pub struct GatedSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
    gate: Arc<tokio::sync::Semaphore>,
}

impl GatedSleeper {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
        }
    }

    /// Durations requested so far, in call order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap().clone()
    }

    /// Let one pending sleep complete. Permits accumulate, so releasing
    /// before the sleep starts also works.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }
}

impl Default for GatedSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for GatedSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap().push(duration);
        let gate = self.gate.clone();
        Box::pin(async move {
            // A closed semaphore means the test is done; just return.
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokio_sleeper_actually_sleeps() {
        let sleeper = TokioSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_millis(50)).await;
        let elapsed = start.elapsed();
        // Should take at least the requested duration
        assert!(elapsed >= Duration::from_millis(45)); // Small tolerance for timing jitter
    }

    #[tokio::test]
    async fn gated_sleeper_records_calls() {
        let sleeper = GatedSleeper::new();

        sleeper.release();
        sleeper.release();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;

        let calls = sleeper.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Duration::from_millis(100));
        assert_eq!(calls[1], Duration::from_millis(200));
    }

    #[tokio::test]
    async fn gated_sleeper_parks_until_released() {
        let sleeper = GatedSleeper::new();
        let pending = tokio::spawn({
            let sleeper = sleeper.clone();
            async move { sleeper.sleep(Duration::from_secs(3600)).await }
        });

        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        sleeper.release();
        tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("released sleep should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn gated_sleeper_release_is_one_shot() {
        let sleeper = GatedSleeper::new();
        sleeper.release();
        sleeper.sleep(Duration::from_millis(1)).await;

        // Second sleep has no permit; it must still be pending.
        let pending = tokio::spawn({
            let sleeper = sleeper.clone();
            async move { sleeper.sleep(Duration::from_millis(1)).await }
        });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());
        sleeper.release();
        let _ = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap();
    }
}
