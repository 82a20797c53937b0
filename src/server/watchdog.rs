//! Idle-connection watchdog
//!
//! Counts connections accepted since the last check; when a whole check
//! interval passes without a single new connection the watchdog resolves
//! and the process is expected to shut down. Deployed under a supervisor
//! this recycles processes whose listener has silently wedged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

/// Process-wide count of connections accepted since the last check.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter {
    accepted: Arc<AtomicU64>,
}

impl ConnectionCounter {
    /// Record one accepted connection.
    pub fn mark(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Read and reset the count.
    fn take(&self) -> u64 {
        self.accepted.swap(0, Ordering::Relaxed)
    }
}

/// Watches the connection counter and resolves once idle.
#[derive(Debug)]
pub struct IdleWatchdog {
    counter: ConnectionCounter,
    interval: Duration,
}

impl IdleWatchdog {
    pub fn new(interval: Duration) -> Self {
        Self {
            counter: ConnectionCounter::default(),
            interval,
        }
    }

    /// The counter connection callbacks should mark.
    pub fn counter(&self) -> ConnectionCounter {
        self.counter.clone()
    }

    /// Resolve once a full interval passes with zero accepted connections.
    pub async fn idle(self) {
        loop {
            tokio::time::sleep(self.interval).await;
            if self.counter.take() == 0 {
                warn!(
                    "no connections accepted in the last {:?}, considering the process idle",
                    self.interval
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_idle_interval_fires() {
        let watchdog = IdleWatchdog::new(Duration::from_secs(30));
        let start = tokio::time::Instant::now();

        watchdog.idle().await;

        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_connections_defer_firing() {
        let watchdog = IdleWatchdog::new(Duration::from_secs(30));
        let counter = watchdog.counter();
        let start = tokio::time::Instant::now();

        let marker = tokio::spawn(async move {
            // Activity during the first two intervals, then silence.
            for _ in 0..2 {
                tokio::time::sleep(Duration::from_secs(20)).await;
                counter.mark();
            }
        });

        watchdog.idle().await;
        marker.await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_resets_each_check() {
        let counter = ConnectionCounter::default();
        counter.mark();
        counter.mark();
        assert_eq!(counter.take(), 2);
        assert_eq!(counter.take(), 0);
    }
}
