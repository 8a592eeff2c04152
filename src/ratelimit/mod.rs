//! Per-venue rate-limited request scheduler (§4.2).
//!
//! Every outbound request carries a weight map; admission against each
//! weight kind's bounded window is serialized by a single lock so a
//! multi-kind request never partially consumes its budget.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{Error, Result};

/// A weight kind identifies one bucket of venue rate-limit budget, e.g.
/// `"orders"` or `"requests"`.
pub type WeightKind = String;

/// A bounded window: at most `limit` total weight spent within the last
/// `window` duration.
#[derive(Debug, Clone, Copy)]
pub struct Window {
    pub window: Duration,
    pub limit: u32,
}

struct Bucket {
    window: Window,
    spent: Vec<(Instant, u32)>,
}

impl Bucket {
    fn prune(&mut self, now: Instant) {
        let window = self.window.window;
        self.spent.retain(|(ts, _)| now.duration_since(*ts) < window);
    }

    fn total_spent(&self) -> u32 {
        self.spent.iter().map(|(_, w)| w).sum()
    }

    /// `None` means admissible now. `Some(wait)` means retry after `wait`.
    fn sleep_until_admissible(&self, now: Instant, needed: u32) -> Option<Duration> {
        if self.total_spent() + needed <= self.window.limit {
            return None;
        }
        let oldest = self.spent.first().map(|(ts, _)| *ts).unwrap_or(now);
        let elapsed = now.duration_since(oldest);
        Some(self.window.window.saturating_sub(elapsed))
    }
}

/// The per-venue ticket dispenser. One instance is shared by every task
/// that issues requests against that venue.
pub struct RateScheduler {
    venue: String,
    buckets: Mutex<HashMap<WeightKind, Bucket>>,
}

impl RateScheduler {
    #[must_use]
    pub fn new(venue: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Register a window for `kind`, replacing any prior registration.
    pub async fn register(&self, kind: impl Into<WeightKind>, window: Window) {
        let mut buckets = self.buckets.lock().await;
        buckets.insert(
            kind.into(),
            Bucket {
                window,
                spent: Vec::new(),
            },
        );
    }

    /// Block until every weight kind in `weights` can be admitted
    /// simultaneously, then record the spend. FIFO among concurrent
    /// waiters falls out of holding the lock across the whole
    /// check-then-spend sequence. Returns `Error::RateLimitExhausted` if
    /// a single request's weight for some kind can never fit within that
    /// kind's window, since waiting would never make it admissible.
    pub async fn admit(&self, weights: &HashMap<WeightKind, u32>) -> Result<()> {
        loop {
            let mut buckets = self.buckets.lock().await;
            let now = Instant::now();
            let mut longest_wait = Duration::ZERO;

            for (kind, bucket) in buckets.iter_mut() {
                bucket.prune(now);
                if let Some(weight) = weights.get(kind) {
                    if *weight > bucket.window.limit {
                        return Err(Error::RateLimitExhausted {
                            venue: self.venue.clone(),
                            kind: kind.clone(),
                        });
                    }
                    if let Some(wait) = bucket.sleep_until_admissible(now, *weight) {
                        longest_wait = longest_wait.max(wait);
                    }
                }
            }

            if longest_wait.is_zero() {
                for (kind, weight) in weights {
                    if let Some(bucket) = buckets.get_mut(kind) {
                        bucket.spent.push((now, *weight));
                    }
                }
                return Ok(());
            }

            debug!(venue = %self.venue, wait_ms = longest_wait.as_millis() as u64, "rate scheduler waiting for admission");
            drop(buckets);
            sleep(longest_wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_immediately_under_budget() {
        let scheduler = RateScheduler::new("test");
        scheduler
            .register("orders", Window { window: Duration::from_secs(10), limit: 100 })
            .await;

        let weights = HashMap::from([("orders".to_string(), 10)]);
        let start = Instant::now();
        scheduler.admit(&weights).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn eleventh_burst_request_waits_for_window() {
        let scheduler = RateScheduler::new("test");
        scheduler
            .register("orders", Window { window: Duration::from_millis(300), limit: 100 })
            .await;

        let weights = HashMap::from([("orders".to_string(), 10)]);
        let start = Instant::now();
        for _ in 0..10 {
            scheduler.admit(&weights).await.unwrap();
        }
        scheduler.admit(&weights).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn multi_kind_admission_is_atomic() {
        let scheduler = RateScheduler::new("test");
        scheduler
            .register("a", Window { window: Duration::from_secs(10), limit: 5 })
            .await;
        scheduler
            .register("b", Window { window: Duration::from_secs(10), limit: 100 })
            .await;

        let weights = HashMap::from([("a".to_string(), 5), ("b".to_string(), 1)]);
        scheduler.admit(&weights).await.unwrap();

        let buckets = scheduler.buckets.lock().await;
        assert_eq!(buckets["a"].total_spent(), 5);
        assert_eq!(buckets["b"].total_spent(), 1);
    }

    #[tokio::test]
    async fn request_wider_than_window_limit_is_rejected_not_spun_on() {
        let scheduler = RateScheduler::new("test");
        scheduler
            .register("orders", Window { window: Duration::from_secs(10), limit: 5 })
            .await;

        let weights = HashMap::from([("orders".to_string(), 10)]);
        let result = tokio::time::timeout(Duration::from_millis(200), scheduler.admit(&weights)).await;
        match result {
            Ok(Err(Error::RateLimitExhausted { venue, kind })) => {
                assert_eq!(venue, "test");
                assert_eq!(kind, "orders");
            }
            other => panic!("expected immediate RateLimitExhausted, got {other:?}"),
        }
    }
}
