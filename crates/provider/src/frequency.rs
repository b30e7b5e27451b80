//! Request-rate estimation over a window sized to the observed requests.
//!
//! The rate is `observations / span`, where span runs from the oldest retained
//! observation to now, clamped to `[min_window, max_window]`. Dividing by a
//! fixed bucket would under-report short bursts.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct FrequencyEstimator {
    observations: VecDeque<Instant>,
    min_window: Duration,
    max_window: Duration,
}

impl FrequencyEstimator {
    #[must_use]
    pub fn new(min_window: Duration, max_window: Duration) -> Self {
        Self {
            observations: VecDeque::new(),
            min_window,
            max_window: max_window.max(min_window),
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.prune(now);
        self.observations.push_back(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.observations.front() {
            if now.saturating_duration_since(oldest) > self.max_window {
                self.observations.pop_front();
            } else {
                break;
            }
        }
    }

    /// Requests per minute as of `now`.
    pub fn rate_per_minute(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let Some(&oldest) = self.observations.front() else {
            return 0.0;
        };
        let span = now
            .saturating_duration_since(oldest)
            .clamp(self.min_window, self.max_window);
        self.observations.len() as f64 * 60.0 / span.as_secs_f64()
    }

    #[must_use]
    pub fn last_seen(&self) -> Option<Instant> {
        self.observations.back().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

impl Default for FrequencyEstimator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_six_in_thirty_seconds_is_twelve_per_minute() {
        let mut estimator = FrequencyEstimator::default();
        let t0 = Instant::now();
        for i in 0..6u64 {
            estimator.record(t0 + Duration::from_secs(i * 5));
        }
        let rate = estimator.rate_per_minute(t0 + Duration::from_secs(30));
        assert!((rate - 12.0).abs() < 0.01, "rate was {rate}");
        // a fixed five-minute bucket would have reported 1.2/min
        assert!(rate > 1.2 * 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_span_clamped_to_min_window() {
        let mut estimator = FrequencyEstimator::default();
        let t0 = Instant::now();
        estimator.record(t0);
        estimator.record(t0 + Duration::from_secs(1));
        let rate = estimator.rate_per_minute(t0 + Duration::from_secs(2));
        assert!((rate - 4.0).abs() < 0.01, "rate was {rate}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_observations_discarded() {
        let mut estimator = FrequencyEstimator::default();
        let t0 = Instant::now();
        for i in 0..10u64 {
            estimator.record(t0 + Duration::from_secs(i));
        }
        let later = t0 + Duration::from_secs(700);
        assert_eq!(estimator.rate_per_minute(later), 0.0);
        assert!(estimator.is_empty());
    }
}
