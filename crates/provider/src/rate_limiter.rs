//! Per-channel request budget.
//!
//! Each channel (poll, stream control) owns one [`ChannelRateLimiter`],
//! created once and shared by `Arc` with everything that calls through that
//! channel. Two limits apply together: a `governor` GCRA bucket that smooths
//! bursts per second, and a sliding window capping requests per window.

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use market_data_core::{DataError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

type GovernorLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Burst smoothing rate.
    pub requests_per_second: NonZeroU32,
    /// Length of the sliding window.
    pub window: Duration,
    /// Requests allowed inside one window.
    pub window_budget: u32,
}

impl RateLimiterConfig {
    /// Budget of `requests_per_second` with a one-minute window sized to match.
    #[must_use]
    pub fn per_second(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            requests_per_second: rps,
            window: Duration::from_secs(60),
            window_budget: rps.get().saturating_mul(60),
        }
    }

    #[must_use]
    pub fn with_window(mut self, window: Duration, budget: u32) -> Self {
        self.window = window;
        self.window_budget = budget.max(1);
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::per_second(10)
    }
}

// =============================================================================
// Limiter
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub granted: u64,
    pub throttled: u64,
    pub used_in_window: usize,
    pub window_budget: u32,
}

pub struct ChannelRateLimiter {
    channel: &'static str,
    governor: GovernorLimiter,
    window: Mutex<VecDeque<Instant>>,
    config: RateLimiterConfig,
    granted: AtomicU64,
    throttled: AtomicU64,
}

impl ChannelRateLimiter {
    #[must_use]
    pub fn new(channel: &'static str, config: RateLimiterConfig) -> Self {
        Self {
            channel,
            governor: RateLimiter::direct(Quota::per_second(config.requests_per_second)),
            window: Mutex::new(VecDeque::new()),
            config,
            granted: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    fn prune(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = window.front() {
            if now.saturating_duration_since(oldest) >= self.config.window {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records a request if the window has room, otherwise returns how long
    /// until the oldest entry leaves the window.
    fn reserve_slot(&self) -> std::result::Result<(), Duration> {
        let now = Instant::now();
        let mut window = self.window.lock();
        self.prune(&mut window, now);
        if window.len() < self.config.window_budget as usize {
            window.push_back(now);
            return Ok(());
        }
        let oldest = window.front().copied().unwrap_or(now);
        Err((oldest + self.config.window).saturating_duration_since(now))
    }

    /// Waits until both limits allow one more request.
    pub async fn acquire(&self) {
        loop {
            self.governor.until_ready().await;
            match self.reserve_slot() {
                Ok(()) => {
                    self.granted.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(wait) => {
                    self.throttled.fetch_add(1, Ordering::Relaxed);
                    debug!(channel = self.channel, wait_ms = wait.as_millis() as u64, "Window budget exhausted, waiting");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    /// Takes a slot only if one is available right now.
    pub fn try_acquire(&self) -> bool {
        if self.governor.check().is_err() {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if self.reserve_slot().is_err() {
            self.throttled.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.granted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// # Errors
    /// Returns [`DataError::TransientChannel`] if no slot frees up within `timeout`.
    pub async fn acquire_with_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| {
                DataError::transient(format!(
                    "{} channel rate limit not available within {}ms",
                    self.channel,
                    timeout.as_millis()
                ))
            })
    }

    #[must_use]
    pub fn used_in_window(&self) -> usize {
        let mut window = self.window.lock();
        self.prune(&mut window, Instant::now());
        window.len()
    }

    /// Fraction of the window budget currently consumed.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        self.used_in_window() as f64 / f64::from(self.config.window_budget.max(1))
    }

    #[must_use]
    pub fn channel(&self) -> &'static str {
        self.channel
    }

    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            granted: self.granted.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            used_in_window: self.used_in_window(),
            window_budget: self.config.window_budget,
        }
    }
}
