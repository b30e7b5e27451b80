//! Per (symbol, data type) choice between the push stream and polling.
//!
//! `route` is called on every snapshot request. It feeds the frequency
//! estimator and promotes busy keys to streaming. All network work happens in
//! `tick`, which the maintenance task drives: establishing subscriptions,
//! reconnecting with backoff, probing degraded keys and reclaiming idle ones.
//! Channel failures never leave the router; callers only see the decision.

pub mod state;

use market_data_core::{DataType, RouterConfig, StreamSink, SubscriptionHandle, UpstreamProvider};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::frequency::FrequencyEstimator;
use crate::rate_limiter::ChannelRateLimiter;
pub use state::{transition, StateEvent, SubscriptionState, TransitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Stream,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// A live subscription is delivering updates.
    StreamActive,
    /// Request rate below the streaming threshold.
    LowFrequency,
    /// Promoted; the subscription is being established.
    SubscriptionPending,
    /// The stream failed; polling until a probe succeeds.
    DegradedFallback,
    /// Too many failures for this data type; polling until the cooldown ends.
    RoutingDisabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelDecision {
    pub channel: Channel,
    pub reason: DecisionReason,
    pub fallback_active: bool,
}

impl ChannelDecision {
    const fn poll(reason: DecisionReason, fallback_active: bool) -> Self {
        Self {
            channel: Channel::Poll,
            reason,
            fallback_active,
        }
    }
}

type RouteKey = (String, DataType);

struct RouteEntry {
    state: SubscriptionState,
    frequency: FrequencyEstimator,
    low_since: Option<Instant>,
}

#[derive(Debug, Default)]
struct DataTypeHealth {
    consecutive_failures: u32,
    disabled_until: Option<Instant>,
}

/// Diagnostic view of one routed key.
#[derive(Debug, Clone, Serialize)]
pub struct RouteSnapshot {
    pub symbol: String,
    pub data_type: DataType,
    pub state: &'static str,
    pub rate_per_min: f64,
}

pub struct ChannelRouter {
    config: RouterConfig,
    upstream: Arc<dyn UpstreamProvider>,
    sink: StreamSink,
    limiter: Arc<ChannelRateLimiter>,
    routes: Mutex<HashMap<RouteKey, RouteEntry>>,
    health: Mutex<HashMap<DataType, DataTypeHealth>>,
}

impl ChannelRouter {
    /// `limiter` is the stream channel's budget; it gates subscribe calls.
    #[must_use]
    pub fn new(
        config: RouterConfig,
        upstream: Arc<dyn UpstreamProvider>,
        sink: StreamSink,
        limiter: Arc<ChannelRateLimiter>,
    ) -> Self {
        Self {
            config,
            upstream,
            sink,
            limiter,
            routes: Mutex::new(HashMap::new()),
            health: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Decisions
    // ========================================================================

    /// Records a request for `(symbol, data_type)` and picks its channel.
    pub fn route(&self, symbol: &str, data_type: DataType) -> ChannelDecision {
        let now = Instant::now();
        let disabled = self.is_disabled_at(data_type, now);

        let mut routes = self.routes.lock();
        let entry = routes
            .entry((symbol.to_string(), data_type))
            .or_insert_with(|| RouteEntry {
                state: SubscriptionState::Unsubscribed,
                frequency: FrequencyEstimator::new(self.config.min_window(), self.config.max_window()),
                low_since: None,
            });
        entry.frequency.record(now);
        let rate = entry.frequency.rate_per_minute(now);

        match entry.state {
            SubscriptionState::Streaming { .. } => ChannelDecision {
                channel: Channel::Stream,
                reason: DecisionReason::StreamActive,
                fallback_active: false,
            },
            _ if disabled => ChannelDecision::poll(DecisionReason::RoutingDisabled, true),
            SubscriptionState::Unsubscribed if rate >= self.config.stream_threshold_per_min => {
                if let Ok(next) = transition(entry.state, StateEvent::Promote, now) {
                    entry.state = next;
                }
                info!(symbol, data_type = %data_type, rate_per_min = rate, "Promoting to stream");
                ChannelDecision::poll(DecisionReason::SubscriptionPending, false)
            }
            SubscriptionState::Unsubscribed => ChannelDecision::poll(DecisionReason::LowFrequency, false),
            SubscriptionState::Subscribing { .. } => {
                ChannelDecision::poll(DecisionReason::SubscriptionPending, false)
            }
            SubscriptionState::DegradedPolling { .. } => {
                ChannelDecision::poll(DecisionReason::DegradedFallback, true)
            }
        }
    }

    /// Marks the streaming subscription(s) for `symbols` as failed.
    ///
    /// Affected keys fall back to polling and are reconnected on the next tick.
    pub fn report_stream_failure(&self, data_type: DataType, symbols: &[String], reason: &str) {
        let now = Instant::now();
        let mut failed = 0usize;
        {
            let mut routes = self.routes.lock();
            for symbol in symbols {
                let Some(entry) = routes.get_mut(&(symbol.clone(), data_type)) else {
                    continue;
                };
                if let Ok(next) = transition(entry.state, StateEvent::StreamFailed, now) {
                    entry.state = next;
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            warn!(data_type = %data_type, symbols = failed, reason, "Stream failed, degrading to polling");
            self.record_failure(data_type, now);
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Runs one maintenance pass.
    pub async fn tick(&self) {
        let now = Instant::now();
        self.expire_cooldowns(now);

        let mut reclaim = Vec::new();
        let mut establish = Vec::new();
        let mut probe = Vec::new();
        {
            let mut routes = self.routes.lock();
            // Idle keys with no live subscription carry no state worth keeping.
            routes.retain(|_, entry| {
                entry.frequency.rate_per_minute(now);
                !(entry.state == SubscriptionState::Unsubscribed && entry.frequency.is_empty())
            });
            for (key, entry) in routes.iter_mut() {
                let rate = entry.frequency.rate_per_minute(now);
                if entry.state.is_active() && rate < self.config.reclaim_threshold_per_min {
                    let since = *entry.low_since.get_or_insert(now);
                    if now.saturating_duration_since(since) >= self.config.idle_grace() {
                        reclaim.push((key.clone(), entry.state.handle()));
                        continue;
                    }
                } else {
                    entry.low_since = None;
                }

                match entry.state {
                    SubscriptionState::Subscribing { .. } => establish.push(key.clone()),
                    SubscriptionState::DegradedPolling { next_probe_at, .. } if next_probe_at <= now => {
                        probe.push(key.clone());
                    }
                    _ => {}
                }
            }
        }

        for (key, handle) in reclaim {
            self.reclaim(&key, handle).await;
        }

        for key in establish {
            let event = match self.connect(&key).await {
                Some(handle) => StateEvent::Subscribed(handle),
                None => StateEvent::SubscribeFailed {
                    retry_in: self.config.probe_interval(),
                },
            };
            self.apply(&key, event).await;
        }

        for key in probe {
            let event = match self.connect(&key).await {
                Some(handle) => StateEvent::ProbeSucceeded(handle),
                None => StateEvent::ProbeFailed {
                    retry_in: self.config.probe_interval(),
                },
            };
            self.apply(&key, event).await;
        }
    }

    /// Spawns the maintenance loop. It exits when `stop` is set.
    pub fn spawn_maintenance(self: &Arc<Self>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_ms = router.config.maintenance_interval_ms, "Router maintenance started");
            while !stop.load(Ordering::Relaxed) {
                router.tick().await;
                tokio::time::sleep(router.config.maintenance_interval()).await;
            }
            info!("Router maintenance stopped");
        })
    }

    /// Releases every held subscription.
    pub async fn shutdown(&self) {
        let held: Vec<(RouteKey, Option<SubscriptionHandle>)> = self
            .routes
            .lock()
            .iter()
            .filter(|(_, e)| e.state.is_active())
            .map(|(k, e)| (k.clone(), e.state.handle()))
            .collect();
        for (key, handle) in held {
            self.reclaim(&key, handle).await;
        }
    }

    /// Tier (a): subscribe with exponential backoff up to the attempt limit.
    async fn connect(&self, key: &RouteKey) -> Option<SubscriptionHandle> {
        let (symbol, data_type) = key;
        let symbols = [symbol.clone()];
        let max_attempts = self.config.max_reconnect_attempts.max(1);
        let mut delay = self.config.initial_backoff();

        for attempt in 1..=max_attempts {
            if self.is_disabled_at(*data_type, Instant::now()) {
                debug!(symbol = %symbol, data_type = %data_type, "Routing disabled, skipping subscribe");
                return None;
            }
            self.limiter.acquire().await;
            match self
                .upstream
                .subscribe(*data_type, &symbols, self.sink.clone())
                .await
            {
                Ok(handle) => {
                    self.record_success(*data_type);
                    info!(symbol = %symbol, data_type = %data_type, attempt, "Stream subscribed");
                    return Some(handle);
                }
                Err(e) => {
                    warn!(
                        symbol = %symbol,
                        data_type = %data_type,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Subscribe failed"
                    );
                    self.record_failure(*data_type, Instant::now());
                    if attempt < max_attempts {
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.config.max_backoff().max(Duration::from_millis(1)));
                    }
                }
            }
        }
        None
    }

    async fn apply(&self, key: &RouteKey, event: StateEvent) {
        let now = Instant::now();
        let orphaned = {
            let mut routes = self.routes.lock();
            let Some(entry) = routes.get_mut(key) else {
                return;
            };
            match transition(entry.state, event, now) {
                Ok(next) => {
                    debug!(symbol = %key.0, data_type = %key.1, from = %entry.state, to = %next, "Route transition");
                    entry.state = next;
                    None
                }
                Err(e) => {
                    debug!(symbol = %key.0, data_type = %key.1, error = %e, "Dropped stale route event");
                    match event {
                        StateEvent::Subscribed(h) | StateEvent::ProbeSucceeded(h) => Some(h),
                        _ => None,
                    }
                }
            }
        };
        if let Some(handle) = orphaned {
            if let Err(e) = self.upstream.unsubscribe(handle).await {
                warn!(handle = handle.0, error = %e, "Failed to release orphaned subscription");
            }
        }
    }

    async fn reclaim(&self, key: &RouteKey, handle: Option<SubscriptionHandle>) {
        if let Some(handle) = handle {
            if let Err(e) = self.upstream.unsubscribe(handle).await {
                warn!(symbol = %key.0, data_type = %key.1, error = %e, "Unsubscribe failed");
            }
        }
        let now = Instant::now();
        let mut routes = self.routes.lock();
        if let Some(entry) = routes.get_mut(key) {
            if let Ok(next) = transition(entry.state, StateEvent::Reclaimed, now) {
                info!(symbol = %key.0, data_type = %key.1, "Reclaimed idle subscription");
                entry.state = next;
                entry.low_since = None;
            }
        }
    }

    // ========================================================================
    // Health
    // ========================================================================

    fn record_failure(&self, data_type: DataType, now: Instant) {
        let mut health = self.health.lock();
        let h = health.entry(data_type).or_default();
        h.consecutive_failures = h.consecutive_failures.saturating_add(1);
        if h.consecutive_failures >= self.config.hard_failure_ceiling && h.disabled_until.is_none() {
            h.disabled_until = Some(now + self.config.disabled_cooldown());
            error!(
                data_type = %data_type,
                failures = h.consecutive_failures,
                cooldown_ms = self.config.disabled_cooldown_ms,
                "Routing disabled after repeated stream failures"
            );
        }
    }

    fn record_success(&self, data_type: DataType) {
        if let Some(h) = self.health.lock().get_mut(&data_type) {
            h.consecutive_failures = 0;
        }
    }

    fn expire_cooldowns(&self, now: Instant) {
        for (data_type, h) in self.health.lock().iter_mut() {
            if h.disabled_until.is_some_and(|until| until <= now) {
                info!(data_type = %data_type, "Routing re-enabled after cooldown");
                h.disabled_until = None;
                h.consecutive_failures = 0;
            }
        }
    }

    fn is_disabled_at(&self, data_type: DataType, now: Instant) -> bool {
        self.health
            .lock()
            .get(&data_type)
            .and_then(|h| h.disabled_until)
            .is_some_and(|until| until > now)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    #[must_use]
    pub fn is_routing_disabled(&self, data_type: DataType) -> bool {
        self.is_disabled_at(data_type, Instant::now())
    }

    #[must_use]
    pub fn state_of(&self, symbol: &str, data_type: DataType) -> SubscriptionState {
        self.routes
            .lock()
            .get(&(symbol.to_string(), data_type))
            .map_or(SubscriptionState::Unsubscribed, |e| e.state)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<RouteSnapshot> {
        let now = Instant::now();
        let mut routes = self.routes.lock();
        let mut out: Vec<RouteSnapshot> = routes
            .iter_mut()
            .map(|((symbol, data_type), entry)| RouteSnapshot {
                symbol: symbol.clone(),
                data_type: *data_type,
                state: entry.state.name(),
                rate_per_min: entry.frequency.rate_per_minute(now),
            })
            .collect();
        out.sort_by(|a, b| (&a.symbol, a.data_type).cmp(&(&b.symbol, b.data_type)));
        out
    }
}
