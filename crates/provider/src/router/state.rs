//! Subscription state machine for one (symbol, data type) key.
//!
//! ```text
//! Unsubscribed --Promote--> Subscribing --Subscribed--> Streaming
//!                           Subscribing --SubscribeFailed--> DegradedPolling
//! Streaming --StreamFailed--> DegradedPolling --ProbeSucceeded--> Streaming
//! Streaming | DegradedPolling --Reclaimed--> Unsubscribed
//! ```

use market_data_core::SubscriptionHandle;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing {
        since: Instant,
    },
    Streaming {
        handle: SubscriptionHandle,
        since: Instant,
    },
    /// Served by polling while recovery probes run in the background.
    DegradedPolling {
        since: Instant,
        failures: u32,
        next_probe_at: Instant,
    },
}

impl SubscriptionState {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Unsubscribed => "UNSUBSCRIBED",
            Self::Subscribing { .. } => "SUBSCRIBING",
            Self::Streaming { .. } => "STREAMING",
            Self::DegradedPolling { .. } => "DEGRADED_POLLING",
        }
    }

    /// Streaming or degraded: a subscription is being held or recovered.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Streaming { .. } | Self::DegradedPolling { .. })
    }

    #[must_use]
    pub const fn handle(&self) -> Option<SubscriptionHandle> {
        match self {
            Self::Streaming { handle, .. } => Some(*handle),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    /// Request frequency crossed the streaming threshold.
    Promote,
    Subscribed(SubscriptionHandle),
    /// Reconnect attempts for the initial subscription were exhausted.
    SubscribeFailed { retry_in: Duration },
    StreamFailed,
    ProbeSucceeded(SubscriptionHandle),
    ProbeFailed { retry_in: Duration },
    /// Frequency stayed low long enough to release the subscription.
    Reclaimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} in state {from}")]
pub struct TransitionError {
    pub from: &'static str,
    pub event: StateEvent,
}

/// Applies `event` to `state` at time `now`.
///
/// # Errors
/// Returns [`TransitionError`] for events that are not valid in `state`.
pub fn transition(
    state: SubscriptionState,
    event: StateEvent,
    now: Instant,
) -> Result<SubscriptionState, TransitionError> {
    use StateEvent as E;
    use SubscriptionState as S;

    let next = match (state, event) {
        (S::Unsubscribed, E::Promote) => S::Subscribing { since: now },

        (S::Subscribing { .. }, E::Subscribed(handle)) => S::Streaming { handle, since: now },
        (S::Subscribing { .. }, E::SubscribeFailed { retry_in }) => S::DegradedPolling {
            since: now,
            failures: 1,
            next_probe_at: now + retry_in,
        },

        (S::Streaming { .. }, E::StreamFailed) => S::DegradedPolling {
            since: now,
            failures: 1,
            next_probe_at: now,
        },

        (S::DegradedPolling { .. }, E::ProbeSucceeded(handle)) => S::Streaming { handle, since: now },
        (
            S::DegradedPolling {
                since, failures, ..
            },
            E::ProbeFailed { retry_in },
        ) => S::DegradedPolling {
            since,
            failures: failures.saturating_add(1),
            next_probe_at: now + retry_in,
        },

        (S::Streaming { .. } | S::DegradedPolling { .. }, E::Reclaimed) => S::Unsubscribed,

        (from, event) => {
            return Err(TransitionError {
                from: from.name(),
                event,
            })
        }
    };
    Ok(next)
}
