//! Background token-refresh scheduling
//!
//! One timer per provider, armed against a token snapshot. A fired timer
//! refreshes, hands the new tokens to the registered callback, and
//! re-arms itself with the new snapshot; on failure it emits an error
//! status and stops, leaving the provider to a fresh interactive flow.
//! There is deliberately no retry or backoff.

use crate::capabilities::CapabilityTable;
use crate::token_exchange::TokenExchanger;
use crate::types::{OAuthFlowStatus, OAuthTokens, StatusBroadcaster, TokenRefreshCallback};
use chrono::{DateTime, Utc};
use ks_types::ProviderId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long before expiry a refresh fires
const REFRESH_LEAD_SECS: i64 = 5 * 60;

/// Floor on the delay, so near-expired tokens don't refresh in a tight loop
const MIN_REFRESH_DELAY_SECS: i64 = 10;

/// Delay until the refresh for a token set should fire:
/// `max(expires_at - 5min, now + 10s)` relative to `now`.
fn refresh_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let secs = (expires_at - now).num_seconds() - REFRESH_LEAD_SECS;
    Duration::from_secs(secs.max(MIN_REFRESH_DELAY_SECS) as u64)
}

struct TimerEntry {
    /// Identifies which armed task owns the map slot, so a finished task
    /// never removes a successor's entry
    generation: u64,
    handle: JoinHandle<()>,
}

struct RefreshInner {
    timers: Mutex<HashMap<ProviderId, TimerEntry>>,
    next_generation: AtomicU64,
    exchanger: Arc<TokenExchanger>,
    capabilities: Arc<CapabilityTable>,
    status: StatusBroadcaster,
    on_refresh: RwLock<Option<TokenRefreshCallback>>,
}

/// Per-provider refresh timers with self-rescheduling on success
#[derive(Clone)]
pub(crate) struct RefreshScheduler {
    inner: Arc<RefreshInner>,
}

impl RefreshScheduler {
    pub(crate) fn new(
        exchanger: Arc<TokenExchanger>,
        capabilities: Arc<CapabilityTable>,
        status: StatusBroadcaster,
    ) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                timers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                exchanger,
                capabilities,
                status,
                on_refresh: RwLock::new(None),
            }),
        }
    }

    pub(crate) fn set_refresh_callback(&self, callback: TokenRefreshCallback) {
        *self.inner.on_refresh.write() = Some(callback);
    }

    /// Arm (or re-arm) the refresh timer for a provider.
    ///
    /// Replaces any existing timer for that provider. A token set without
    /// a refresh token arms nothing — there is nothing to refresh with.
    pub(crate) fn schedule(&self, provider: ProviderId, tokens: OAuthTokens) {
        arm(&self.inner, provider, tokens);
    }

    /// Disarm the timer for a provider, cancelling any in-flight
    /// scheduled continuation
    pub(crate) fn clear(&self, provider: ProviderId) {
        if clear_entry(&self.inner, provider) {
            debug!("Cleared refresh timer for {}", provider);
        }
    }

    /// Disarm every timer (process teardown)
    pub(crate) fn clear_all(&self) {
        let mut timers = self.inner.timers.lock();
        for (_, entry) in timers.drain() {
            entry.handle.abort();
        }
    }

    pub(crate) fn has_timer(&self, provider: ProviderId) -> bool {
        self.inner.timers.lock().contains_key(&provider)
    }

    #[cfg(test)]
    fn timer_count(&self) -> usize {
        self.inner.timers.lock().len()
    }
}

/// Remove and abort the timer entry for a provider, if any
fn clear_entry(inner: &Arc<RefreshInner>, provider: ProviderId) -> bool {
    match inner.timers.lock().remove(&provider) {
        Some(entry) => {
            entry.handle.abort();
            true
        }
        None => false,
    }
}

fn arm(inner: &Arc<RefreshInner>, provider: ProviderId, tokens: OAuthTokens) {
    clear_entry(inner, provider);

    if tokens.refresh_token.is_none() {
        debug!("No refresh token for {}, not scheduling refresh", provider);
        return;
    }

    let delay = refresh_delay(tokens.expires_at, Utc::now());
    let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);

    debug!(
        "Scheduling token refresh for {} in {}s",
        provider,
        delay.as_secs()
    );

    let task_inner = Arc::clone(inner);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fire(task_inner, provider, tokens, generation).await;
    });

    inner
        .timers
        .lock()
        .insert(provider, TimerEntry { generation, handle });
}

/// One refresh attempt. Success hands the new tokens to the refresh
/// callback and re-arms with the new snapshot; failure emits an error
/// status and leaves the provider unscheduled.
async fn fire(inner: Arc<RefreshInner>, provider: ProviderId, tokens: OAuthTokens, generation: u64) {
    debug!("Refresh timer fired for {}", provider);

    let refreshed = match inner.capabilities.get(provider) {
        Some(caps) => inner.exchanger.refresh(provider, caps, &tokens).await,
        None => None,
    };

    match refreshed {
        Some(new_tokens) => {
            info!("Background token refresh succeeded for {}", provider);
            let callback = inner.on_refresh.read().clone();
            if let Some(callback) = callback {
                callback(provider, new_tokens.clone());
            }
            arm(&inner, provider, new_tokens);
        }
        None => {
            warn!("Background token refresh failed for {}", provider);
            inner.status.emit(OAuthFlowStatus::Error {
                provider,
                message: "Token refresh failed. Please sign in again.".to_string(),
            });
            let mut timers = inner.timers.lock();
            if timers.get(&provider).map(|e| e.generation) == Some(generation) {
                timers.remove(&provider);
            }
        }
    }
}
