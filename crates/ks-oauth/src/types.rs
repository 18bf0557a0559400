//! Token and flow-status types shared across the OAuth engine

use chrono::{DateTime, Utc};
use ks_types::ProviderId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Callback invoked on every flow-status transition
pub type StatusCallback = Arc<dyn Fn(OAuthFlowStatus) + Send + Sync>;

/// Callback invoked whenever a background token refresh succeeds,
/// so the host can persist the update and reconfigure the live provider
/// client.
pub type TokenRefreshCallback = Arc<dyn Fn(ProviderId, OAuthTokens) + Send + Sync>;

/// Tokens obtained from a completed authorization or refresh.
///
/// For providers that require a secondary token exchange, `access_token`
/// holds the *exchanged* credential, not the raw OAuth access token.
/// `id_token` is retained only so the credential can be re-exchanged on
/// refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Absolute expiry instant of the access credential
    pub expires_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    /// Best-effort, parsed from the ID token payload; display data only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Transient flow status, broadcast to subscribers and never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OAuthFlowStatus {
    Idle,

    Pending {
        provider: ProviderId,
    },

    Success {
        provider: ProviderId,
        #[serde(skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },

    Error {
        provider: ProviderId,
        message: String,
    },
}

/// What the UI needs to know about a provider before offering OAuth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySummary {
    pub supported: bool,
    pub experimental: bool,
}

/// Fan-out of status transitions to every registered subscriber
#[derive(Clone, Default)]
pub(crate) struct StatusBroadcaster {
    subscribers: Arc<RwLock<Vec<StatusCallback>>>,
}

impl StatusBroadcaster {
    pub(crate) fn subscribe(&self, callback: StatusCallback) {
        self.subscribers.write().push(callback);
    }

    pub(crate) fn emit(&self, status: OAuthFlowStatus) {
        let subscribers = self.subscribers.read();
        for callback in subscribers.iter() {
            callback(status.clone());
        }
    }
}
