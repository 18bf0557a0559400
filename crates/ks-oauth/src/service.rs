//! OAuth flow orchestration
//!
//! `OAuthService` owns the capability table, the loopback callback
//! server, the token exchanger, and the refresh scheduler. It runs the
//! interactive authorization flow end to end and exposes the refresh
//! lifecycle to the host. Exactly one flow is active per process at a
//! time; starting a new flow tears down the previous one.

use crate::browser::{BrowserOpener, SystemBrowser};
use crate::callback_server::CallbackServer;
use crate::capabilities::{CapabilityTable, OAuthCapabilities};
use crate::pkce::{generate_pkce_challenge, generate_state};
use crate::refresh::RefreshScheduler;
use crate::token_exchange::TokenExchanger;
use crate::types::{
    CapabilitySummary, OAuthFlowStatus, OAuthTokens, StatusBroadcaster, StatusCallback,
    TokenRefreshCallback,
};
use ks_types::{AppError, AppResult, ProviderId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Overall flow timeout (5 minutes from flow start)
const FLOW_TIMEOUT_SECS: u64 = 300;

struct ActiveFlow {
    /// Distinguishes this flow from a successor that may have replaced it
    id: u64,
    server: CallbackServer,
}

/// Orchestrates interactive OAuth flows and background token refresh
pub struct OAuthService {
    capabilities: Arc<CapabilityTable>,
    exchanger: Arc<TokenExchanger>,
    scheduler: RefreshScheduler,
    browser: Arc<dyn BrowserOpener>,
    status: StatusBroadcaster,
    active_flow: Mutex<Option<ActiveFlow>>,
    next_flow_id: AtomicU64,
}

impl OAuthService {
    /// Create a service over the given capability table, opening
    /// authorization URLs in the system browser
    pub fn new(capabilities: CapabilityTable) -> Self {
        Self::with_browser(capabilities, Arc::new(SystemBrowser))
    }

    /// Create a service with a custom browser opener (tests, embedders)
    pub fn with_browser(capabilities: CapabilityTable, browser: Arc<dyn BrowserOpener>) -> Self {
        let capabilities = Arc::new(capabilities);
        let exchanger = Arc::new(TokenExchanger::new());
        let status = StatusBroadcaster::default();
        let scheduler = RefreshScheduler::new(
            Arc::clone(&exchanger),
            Arc::clone(&capabilities),
            status.clone(),
        );

        Self {
            capabilities,
            exchanger,
            scheduler,
            browser,
            status,
            active_flow: Mutex::new(None),
            next_flow_id: AtomicU64::new(0),
        }
    }

    /// Subscribe to flow-status transitions
    pub fn on_status(&self, callback: StatusCallback) {
        self.status.subscribe(callback);
    }

    /// Register the callback invoked when a background refresh succeeds
    pub fn on_token_refresh(&self, callback: TokenRefreshCallback) {
        self.scheduler.set_refresh_callback(callback);
    }

    /// Static capability summary for the UI; no network or state access
    pub fn get_capabilities(&self, provider: ProviderId) -> CapabilitySummary {
        self.capabilities.summary(provider)
    }

    /// Run the interactive authorization flow for a provider.
    ///
    /// Suspends until the browser redirect lands on the loopback server,
    /// the user denies, the callback is malformed, the exchange fails, or
    /// the 5-minute timeout elapses — whichever comes first, exactly once.
    /// Any previously active flow is torn down before the new server
    /// binds.
    pub async fn start_flow(&self, provider: ProviderId) -> AppResult<OAuthTokens> {
        let caps = match self.capabilities.get(provider) {
            Some(caps) if caps.supported => caps.clone(),
            _ => {
                return Err(AppError::oauth(
                    provider,
                    "OAuth not supported for this provider",
                ))
            }
        };

        self.teardown_active_flow().await;

        info!("Starting OAuth flow for {}", provider);
        self.status.emit(OAuthFlowStatus::Pending { provider });

        let pkce = generate_pkce_challenge();
        let state = generate_state();

        let (server, outcome_rx) = match CallbackServer::start(
            provider,
            caps.clone(),
            pkce.code_verifier.clone(),
            state.clone(),
            Arc::clone(&self.exchanger),
            self.status.clone(),
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                self.status.emit(OAuthFlowStatus::Error {
                    provider,
                    message: oauth_message(&e),
                });
                return Err(e);
            }
        };

        let auth_url =
            build_authorization_url(&caps, server.redirect_uri(), &pkce.code_challenge, &state);

        let flow_id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        *self.active_flow.lock() = Some(ActiveFlow {
            id: flow_id,
            server,
        });

        debug!("Opening browser for {} authorization", provider);
        self.browser.open(&auth_url);

        match tokio::time::timeout(Duration::from_secs(FLOW_TIMEOUT_SECS), outcome_rx).await {
            Ok(Ok(outcome)) => {
                // The handler settled and already signalled shutdown; wait
                // until the socket is actually released before returning.
                if let Some(server) = self.take_active_if(flow_id) {
                    server.shutdown().await;
                }
                outcome
            }
            Ok(Err(_)) => {
                // Settlement channel dropped without a result: the flow
                // was cancelled out from under this caller.
                debug!("OAuth flow for {} cancelled", provider);
                Err(AppError::oauth(provider, "Authorization flow cancelled"))
            }
            Err(_) => {
                warn!(
                    "OAuth flow for {} timed out after {}s",
                    provider, FLOW_TIMEOUT_SECS
                );
                self.status.emit(OAuthFlowStatus::Error {
                    provider,
                    message: "Authorization timed out".to_string(),
                });
                if let Some(server) = self.take_active_if(flow_id) {
                    server.shutdown().await;
                }
                Err(AppError::oauth(provider, "Authorization timed out"))
            }
        }
    }

    /// One refresh-token exchange for a provider; `None` when there is
    /// nothing to refresh with or the attempt failed (recoverable)
    pub async fn refresh_token(
        &self,
        provider: ProviderId,
        current: &OAuthTokens,
    ) -> Option<OAuthTokens> {
        let caps = self.capabilities.get(provider)?;
        self.exchanger.refresh(provider, caps, current).await
    }

    /// Arm (or re-arm) the background refresh timer for a provider
    pub fn schedule_refresh(&self, provider: ProviderId, tokens: OAuthTokens) {
        self.scheduler.schedule(provider, tokens);
    }

    /// Disarm the refresh timer for a provider (disconnect)
    pub fn clear_refresh_timer(&self, provider: ProviderId) {
        self.scheduler.clear(provider);
    }

    /// Whether a refresh timer is currently armed for a provider
    pub fn has_refresh_timer(&self, provider: ProviderId) -> bool {
        self.scheduler.has_timer(provider)
    }

    /// Tear down any active flow server. Pending `start_flow` callers are
    /// rejected through the server's own settlement channel closing.
    pub fn cancel_flow(&self) {
        if let Some(flow) = self.active_flow.lock().take() {
            info!("Cancelling active OAuth flow");
            flow.server.signal_shutdown();
        }
    }

    /// Process-teardown hook: close the active server and drop every
    /// refresh timer
    pub fn destroy(&self) {
        self.cancel_flow();
        self.scheduler.clear_all();
    }

    async fn teardown_active_flow(&self) {
        let server = self.active_flow.lock().take().map(|flow| flow.server);
        if let Some(server) = server {
            debug!("Tearing down previous OAuth flow server");
            server.shutdown().await;
        }
    }

    /// Take the active server only if it still belongs to `flow_id`
    fn take_active_if(&self, flow_id: u64) -> Option<CallbackServer> {
        let mut guard = self.active_flow.lock();
        if guard.as_ref().map(|flow| flow.id) == Some(flow_id) {
            guard.take().map(|flow| flow.server)
        } else {
            None
        }
    }
}

fn oauth_message(error: &AppError) -> String {
    match error {
        AppError::OAuth { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Authorization URL the browser is sent to
fn build_authorization_url(
    caps: &OAuthCapabilities,
    redirect_uri: &str,
    code_challenge: &str,
    state: &str,
) -> String {
    let mut url = format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&state={}&code_challenge={}&code_challenge_method=S256",
        caps.authorization_url,
        urlencoding::encode(&caps.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );

    if !caps.scopes.is_empty() {
        let scopes = caps.scopes.join(" ");
        url.push_str(&format!("&scope={}", urlencoding::encode(&scopes)));
    }

    for (key, value) in &caps.extra_auth_params {
        url.push_str(&format!(
            "&{}={}",
            urlencoding::encode(key),
            urlencoding::encode(value)
        ));
    }

    url
}
