//! OAuth authorization and token-refresh engine for Keystone
//!
//! Runs the interactive OAuth 2.0 authorization code flow with PKCE for
//! the AI providers Keystone connects to, and keeps the resulting tokens
//! fresh in the background.
//!
//! # Features
//! - Authorization code flow with PKCE (S256) and CSRF state binding
//! - One-shot loopback callback server with a human-readable result page
//! - Token exchange, including provider-specific secondary exchange of
//!   the ID token for an API credential
//! - Self-rescheduling per-provider refresh timers
//! - Status broadcast on every flow transition
//!
//! # Usage Example
//! ```no_run
//! use ks_oauth::{CapabilityTable, OAuthService};
//! use ks_types::ProviderId;
//!
//! # async fn example() -> ks_types::AppResult<()> {
//! let service = OAuthService::new(CapabilityTable::builtin());
//! let tokens = service.start_flow(ProviderId::OpenAi).await?;
//! service.schedule_refresh(ProviderId::OpenAi, tokens);
//! # Ok(())
//! # }
//! ```

pub mod browser;
mod callback_server;
pub mod capabilities;
pub mod pkce;
mod refresh;
pub mod service;
pub mod token_exchange;
pub mod types;

pub use browser::{BrowserOpener, SystemBrowser};
pub use capabilities::{CapabilityTable, OAuthCapabilities};
pub use pkce::{generate_pkce_challenge, generate_state, PkceChallenge};
pub use service::OAuthService;
pub use token_exchange::TokenExchanger;
pub use types::{
    CapabilitySummary, OAuthFlowStatus, OAuthTokens, StatusCallback, TokenRefreshCallback,
};
