//! Static per-provider OAuth capability configuration
//!
//! The capability table is immutable after construction. The built-in
//! table carries the providers Keystone ships with; tests and embedders
//! can inject their own.

use crate::types::CapabilitySummary;
use ks_types::ProviderId;
use std::collections::HashMap;

/// OAuth configuration for a single provider.
///
/// `callback_port` is `None` for providers that accept any loopback port;
/// some providers only allow-list a fixed port and path for their
/// registered desktop client.
#[derive(Debug, Clone)]
pub struct OAuthCapabilities {
    pub supported: bool,
    /// UI hint only; has no effect on flow behavior
    pub experimental: bool,
    pub client_id: String,
    pub authorization_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    /// Extra query parameters appended to the authorization URL, in order
    pub extra_auth_params: Vec<(String, String)>,
    /// Whether the ID token must be exchanged for a provider credential
    pub requires_token_exchange: bool,
    pub callback_port: Option<u16>,
    /// Must start with `/`
    pub callback_path: String,
}

impl OAuthCapabilities {
    /// Placeholder entry for a provider without OAuth support
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            experimental: false,
            client_id: String::new(),
            authorization_url: String::new(),
            token_url: String::new(),
            scopes: Vec::new(),
            extra_auth_params: Vec::new(),
            requires_token_exchange: false,
            callback_port: None,
            callback_path: "/callback".to_string(),
        }
    }
}

/// Immutable map of provider capabilities, injected at service construction
#[derive(Debug, Clone)]
pub struct CapabilityTable {
    providers: HashMap<ProviderId, OAuthCapabilities>,
}

impl CapabilityTable {
    pub fn new(providers: HashMap<ProviderId, OAuthCapabilities>) -> Self {
        Self { providers }
    }

    /// The capability table Keystone ships with
    pub fn builtin() -> Self {
        let mut providers = HashMap::new();

        // OpenAI's registered desktop client only accepts the fixed
        // loopback redirect, and its access credential is obtained by
        // exchanging the ID token rather than using the raw access token.
        providers.insert(
            ProviderId::OpenAi,
            OAuthCapabilities {
                supported: true,
                experimental: false,
                client_id: "app_EMoamEEZ73f0CkXaXp7hrann".to_string(),
                authorization_url: "https://auth.openai.com/oauth/authorize".to_string(),
                token_url: "https://auth.openai.com/oauth/token".to_string(),
                scopes: vec![
                    "openid".to_string(),
                    "profile".to_string(),
                    "email".to_string(),
                    "offline_access".to_string(),
                ],
                extra_auth_params: Vec::new(),
                requires_token_exchange: true,
                callback_port: Some(1455),
                callback_path: "/auth/callback".to_string(),
            },
        );

        // Google issues a refresh token only with access_type=offline and
        // an explicit consent prompt.
        providers.insert(
            ProviderId::Google,
            OAuthCapabilities {
                supported: true,
                experimental: true,
                client_id: "681255809395-keystone.apps.googleusercontent.com".to_string(),
                authorization_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                scopes: vec![
                    "openid".to_string(),
                    "email".to_string(),
                    "profile".to_string(),
                ],
                extra_auth_params: vec![
                    ("access_type".to_string(), "offline".to_string()),
                    ("prompt".to_string(), "consent".to_string()),
                ],
                requires_token_exchange: false,
                callback_port: None,
                callback_path: "/callback".to_string(),
            },
        );

        // Anthropic access goes through API keys for now
        providers.insert(ProviderId::Anthropic, OAuthCapabilities::unsupported());

        Self::new(providers)
    }

    pub fn get(&self, provider: ProviderId) -> Option<&OAuthCapabilities> {
        self.providers.get(&provider)
    }

    /// Static summary for the UI; no network or state access
    pub fn summary(&self, provider: ProviderId) -> CapabilitySummary {
        match self.providers.get(&provider) {
            Some(caps) => CapabilitySummary {
                supported: caps.supported,
                experimental: caps.experimental,
            },
            None => CapabilitySummary {
                supported: false,
                experimental: false,
            },
        }
    }
}
