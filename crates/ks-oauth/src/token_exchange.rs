//! OAuth token exchange and refresh against provider token endpoints

use crate::capabilities::OAuthCapabilities;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use ks_types::{AppError, AppResult, ProviderId};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::types::OAuthTokens;

/// RFC 8693 token-exchange grant type
const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ID_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";

/// Seconds a token lives when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Token response from a provider's token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,

    #[serde(default)]
    refresh_token: Option<String>,

    /// Lifetime in seconds
    #[serde(default)]
    expires_in: Option<i64>,

    #[serde(default)]
    id_token: Option<String>,

    /// Some providers attach an account identifier to the grant
    #[serde(default)]
    account_id: Option<String>,
}

/// Response of the secondary RFC 8693 exchange
#[derive(Debug, Deserialize)]
struct ExchangedCredentialResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Client for authorization-code exchange and refresh-token exchange
pub struct TokenExchanger {
    client: Client,
}

impl TokenExchanger {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Exchange an authorization code (plus PKCE verifier) for tokens.
    ///
    /// When the provider requires it and an ID token was returned, the ID
    /// token is further exchanged for the provider credential; that
    /// credential replaces the access token. Failure of the secondary
    /// exchange fails the whole call, since the flow cannot succeed
    /// without the credential.
    pub async fn exchange_code(
        &self,
        provider: ProviderId,
        capabilities: &OAuthCapabilities,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> AppResult<OAuthTokens> {
        debug!("Exchanging authorization code for {} tokens", provider);

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", capabilities.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];

        let response = self
            .client
            .post(&capabilities.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::oauth(provider, format!("Token exchange failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::oauth(
                provider,
                format!("Token exchange failed: {} {}", status, body),
            ));
        }

        let data: TokenResponse = response.json().await.map_err(|e| {
            AppError::oauth(provider, format!("Malformed token response: {}", e))
        })?;

        let expires_at =
            Utc::now() + Duration::seconds(data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));

        let mut tokens = OAuthTokens {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            id_token: data.id_token,
            expires_at,
            account_id: data.account_id,
            email: None,
        };

        if let Some(ref id_token) = tokens.id_token {
            tokens.email = decode_email_claim(id_token);
        }

        if capabilities.requires_token_exchange {
            if let Some(id_token) = tokens.id_token.clone() {
                match self.exchange_for_credential(capabilities, &id_token).await {
                    Some(credential) => tokens.access_token = credential,
                    None => {
                        return Err(AppError::oauth(
                            provider,
                            "Failed to exchange token for API key. Please try again.",
                        ))
                    }
                }
            }
        }

        info!("Token exchange successful for {}", provider);

        Ok(tokens)
    }

    /// Refresh the token set for a provider.
    ///
    /// Returns `None` when there is nothing to refresh with, the provider
    /// does not support OAuth, or the refresh request fails — refresh
    /// failure is recoverable and must not tear anything down. On success
    /// the account id and email are carried forward from the prior record,
    /// and the refresh/ID tokens are retained when the provider omits new
    /// ones.
    pub async fn refresh(
        &self,
        provider: ProviderId,
        capabilities: &OAuthCapabilities,
        current: &OAuthTokens,
    ) -> Option<OAuthTokens> {
        let refresh_token = current.refresh_token.as_ref()?;
        if !capabilities.supported {
            return None;
        }

        debug!("Refreshing tokens for {}", provider);

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", capabilities.client_id.as_str()),
        ];

        let response = match self
            .client
            .post(&capabilities.token_url)
            .form(&params)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Token refresh request failed for {}: {}", provider, e);
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(
                "Token refresh failed for {} with status {}",
                provider,
                response.status()
            );
            return None;
        }

        let data: TokenResponse = match response.json().await {
            Ok(data) => data,
            Err(e) => {
                warn!("Malformed refresh response for {}: {}", provider, e);
                return None;
            }
        };

        let mut tokens = OAuthTokens {
            access_token: data.access_token,
            refresh_token: data
                .refresh_token
                .or_else(|| Some(refresh_token.clone())),
            id_token: data.id_token.or_else(|| current.id_token.clone()),
            expires_at: Utc::now()
                + Duration::seconds(data.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
            account_id: current.account_id.clone(),
            email: current.email.clone(),
        };

        // Re-exchange the ID token for a fresh provider credential. Unlike
        // the initial flow, failure here is non-fatal: the refreshed OAuth
        // tokens are still usable, just without an updated credential.
        if capabilities.requires_token_exchange {
            if let Some(id_token) = tokens.id_token.clone() {
                if let Some(credential) =
                    self.exchange_for_credential(capabilities, &id_token).await
                {
                    tokens.access_token = credential;
                }
            }
        }

        info!("Token refresh successful for {}", provider);

        Some(tokens)
    }

    /// RFC 8693 token exchange: convert an ID token into the provider's
    /// API credential. Failures are logged and reported as `None`.
    async fn exchange_for_credential(
        &self,
        capabilities: &OAuthCapabilities,
        id_token: &str,
    ) -> Option<String> {
        let params = [
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("client_id", capabilities.client_id.as_str()),
            ("requested_token", "openai-api-key"),
            ("subject_token", id_token),
            ("subject_token_type", ID_TOKEN_TYPE),
        ];

        let response = match self
            .client
            .post(&capabilities.token_url)
            .form(&params)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Credential exchange request failed: {}", e);
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(
                "Credential exchange failed with status {}",
                response.status()
            );
            return None;
        }

        match response.json::<ExchangedCredentialResponse>().await {
            Ok(data) => data.access_token,
            Err(e) => {
                warn!("Malformed credential exchange response: {}", e);
                None
            }
        }
    }
}

impl Default for TokenExchanger {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort extraction of the `email` claim from an ID token payload.
///
/// No signature verification: this is advisory display data, never used
/// for authorization decisions. Any decode failure leaves the email
/// unset.
fn decode_email_claim(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("email")?.as_str().map(str::to_owned)
}
