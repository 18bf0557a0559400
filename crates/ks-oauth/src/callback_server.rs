//! One-shot loopback server receiving the OAuth authorization redirect
//!
//! The server lives for exactly one flow attempt: it serves the single
//! callback request (404 elsewhere), renders a human-readable result
//! page, routes the outcome to the waiting flow through a take-once
//! channel, and shuts itself down. At most one of these exists per
//! process.

use crate::capabilities::OAuthCapabilities;
use crate::token_exchange::TokenExchanger;
use crate::types::{OAuthFlowStatus, OAuthTokens, StatusBroadcaster};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use ks_types::{AppError, AppResult, ProviderId};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Query parameters the provider may send to the redirect target
#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Everything the callback handler needs to resolve one flow attempt
struct CallbackContext {
    provider: ProviderId,
    capabilities: OAuthCapabilities,
    expected_state: String,
    code_verifier: String,
    redirect_uri: String,
    exchanger: Arc<TokenExchanger>,
    status: StatusBroadcaster,
    /// Take-once settlement guard: whoever takes the sender settles the
    /// flow; every later resolve/reject attempt is a no-op
    outcome: Mutex<Option<oneshot::Sender<AppResult<OAuthTokens>>>>,
    shutdown: watch::Sender<bool>,
}

impl CallbackContext {
    fn settle(&self, result: AppResult<OAuthTokens>) {
        if let Some(tx) = self.outcome.lock().take() {
            let _ = tx.send(result);
        }
    }

    fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Failure path shared by every rejecting branch: emit the error
    /// status, reject the flow, shut the server down, render the page.
    fn reject(&self, message: String) -> Html<String> {
        self.status.emit(OAuthFlowStatus::Error {
            provider: self.provider,
            message: message.clone(),
        });
        let page = callback_page(false, &message);
        self.settle(Err(AppError::oauth(self.provider, message)));
        self.request_shutdown();
        Html(page)
    }
}

/// Handle to the running loopback server for one flow attempt
pub(crate) struct CallbackServer {
    port: u16,
    redirect_uri: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CallbackServer {
    /// Bind the loopback interface and start serving the callback path.
    ///
    /// Uses the provider-mandated fixed port when the capabilities name
    /// one, otherwise an OS-assigned ephemeral port. Returns the server
    /// handle plus the receiver that resolves with the flow outcome.
    pub(crate) async fn start(
        provider: ProviderId,
        capabilities: OAuthCapabilities,
        code_verifier: String,
        expected_state: String,
        exchanger: Arc<TokenExchanger>,
        status: StatusBroadcaster,
    ) -> AppResult<(Self, oneshot::Receiver<AppResult<OAuthTokens>>)> {
        let port = capabilities.callback_port.unwrap_or(0);
        let listener = TcpListener::bind(("127.0.0.1", port)).await.map_err(|e| {
            AppError::oauth(provider, format!("Failed to start loopback server: {}", e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                AppError::oauth(provider, format!("Failed to start loopback server: {}", e))
            })?
            .port();

        let redirect_uri = format!("http://127.0.0.1:{}{}", port, capabilities.callback_path);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let context = Arc::new(CallbackContext {
            provider,
            expected_state,
            code_verifier,
            redirect_uri: redirect_uri.clone(),
            exchanger,
            status,
            outcome: Mutex::new(Some(outcome_tx)),
            shutdown: shutdown_tx.clone(),
            capabilities: capabilities.clone(),
        });

        let app = Router::new()
            .route(&capabilities.callback_path, get(handle_callback))
            .fallback(not_found)
            .with_state(context);

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(e) = server.await {
                error!("Loopback callback server error: {}", e);
            }
        });

        debug!(
            "Loopback callback server for {} listening on 127.0.0.1:{}",
            provider, port
        );

        Ok((
            Self {
                port,
                redirect_uri,
                shutdown: shutdown_tx,
                task,
            },
            outcome_rx,
        ))
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Ask the server to stop without waiting for it
    pub(crate) fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop the server and wait until the socket is released.
    ///
    /// The graceful drain is bounded; a server stuck on an in-flight
    /// request is aborted so the port is always freed.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let abort = self.task.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), self.task)
            .await
            .is_err()
        {
            warn!("Loopback callback server did not drain in time, aborting");
            abort.abort();
        }
    }
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not found")
}

async fn handle_callback(
    State(ctx): State<Arc<CallbackContext>>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    let provider = ctx.provider;

    // A provider error outranks everything else, even a present code
    if let Some(error) = params.error {
        warn!("Authorization for {} denied: {}", provider, error);
        return ctx.reject(format!("Authorization denied: {}", error));
    }

    let code = match params.code {
        Some(code) if params.state.as_deref() == Some(ctx.expected_state.as_str()) => code,
        _ => {
            warn!("Invalid callback parameters for {}", provider);
            return ctx.reject("Invalid callback parameters".to_string());
        }
    };

    info!("Authorization callback received for {}", provider);

    match ctx
        .exchanger
        .exchange_code(
            provider,
            &ctx.capabilities,
            &code,
            &ctx.code_verifier,
            &ctx.redirect_uri,
        )
        .await
    {
        Ok(tokens) => {
            ctx.status.emit(OAuthFlowStatus::Success {
                provider,
                email: tokens.email.clone(),
            });
            let page = callback_page(true, "You can close this tab and return to Keystone.");
            ctx.settle(Ok(tokens));
            ctx.request_shutdown();
            Html(page)
        }
        Err(e) => {
            let message = match e {
                AppError::OAuth { message, .. } => message,
                other => other.to_string(),
            };
            error!("Token exchange failed for {}: {}", provider, message);
            ctx.reject(message)
        }
    }
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#039;")
}

/// Minimal styled result page shown in the user's browser
fn callback_page(success: bool, message: &str) -> String {
    let (icon, heading) = if success {
        ("&#10003;", "Connected!")
    } else {
        ("&#10007;", "Connection Failed")
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <title>Keystone - OAuth</title>
  <style>
    body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', system-ui, sans-serif; display: flex; align-items: center; justify-content: center; min-height: 100vh; margin: 0; background: #1a1a2e; color: #e0e0e0; }}
    .card {{ text-align: center; padding: 2rem; border-radius: 12px; background: #16213e; max-width: 400px; }}
    .icon {{ font-size: 3rem; margin-bottom: 1rem; }}
    h1 {{ font-size: 1.25rem; margin: 0.5rem 0; }}
    p {{ color: #a0a0b0; font-size: 0.9rem; }}
  </style>
</head>
<body>
  <div class="card">
    <div class="icon">{icon}</div>
    <h1>{heading}</h1>
    <p>{message}</p>
  </div>
</body>
</html>"#,
        icon = icon,
        heading = heading,
        message = escape_html(message),
    )
}
