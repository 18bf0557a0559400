//! End-to-end OAuth flow tests
//!
//! Drive real loopback flows: a stubbed browser captures the
//! authorization URL, a reqwest client plays the provider redirect, and
//! wiremock plays the provider token endpoint.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ks_oauth::{
    BrowserOpener, CapabilityTable, OAuthCapabilities, OAuthFlowStatus, OAuthService, OAuthTokens,
};
use ks_types::ProviderId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use wiremock::matchers::{body_string_contains, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Captures authorization URLs instead of opening a browser
#[derive(Default)]
struct RecordingBrowser {
    urls: Mutex<Vec<String>>,
}

impl BrowserOpener for RecordingBrowser {
    fn open(&self, url: &str) {
        self.urls.lock().push(url.to_string());
    }
}

impl RecordingBrowser {
    fn open_count(&self) -> usize {
        self.urls.lock().len()
    }

    async fn wait_for_url(&self, index: usize) -> String {
        for _ in 0..200 {
            if let Some(url) = self.urls.lock().get(index).cloned() {
                return url;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("browser was never opened");
    }
}

fn query_param(url: &str, key: &str) -> String {
    let (_, query) = url.split_once('?').expect("url has no query string");
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return urlencoding::decode(v).expect("invalid urlencoding").into_owned();
            }
        }
    }
    panic!("param {key} not found in {url}");
}

fn single_provider_table(
    provider: ProviderId,
    token_url: String,
    requires_token_exchange: bool,
) -> CapabilityTable {
    let mut providers = HashMap::new();
    providers.insert(
        provider,
        OAuthCapabilities {
            supported: true,
            experimental: false,
            client_id: "test-client".to_string(),
            authorization_url: "https://auth.example.com/authorize".to_string(),
            token_url,
            scopes: vec!["openid".to_string(), "email".to_string()],
            extra_auth_params: Vec::new(),
            requires_token_exchange,
            callback_port: None,
            callback_path: "/auth/callback".to_string(),
        },
    );
    CapabilityTable::new(providers)
}

fn fake_id_token(payload: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.signature", header, body)
}

fn record_statuses(service: &OAuthService) -> Arc<Mutex<Vec<OAuthFlowStatus>>> {
    let statuses: Arc<Mutex<Vec<OAuthFlowStatus>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    service.on_status(Arc::new(move |status| sink.lock().push(status)));
    statuses
}

async fn assert_port_closes(port: u16) {
    for _ in 0..200 {
        if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("port {port} still accepting connections after settlement");
}

#[tokio::test]
async fn flow_with_secondary_exchange_resolves_with_exchanged_credential() {
    let mock = MockServer::start().await;

    let id_token = fake_id_token(serde_json::json!({"email": "dev@example.com"}));
    Mock::given(method("POST"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "raw-oauth-access",
            "refresh_token": "r1",
            "expires_in": 3600,
            "id_token": id_token,
            "account_id": "acct_42"
        })))
        .mount(&mock)
        .await;

    Mock::given(method("POST"))
        .and(body_string_contains("token-exchange"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "sk-exchanged"
        })))
        .mount(&mock)
        .await;

    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::OpenAi, mock.uri(), true),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));
    let statuses = record_statuses(&service);

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::OpenAi).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    assert!(auth_url.starts_with("https://auth.example.com/authorize?"));
    assert_eq!(query_param(&auth_url, "response_type"), "code");
    assert_eq!(query_param(&auth_url, "code_challenge_method"), "S256");
    assert_eq!(query_param(&auth_url, "scope"), "openid email");

    let redirect_uri = query_param(&auth_url, "redirect_uri");
    let state = query_param(&auth_url, "state");
    assert!(redirect_uri.starts_with("http://127.0.0.1:"));
    assert!(redirect_uri.ends_with("/auth/callback"));

    let page = reqwest::get(format!("{redirect_uri}?code=abc&state={state}"))
        .await
        .unwrap();
    assert!(page.status().is_success());
    let body = page.text().await.unwrap();
    assert!(body.contains("Connected!"));

    let tokens = flow.await.unwrap().unwrap();
    // The exchanged credential, not the raw OAuth access token
    assert_eq!(tokens.access_token, "sk-exchanged");
    assert_eq!(tokens.refresh_token.as_deref(), Some("r1"));
    assert_eq!(tokens.account_id.as_deref(), Some("acct_42"));
    assert_eq!(tokens.email.as_deref(), Some("dev@example.com"));

    let statuses = statuses.lock();
    assert!(matches!(statuses[0], OAuthFlowStatus::Pending { .. }));
    match &statuses[1] {
        OAuthFlowStatus::Success { provider, email } => {
            assert_eq!(*provider, ProviderId::OpenAi);
            assert_eq!(email.as_deref(), Some("dev@example.com"));
        }
        other => panic!("expected success status, got {other:?}"),
    }
}

#[tokio::test]
async fn flow_without_secondary_exchange_keeps_raw_access_token() {
    let mock = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.raw",
            "refresh_token": "g-refresh",
            "expires_in": 3599
        })))
        .mount(&mock)
        .await;

    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, mock.uri(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    let redirect_uri = query_param(&auth_url, "redirect_uri");
    let state = query_param(&auth_url, "state");

    reqwest::get(format!("{redirect_uri}?code=abc&state={state}"))
        .await
        .unwrap();

    let tokens = flow.await.unwrap().unwrap();
    assert_eq!(tokens.access_token, "ya29.raw");
    assert!(tokens.email.is_none());
}

#[tokio::test]
async fn denial_rejects_even_with_valid_code() {
    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, "http://127.0.0.1:1/token".to_string(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));
    let statuses = record_statuses(&service);

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    let redirect_uri = query_param(&auth_url, "redirect_uri");
    let state = query_param(&auth_url, "state");

    // `error` outranks the (otherwise valid) code and state
    let page = reqwest::get(format!(
        "{redirect_uri}?error=access_denied&code=abc&state={state}"
    ))
    .await
    .unwrap();
    let body = page.text().await.unwrap();
    assert!(body.contains("Connection Failed"));

    let err = flow.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("Authorization denied: access_denied"));

    let statuses = statuses.lock();
    assert!(matches!(
        statuses.last(),
        Some(OAuthFlowStatus::Error { .. })
    ));
}

#[tokio::test]
async fn state_mismatch_rejects_with_invalid_callback() {
    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, "http://127.0.0.1:1/token".to_string(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    let redirect_uri = query_param(&auth_url, "redirect_uri");

    reqwest::get(format!("{redirect_uri}?code=abc&state=forged"))
        .await
        .unwrap();

    let err = flow.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("Invalid callback parameters"));
}

#[tokio::test]
async fn missing_code_rejects_with_invalid_callback() {
    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, "http://127.0.0.1:1/token".to_string(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    let redirect_uri = query_param(&auth_url, "redirect_uri");
    let state = query_param(&auth_url, "state");

    reqwest::get(format!("{redirect_uri}?state={state}"))
        .await
        .unwrap();

    let err = flow.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("Invalid callback parameters"));
}

#[tokio::test]
async fn non_callback_path_is_404_and_flow_survives() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "a1"
        })))
        .mount(&mock)
        .await;

    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, mock.uri(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    let redirect_uri = query_param(&auth_url, "redirect_uri");
    let state = query_param(&auth_url, "state");
    let base = redirect_uri.trim_end_matches("/auth/callback");

    let response = reqwest::get(format!("{base}/favicon.ico")).await.unwrap();
    assert_eq!(response.status(), 404);

    // The stray request did not settle the flow
    reqwest::get(format!("{redirect_uri}?code=abc&state={state}"))
        .await
        .unwrap();
    let tokens = flow.await.unwrap().unwrap();
    assert_eq!(tokens.access_token, "a1");
}

#[tokio::test]
async fn exchange_failure_rejects_with_upstream_details() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
        .mount(&mock)
        .await;

    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, mock.uri(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    let redirect_uri = query_param(&auth_url, "redirect_uri");
    let state = query_param(&auth_url, "state");

    let page = reqwest::get(format!("{redirect_uri}?code=abc&state={state}"))
        .await
        .unwrap();
    let body = page.text().await.unwrap();
    assert!(body.contains("Connection Failed"));

    let err = flow.await.unwrap().unwrap_err();
    let message = err.to_string();
    assert!(message.contains("400"), "message: {message}");
    assert!(message.contains("invalid_grant"), "message: {message}");
}

#[tokio::test]
async fn server_is_closed_after_settlement() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "a1"
        })))
        .mount(&mock)
        .await;

    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, mock.uri(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };

    let auth_url = browser.wait_for_url(0).await;
    let redirect_uri = query_param(&auth_url, "redirect_uri");
    let state = query_param(&auth_url, "state");
    let port: u16 = redirect_uri
        .trim_start_matches("http://127.0.0.1:")
        .split('/')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    reqwest::get(format!("{redirect_uri}?code=abc&state={state}"))
        .await
        .unwrap();
    flow.await.unwrap().unwrap();

    assert_port_closes(port).await;
}

#[tokio::test]
async fn starting_a_new_flow_cancels_the_previous_one() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "a1"
        })))
        .mount(&mock)
        .await;

    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, mock.uri(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };
    let first_url = browser.wait_for_url(0).await;
    let first_port: u16 = query_param(&first_url, "redirect_uri")
        .trim_start_matches("http://127.0.0.1:")
        .split('/')
        .next()
        .unwrap()
        .parse()
        .unwrap();

    let second = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };
    let second_url = browser.wait_for_url(1).await;

    // The first caller is rejected through the torn-down server
    let err = first.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("cancelled"));
    assert_port_closes(first_port).await;

    // The second flow is fully operational
    let redirect_uri = query_param(&second_url, "redirect_uri");
    let state = query_param(&second_url, "state");
    reqwest::get(format!("{redirect_uri}?code=abc&state={state}"))
        .await
        .unwrap();
    let tokens = second.await.unwrap().unwrap();
    assert_eq!(tokens.access_token, "a1");
}

#[tokio::test]
async fn explicit_cancel_rejects_the_pending_flow() {
    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, "http://127.0.0.1:1/token".to_string(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };
    browser.wait_for_url(0).await;

    service.cancel_flow();

    let err = flow.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("cancelled"));
}

#[tokio::test]
async fn unsupported_provider_rejects_immediately() {
    let browser = Arc::new(RecordingBrowser::default());
    let service = OAuthService::with_browser(
        CapabilityTable::builtin(),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    );
    let statuses = record_statuses(&service);

    let err = service.start_flow(ProviderId::Anthropic).await.unwrap_err();
    assert!(err.to_string().contains("OAuth not supported"));

    // No browser launch, no status transition, no socket
    assert_eq!(browser.open_count(), 0);
    assert!(statuses.lock().is_empty());
}

#[tokio::test]
async fn refresh_timer_lifecycle_through_the_service() {
    let service = OAuthService::new(CapabilityTable::builtin());

    let no_refresh = OAuthTokens {
        access_token: "a1".to_string(),
        refresh_token: None,
        id_token: None,
        expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        account_id: None,
        email: None,
    };
    service.schedule_refresh(ProviderId::Google, no_refresh.clone());
    assert!(!service.has_refresh_timer(ProviderId::Google));

    let with_refresh = OAuthTokens {
        refresh_token: Some("r1".to_string()),
        ..no_refresh
    };
    service.schedule_refresh(ProviderId::Google, with_refresh);
    assert!(service.has_refresh_timer(ProviderId::Google));

    service.clear_refresh_timer(ProviderId::Google);
    assert!(!service.has_refresh_timer(ProviderId::Google));
}

#[tokio::test]
async fn destroy_tears_everything_down() {
    let mock = MockServer::start().await;
    let browser = Arc::new(RecordingBrowser::default());
    let service = Arc::new(OAuthService::with_browser(
        single_provider_table(ProviderId::Google, mock.uri(), false),
        Arc::clone(&browser) as Arc<dyn BrowserOpener>,
    ));

    let flow = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.start_flow(ProviderId::Google).await })
    };
    browser.wait_for_url(0).await;

    service.schedule_refresh(
        ProviderId::Google,
        OAuthTokens {
            access_token: "a1".to_string(),
            refresh_token: Some("r1".to_string()),
            id_token: None,
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            account_id: None,
            email: None,
        },
    );

    service.destroy();

    assert!(flow.await.unwrap().is_err());
    assert!(!service.has_refresh_timer(ProviderId::Google));
}
