use crate::config::Config;
use crate::error::WebhookError;
use crate::notifier::{format_message, Notifier};
use crate::rate_limit::RateLimiter;
use crate::store::NotificationStore;
use crate::telegram::{ChatApi, TelegramClient};
use crate::validation::validate;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_server::tls_rustls::RustlsConfig;
use constant_time_eq::constant_time_eq;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::{any::Any, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::{catch_panic::CatchPanicLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;
// backstop only; the handler enforces MAX_BODY_BYTES after the rate check
const BODY_LIMIT_BACKSTOP: usize = 1024 * 1024;
const MAX_CONCURRENT_DELIVERIES: usize = 8;
const API_KEY_HEADER: &str = "API-Key";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub store: NotificationStore,
    pub notifier: Notifier,
    pub limiter: Arc<RateLimiter>,
    pub api_key_digest: Vec<u8>,
    pub in_flight: Arc<Semaphore>,
    pub deliveries: Arc<Semaphore>,
    pub trust_proxy_headers: bool,
}

impl AppState {
    pub fn new(config: &Config, store: NotificationStore, chat: Arc<dyn ChatApi>) -> Self {
        Self {
            store,
            notifier: Notifier::new(chat, config.notify_max_attempts),
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_requests,
                config.rate_limit_window,
            )),
            api_key_digest: Sha256::digest(config.api_key.as_bytes()).to_vec(),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
            deliveries: Arc::new(Semaphore::new(MAX_CONCURRENT_DELIVERIES)),
            trust_proxy_headers: config.trust_proxy_headers,
        }
    }
}

pub async fn run_server(config: Config) -> Result<()> {
    let store = NotificationStore::new(&config.db_path);
    store
        .ensure_schema()
        .await
        .with_context(|| format!("Failed to prepare database {:?}", config.db_path))?;
    let existing = store.count().await.context("Failed to read notification count")?;
    info!(
        "Database {:?} ready ({} stored notifications)",
        config.db_path, existing
    );

    let chat: Arc<dyn ChatApi> =
        Arc::new(TelegramClient::new(&config).context("Failed to build Telegram client")?);
    let state = AppState::new(&config, store, chat);
    spawn_rate_limit_sweeper(state.limiter.clone());

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let addr = config.bind_addr()?;

    match choose_transport(load_tls_config(&config).await, config.allow_insecure_http)? {
        Transport::Tls(tls) => {
            info!("Listening on https://{}", addr);
            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });
            axum_server::bind_rustls(addr, tls)
                .handle(handle)
                .serve(app)
                .await
                .context("HTTPS server failed")?;
        }
        Transport::PlainHttp => {
            warn!(
                "Serving plain HTTP on {}. API keys travel unencrypted!",
                addr
            );
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
                .context("HTTP server failed")?;
        }
    }
    info!("Server stopped");
    Ok(())
}

enum Transport {
    Tls(RustlsConfig),
    PlainHttp,
}

/// Plain HTTP is only ever an explicit opt-in; without it a TLS failure is fatal.
fn choose_transport(tls: Result<RustlsConfig>, allow_insecure_http: bool) -> Result<Transport> {
    match tls {
        Ok(tls) => Ok(Transport::Tls(tls)),
        Err(e) if allow_insecure_http => {
            warn!("TLS unavailable: {:#}", e);
            warn!("ALLOW_INSECURE_HTTP is set: falling back to plain HTTP");
            Ok(Transport::PlainHttp)
        }
        Err(e) => Err(e.context(
            "TLS certificates could not be loaded; set ALLOW_INSECURE_HTTP=true to serve plain HTTP",
        )),
    }
}

async fn load_tls_config(config: &Config) -> Result<RustlsConfig> {
    for path in [&config.ssl_cert_path, &config.ssl_key_path] {
        if !path.exists() {
            anyhow::bail!("TLS file not found: {:?}", path);
        }
    }
    RustlsConfig::from_pem_file(&config.ssl_cert_path, &config.ssl_key_path)
        .await
        .with_context(|| {
            format!(
                "Failed to load TLS certificate {:?} / key {:?}",
                config.ssl_cert_path, config.ssl_key_path
            )
        })
}

fn spawn_rate_limit_sweeper(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limiter.window());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            limiter.evict_stale().await;
        }
    });
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(health))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT_BACKSTOP))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn handle_webhook(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let peer = connect_info.map(|ConnectInfo(addr)| addr);
    let client = client_id(&headers, peer, state.trust_proxy_headers);

    match accept_webhook(&state, &client, &headers, &body).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(err) => {
            match &err {
                WebhookError::Storage(_) | WebhookError::Internal(_) => {
                    error!(client = %client, "Webhook failed: {}", err)
                }
                _ => warn!(client = %client, "Webhook rejected: {}", err),
            }
            err.into_response()
        }
    }
}

/// Runs one request through admission, auth, validation and persistence, then
/// hands the chat delivery to a background task.
async fn accept_webhook(
    state: &AppState,
    client: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), WebhookError> {
    let _permit = state
        .in_flight
        .clone()
        .try_acquire_owned()
        .map_err(|_| WebhookError::Unavailable)?;

    if !state.limiter.check(client).await {
        return Err(WebhookError::RateLimited);
    }

    if body.len() > MAX_BODY_BYTES {
        return Err(WebhookError::PayloadTooLarge(body.len()));
    }

    if !verify_api_key(headers, &state.api_key_digest) {
        return Err(WebhookError::Unauthorized);
    }

    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(WebhookError::InvalidJson)?;
    let notification = validate(&payload).map_err(WebhookError::Validation)?;

    let text = format_message(&notification);
    let service = notification.service.clone();
    let is_error = notification.error;
    let id = state.store.insert(notification).await?;
    info!(client = %client, id, service = %service, error = is_error, "Stored notification");

    spawn_delivery(state, client, id, text);
    Ok(())
}

/// Starts a delivery only when a delivery slot is free. The row is already
/// committed, so a full queue drops the chat copy, not the notification.
fn spawn_delivery(state: &AppState, client: &str, id: i64, text: String) {
    let permit: OwnedSemaphorePermit = match state.deliveries.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => {
            error!(
                id,
                client = %client,
                "Delivery queue full, notification stored but not forwarded"
            );
            return;
        }
    };
    let notifier = state.notifier.clone();
    tokio::spawn(async move {
        let _permit = permit;
        if !notifier.send(&text).await {
            error!(id, "Notification stored but not delivered to chat");
        }
    });
}

fn verify_api_key(headers: &HeaderMap, expected_digest: &[u8]) -> bool {
    let Some(provided) = headers.get(API_KEY_HEADER) else {
        debug!("Request without {} header", API_KEY_HEADER);
        return false;
    };
    let provided_digest = Sha256::digest(provided.as_bytes());
    constant_time_eq(&provided_digest, expected_digest)
}

fn client_id(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers {
        let forwarded = headers
            .get("cf-connecting-ip")
            .or_else(|| headers.get("x-real-ip"))
            .or_else(|| headers.get("x-forwarded-for"))
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    let err = WebhookError::Internal(detail);
    error!("Handler panicked: {}", err);
    err.into_response()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        term.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Shutdown signal received (Ctrl+C)");
        }
        _ = terminate => {
            info!("Shutdown signal received (SIGTERM)");
        }
    }
}
