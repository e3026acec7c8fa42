//! HTTP surface of the key issuer: receives Telegram updates (webhook
//! deliveries or `getUpdates` polling), dispatches `/start` and `/getkey`,
//! and replies through the Bot API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use keyminter_config::{Config, Webhook};
use keyminter_contracts::{Update, SECRET_TOKEN_HEADER};
use keyminter_kernel::OsKeySource;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub mod dispatcher;
pub mod gateway;
pub mod issuer;
pub mod poller;
pub mod store;

pub use dispatcher::CommandDispatcher;
pub use gateway::{GatewayError, MessageGateway, TelegramGateway};
pub use issuer::{has_active_key, IssueError, IssueOutcome, KeyIssuer, LookupFailMode};
pub use poller::UpdatePoller;
pub use store::{store_from_config, KeyStore, MemoryKeyStore, RestKeyStore, SqliteKeyStore, StoreError};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let telegram = Arc::new(TelegramGateway::new(
        &cfg.telegram.api_base,
        &cfg.telegram.bot_token,
        Duration::from_millis(cfg.telegram.timeout_ms),
    )?);
    let store = store_from_config(&cfg)?;
    let dispatcher = Arc::new(dispatcher_from_config(&cfg, store)?);
    let public_url = cfg.telegram.public_url.clone();
    let polling = cfg.telegram.polling();
    let mode = cfg.telegram.mode.clone();

    if polling {
        // getUpdates is refused while a webhook is registered
        if let Err(err) = telegram.delete_webhook(false).await {
            warn!(error = %err, "clearing webhook before polling failed; continuing");
        }
    } else if let Some(url) = public_url.as_deref() {
        match telegram.set_webhook(url, cfg.webhook.secret.as_deref()).await {
            Ok(()) => info!(public_url = url, "webhook registered"),
            Err(err) => warn!(error = %err, "webhook registration failed; continuing"),
        }
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let poller = polling.then(|| {
        let poller = UpdatePoller::new(
            telegram.clone(),
            dispatcher.clone(),
            cfg.telegram.poll_timeout_s,
        );
        tokio::spawn(poller.run(stop_rx))
    });

    let app = router(cfg.webhook, dispatcher, telegram.clone());
    info!(%addr, mode = %mode, "keyminter listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stop_tx.send(true);
        })
        .await
        .map_err(|e| format!("serve failed: {e}"))?;

    if let Some(handle) = poller {
        if let Err(err) = handle.await {
            warn!(error = %err, "poller task ended abnormally");
        }
    }
    if !polling && public_url.is_some() {
        match telegram.delete_webhook(true).await {
            Ok(()) => info!("webhook removed"),
            Err(err) => warn!(error = %err, "webhook removal failed"),
        }
    }
    Ok(())
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let store = store_from_config(&cfg)?;
    let gateway = Arc::new(TelegramGateway::new(
        &cfg.telegram.api_base,
        &cfg.telegram.bot_token,
        Duration::from_millis(cfg.telegram.timeout_ms),
    )?);
    build_app_with(cfg, store, gateway)
}

/// Builds the router around caller-supplied store and gateway.
pub fn build_app_with(
    cfg: Config,
    store: Arc<dyn KeyStore>,
    gateway: Arc<dyn MessageGateway>,
) -> Result<Router, String> {
    let dispatcher = Arc::new(dispatcher_from_config(&cfg, store)?);
    Ok(router(cfg.webhook, dispatcher, gateway))
}

fn dispatcher_from_config(
    cfg: &Config,
    store: Arc<dyn KeyStore>,
) -> Result<CommandDispatcher, String> {
    let lookup_fail_mode = LookupFailMode::parse(&cfg.issuer.lookup_fail_mode)?;
    let issuer = KeyIssuer::new(store, Arc::new(OsKeySource), lookup_fail_mode);
    Ok(CommandDispatcher::new(issuer))
}

fn router(
    webhook: Webhook,
    dispatcher: Arc<CommandDispatcher>,
    gateway: Arc<dyn MessageGateway>,
) -> Router {
    let state = AppState {
        webhook: Arc::new(webhook),
        dispatcher,
        gateway,
    };
    Router::new()
        .route("/webhook", post(webhook_handler).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    webhook: Arc<Webhook>,
    dispatcher: Arc<CommandDispatcher>,
    gateway: Arc<dyn MessageGateway>,
}

impl AppState {
    fn secret_accepted(&self, headers: &HeaderMap) -> bool {
        let provided = headers
            .get(SECRET_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if !self.webhook.enforce_secret {
            debug!(
                header_present = provided.is_some(),
                "webhook secret enforcement disabled"
            );
            return true;
        }
        match self.webhook.secret.as_deref() {
            Some(expected) => provided == Some(expected),
            None => false,
        }
    }
}

async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if !state.secret_accepted(&headers) {
        warn!("webhook secret token mismatch");
        return StatusCode::UNAUTHORIZED;
    }

    let update: Update = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "malformed webhook body");
            return StatusCode::BAD_REQUEST;
        }
    };

    state
        .dispatcher
        .respond(&update, state.gateway.as_ref())
        .await;
    StatusCode::OK
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn state(enforce_secret: bool, secret: Option<&str>) -> AppState {
        AppState {
            webhook: Arc::new(Webhook {
                secret: secret.map(|v| v.to_string()),
                enforce_secret,
            }),
            dispatcher: Arc::new(CommandDispatcher::new(KeyIssuer::new(
                Arc::new(MemoryKeyStore::default()),
                Arc::new(OsKeySource),
                LookupFailMode::Allow,
            ))),
            gateway: Arc::new(
                TelegramGateway::new("http://127.0.0.1:1", "t", Duration::from_secs(1)).unwrap(),
            ),
        }
    }

    fn headers(secret: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(v) = secret {
            h.insert(SECRET_TOKEN_HEADER, HeaderValue::from_str(v).unwrap());
        }
        h
    }

    #[test]
    fn secret_checked_when_enforced() {
        let s = state(true, Some("s3cret"));
        assert!(s.secret_accepted(&headers(Some("s3cret"))));
        assert!(!s.secret_accepted(&headers(Some("wrong"))));
        assert!(!s.secret_accepted(&headers(None)));
    }

    #[test]
    fn enforced_without_secret_rejects_everything() {
        let s = state(true, None);
        assert!(!s.secret_accepted(&headers(Some("anything"))));
    }

    #[test]
    fn secret_ignored_when_disabled() {
        let s = state(false, Some("s3cret"));
        assert!(s.secret_accepted(&headers(None)));
        assert!(s.secret_accepted(&headers(Some("wrong"))));
    }
}
