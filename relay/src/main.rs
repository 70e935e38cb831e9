//! # Tunnel Gateway
//!
//! A public-internet tunneling gateway: exposes per-tenant subdomains on a
//! shared HTTP(S) host and relays incoming HTTP requests and WebSocket
//! sessions to long-lived tunnel clients connected outbound over a control
//! WebSocket.
//!
//! ## Modules
//!
//! - [`transport`]    — pluggable queue transport (in-memory / Redis pub/sub)
//! - [`registry`]     — tunnel subdomain registry
//! - [`correlator`]   — request/response correlation over the transport
//! - [`http_ingress`] — HTTP request/response translation
//! - [`ws_ingress`]   — WebSocket connect/message/disconnect proxy
//! - [`control`]      — the tunnel client's control WebSocket
//! - [`config`]       — environment configuration

mod config;
mod control;
mod correlator;
mod http_ingress;
mod registry;
mod transport;
mod ws_ingress;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequest, State};
use axum::http::{header, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use tracing::info;
use uuid::Uuid;

use config::Config;
use correlator::RequestCorrelator;
use registry::TunnelRegistry;
use transport::Transport;

#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<TunnelRegistry>,
    pub correlator: Arc<RequestCorrelator>,
    pub config: Arc<Config>,
}

/// A fresh, per-exchange correlation id (invariant 3: unique per tunnel
/// for the lifetime of the exchange).
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("tunnelgate_relay={}", config.log_level).into()),
        )
        .init();

    let transport = transport::select(config.redis_url.as_deref()).await?;
    let transport: Arc<dyn Transport> = Arc::from(transport);
    let registry = Arc::new(TunnelRegistry::new(transport.clone()));
    let correlator = Arc::new(RequestCorrelator::new(transport.clone()));

    let state = AppState {
        transport,
        registry,
        correlator,
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/health/", get(health_handler))
        .route("/tunnel/", get(tunnel_handler))
        .fallback(any(fallback))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!(domain = %config.tunnel_domain, %addr, "tunnel gateway listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// `GET /health/` → 200 `OK` (§6).
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// `WebSocket /tunnel/` → control session (§6, §4.F).
async fn tunnel_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| control::handle_socket(socket, state))
}

/// Everything else: HTTP ingress, or WebSocket ingress if the request
/// carries an `Upgrade: websocket` header (§4.D, §4.E).
async fn fallback(State(state): State<AppState>, req: Request<Body>) -> axum::response::Response {
    let is_websocket_upgrade = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_websocket_upgrade {
        return http_ingress::handle(&state, req).await;
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let subdomain = http_ingress::subdomain_from_host(&host).to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    let (parts, body) = req.into_parts();
    let req = Request::from_parts(parts, body);

    match WebSocketUpgrade::from_request(req, &state).await {
        Ok(ws) => ws_ingress::accept(ws, state, subdomain, path, headers).await,
        Err(rejection) => rejection.into_response(),
    }
}
