//! Duplex Gateway Service
//!
//! Hosts a handshake authority behind a websocket endpoint. Phase-1 requests
//! arrive on `/ws`, phase-2 data channels on `/ws?auth=<session key>`. Each
//! websocket is bridged onto an in-process channel pair, so the authority
//! sees the same channels it would see on any other transport.

use anyhow::{Context, bail};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use clap::Parser;
use duplex_core::Secret;
use duplex_handshake::transport::pair;
use duplex_handshake::{Acceptor, Authority, AuthorityConfig, Channel, Frame, HandshakeInfo};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "duplex-gateway")]
#[command(about = "Websocket gateway for the duplex handshake")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8700")]
    listen: SocketAddr,

    /// Secret shared with the identity token issuer
    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    secret: String,

    /// Seconds a pending connection waits for its data channel
    #[arg(long, env = "PENDING_TTL_SECS", default_value_t = 300)]
    pending_ttl_secs: i64,

    /// Lifetime of an issued session key in seconds
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 300)]
    session_ttl_secs: i64,

    /// Seconds a request channel may stay silent
    #[arg(long, default_value_t = 10)]
    request_timeout_secs: u64,

    /// Seconds between sweeps of expired and stale connections
    #[arg(long, env = "PRUNE_INTERVAL_SECS", default_value_t = 60,
          value_parser = clap::value_parser!(u64).range(1..))]
    prune_interval_secs: u64,

    /// Send a generic reason instead of the verification error on rejection
    #[arg(long)]
    hide_rejection_reasons: bool,
}

impl Args {
    fn authority_config(&self) -> anyhow::Result<AuthorityConfig> {
        if self.secret.is_empty() {
            bail!("SECRET_KEY must not be empty");
        }
        if self.pending_ttl_secs <= 0 || self.session_ttl_secs <= 0 {
            bail!("TTLs must be positive");
        }
        Ok(AuthorityConfig::new(Secret::from(self.secret.as_str()))
            .with_pending_ttl(chrono::Duration::seconds(self.pending_ttl_secs))
            .with_session_key_ttl(chrono::Duration::seconds(self.session_ttl_secs))
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_exposed_reasons(!self.hide_rejection_reasons))
    }
}

/// Application state.
#[derive(Clone)]
pub struct AppState {
    authority: Arc<Authority>,
    incoming: mpsc::UnboundedSender<Channel>,
}

/// Channels bridged from upgraded websockets.
pub struct WsAcceptor {
    incoming: mpsc::UnboundedReceiver<Channel>,
}

#[async_trait]
impl Acceptor for WsAcceptor {
    async fn accept(&mut self) -> Option<Channel> {
        self.incoming.recv().await
    }
}

impl AppState {
    pub fn new(authority: Arc<Authority>) -> (Self, WsAcceptor) {
        let (incoming, rx) = mpsc::unbounded_channel();
        (Self { authority, incoming }, WsAcceptor { incoming: rx })
    }
}

// === API Types ===

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pending: usize,
    pub open: usize,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub delivered: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// === Handlers ===

/// Health check endpoint.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok", "service": "duplex-gateway"}))
}

/// Pending and open connection counts.
async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.authority.stats();
    Json(StatsResponse {
        pending: stats.pending,
        open: stats.open,
    })
}

/// Send the request body to every open connection.
async fn broadcast(State(state): State<AppState>, body: String) -> Response {
    if body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Message must not be empty".to_string(),
            }),
        )
            .into_response();
    }

    let delivered = state.authority.broadcast(&body);
    info!("Broadcast delivered to {} connections", delivered);
    Json(BroadcastResponse { delivered }).into_response()
}

/// Close the open connection for a uid.
async fn close_connection(State(state): State<AppState>, Path(uid): Path<String>) -> StatusCode {
    if state.authority.close(&uid) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Websocket upgrade; the query string becomes the handshake parameters.
async fn ws_upgrade(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(query): Query<BTreeMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let info = HandshakeInfo::new(connect_info.map(|ConnectInfo(addr)| addr), query);
    ws.on_upgrade(move |socket| bridge(socket, info, state.incoming))
}

/// Pump frames between a websocket and one end of a channel pair.
async fn bridge(socket: WebSocket, info: HandshakeInfo, incoming: mpsc::UnboundedSender<Channel>) {
    let channel_id = info.channel_id;
    let (local, remote) = pair(info);
    if incoming.send(local).is_err() {
        warn!(channel = %channel_id, "Authority is not accepting connections");
        return;
    }

    let (handle, mut inbound, _) = remote.into_parts();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                match frame.encode() {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(channel = %channel_id, "Dropping outbound frame: {}", e),
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(frame) => {
                        if handle.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!(channel = %channel_id, "Dropping inbound frame: {}", e),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    handle.disconnect();
    let _ = sink.send(Message::Close(None)).await;
    debug!(channel = %channel_id, "Websocket closed");
}

/// Build the router.
fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/broadcast", post(broadcast))
        .route("/connections/:uid", delete(close_connection))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.authority_config()?;

    info!("Starting duplex gateway on {}", args.listen);

    let authority = Arc::new(Authority::new(config));
    let (state, acceptor) = AppState::new(Arc::clone(&authority));
    tokio::spawn(Arc::clone(&authority).serve(acceptor));
    let pruner = authority.spawn_pruner(Duration::from_secs(args.prune_interval_secs));

    let app = build_router(state);
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;

    info!("Duplex gateway listening on {}", args.listen);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    pruner.abort();
    let closed = authority.close_all();
    info!("Shut down, closed {} connections", closed);
    Ok(())
}
