//! Call Relay Server
//!
//! Presence and call-signaling relay for browser peers. Peers register over a
//! WebSocket, see who else is online, ring each other, and exchange opaque
//! WebRTC negotiation payloads through the relay. Media never passes through
//! the server.
//!
//! ## Architecture
//!
//! ```text
//! Peer A ──WebSocket──┐
//!                     ├── Relay Server ── AccountStore (SQLite, optional)
//! Peer B ──WebSocket──┘        │
//!                         Liveness monitor
//! ```

mod accounts;
mod call;
mod handler;
mod liveness;
mod pending;
mod protocol;
mod registry;
mod state;

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use accounts::{run_blocking, AccountStore, Detached, SqliteAccounts};
use protocol::PeerId;
use state::{RelayConfig, RelayState};

/// Call history rows returned when `limit` is not given.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound on `limit` for call history.
const MAX_HISTORY_LIMIT: usize = 500;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "callrelay", about = "Presence and call-signaling relay")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 3000, env = "RELAY_PORT")]
    port: u16,

    /// Seconds without a heartbeat before a peer is considered gone
    #[arg(long, default_value_t = 30, env = "HEARTBEAT_TIMEOUT_SECS")]
    heartbeat_timeout_secs: u64,

    /// Liveness sweep interval in seconds
    #[arg(long, default_value_t = 60, env = "SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: u64,

    /// Maximum buffered signals per peer
    #[arg(long, default_value_t = 256, env = "MAX_PENDING_SIGNALS")]
    max_pending_signals: usize,

    /// Maximum number of distinct peers with buffered signals
    #[arg(long, default_value_t = 1024, env = "MAX_PENDING_TARGETS")]
    max_pending_targets: usize,

    /// Buffered signal lifetime in seconds
    #[arg(long, default_value_t = 300, env = "PENDING_TTL_SECS")]
    pending_ttl_secs: u64,

    /// SQLite database for accounts and the call log.
    /// Without it the relay runs detached: no tokens, nothing persisted.
    #[arg(long, env = "RELAY_DATABASE")]
    database: Option<String>,

    /// Refuse WebSocket connections that do not carry a session token
    #[arg(long, default_value_t = false, env = "RELAY_REQUIRE_TOKEN")]
    require_token: bool,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            port: self.port,
            heartbeat_timeout_secs: self.heartbeat_timeout_secs,
            sweep_interval_secs: self.sweep_interval_secs,
            max_pending_per_peer: self.max_pending_signals,
            max_pending_targets: self.max_pending_targets,
            pending_ttl_secs: self.pending_ttl_secs,
            require_token: self.require_token,
            database_path: self.database,
        }
    }
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callrelay=info,tower_http=info".into()),
        )
        .init();

    let config = Args::parse().into_config();
    let port = config.port;

    let accounts: Arc<dyn AccountStore> = match config.database_path.as_deref() {
        Some(path) => Arc::new(
            SqliteAccounts::open(Some(path)).expect("Failed to open account database"),
        ),
        None => {
            tracing::info!("No database configured, running detached");
            Arc::new(Detached)
        }
    };

    let state = RelayState::with_accounts(config, accounts);

    tokio::spawn(liveness::run(state.clone()));

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Call relay server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server error");
}

fn build_router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/calls", get(calls_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Resolve the identity a connection will run under. `Ok(None)` means an
/// anonymous peer with a minted id.
async fn authenticate(
    state: &RelayState,
    token: Option<String>,
) -> Result<Option<PeerId>, &'static str> {
    let token = match token.filter(|t| !t.is_empty()) {
        Some(token) => token,
        None if state.config.require_token => return Err("Session token required"),
        None => return Ok(None),
    };

    let verified = run_blocking(state.accounts.clone(), move |store| {
        store.verify_identity(&token)
    })
    .await;
    match verified {
        Ok(Some(id)) => Ok(Some(id)),
        Ok(None) => Err("Invalid session token"),
        Err(e) => {
            tracing::warn!(error = %e, "Identity verification failed");
            Err("Unable to verify session")
        }
    }
}

/// WebSocket upgrade handler for peer connections.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    let identity = authenticate(&state, params.token).await;
    ws.on_upgrade(move |socket| async move {
        match identity {
            Ok(identity) => handler::handle_websocket(socket, state, identity).await,
            Err(reason) => handler::reject(socket, reason).await,
        }
    })
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "callrelay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(json!({
        "status": "online",
        "timestamp": chrono::Utc::now().timestamp_millis(),
        "onlinePeers": state.online_count(),
        "activeCalls": state.active_call_count(),
        "pendingSignals": state.pending_count(),
    }))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    token: Option<String>,
    limit: Option<usize>,
}

/// Call history for the token's user, newest first.
async fn calls_handler(
    Query(params): Query<HistoryParams>,
    State(state): State<RelayState>,
) -> Response {
    let token = params.token.unwrap_or_default();
    let verified = run_blocking(state.accounts.clone(), move |store| {
        store.verify_identity(&token)
    })
    .await;
    let peer = match verified {
        Ok(Some(peer)) => peer,
        Ok(None) => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid session token" })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Identity verification failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let owner = peer.clone();
    let history = run_blocking(state.accounts.clone(), move |store| {
        store.call_history(&owner, limit)
    })
    .await;

    match history {
        Ok(calls) => Json(json!({ "userId": peer, "calls": calls })).into_response(),
        Err(e) => {
            tracing::warn!(peer = peer.as_str(), error = %e, "Failed to load call history");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
