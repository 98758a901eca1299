//! Signal Relay Server
//!
//! A WebSocket signaling relay for peer-to-peer calls:
//!
//! 1. **Presence**: every connection gets a unique display-name identifier
//!    and everyone online receives the full roster whenever it changes.
//!
//! 2. **Signaling relay**: SDP offers/answers, ICE candidates and hangups
//!    are forwarded to the addressed participant. Payloads are opaque.
//!
//! 3. **Call log**: delivered offers open a call record, hangups close it.
//!    The log is written by a background worker and never slows relaying.
//!
//! Media never flows through the relay, and participants are not
//! authenticated.

mod error;
mod handler;
mod ledger;
mod names;
mod protocol;
mod registry;
mod router;
mod state;

use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::{RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "signal-relay", version, about = "WebRTC signaling relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,

    /// SQLite database for the call log (":memory:" keeps it in memory)
    #[arg(long, default_value = "calls.db", env = "CALLS_DB_PATH")]
    database: String,

    /// Maximum call events waiting for the ledger worker
    #[arg(long, default_value_t = 1024, env = "LEDGER_QUEUE_CAPACITY")]
    ledger_queue: usize,

    /// How often to log the number of call records, in seconds
    #[arg(long, default_value_t = 300, env = "STATS_INTERVAL_SECS")]
    stats_interval_secs: u64,

    /// How often to dump every call record at debug level, in seconds (0 disables)
    #[arg(long, default_value_t = 3600, env = "CALL_DUMP_INTERVAL_SECS")]
    dump_interval_secs: u64,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_relay=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let config = RelayConfig {
        port: args.port,
        database_path: args.database,
        ledger_queue_capacity: args.ledger_queue,
        stats_interval_secs: args.stats_interval_secs,
        dump_interval_secs: args.dump_interval_secs,
    };

    let state = match RelayState::open(config.clone()) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(
                path = config.database_path.as_str(),
                error = %e,
                "Failed to open call database"
            );
            std::process::exit(1);
        }
    };
    tracing::info!(path = config.database_path.as_str(), "Call database ready");

    spawn_stats_task(state.clone());
    spawn_dump_task(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Signal relay server starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = addr.as_str(), error = %e, "Failed to bind address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app(state)).await {
        tracing::error!(error = %e, "Server error");
    }
}

/// Build the HTTP router.
fn app(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/calls", get(ledger::api::list_calls))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Background Tasks ──────────────────────────────────────────────────────────

/// Periodically log how many call records exist.
fn spawn_stats_task(state: RelayState) {
    let period = Duration::from_secs(state.config.stats_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match state.ledger.count_calls().await {
                Ok(count) => tracing::info!(
                    calls = count,
                    online = state.registry.online_count(),
                    "Current number of call records"
                ),
                Err(e) => tracing::warn!(error = %e, "Error getting call stats"),
            }
        }
    });
}

/// Periodically dump every call record at debug level.
fn spawn_dump_task(state: RelayState) {
    if state.config.dump_interval_secs == 0 {
        return;
    }
    let period = Duration::from_secs(state.config.dump_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            match state.ledger.list_calls(None).await {
                Ok(calls) => {
                    tracing::debug!(total = calls.len(), "Total calls in database");
                    for call in &calls {
                        tracing::debug!(call = ?call, "Call");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Error fetching all calls"),
            }
        }
    });
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    tracing::debug!("Attempting WebSocket connection");
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "signal-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let calls = match state.ledger.count_calls().await {
        Ok(count) => json!(count),
        Err(e) => {
            tracing::warn!(error = %e, "Error counting calls");
            serde_json::Value::Null
        }
    };

    Json(json!({
        "online_clients": state.registry.online_count(),
        "total_calls": calls,
        "ledger": state.ledger.stats(),
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures::{SinkExt, StreamExt};
    use protocol::ServerMessage;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    async fn get_json(state: RelayState, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["signal-relay"]);
        assert_eq!(args.port, 8080);
        assert_eq!(args.database, "calls.db");
        assert_eq!(args.ledger_queue, 1024);
        assert_eq!(args.stats_interval_secs, 300);
        assert_eq!(args.dump_interval_secs, 3600);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::parse_from(["signal-relay", "-p", "9000", "--database", ":memory:"]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.database, ":memory:");
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, body) = get_json(RelayState::in_memory(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "signal-relay");
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (status, body) = get_json(RelayState::in_memory(), "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online_clients"], 0);
        assert_eq!(body["total_calls"], 0);
        assert_eq!(body["ledger"]["dropped_events"], 0);
    }

    #[tokio::test]
    async fn test_calls_endpoint_newest_first() {
        let state = RelayState::in_memory();
        for peer in ["a", "b", "c"] {
            state.ledger.call_started("caller", peer);
            // Distinct start times so the ordering is unambiguous.
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state.ledger.count_calls().await.unwrap(), 3);

        let (status, body) = get_json(state.clone(), "/calls?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        let calls = body.as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["to"], "c");
        assert_eq!(calls[1]["to"], "b");
        assert!(calls[0]["start_time"].is_string());
        assert!(calls[0]["end_time"].is_null());

        let (_, body) = get_json(state, "/calls").await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    type Client =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn next_server_message(client: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn next_signal(client: &mut Client) -> ServerMessage {
        loop {
            match next_server_message(client).await {
                ServerMessage::RosterUpdate { .. } => continue,
                other => return other,
            }
        }
    }

    async fn connect(addr: std::net::SocketAddr) -> (Client, String) {
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        match next_server_message(&mut client).await {
            ServerMessage::AssignIdentity { data } => (client, data.client_id),
            other => panic!("Expected assignIdentity, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_websocket_call_flow() {
        let state = RelayState::in_memory();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_state = state.clone();
        tokio::spawn(async move {
            axum::serve(listener, app(server_state)).await.unwrap();
        });

        let (mut alice, alice_id) = connect(addr).await;
        let (mut bob, bob_id) = connect(addr).await;
        assert_ne!(alice_id, bob_id);

        let offer = json!({
            "type": "mediaOffer",
            "from": alice_id,
            "to": bob_id,
            "offer": { "type": "offer", "sdp": "v=0" }
        });
        alice.send(WsMessage::Text(offer.to_string())).await.unwrap();

        match next_signal(&mut bob).await {
            ServerMessage::Offer { from, payload, .. } => {
                assert_eq!(from, alice_id);
                assert_eq!(payload["offer"]["type"], "offer");
            }
            other => panic!("Expected offer, got {:?}", other),
        }

        let answer = json!({
            "type": "mediaAnswer",
            "to": alice_id,
            "answer": { "type": "answer", "sdp": "v=0" }
        });
        bob.send(WsMessage::Text(answer.to_string())).await.unwrap();
        assert!(matches!(
            next_signal(&mut alice).await,
            ServerMessage::Answer { ref from, .. } if *from == bob_id
        ));

        bob.send(WsMessage::Text(json!({ "type": "hangup", "to": alice_id }).to_string()))
            .await
            .unwrap();
        assert!(matches!(next_signal(&mut alice).await, ServerMessage::Hangup { .. }));

        let mut closed = false;
        for _ in 0..100 {
            let calls = state.ledger.list_calls(None).await.unwrap();
            if calls.len() == 1 && !calls[0].is_open() {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed);

        bob.close(None).await.unwrap();
        for _ in 0..100 {
            if !state.registry.is_online(&bob_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!state.registry.is_online(&bob_id));
        assert!(state.registry.is_online(&alice_id));
    }
}
