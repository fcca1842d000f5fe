use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use mold_defense_server::config::RelayConfig;
use mold_defense_server::relay::{OutboundMessage, RelayState};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tower_http::services::{ServeDir, ServeFile};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;

const CLIENT_QUEUE: usize = 256;
// RFC 6455: payload data inconsistent with the message type
const CLOSE_INVALID_PAYLOAD: u16 = 1007;

type SharedState = Arc<Mutex<RelayState>>;

/// Fans one shared mold-defense game out to every connected browser.
#[derive(Debug, Parser)]
#[command(name = "relay", version)]
struct Args {
    /// Port to listen on. Overrides PORT.
    #[arg(long)]
    port: Option<u16>,
    /// Terrain seed handed to clients. Overrides RELAY_SEED.
    #[arg(long)]
    seed: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();
    let config = RelayConfig::load().with_overrides(args.port, args.seed);

    let state: SharedState = Arc::new(Mutex::new(RelayState::new(config.seed)));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let app = if let Some(static_dir) = config.static_dir.clone() {
        let index_file = static_dir.join("index.html");
        info!(root = %static_dir.display(), "serving static client");
        app.fallback_service(
            ServeDir::new(static_dir).not_found_service(ServeFile::new(index_file)),
        )
    } else {
        warn!("static client not found, serving the websocket endpoint only");
        app
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, seed = config.seed, "relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn healthz(State(state): State<SharedState>) -> impl IntoResponse {
    let guard = state.lock().await;
    Json(json!({
        "ok": true,
        "players": guard.player_count(),
        "seed": guard.game().seed,
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: SharedState, socket: WebSocket) {
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(CLIENT_QUEUE);
    let Some(client_id) = state.lock().await.connect(tx.clone()) else {
        warn!("dropping connection that could not take init");
        return;
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let should_close = matches!(outbound, OutboundMessage::Close { .. });
            let result = match outbound {
                OutboundMessage::Text(payload) => {
                    ws_sender.send(Message::Text(payload.into())).await
                }
                OutboundMessage::Close { code, reason } => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    ws_sender.send(Message::Close(Some(frame))).await
                }
            };
            if result.is_err() || should_close {
                break;
            }
        }
    });

    while let Some(received) = ws_receiver.next().await {
        let message = match received {
            Ok(message) => message,
            Err(err) => {
                debug!(client_id = %client_id, error = %err, "websocket read failed");
                break;
            }
        };

        match message {
            Message::Text(raw) => {
                state
                    .lock()
                    .await
                    .handle_client_message(&client_id, raw.as_str());
            }
            Message::Binary(raw) => match std::str::from_utf8(&raw) {
                Ok(text) => state.lock().await.handle_client_message(&client_id, text),
                Err(_) => {
                    warn!(client_id = %client_id, "closing client that sent invalid utf8");
                    let _ = tx
                        .send(OutboundMessage::Close {
                            code: CLOSE_INVALID_PAYLOAD,
                            reason: "invalid utf8".to_string(),
                        })
                        .await;
                    break;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.lock().await.disconnect(&client_id);
    drop(tx);
    let _ = writer.await;
}
