// ABOUTME: In-process mock audio node for integration tests
// ABOUTME: axum server speaking the node WebSocket protocol and a slice of its REST API

#![allow(dead_code)]

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use lavawire::{NodeConfig, NodeEvent};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

pub const PASSWORD: &str = "youshallnotpass";
pub const WAIT: Duration = Duration::from_secs(5);

/// What the mock should do on every open socket
#[derive(Debug, Clone)]
pub enum Command {
    Push(String),
    Close(u16, &'static str),
}

#[derive(Clone)]
struct MockState {
    inbound: mpsc::UnboundedSender<Value>,
    handshakes: mpsc::UnboundedSender<HeaderMap>,
    freed: mpsc::UnboundedSender<String>,
    commands: broadcast::Sender<Command>,
}

pub struct MockNode {
    pub addr: SocketAddr,
    pub inbound: mpsc::UnboundedReceiver<Value>,
    pub handshakes: mpsc::UnboundedReceiver<HeaderMap>,
    pub freed: mpsc::UnboundedReceiver<String>,
    commands: broadcast::Sender<Command>,
}

/// Route library logs to the test output; `RUST_LOG=lavawire=debug` for detail
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

impl MockNode {
    pub async fn start() -> Self {
        init_logging();

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (handshakes_tx, handshakes) = mpsc::unbounded_channel();
        let (freed_tx, freed) = mpsc::unbounded_channel();
        let (commands, _) = broadcast::channel(64);

        let state = MockState {
            inbound: inbound_tx,
            handshakes: handshakes_tx,
            freed: freed_tx,
            commands: commands.clone(),
        };

        let app = Router::new()
            .route("/", get(upgrade))
            .route("/loadtracks", get(load_tracks))
            .route("/decodetracks", post(decode_tracks))
            .route("/routeplanner/status", get(route_planner_status))
            .route("/routeplanner/free/address", post(free_address))
            .route("/routeplanner/free/all", post(free_all))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            inbound,
            handshakes,
            freed,
            commands,
        }
    }

    pub fn config(&self, id: &str) -> NodeConfig {
        NodeConfig::new(id, "127.0.0.1", self.addr.port(), PASSWORD)
    }

    pub fn push(&self, payload: Value) {
        let _ = self.commands.send(Command::Push(payload.to_string()));
    }

    pub fn close(&self, code: u16, reason: &'static str) {
        let _ = self.commands.send(Command::Close(code, reason));
    }

    /// Next payload the client sent
    pub async fn recv(&mut self) -> Value {
        timeout(WAIT, self.inbound.recv())
            .await
            .expect("timed out waiting for a client payload")
            .expect("mock node stopped")
    }

    pub async fn handshake(&mut self) -> HeaderMap {
        timeout(WAIT, self.handshakes.recv())
            .await
            .expect("timed out waiting for a handshake")
            .expect("mock node stopped")
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<MockState>,
) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == PASSWORD);
    let _ = state.handshakes.send(headers);

    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| session(socket, state))
}

async fn session(mut socket: WebSocket, state: MockState) {
    let mut commands = state.commands.subscribe();

    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(value) = serde_json::from_str(text.as_str()) {
                        let _ = state.inbound.send(value);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            command = commands.recv() => match command {
                Ok(Command::Push(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(Command::Close(code, reason)) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    break;
                }
                Err(_) => break,
            },
        }
    }
}

fn authorized(headers: &HeaderMap) -> bool {
    headers.get("authorization").and_then(|v| v.to_str().ok()) == Some(PASSWORD)
}

fn track_info(identifier: &str) -> Value {
    json!({
        "identifier": identifier,
        "isSeekable": true,
        "author": "mock",
        "length": 180000,
        "isStream": false,
        "position": 0,
        "title": format!("track {}", identifier),
        "uri": format!("https://example.invalid/{}", identifier),
        "sourceName": "http"
    })
}

async fn load_tracks(
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let identifier = query.get("identifier").cloned().unwrap_or_default();
    let body = if identifier.is_empty() {
        json!({ "loadType": "NO_MATCHES", "playlistInfo": {}, "tracks": [] })
    } else {
        json!({
            "loadType": "SEARCH_RESULT",
            "playlistInfo": {},
            "tracks": [{ "track": format!("encoded:{}", identifier), "info": track_info(&identifier) }]
        })
    };
    Json(body).into_response()
}

async fn decode_tracks(headers: HeaderMap, Json(tracks): Json<Vec<String>>) -> Response {
    if !authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let decoded: Vec<Value> = tracks
        .iter()
        .map(|track| json!({ "track": track, "info": track_info(track) }))
        .collect();
    Json(Value::Array(decoded)).into_response()
}

async fn route_planner_status() -> Json<Value> {
    Json(json!({
        "class": "RotatingIpRoutePlanner",
        "details": { "ipBlock": { "type": "Inet6Address", "size": "1208925819614629174706176" } }
    }))
}

async fn free_address(State(state): State<MockState>, Json(body): Json<Value>) -> StatusCode {
    match body.get("address").and_then(Value::as_str) {
        Some(address) => {
            let _ = state.freed.send(address.to_string());
            StatusCode::NO_CONTENT
        }
        None => StatusCode::BAD_REQUEST,
    }
}

async fn free_all() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Stats payload with the given system load
pub fn stats(players: u32, system_load: f64) -> Value {
    json!({
        "op": "stats",
        "players": players,
        "playingPlayers": players,
        "uptime": 1000,
        "memory": { "free": 1, "used": 1, "allocated": 2, "reservable": 4 },
        "cpu": { "cores": 4, "systemLoad": system_load, "lavalinkLoad": 0.01 }
    })
}

/// Wait for the first event `pick` accepts
pub async fn wait_for<E, T>(
    events: &mut mpsc::UnboundedReceiver<E>,
    mut pick: impl FnMut(E) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event stream ended");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for an event")
}

/// Wait for the next connect, returning its reconnect flag
pub async fn wait_connected(events: &mut mpsc::UnboundedReceiver<NodeEvent>) -> bool {
    wait_for(events, |event| match event {
        NodeEvent::Connect { reconnect, .. } => Some(reconnect),
        _ => None,
    })
    .await
}
