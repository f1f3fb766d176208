//! Axum routes and per-client socket loop

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// State shared by all routes
#[derive(Clone)]
pub struct EchoState {
    attachments: Arc<Mutex<HashMap<String, u64>>>,
    heartbeats: Arc<AtomicU64>,
    kick: broadcast::Sender<()>,
}

impl EchoState {
    pub fn new() -> Self {
        let (kick, _) = broadcast::channel(4);
        Self {
            attachments: Arc::new(Mutex::new(HashMap::new())),
            heartbeats: Arc::new(AtomicU64::new(0)),
            kick,
        }
    }

    /// Record a new socket for this client; returns its attempt number
    pub async fn attach(&self, client: &str) -> u64 {
        let mut attachments = self.attachments.lock().await;
        let attempt = attachments.entry(client.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    /// Sockets this client has opened so far
    pub async fn attempts(&self, client: &str) -> u64 {
        self.attachments.lock().await.get(client).copied().unwrap_or(0)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Close every open socket
    pub fn kick_all(&self) -> usize {
        self.kick.send(()).unwrap_or(0)
    }

    async fn stats(&self) -> Stats {
        Stats {
            heartbeats: self.heartbeats(),
            clients: self.attachments.lock().await.clone(),
        }
    }
}

impl Default for EchoState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
struct Stats {
    heartbeats: u64,
    clients: HashMap<String, u64>,
}

/// Echo server bound to one address
pub struct EchoServer {
    state: EchoState,
}

impl EchoServer {
    pub fn new() -> Self {
        Self {
            state: EchoState::new(),
        }
    }

    /// Get the state for inspection
    pub fn state(&self) -> EchoState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(socket))
            .route("/heartbeat", post(heartbeat))
            .route("/stats", get(stats))
            .route("/kick", post(kick))
            .with_state(self.state.clone())
    }

    /// Bind and serve in the background; returns the bound address
    ///
    /// Port 0 picks a free port.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local = listener
            .local_addr()
            .context("Failed to read bound address")?;
        info!("Echo server listening on http://{}", local);

        let app = self.router();
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                error!("Echo server error: {}", e);
            }
        });

        Ok(local)
    }
}

impl Default for EchoServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn heartbeat(State(state): State<EchoState>) -> &'static str {
    state.heartbeats.fetch_add(1, Ordering::SeqCst);
    "here"
}

async fn stats(State(state): State<EchoState>) -> Json<Stats> {
    Json(state.stats().await)
}

async fn kick(State(state): State<EchoState>) -> String {
    let kicked = state.kick_all();
    info!("Kicked {} sockets", kicked);
    kicked.to_string()
}

async fn socket(ws: WebSocketUpgrade, State(state): State<EchoState>) -> Response {
    ws.on_upgrade(move |socket| serve_client(socket, state))
}

async fn serve_client(mut socket: WebSocket, state: EchoState) {
    let mut kicked = state.kick.subscribe();

    // Identity frame first
    let client = match socket.recv().await {
        Some(Ok(Message::Text(id))) => id,
        other => {
            debug!("Socket closed before identity: {:?}", other);
            return;
        }
    };
    let attempt = state.attach(&client).await;
    info!("Client {} attached (attempt {})", client, attempt);

    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    let echo: Value = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!("Client {} sent malformed JSON: {}", client, e);
                            continue;
                        }
                    };
                    let reply = json!({"client": client, "attempt": attempt, "echo": echo});
                    if socket.send(Message::Text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Client {} socket error: {}", client, e);
                    break;
                }
            },
            _ = kicked.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("Client {} detached", client);
}
