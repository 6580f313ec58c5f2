use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Interval};

use super::api::{ApiError, AppState};
use super::console::Attachment;
use super::events::Subscription;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── Message types ────────────────────────────────────────────────────

/// Control messages a console client sends as text frames.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleControl {
    Resize { rows: u16, cols: u16 },
    Input { data: String },
}

/// Control messages the server sends to a console client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConsoleReply {
    Attached { rows: Option<u16>, cols: Option<u16> },
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum EventsHello {
    Connected,
}

// ── Keepalive ────────────────────────────────────────────────────────

/// Ping/pong bookkeeping shared by both sockets. If no Pong arrives within
/// [`PONG_TIMEOUT`] of the oldest unanswered Ping, the connection is treated
/// as dead.
struct Keepalive {
    interval: Interval,
    unanswered_since: Option<Instant>,
}

impl Keepalive {
    async fn new() -> Self {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        // The first tick completes immediately; consume it so the first real
        // ping fires after PING_INTERVAL has elapsed.
        interval.tick().await;
        Self {
            interval,
            unanswered_since: None,
        }
    }

    async fn tick(&mut self) {
        self.interval.tick().await;
    }

    /// Called on each tick. Returns false when the peer stopped answering.
    fn should_ping(&mut self) -> bool {
        match self.unanswered_since {
            Some(sent) if sent.elapsed() > PONG_TIMEOUT => false,
            Some(_) => true,
            None => {
                self.unanswered_since = Some(Instant::now());
                true
            }
        }
    }

    fn pong(&mut self) {
        self.unanswered_since = None;
    }
}

async fn send_json<T: Serialize>(sender: &mut SplitSink<WebSocket, Message>, msg: &T) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize websocket message");
            true
        }
    }
}

// ── Console socket ───────────────────────────────────────────────────

/// `GET /ws/console/{id}`. The attach happens before the upgrade so a
/// session in the wrong state gets a plain HTTP error.
pub async fn console_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.manager.attach(&id).await {
        Ok(attachment) => ws.on_upgrade(move |socket| run_console(socket, attachment)),
        Err(e) => ApiError::from(e).into_response(),
    }
}

async fn run_console(socket: WebSocket, mut attachment: Attachment) {
    let session_id = attachment.session_id().to_string();
    let (mut sender, mut receiver) = socket.split();
    let mut keepalive = Keepalive::new().await;

    let (rows, cols) = match attachment.geometry() {
        Some((rows, cols)) => (Some(rows), Some(cols)),
        None => (None, None),
    };
    if !send_json(&mut sender, &ConsoleReply::Attached { rows, cols }).await {
        return;
    }

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if !keepalive.should_ping() {
                    tracing::debug!(session_id = %session_id, "console client stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            chunk = attachment.recv() => match chunk {
                Some(chunk) => {
                    if sender.send(Message::Binary(chunk)).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = send_json(&mut sender, &ConsoleReply::Error {
                        message: "console stream ended".to_string(),
                    }).await;
                    break;
                }
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = attachment.write(data).await {
                        let _ = send_json(&mut sender, &ConsoleReply::Error { message: e.to_string() }).await;
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ConsoleControl>(text.as_str()) {
                        Ok(ConsoleControl::Resize { rows, cols }) => attachment.resize(rows, cols).await,
                        Ok(ConsoleControl::Input { data }) => {
                            if let Err(e) = attachment.write(data.into_bytes()).await {
                                let _ = send_json(&mut sender, &ConsoleReply::Error { message: e.to_string() }).await;
                                break;
                            }
                        }
                        Err(e) => {
                            let reply = ConsoleReply::Error { message: format!("invalid control message: {}", e) };
                            if !send_json(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => keepalive.pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_))) => {}
                Some(Err(_)) => break,
            },
        }
    }

    attachment.detach();
    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

// ── Events socket ────────────────────────────────────────────────────

/// `GET /ws/events`.
pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let subscription = state.manager.subscribe();
    ws.on_upgrade(move |socket| run_events(socket, subscription))
}

async fn run_events(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let mut keepalive = Keepalive::new().await;

    if !send_json(&mut sender, &EventsHello::Connected).await {
        return;
    }

    loop {
        tokio::select! {
            _ = keepalive.tick() => {
                if !keepalive.should_ping() {
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }

            event = subscription.recv() => match event {
                Some(event) => {
                    if !send_json(&mut sender, &event).await {
                        break;
                    }
                }
                None => break,
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Pong(_))) => keepalive.pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Clients have nothing to say on this socket.
                }
                Some(Err(_)) => break,
            },
        }
    }

    subscription.unsubscribe();
    let _ = sender.send(Message::Close(None)).await;
}
