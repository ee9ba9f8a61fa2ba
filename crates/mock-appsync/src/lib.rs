//! # Mock AppSync Events server
//!
//! An in-process stand-in for the AppSync Events endpoints, implementing
//! the protocol subset the bridge speaks: the realtime WebSocket
//! (`connection_init`/`connection_ack`, `subscribe`/`subscribe_success`,
//! `data`, `ka`) and the HTTP publish endpoint. Authentication headers are
//! accepted and ignored.
//!
//! Connections can be dropped on demand to exercise reconnect paths.
//!
//! ```no_run
//! # async fn example() {
//! let server = mock_appsync::MockAppsync::start().await;
//! // Dial the bridge at the mock endpoints:
//! let http_endpoint = server.http_endpoint();       // "http://127.0.0.1:PORT"
//! let realtime_endpoint = server.realtime_endpoint(); // "ws://127.0.0.1:PORT"
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{any, post};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const FRAME_BUFFER: usize = 1024;

#[derive(Clone)]
struct ServerState {
    inner: Arc<Inner>,
}

struct Inner {
    connection_timeout_ms: u64,
    ka_interval: Duration,
    conn_counter: AtomicU64,
    /// channel -> subscribers
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    /// live connection ids -> per-connection kill switch
    connections: Mutex<HashMap<u64, CancellationToken>>,
    /// every event string accepted by the publish endpoint, by channel
    published: Mutex<Vec<(String, String)>>,
}

#[derive(Clone)]
struct Subscriber {
    conn_id: u64,
    subscription_id: String,
    frames: mpsc::Sender<String>,
}

/// A running mock server. Shuts down when dropped.
pub struct MockAppsync {
    addr: SocketAddr,
    state: ServerState,
    shutdown: CancellationToken,
}

/// Builder for non-default mock settings.
pub struct MockAppsyncBuilder {
    connection_timeout_ms: u64,
    ka_interval: Duration,
}

impl Default for MockAppsyncBuilder {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 300_000,
            ka_interval: Duration::from_secs(30),
        }
    }
}

impl MockAppsyncBuilder {
    /// Keep-alive window reported in `connection_ack`.
    pub fn connection_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_timeout_ms = ms;
        self
    }

    /// How often `ka` frames are sent.
    pub fn ka_interval(mut self, interval: Duration) -> Self {
        self.ka_interval = interval;
        self
    }

    pub async fn start(self) -> MockAppsync {
        let shutdown = CancellationToken::new();
        let state = ServerState {
            inner: Arc::new(Inner {
                connection_timeout_ms: self.connection_timeout_ms,
                ka_interval: self.ka_interval,
                conn_counter: AtomicU64::new(0),
                subscribers: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                published: Mutex::new(Vec::new()),
            }),
        };

        let app = Router::new()
            .route("/event/realtime", any(realtime))
            .route("/event", post(publish))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock appsync");
        let addr = listener.local_addr().expect("local addr");

        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
        });

        MockAppsync {
            addr,
            state,
            shutdown,
        }
    }
}

impl MockAppsync {
    /// Starts a mock with default settings.
    pub async fn start() -> Self {
        MockAppsyncBuilder::default().start().await
    }

    /// Returns a builder for custom settings.
    pub fn builder() -> MockAppsyncBuilder {
        MockAppsyncBuilder::default()
    }

    /// HTTP endpoint to hand the bridge (scheme included).
    pub fn http_endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Realtime endpoint to hand the bridge (scheme included).
    pub fn realtime_endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Number of live WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.state.inner.connections.lock().unwrap().len()
    }

    /// Every `(channel, event)` accepted by the publish endpoint so far.
    pub fn published(&self) -> Vec<(String, String)> {
        self.state.inner.published.lock().unwrap().clone()
    }

    /// Forcibly closes every live WebSocket, exercising client reconnects.
    pub fn drop_connections(&self) {
        let connections: Vec<CancellationToken> = self
            .state
            .inner
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for token in connections {
            token.cancel();
        }
    }
}

impl Drop for MockAppsync {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn realtime(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.protocols(["aws-appsync-event-ws"])
        .on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: ServerState, mut socket: WebSocket) {
    let inner = &state.inner;
    let conn_id = inner.conn_counter.fetch_add(1, Ordering::SeqCst);
    let kill = CancellationToken::new();
    inner
        .connections
        .lock()
        .unwrap()
        .insert(conn_id, kill.clone());

    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(FRAME_BUFFER);
    let mut ka_timer = tokio::time::interval(inner.ka_interval);
    ka_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = kill.cancelled() => break,
            _ = ka_timer.tick() => {
                if socket
                    .send(WsMessage::Text(json!({"type": "ka"}).to_string().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let WsMessage::Text(text) = message else { continue };
                let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                match value["type"].as_str() {
                    Some("connection_init") => {
                        let ack = json!({
                            "type": "connection_ack",
                            "connectionTimeoutMs": inner.connection_timeout_ms,
                        });
                        if socket.send(WsMessage::Text(ack.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Some("subscribe") => {
                        let id = value["id"].as_str().unwrap_or_default().to_string();
                        let channel = value["channel"].as_str().unwrap_or_default().to_string();
                        inner.subscribers.lock().unwrap().entry(channel).or_default().push(
                            Subscriber {
                                conn_id,
                                subscription_id: id.clone(),
                                frames: frame_tx.clone(),
                            },
                        );
                        let ok = json!({"type": "subscribe_success", "id": id});
                        if socket.send(WsMessage::Text(ok.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    inner.connections.lock().unwrap().remove(&conn_id);
    let mut subscribers = inner.subscribers.lock().unwrap();
    for list in subscribers.values_mut() {
        list.retain(|s| s.conn_id != conn_id);
    }
}

async fn publish(State(state): State<ServerState>, body: String) -> impl IntoResponse {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return (axum::http::StatusCode::BAD_REQUEST, "invalid json");
    };
    let channel = value["channel"].as_str().unwrap_or_default().to_string();
    let events: Vec<String> = value["events"]
        .as_array()
        .map(|events| {
            events
                .iter()
                .filter_map(|e| e.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let targets: Vec<Subscriber> = state
        .inner
        .subscribers
        .lock()
        .unwrap()
        .get(&channel)
        .cloned()
        .unwrap_or_default();

    for event in events {
        state
            .inner
            .published
            .lock()
            .unwrap()
            .push((channel.clone(), event.clone()));
        for target in &targets {
            let frame = json!({
                "type": "data",
                "id": target.subscription_id,
                "event": event,
            });
            let _ = target.frames.send(frame.to_string()).await;
        }
    }

    (axum::http::StatusCode::OK, "")
}
