//! The AppSync Events WebSocket connection.
//!
//! One [`Connection`] owns one WebSocket. A driver task reads frames,
//! enforces the server-reported keep-alive window, and transparently
//! reconnects and resubscribes when the socket dies. Subscriptions keep
//! their id and output sink across reconnects; the sink is closed exactly
//! once, when the connection is torn down.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::auth::AuthConfig;
use crate::error::{Error, Result};
use crate::protocol::{ClientFrame, ServerFrame};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Capacity of each subscription's output channel. A slow consumer
/// eventually stalls this connection's reader, which only affects the
/// owning dev session.
const SUBSCRIPTION_BUFFER: usize = 1000;

/// How long a subscribe waits for `subscribe_success`.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Backoff between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on the initial dial, handshake included.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// A handle to a single multiplexed WebSocket connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    auth: AuthConfig,
    http_endpoint: String,
    realtime_endpoint: String,
    http: reqwest::Client,
    token: CancellationToken,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    sink: Option<WsSink>,
    subscriptions: HashMap<String, SubscriptionEntry>,
    /// Subscribe handshakes in flight. Routing `subscribe_success` through
    /// here keeps the sentinel out of the data sinks during resubscription.
    pending: HashMap<String, oneshot::Sender<()>>,
}

struct SubscriptionEntry {
    channel: String,
    out: mpsc::Sender<String>,
}

/// A channel subscription. Receives the raw `event` strings the server
/// delivers for the channel; yields `None` once the connection terminates.
pub struct Subscription {
    /// Subscription id, stable across reconnects.
    pub id: String,
    /// The subscribed channel.
    pub channel: String,
    out: mpsc::Receiver<String>,
}

impl Subscription {
    /// Receives the next event, or `None` after connection teardown.
    pub async fn recv(&mut self) -> Option<String> {
        self.out.recv().await
    }
}

enum ReadEnd {
    Cancelled,
    KeepAliveExpired,
    SocketError,
}

impl Connection {
    /// Opens a connection and spawns its driver task.
    ///
    /// The driver runs until `token` is cancelled; socket failures after the
    /// initial dial are handled internally with reconnect and resubscribe.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the initial dial or handshake
    /// does not complete within ten seconds.
    pub async fn dial(
        token: CancellationToken,
        auth: AuthConfig,
        http_endpoint: impl Into<String>,
        realtime_endpoint: impl Into<String>,
    ) -> Result<Connection> {
        let conn = Connection {
            inner: Arc::new(Inner {
                auth,
                http_endpoint: http_endpoint.into(),
                realtime_endpoint: realtime_endpoint.into(),
                http: reqwest::Client::new(),
                token,
                state: Mutex::new(ConnState::default()),
            }),
        };

        let (source, ka) = timeout(DIAL_TIMEOUT, conn.connect())
            .await
            .map_err(|_| Error::ConnectionFailed("handshake timed out".to_string()))??;

        let driver = conn.clone();
        tokio::spawn(async move { driver.drive(source, ka).await });

        Ok(conn)
    }

    /// Subscribes to a channel.
    ///
    /// If the socket is currently down the subscription is queued and
    /// established on the next reconnect; otherwise this waits up to three
    /// seconds for `subscribe_success`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionFailed`] if the server does not confirm
    /// in time.
    pub async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let body = serde_json::to_vec(&json!({ "channel": channel }))?;
        let authorization = self.inner.auth.authorization(&self.http_url(), &body).await?;

        let id = uuid::Uuid::new_v4().simple().to_string();
        let (out_tx, out_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let (ack_tx, ack_rx) = oneshot::channel();

        let frame = serde_json::to_string(&ClientFrame::Subscribe {
            id: id.clone(),
            channel: channel.to_string(),
            authorization,
        })?;

        let sent = {
            let mut state = self.inner.state.lock().await;
            state.subscriptions.insert(
                id.clone(),
                SubscriptionEntry {
                    channel: channel.to_string(),
                    out: out_tx,
                },
            );
            state.pending.insert(id.clone(), ack_tx);
            match state.sink.as_mut() {
                Some(sink) => sink.send(WsMessage::Text(frame.into())).await.is_ok(),
                None => false,
            }
        };

        if sent {
            match timeout(SUBSCRIBE_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => {}
                _ => {
                    let mut state = self.inner.state.lock().await;
                    state.subscriptions.remove(&id);
                    state.pending.remove(&id);
                    return Err(Error::SubscriptionFailed {
                        channel: channel.to_string(),
                    });
                }
            }
        } else {
            tracing::debug!(channel, "socket down, subscription queued for reconnect");
        }

        Ok(Subscription {
            id,
            channel: channel.to_string(),
            out: out_rx,
        })
    }

    /// Publishes an event to a channel via the HTTP events endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PublishFailed`] on a non-2xx response.
    pub async fn publish<T: Serialize>(&self, channel: &str, event: &T) -> Result<()> {
        let event_json = serde_json::to_string(event)?;
        let body = serde_json::to_vec(&json!({
            "channel": channel,
            "events": [event_json],
        }))?;

        let url = self.http_url();
        let headers = self.inner.auth.publish_headers(&url, &body).await?;

        let mut request = self.inner.http.post(&url).body(body);
        for (key, value) in &headers {
            request = request.header(key, value);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::PublishFailed {
                channel: channel.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn http_url(&self) -> String {
        endpoint_url(&self.inner.http_endpoint, "https", "/event")
    }

    fn realtime_url(&self) -> String {
        endpoint_url(&self.inner.realtime_endpoint, "wss", "/event/realtime")
    }

    /// Establishes the socket, performs the handshake, stores the write half
    /// and replays every known subscription. Returns the read half and the
    /// keep-alive window from `connection_ack`.
    async fn connect(&self) -> Result<(WsSource, Duration)> {
        let auth = self
            .inner
            .auth
            .authorization(&self.http_url(), b"{}")
            .await?;
        let auth64 = {
            use base64::Engine as _;
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(serde_json::to_vec(&auth)?)
        };

        let mut request = self
            .realtime_url()
            .into_client_request()
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let protocols = format!("aws-appsync-event-ws, header-{auth64}");
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            protocols
                .parse()
                .map_err(|_| Error::ConnectionFailed("invalid subprotocol header".to_string()))?,
        );

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        let init = serde_json::to_string(&ClientFrame::ConnectionInit)?;
        sink.send(WsMessage::Text(init.into()))
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;

        let ka = wait_for_ack(&mut source).await?;

        {
            let mut state = self.inner.state.lock().await;
            state.sink = Some(sink);
        }
        self.resubscribe_all().await;

        Ok((source, ka))
    }

    /// Replays every registered subscription on the fresh socket, reusing
    /// each subscription's id so its sink keeps working.
    async fn resubscribe_all(&self) {
        let channels: Vec<(String, String)> = {
            let state = self.inner.state.lock().await;
            state
                .subscriptions
                .iter()
                .map(|(id, entry)| (id.clone(), entry.channel.clone()))
                .collect()
        };

        for (id, channel) in channels {
            let body = match serde_json::to_vec(&json!({ "channel": channel })) {
                Ok(body) => body,
                Err(_) => continue,
            };
            let authorization = match self.inner.auth.authorization(&self.http_url(), &body).await {
                Ok(auth) => auth,
                Err(err) => {
                    tracing::warn!(%channel, error = %err, "failed to sign resubscribe");
                    continue;
                }
            };
            let frame = match serde_json::to_string(&ClientFrame::Subscribe {
                id: id.clone(),
                channel: channel.clone(),
                authorization,
            }) {
                Ok(frame) => frame,
                Err(_) => continue,
            };

            let mut state = self.inner.state.lock().await;
            // Handshake acks route through `pending`, never the data sink.
            let (ack_tx, _ack_rx) = oneshot::channel();
            state.pending.insert(id.clone(), ack_tx);
            if let Some(sink) = state.sink.as_mut() {
                if let Err(err) = sink.send(WsMessage::Text(frame.into())).await {
                    tracing::warn!(%channel, error = %err, "failed to resubscribe");
                }
            }
        }
    }

    /// Runs until cancellation: reads frames, reconnects on failure.
    async fn drive(self, mut source: WsSource, mut ka: Duration) {
        loop {
            match self.read_loop(&mut source, ka).await {
                ReadEnd::Cancelled => break,
                ReadEnd::KeepAliveExpired => {
                    tracing::warn!("keep-alive expired, resetting connection");
                }
                ReadEnd::SocketError => {
                    tracing::info!("socket closed, reconnecting");
                }
            }

            self.inner.state.lock().await.sink = None;

            let reconnected = loop {
                if self.inner.token.is_cancelled() {
                    break None;
                }
                match self.connect().await {
                    Ok(pair) => break Some(pair),
                    Err(err) => {
                        tracing::info!(error = %err, "reconnect failed, retrying");
                        tokio::select! {
                            _ = self.inner.token.cancelled() => break None,
                            _ = sleep(RECONNECT_BACKOFF) => {}
                        }
                    }
                }
            };

            match reconnected {
                Some((new_source, new_ka)) => {
                    source = new_source;
                    ka = new_ka;
                }
                None => break,
            }
        }

        self.teardown().await;
    }

    async fn read_loop(&self, source: &mut WsSource, mut ka: Duration) -> ReadEnd {
        let mut deadline = Instant::now() + ka;
        loop {
            tokio::select! {
                _ = self.inner.token.cancelled() => return ReadEnd::Cancelled,
                _ = sleep_until(deadline) => return ReadEnd::KeepAliveExpired,
                frame = source.next() => {
                    let text = match frame {
                        Some(Ok(WsMessage::Text(text))) => text,
                        Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                            return ReadEnd::SocketError;
                        }
                        Some(Ok(_)) => continue,
                    };
                    match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(ServerFrame::Ka) => deadline = Instant::now() + ka,
                        Ok(ServerFrame::ConnectionAck { connection_timeout_ms }) => {
                            ka = Duration::from_millis(connection_timeout_ms);
                            deadline = Instant::now() + ka;
                        }
                        Ok(ServerFrame::SubscribeSuccess { id }) => {
                            let sender = self.inner.state.lock().await.pending.remove(&id);
                            if let Some(sender) = sender {
                                let _ = sender.send(());
                            }
                        }
                        Ok(ServerFrame::SubscribeError { id, errors }) => {
                            tracing::warn!(?id, %errors, "subscribe rejected");
                        }
                        Ok(ServerFrame::Data { id, event }) => {
                            let sender = {
                                let state = self.inner.state.lock().await;
                                state.subscriptions.get(&id).map(|entry| entry.out.clone())
                            };
                            match sender {
                                Some(sender) => {
                                    if sender.send(event).await.is_err() {
                                        // Consumer dropped its subscription.
                                        self.inner.state.lock().await.subscriptions.remove(&id);
                                    }
                                }
                                None => tracing::debug!(%id, "data for unknown subscription"),
                            }
                        }
                        Ok(ServerFrame::Unknown) => {}
                        Err(err) => {
                            tracing::debug!(error = %err, "ignoring malformed frame");
                        }
                    }
                }
            }
        }
    }

    /// Drops the sink and every subscription sender, closing each
    /// subscription's output exactly once.
    async fn teardown(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(mut sink) = state.sink.take() {
            let _ = sink.close().await;
        }
        state.subscriptions.clear();
        state.pending.clear();
    }
}

/// Reads frames until `connection_ack`, returning the keep-alive window.
async fn wait_for_ack(source: &mut WsSource) -> Result<Duration> {
    let handshake = async {
        while let Some(frame) = source.next().await {
            let text = match frame {
                Ok(WsMessage::Text(text)) => text,
                Ok(_) => continue,
                Err(e) => return Err(Error::ConnectionFailed(e.to_string())),
            };
            if let Ok(ServerFrame::ConnectionAck {
                connection_timeout_ms,
            }) = serde_json::from_str::<ServerFrame>(text.as_str())
            {
                return Ok(Duration::from_millis(connection_timeout_ms));
            }
        }
        Err(Error::ConnectionFailed(
            "socket closed before connection_ack".to_string(),
        ))
    };

    timeout(DIAL_TIMEOUT, handshake)
        .await
        .map_err(|_| Error::ConnectionFailed("no connection_ack".to_string()))?
}

/// Expands a bare `host[:port]` endpoint into a full URL; endpoints that
/// already carry a scheme (used by tests against a local server) pass
/// through.
fn endpoint_url(endpoint: &str, default_scheme: &str, path: &str) -> String {
    if endpoint.contains("://") {
        format!("{endpoint}{path}")
    } else {
        format!("{default_scheme}://{endpoint}{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::endpoint_url;

    #[test]
    fn bare_endpoints_get_default_scheme() {
        assert_eq!(
            endpoint_url("abc.appsync-realtime-api.us-east-1.amazonaws.com", "wss", "/event/realtime"),
            "wss://abc.appsync-realtime-api.us-east-1.amazonaws.com/event/realtime"
        );
    }

    #[test]
    fn scheme_endpoints_pass_through() {
        assert_eq!(
            endpoint_url("ws://127.0.0.1:4000", "wss", "/event/realtime"),
            "ws://127.0.0.1:4000/event/realtime"
        );
    }
}
