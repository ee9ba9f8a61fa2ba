//! The local Runtime API adapter.
//!
//! Exposes the Lambda Runtime API to local worker processes under
//! `/lambda/{workerId}/…` and translates each HTTP interaction into bridge
//! messages: the long poll for the next invocation rides on queued `Next`
//! bodies, and every POST is tunneled to the remote shim, which proxies it
//! to the real Runtime API and replies under the same message id.
//!
//! Routes are mounted both with and without the `/2018-06-01` prefix so
//! stock Runtime API clients work unchanged.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::response::Response;
use axum::routing::{get, post};
use bridge_protocol::{Client, MessageKind, PingBody, channels, wire};
use futures_util::TryStreamExt;
use http::{HeaderMap, Method, StatusCode, header};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::time::timeout;
use tokio_util::io::StreamReader;

use crate::bus::Bus;
use crate::events::{
    Event, FunctionErrorEvent, FunctionInvokedEvent, FunctionResponseEvent,
};
use crate::exchange::Exchanges;

/// How long a tunneled POST waits for the shim's proxied reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on body bytes captured for events; bodies stream through the bridge
/// in full regardless.
const CAPTURE_LIMIT: usize = 256 * 1024;

#[derive(Clone)]
pub(crate) struct AdapterState {
    pub client: Client,
    pub exchanges: Arc<Exchanges>,
    pub bus: Bus,
    pub prefix: String,
}

pub(crate) fn router(state: AdapterState) -> Router {
    let routes = |r: Router<AdapterState>, base: &str| {
        r.route(&format!("{base}/runtime/invocation/next"), get(next_invocation))
            .route(
                &format!("{base}/runtime/invocation/{{request_id}}/response"),
                post(invocation_response),
            )
            .route(
                &format!("{base}/runtime/invocation/{{request_id}}/error"),
                post(invocation_error),
            )
            .route(&format!("{base}/runtime/init/error"), post(init_error))
    };
    let mut router = Router::new();
    router = routes(router, "/lambda/{worker_id}");
    router = routes(router, "/lambda/{worker_id}/2018-06-01");
    router.with_state(state)
}

/// GET `/lambda/{workerId}/runtime/invocation/next`
///
/// Pings the worker's inbox (prompting the shim to forward the pending
/// invocation) and blocks until a `Next` body is queued for this worker,
/// then mirrors the tunneled Runtime API response to the local client.
async fn next_invocation(
    State(state): State<AdapterState>,
    Path(worker_id): Path<String>,
) -> Response {
    tracing::debug!(%worker_id, "--> invocation/next");
    let inbox = channels::worker_inbox(&state.prefix, &worker_id);
    let mut ping = state.client.writer(MessageKind::Ping, &inbox);
    let pinged = match ping.write_json(&PingBody {}).await {
        Ok(()) => ping.close().await,
        Err(err) => Err(err),
    };
    if let Err(err) = pinged {
        tracing::warn!(%worker_id, error = %err, "failed to ping worker");
        return error_response(StatusCode::BAD_GATEWAY, "bridge ping failed");
    }

    let body = state.exchanges.pop_next(&worker_id).await;
    let parsed = wire::read_response(BufReader::new(body)).await;
    let (head, mut wire_body) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(%worker_id, error = %err, "malformed next payload");
            return error_response(StatusCode::BAD_GATEWAY, "malformed next payload");
        }
    };
    // Invocation payloads are bounded by Lambda's payload cap, so they are
    // buffered whole for the invoked event.
    let mut payload = Vec::new();
    if let Err(err) = wire_body.read_to_end(&mut payload).await {
        tracing::warn!(%worker_id, error = %err, "truncated next payload");
        return error_response(StatusCode::BAD_GATEWAY, "truncated next payload");
    }

    let request_id = head
        .headers
        .get("lambda-runtime-aws-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    tracing::debug!(%worker_id, %request_id, "<-- invocation/next");
    state.bus.publish(Event::FunctionInvoked(FunctionInvokedEvent {
        function_id: state.exchanges.function_of(&worker_id).unwrap_or_default(),
        worker_id: worker_id.clone(),
        request_id,
        input: payload.clone(),
    }));

    mirror(&head, payload)
}

/// POST `/lambda/{workerId}/runtime/invocation/{requestId}/response`
async fn invocation_response(
    State(state): State<AdapterState>,
    Path((worker_id, request_id)): Path<(String, String)>,
    request: Request,
) -> Response {
    let path = format!("/2018-06-01/runtime/invocation/{request_id}/response");
    match tunnel(
        &state,
        &worker_id,
        MessageKind::Response,
        Some(request_id.clone()),
        path,
        request,
    )
    .await
    {
        Err(response) => response,
        Ok(outcome) => {
            state
                .bus
                .publish(Event::FunctionResponse(FunctionResponseEvent {
                    function_id: state.exchanges.function_of(&worker_id).unwrap_or_default(),
                    worker_id: worker_id.clone(),
                    request_id,
                    output: outcome.sent_body,
                }));
            mirror(&outcome.head, outcome.reply_body)
        }
    }
}

/// POST `/lambda/{workerId}/runtime/invocation/{requestId}/error`
async fn invocation_error(
    State(state): State<AdapterState>,
    Path((worker_id, request_id)): Path<(String, String)>,
    request: Request,
) -> Response {
    let path = format!("/2018-06-01/runtime/invocation/{request_id}/error");
    match tunnel(
        &state,
        &worker_id,
        MessageKind::Error,
        Some(request_id.clone()),
        path,
        request,
    )
    .await
    {
        Err(response) => response,
        Ok(outcome) => {
            publish_error_event(&state, &worker_id, &request_id, &outcome.sent_body);
            mirror(&outcome.head, outcome.reply_body)
        }
    }
}

/// POST `/lambda/{workerId}/runtime/init/error`
async fn init_error(
    State(state): State<AdapterState>,
    Path(worker_id): Path<String>,
    request: Request,
) -> Response {
    let path = "/2018-06-01/runtime/init/error".to_string();
    match tunnel(&state, &worker_id, MessageKind::InitError, None, path, request).await {
        Err(response) => response,
        Ok(outcome) => {
            publish_error_event(&state, &worker_id, "", &outcome.sent_body);
            mirror(&outcome.head, outcome.reply_body)
        }
    }
}

struct TunnelOutcome {
    head: wire::ResponseHead,
    reply_body: Vec<u8>,
    /// What the worker sent, capped at [`CAPTURE_LIMIT`] for events.
    sent_body: Vec<u8>,
}

/// Streams a worker's Runtime API call through the bridge and awaits the
/// shim's proxied reply under the same message id.
async fn tunnel(
    state: &AdapterState,
    worker_id: &str,
    kind: MessageKind,
    message_id: Option<String>,
    path: String,
    request: Request,
) -> Result<TunnelOutcome, Response> {
    tracing::debug!(%worker_id, %path, "--> tunnel");
    let inbox = channels::worker_inbox(&state.prefix, worker_id);
    let mut writer = match message_id {
        Some(id) => state.client.writer_with_id(kind, &inbox, id),
        None => state.client.writer(kind, &inbox),
    };
    let id = writer.id().to_string();
    let reply = state.exchanges.register_reply(&id);

    let head = wire::RequestHead {
        method: Method::POST,
        path,
        headers: tunnel_headers(request.headers()),
    };
    let stream = request
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let mut body = CapturingReader::new(StreamReader::new(stream), CAPTURE_LIMIT);

    let sent = async {
        wire::write_request(&mut writer, &head, &mut body).await?;
        writer.close().await
    }
    .await;
    if let Err(err) = sent {
        state.exchanges.cancel_reply(&id);
        tracing::warn!(%worker_id, error = %err, "failed to tunnel request");
        return Err(error_response(StatusCode::BAD_GATEWAY, "bridge send failed"));
    }

    let reply_body = match timeout(REPLY_TIMEOUT, reply).await {
        Ok(Ok(body)) => body,
        Ok(Err(_)) => {
            return Err(error_response(StatusCode::BAD_GATEWAY, "bridge closed"));
        }
        Err(_) => {
            state.exchanges.cancel_reply(&id);
            tracing::warn!(%worker_id, "timed out waiting for shim reply");
            return Err(error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "no reply from remote worker",
            ));
        }
    };

    let (reply_head, mut reply_reader) = wire::read_response(BufReader::new(reply_body))
        .await
        .map_err(|err| {
            tracing::warn!(%worker_id, error = %err, "malformed shim reply");
            error_response(StatusCode::BAD_GATEWAY, "malformed shim reply")
        })?;
    let mut reply_bytes = Vec::new();
    reply_reader
        .read_to_end(&mut reply_bytes)
        .await
        .map_err(|err| {
            tracing::warn!(%worker_id, error = %err, "truncated shim reply");
            error_response(StatusCode::BAD_GATEWAY, "truncated shim reply")
        })?;

    tracing::debug!(%worker_id, status = %reply_head.status, "<-- tunnel");
    Ok(TunnelOutcome {
        head: reply_head,
        reply_body: reply_bytes,
        sent_body: body.into_captured(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct WireError {
    #[serde(rename = "errorType", default)]
    error_type: String,
    #[serde(rename = "errorMessage", default)]
    error_message: String,
    #[serde(default)]
    trace: Vec<String>,
}

fn publish_error_event(state: &AdapterState, worker_id: &str, request_id: &str, body: &[u8]) {
    let parsed: WireError = serde_json::from_slice(body).unwrap_or_default();
    state.bus.publish(Event::FunctionError(FunctionErrorEvent {
        function_id: state.exchanges.function_of(worker_id).unwrap_or_default(),
        worker_id: worker_id.to_string(),
        request_id: request_id.to_string(),
        error_type: parsed.error_type,
        error_message: parsed.error_message,
        trace: parsed.trace,
    }));
}

/// Copies a tunneled response onto the local HTTP exchange. Framing
/// headers are dropped; the server re-frames the buffered body.
fn mirror(head: &wire::ResponseHead, payload: Vec<u8>) -> Response {
    let mut builder = Response::builder().status(head.status);
    for (name, value) in head.headers.iter() {
        if name == header::TRANSFER_ENCODING || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from(payload))
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "invalid tunneled response"))
}

fn tunnel_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if name == header::HOST || name == header::CONNECTION {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn error_response(status: StatusCode, message: &str) -> Response {
    Response::builder()
        .status(status)
        .body(Body::from(message.to_string()))
        .expect("static error response")
}

/// Wraps a reader and keeps a bounded copy of everything read through it.
struct CapturingReader<R> {
    inner: R,
    captured: Vec<u8>,
    limit: usize,
}

impl<R> CapturingReader<R> {
    fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            limit,
        }
    }

    fn into_captured(self) -> Vec<u8> {
        self.captured
    }
}

impl<R> AsyncRead for CapturingReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let new = &buf.filled()[before..];
                let room = this.limit.saturating_sub(this.captured.len());
                let take = room.min(new.len());
                this.captured.extend_from_slice(&new[..take]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
