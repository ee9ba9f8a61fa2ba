//! The function shim main loop.
//!
//! Runs in place of the customer handler. For each invocation pulled from
//! the Lambda Runtime API it announces a `Ping` on the developer inbox and
//! then serves the developer's tunneled Runtime API calls until the
//! invocation is answered. If no bridge message arrives within three
//! seconds of the announcement, the invocation is completed with a fixed
//! fallback body so callers fail fast instead of hanging.

use std::time::Duration;

use appsync_events::{AuthConfig, Connection};
use bridge_protocol::{Client, InitBody, Message, MessageKind, PingBody, channels, wire};
use http::{HeaderMap, StatusCode, header};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::config::FunctionConfig;
use crate::environment;
use crate::error::{Error, Result};

/// How long to wait for any sign of the developer before failing fast.
const DEV_WAIT: Duration = Duration::from_secs(3);

/// Body returned to callers when the dev session is not running.
const NOT_RUNNING_BODY: &str = r#"{"body":"sst dev is not running"}"#;

/// Length of the worker id taken from the tail of the log stream name.
const WORKER_ID_LEN: usize = 32;

/// Derives the worker id from the Lambda log stream name. The tail is
/// stable for the lifetime of the execution environment.
pub fn worker_id_from_log_stream(log_stream: &str) -> String {
    let tail = log_stream.len().saturating_sub(WORKER_ID_LEN);
    log_stream[tail..].to_string()
}

/// One invocation pulled from the Runtime API, buffered so it can be
/// replayed to the developer on demand.
struct PendingInvocation {
    request_id: String,
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

/// Runs the function shim with configuration and Lambda environment taken
/// from the process environment.
pub async fn run(token: CancellationToken) -> Result<()> {
    let config = FunctionConfig::load()?;
    let runtime_api = std::env::var("AWS_LAMBDA_RUNTIME_API")
        .map_err(|_| Error::MissingEnv("AWS_LAMBDA_RUNTIME_API"))?;
    let log_stream = std::env::var("AWS_LAMBDA_LOG_STREAM_NAME")
        .map_err(|_| Error::MissingEnv("AWS_LAMBDA_LOG_STREAM_NAME"))?;

    let sdk = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;
    let auth = AuthConfig::from_sdk_config(&sdk)?;

    run_with(token, config, auth, runtime_api, log_stream).await
}

/// Runs the function shim with explicit configuration.
pub async fn run_with(
    token: CancellationToken,
    config: FunctionConfig,
    auth: AuthConfig,
    runtime_api: String,
    log_stream: String,
) -> Result<()> {
    let worker_id = worker_id_from_log_stream(&log_stream);
    let prefix = channels::prefix(&config.app, &config.stage);
    tracing::info!(%worker_id, %prefix, "starting function shim");

    let conn = Connection::dial(
        token.clone(),
        auth,
        config.appsync_http.clone(),
        config.appsync_realtime.clone(),
    )
    .await?;

    let (client, mut inbox) = Client::start(
        conn,
        worker_id.clone(),
        &channels::worker_inbox(&prefix, &worker_id),
    )
    .await?;
    let dev_inbox = channels::dev_inbox(&prefix);

    let init = InitBody {
        function_id: config.function_id.clone(),
        environment: environment::filtered(),
    };
    send_init(&client, &dev_inbox, &init).await?;

    // Long polls must never time out client-side.
    let http = reqwest::Client::builder().build()?;

    loop {
        if token.is_cancelled() {
            return Ok(());
        }

        let pending = next_invocation(&http, &runtime_api).await?;
        tracing::info!(request_id = %pending.request_id, "invocation received");

        let mut ping = client.writer(MessageKind::Ping, &dev_inbox);
        ping.write_json(&PingBody {}).await?;
        ping.close().await?;

        // First contact decides whether the dev side is alive at all.
        let first = match timeout(DEV_WAIT, inbox.recv()).await {
            Err(_) => {
                tracing::info!(request_id = %pending.request_id, "timeout, dev not running");
                default_response(&http, &runtime_api, &pending.request_id).await;
                continue;
            }
            Ok(None) => return Ok(()),
            Ok(Some(message)) => Some(message),
        };

        serve_invocation(
            &client,
            &http,
            &runtime_api,
            &dev_inbox,
            &init,
            &pending,
            first,
            &mut inbox,
        )
        .await?;
    }
}

/// Serves bridge messages for one invocation until a response or error
/// endpoint is hit.
#[allow(clippy::too_many_arguments)]
async fn serve_invocation(
    client: &Client,
    http: &reqwest::Client,
    runtime_api: &str,
    dev_inbox: &str,
    init: &InitBody,
    pending: &PendingInvocation,
    mut first: Option<Message>,
    inbox: &mut mpsc::Receiver<Message>,
) -> Result<()> {
    let mut claimed = false;

    loop {
        let message = match first.take() {
            Some(message) => message,
            None => match inbox.recv().await {
                Some(message) => message,
                None => return Ok(()),
            },
        };

        match message.kind {
            MessageKind::Ping => {
                if !claimed {
                    claimed = true;
                    send_next(client, dev_inbox, pending).await?;
                }
            }
            MessageKind::Reboot => {
                tracing::info!("reboot requested, re-announcing");
                send_init(client, dev_inbox, init).await?;
                claimed = false;
            }
            MessageKind::Response | MessageKind::Error | MessageKind::InitError => {
                if proxy(client, http, runtime_api, dev_inbox, message).await? {
                    return Ok(());
                }
            }
            other => {
                tracing::debug!(kind = ?other, "ignoring message");
            }
        }
    }
}

/// Long-polls the Runtime API for the next invocation and buffers it.
async fn next_invocation(http: &reqwest::Client, runtime_api: &str) -> Result<PendingInvocation> {
    let response = http
        .get(format!(
            "http://{runtime_api}/2018-06-01/runtime/invocation/next"
        ))
        .send()
        .await?;

    let request_id = response
        .headers()
        .get("lambda-runtime-aws-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let status = response.status();

    // Strip framing headers: the buffered body is re-framed by its exact
    // length when replayed over the bridge.
    let mut headers = response.headers().clone();
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONTENT_LENGTH);

    let body = response.bytes().await?.to_vec();
    headers.insert(
        header::CONTENT_LENGTH,
        http::HeaderValue::from_str(&body.len().to_string())
            .expect("length is a valid header value"),
    );

    Ok(PendingInvocation {
        request_id,
        status,
        headers,
        body,
    })
}

async fn send_init(client: &Client, dev_inbox: &str, init: &InitBody) -> Result<()> {
    let mut writer = client.writer(MessageKind::Init, dev_inbox);
    writer.write_json(init).await?;
    writer.close().await?;
    Ok(())
}

/// Replays the buffered invocation to the developer as a `Next` message.
async fn send_next(client: &Client, dev_inbox: &str, pending: &PendingInvocation) -> Result<()> {
    tracing::debug!(request_id = %pending.request_id, "forwarding invocation");
    let mut writer = client.writer(MessageKind::Next, dev_inbox);
    let head = wire::ResponseHead {
        status: pending.status,
        headers: pending.headers.clone(),
    };
    let mut body = pending.body.as_slice();
    wire::write_response(&mut writer, &head, &mut body).await?;
    writer.close().await?;
    Ok(())
}

/// Proxies one tunneled Runtime API call and replies over the bridge under
/// the same message id. Returns true when the call completed the
/// invocation (a response or error endpoint).
async fn proxy(
    client: &Client,
    http: &reqwest::Client,
    runtime_api: &str,
    dev_inbox: &str,
    message: Message,
) -> Result<bool> {
    let id = message.id;
    let parsed = wire::read_request(BufReader::new(message.body)).await;
    let (head, body) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, "dropping malformed tunneled request");
            return Ok(false);
        }
    };
    let path = head.path.clone();
    tracing::debug!(%path, "proxying");

    let mut request = http.request(
        head.method.clone(),
        format!("http://{runtime_api}{path}"),
    );
    for (name, value) in head.headers.iter() {
        if name == header::HOST {
            continue;
        }
        request = request.header(name, value);
    }
    let response = request
        .body(reqwest::Body::wrap_stream(ReaderStream::new(body)))
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(%path, error = %err, "runtime api call failed");
            return Ok(false);
        }
    };

    let reply_kind = if path.ends_with("/response") {
        MessageKind::Response
    } else {
        MessageKind::Error
    };
    // The decoded byte stream is re-framed on the wire, so the original
    // transfer encoding must not travel with it.
    let mut reply_headers = response.headers().clone();
    reply_headers.remove(header::TRANSFER_ENCODING);
    let reply_head = wire::ResponseHead {
        status: response.status(),
        headers: reply_headers,
    };
    let mut writer = client.writer_with_id(reply_kind, dev_inbox, id);
    let mut reply_body = reply_stream(response);
    wire::write_response(&mut writer, &reply_head, &mut reply_body).await?;
    writer.close().await?;
    tracing::debug!(%path, "replied");

    Ok(path.ends_with("/response") || path.ends_with("/error"))
}

fn reply_stream(response: reqwest::Response) -> impl tokio::io::AsyncRead + Unpin {
    use futures_util::TryStreamExt;
    tokio_util::io::StreamReader::new(
        response.bytes_stream().map_err(std::io::Error::other),
    )
}

/// Completes an invocation with the fallback body when the dev side is
/// absent.
async fn default_response(http: &reqwest::Client, runtime_api: &str, request_id: &str) {
    let result = http
        .post(format!(
            "http://{runtime_api}/2018-06-01/runtime/invocation/{request_id}/response"
        ))
        .header(header::CONTENT_TYPE, "application/json")
        .body(NOT_RUNNING_BODY)
        .send()
        .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to post fallback response");
    }
}
