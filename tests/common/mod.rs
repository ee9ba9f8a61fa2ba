//! Shared fixtures for the workspace integration harness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Path as AxumPath, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use dev_bridge::runtime::{
    BuildInput, BuildOutput, LogStream, RunInput, Runtime, RuntimeError, Worker,
};
use http::StatusCode;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Static credentials for signing against the mock server (which ignores
/// signatures).
pub fn test_auth() -> appsync_events::AuthConfig {
    use aws_credential_types::Credentials;
    use aws_credential_types::provider::SharedCredentialsProvider;
    appsync_events::AuthConfig::new(
        SharedCredentialsProvider::new(Credentials::new(
            "AKIDEXAMPLE",
            "secret",
            None,
            None,
            "test",
        )),
        "us-east-1",
    )
}

/// A miniature Lambda Runtime API: queued invocations served to a runtime
/// client via long-polling, recorded responses and errors.
pub struct MockRuntimeApi {
    addr: SocketAddr,
    state: Arc<RuntimeApiState>,
}

#[derive(Default)]
pub struct RuntimeApiState {
    queue: Mutex<Vec<(String, Value)>>,
    queued: Notify,
    completed: Mutex<HashMap<String, Completion>>,
    done: Notify,
    init_errors: Mutex<Vec<Value>>,
    counter: Mutex<u64>,
}

#[derive(Clone, Debug)]
pub enum Completion {
    Response(Value),
    Error(Value),
}

impl MockRuntimeApi {
    pub async fn start() -> Self {
        let state = Arc::new(RuntimeApiState::default());
        let app = Router::new()
            .route("/2018-06-01/runtime/invocation/next", get(next))
            .route(
                "/2018-06-01/runtime/invocation/{request_id}/response",
                post(respond),
            )
            .route(
                "/2018-06-01/runtime/invocation/{request_id}/error",
                post(fail),
            )
            .route("/2018-06-01/runtime/init/error", post(init_error))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { addr, state }
    }

    /// `host:port` form expected in `AWS_LAMBDA_RUNTIME_API`.
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Queues an invocation and returns its request id.
    pub fn enqueue(&self, payload: Value) -> String {
        let mut counter = self.state.counter.lock().unwrap();
        *counter += 1;
        let request_id = format!("req-{counter}");
        drop(counter);
        self.state
            .queue
            .lock()
            .unwrap()
            .push((request_id.clone(), payload));
        self.state.queued.notify_one();
        request_id
    }

    /// Waits until the runtime completes the invocation.
    pub async fn wait_for_completion(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Option<Completion> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(done) = self.state.completed.lock().unwrap().get(request_id) {
                return Some(done.clone());
            }
            if tokio::time::timeout_at(deadline, self.state.done.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    pub fn init_errors(&self) -> Vec<Value> {
        self.state.init_errors.lock().unwrap().clone()
    }
}

async fn next(State(state): State<Arc<RuntimeApiState>>) -> Response {
    loop {
        {
            let mut queue = state.queue.lock().unwrap();
            if let Some((request_id, payload)) = queue.first().cloned() {
                queue.remove(0);
                drop(queue);
                return Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "application/json")
                    .header("lambda-runtime-aws-request-id", &request_id)
                    .header("lambda-runtime-deadline-ms", "9999999999999")
                    .header(
                        "lambda-runtime-invoked-function-arn",
                        "arn:aws:lambda:us-east-1:000000000000:function:test",
                    )
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap();
            }
        }
        state.queued.notified().await;
    }
}

async fn respond(
    State(state): State<Arc<RuntimeApiState>>,
    AxumPath(request_id): AxumPath<String>,
    body: String,
) -> impl IntoResponse {
    let payload: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
    state
        .completed
        .lock()
        .unwrap()
        .insert(request_id, Completion::Response(payload));
    state.done.notify_one();
    (StatusCode::ACCEPTED, "{\"status\":\"OK\"}")
}

async fn fail(
    State(state): State<Arc<RuntimeApiState>>,
    AxumPath(request_id): AxumPath<String>,
    body: String,
) -> impl IntoResponse {
    let payload: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
    state
        .completed
        .lock()
        .unwrap()
        .insert(request_id, Completion::Error(payload));
    state.done.notify_one();
    (StatusCode::ACCEPTED, "{\"status\":\"OK\"}")
}

async fn init_error(
    State(state): State<Arc<RuntimeApiState>>,
    body: String,
) -> impl IntoResponse {
    let payload: Value = serde_json::from_str(&body).unwrap_or(Value::String(body));
    state.init_errors.lock().unwrap().push(payload);
    state.done.notify_one();
    (StatusCode::ACCEPTED, "{\"status\":\"OK\"}")
}

/// A runtime whose workers are in-process tasks that echo invocations back
/// through the local adapter.
pub struct EchoRuntime {
    pub request_ids: Arc<Mutex<Vec<String>>>,
}

impl EchoRuntime {
    pub fn new() -> Self {
        Self {
            request_ids: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl Runtime for EchoRuntime {
    fn matches(&self, runtime: &str) -> bool {
        runtime == "test"
    }

    async fn build(&self, input: &BuildInput) -> Result<BuildOutput, RuntimeError> {
        Ok(BuildOutput {
            handler: "echo".into(),
            out: input.out.clone(),
            errors: vec![],
            sourcemaps: vec![],
        })
    }

    async fn run(&self, input: RunInput) -> Result<Box<dyn Worker>, RuntimeError> {
        let (log_tx, log_rx) = mpsc::channel(16);
        let seen = Arc::clone(&self.request_ids);
        let base = format!("http://{}", input.server);
        let handle = tokio::spawn(async move {
            let http = reqwest::Client::new();
            loop {
                let Ok(next) = http
                    .get(format!("{base}/runtime/invocation/next"))
                    .send()
                    .await
                else {
                    return;
                };
                if !next.status().is_success() {
                    return;
                }
                let request_id = next
                    .headers()
                    .get("lambda-runtime-aws-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push(request_id.clone());
                let input: Value = next.json().await.unwrap_or_default();
                let _ = log_tx.send(format!("handling {request_id}")).await;
                let body = serde_json::json!({"ok": true, "echo": input});
                let _ = http
                    .post(format!("{base}/runtime/invocation/{request_id}/response"))
                    .header("content-type", "application/json")
                    .body(body.to_string())
                    .send()
                    .await;
            }
        });
        Ok(Box::new(EchoWorker {
            handle,
            logs: Some(log_rx),
        }))
    }

    fn should_rebuild(&self, _function_id: &str, _path: &Path) -> bool {
        false
    }
}

struct EchoWorker {
    handle: JoinHandle<()>,
    logs: Option<LogStream>,
}

impl Worker for EchoWorker {
    fn take_logs(&mut self) -> Option<LogStream> {
        self.logs.take()
    }

    fn stop(&mut self) {
        self.handle.abort();
    }
}
