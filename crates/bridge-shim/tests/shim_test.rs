//! Shim integration tests against the in-process AppSync mock.

use std::sync::Arc;
use std::time::Duration;

use appsync_events::AuthConfig;
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use bridge_protocol::{Client, MessageKind, PingBody, TaskCompleteBody, TaskStartBody, channels};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn test_auth() -> AuthConfig {
    AuthConfig::new(
        SharedCredentialsProvider::new(Credentials::new("AKIDEXAMPLE", "secret", None, None, "test")),
        "us-east-1",
    )
}

fn test_credentials() -> Credentials {
    Credentials::new("AKIDEXAMPLE", "secret", Some("session".to_string()), None, "test")
}

/// The task shim announces `TaskStart` with credentials materialized into
/// the environment, then exits when the developer reports completion.
#[tokio::test]
async fn task_shim_announces_and_exits_on_completion() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let appsync = mock_appsync::MockAppsync::start().await;
    let token = CancellationToken::new();

    // Developer side listens on the dev inbox.
    let prefix = channels::prefix("app", "taskshim");
    let dev_conn = appsync_events::Connection::dial(
        token.clone(),
        test_auth(),
        appsync.http_endpoint(),
        appsync.realtime_endpoint(),
    )
    .await
    .unwrap();
    let (dev, mut dev_rx) = Client::start(dev_conn, "dev", &channels::dev_inbox(&prefix))
        .await
        .unwrap();

    let config = bridge_shim::TaskConfig {
        app: "app".into(),
        stage: "taskshim".into(),
        task_id: "task-9".into(),
        region: "us-east-1".into(),
        appsync_http: appsync.http_endpoint(),
        appsync_realtime: appsync.realtime_endpoint(),
    };
    let shim = tokio::spawn(bridge_shim::task::run_with(
        token.child_token(),
        config,
        test_auth(),
        test_credentials(),
    ));

    // TaskStart arrives with the credential environment.
    let mut message = timeout(Duration::from_secs(10), dev_rx.recv())
        .await
        .expect("task start should arrive")
        .expect("dev inbox open");
    assert_eq!(message.kind, MessageKind::TaskStart);
    let start: TaskStartBody = message.body.json().await.unwrap();
    assert_eq!(start.task_id, "task-9");
    assert!(
        start
            .environment
            .iter()
            .any(|e| e == "AWS_ACCESS_KEY_ID=AKIDEXAMPLE")
    );
    assert!(
        start
            .environment
            .iter()
            .any(|e| e == "AWS_SESSION_TOKEN=session")
    );

    // Ping keeps it alive; TaskComplete ends it.
    let inbox = channels::worker_inbox(&prefix, &message.source);
    let mut ping = dev.writer(MessageKind::Ping, &inbox);
    ping.write_json(&PingBody {}).await.unwrap();
    ping.close().await.unwrap();

    let mut complete = dev.writer(MessageKind::TaskComplete, &inbox);
    complete.write_json(&TaskCompleteBody {}).await.unwrap();
    complete.close().await.unwrap();

    let result = timeout(Duration::from_secs(10), shim)
        .await
        .expect("shim should exit")
        .expect("shim task join");
    assert!(result.is_ok(), "shim should exit cleanly: {result:?}");

    token.cancel();
}

#[derive(Default)]
struct TinyRuntimeApi {
    served: Mutex<bool>,
    responses: Mutex<Option<mpsc::Sender<String>>>,
}

async fn tiny_next(State(state): State<Arc<TinyRuntimeApi>>) -> impl IntoResponse {
    {
        let mut served = state.served.lock().await;
        if *served {
            // One invocation only; later polls hang like the real API.
            drop(served);
            std::future::pending::<()>().await;
            unreachable!();
        }
        *served = true;
    }
    (
        [
            ("lambda-runtime-aws-request-id", "req-offline"),
            ("content-type", "application/json"),
        ],
        "{\"ping\":true}",
    )
        .into_response()
}

async fn tiny_response(State(state): State<Arc<TinyRuntimeApi>>, body: String) -> impl IntoResponse {
    if let Some(tx) = state.responses.lock().await.clone() {
        let _ = tx.send(body).await;
    }
    (http::StatusCode::ACCEPTED, "{\"status\":\"OK\"}")
}

/// With no developer listening, the function shim answers the invocation
/// with the fixed fallback body after its three-second wait.
#[tokio::test]
async fn function_shim_falls_back_when_dev_is_absent() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let appsync = mock_appsync::MockAppsync::start().await;
    let token = CancellationToken::new();

    let (response_tx, mut response_rx) = mpsc::channel(1);
    let state = Arc::new(TinyRuntimeApi::default());
    *state.responses.lock().await = Some(response_tx);

    let app = Router::new()
        .route("/2018-06-01/runtime/invocation/next", get(tiny_next))
        .route(
            "/2018-06-01/runtime/invocation/{request_id}/response",
            post(tiny_response),
        )
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let runtime_api = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let config = bridge_shim::FunctionConfig {
        app: "app".into(),
        stage: "offline".into(),
        function_id: "fn-x".into(),
        region: "us-east-1".into(),
        appsync_http: appsync.http_endpoint(),
        appsync_realtime: appsync.realtime_endpoint(),
    };
    tokio::spawn(bridge_shim::function::run_with(
        token.child_token(),
        config,
        test_auth(),
        runtime_api,
        "2026/01/01/fn[$LATEST]00000000000000000000000000000000".to_string(),
    ));

    let fallback = timeout(Duration::from_secs(15), response_rx.recv())
        .await
        .expect("fallback response should be posted")
        .expect("channel open");
    assert_eq!(fallback, r#"{"body":"sst dev is not running"}"#);

    token.cancel();
}
