//! End-to-end harness: mock AppSync + mock Lambda Runtime API + real
//! bridge on both sides.
//!
//! Exercises the cold invocation path: the shim pings, the controller
//! builds and runs a worker, the worker long-polls the local adapter,
//! answers, and the shim hands the response back to the (mock) Runtime
//! API with the request id preserved end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use appsync_events::Connection;
use dev_bridge::events::Event;
use dev_bridge::runtime::{BuildInput, RuntimeRegistry};
use dev_bridge::Bus;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{Completion, EchoRuntime, MockRuntimeApi, test_auth};

/// A log stream name whose 32-character tail is the worker id.
const LOG_STREAM: &str = "2026/01/01/test[$LATEST]0123456789abcdef0123456789abcdef";
const WORKER_ID: &str = "0123456789abcdef0123456789abcdef";

#[tokio::test]
async fn cold_invocation_round_trips_through_the_bridge() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let appsync = mock_appsync::MockAppsync::start().await;
    let token = CancellationToken::new();
    let log_dir = tempfile::tempdir().unwrap();

    // Developer side.
    let dev_conn = Connection::dial(
        token.clone(),
        test_auth(),
        appsync.http_endpoint(),
        appsync.realtime_endpoint(),
    )
    .await
    .expect("dev dial");

    let bus = Bus::new();
    let echo = EchoRuntime::new();
    let seen_requests = Arc::clone(&echo.request_ids);
    let registry = Arc::new(RuntimeRegistry::new(vec![Box::new(echo)]));
    let config = dev_bridge::Config {
        app: "harness".into(),
        stage: "test".into(),
        appsync_http: appsync.http_endpoint(),
        appsync_realtime: appsync.realtime_endpoint(),
        bind: "127.0.0.1:0".into(),
        log_directory: log_dir.path().to_path_buf(),
    };
    let _bridge = dev_bridge::start(token.clone(), config, dev_conn, registry, bus.clone())
        .await
        .expect("bridge start");

    bus.publish(Event::Target(BuildInput {
        function_id: "fn-echo".into(),
        runtime: "test".into(),
        handler: "ignored".into(),
        out: log_dir.path().to_path_buf(),
        properties: json!({}),
    }));
    // Let the controller pick the target up before the shim announces.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Remote side.
    let runtime_api = MockRuntimeApi::start().await;
    let request_id = runtime_api.enqueue(json!({"hello": "world"}));

    let shim_config = bridge_shim::FunctionConfig {
        app: "harness".into(),
        stage: "test".into(),
        function_id: "fn-echo".into(),
        region: "us-east-1".into(),
        appsync_http: appsync.http_endpoint(),
        appsync_realtime: appsync.realtime_endpoint(),
    };
    let shim_token = token.child_token();
    tokio::spawn(bridge_shim::function::run_with(
        shim_token,
        shim_config,
        test_auth(),
        runtime_api.endpoint(),
        LOG_STREAM.to_string(),
    ));

    // The Lambda caller observes the worker's response.
    let completion = runtime_api
        .wait_for_completion(&request_id, Duration::from_secs(15))
        .await
        .expect("invocation should complete");
    match completion {
        Completion::Response(body) => {
            assert_eq!(body, json!({"ok": true, "echo": {"hello": "world"}}));
        }
        Completion::Error(err) => panic!("invocation failed: {err}"),
    }

    // The request id crossed the bridge intact.
    assert!(
        seen_requests.lock().unwrap().contains(&request_id),
        "worker should have seen the original request id"
    );

    // A second invocation reuses the warm worker.
    let second = runtime_api.enqueue(json!({"round": 2}));
    let completion = runtime_api
        .wait_for_completion(&second, Duration::from_secs(15))
        .await
        .expect("second invocation should complete");
    match completion {
        Completion::Response(body) => {
            assert_eq!(body["echo"]["round"], json!(2));
        }
        Completion::Error(err) => panic!("second invocation failed: {err}"),
    }

    // The worker id announced by the shim matches the log stream tail.
    assert_eq!(
        bridge_shim::function::worker_id_from_log_stream(LOG_STREAM),
        WORKER_ID
    );

    token.cancel();
}
