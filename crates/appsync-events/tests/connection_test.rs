//! Connection integration tests against the in-process AppSync mock.

use std::time::Duration;

use appsync_events::{AuthConfig, Connection};
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use serde_json::json;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn test_auth() -> AuthConfig {
    AuthConfig::new(
        SharedCredentialsProvider::new(Credentials::new("AKIDEXAMPLE", "secret", None, None, "test")),
        "us-east-1",
    )
}

async fn dial(server: &mock_appsync::MockAppsync, token: &CancellationToken) -> Connection {
    Connection::dial(
        token.clone(),
        test_auth(),
        server.http_endpoint(),
        server.realtime_endpoint(),
    )
    .await
    .expect("dial mock appsync")
}

#[tokio::test]
async fn subscribe_then_publish_delivers_the_event() {
    let server = mock_appsync::MockAppsync::start().await;
    let token = CancellationToken::new();
    let conn = dial(&server, &token).await;

    let mut sub = conn.subscribe("/sst/app/stage/in").await.expect("subscribe");
    conn.publish("/sst/app/stage/in", &json!({"n": 1}))
        .await
        .expect("publish");

    let event = timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("event should arrive")
        .expect("subscription open");
    assert_eq!(event, r#"{"n":1}"#);

    token.cancel();
}

#[tokio::test]
async fn publishes_only_reach_matching_channels() {
    let server = mock_appsync::MockAppsync::start().await;
    let token = CancellationToken::new();
    let conn = dial(&server, &token).await;

    let mut a = conn.subscribe("/sst/app/stage/a/in").await.unwrap();
    let mut b = conn.subscribe("/sst/app/stage/b/in").await.unwrap();

    conn.publish("/sst/app/stage/b/in", &json!("for-b"))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), b.recv())
        .await
        .expect("b should receive")
        .unwrap();
    assert_eq!(event, r#""for-b""#);
    assert!(
        timeout(Duration::from_millis(300), a.recv()).await.is_err(),
        "a must not receive b's event"
    );

    token.cancel();
}

/// Forced reconnect: previously registered subscriptions keep delivering
/// through the same handles, and the handshake sentinel never shows up as
/// data.
#[tokio::test]
async fn subscriptions_survive_a_dropped_connection() {
    let server = mock_appsync::MockAppsync::start().await;
    let token = CancellationToken::new();
    let conn = dial(&server, &token).await;

    let mut sub = conn.subscribe("/sst/app/stage/in").await.unwrap();
    conn.publish("/sst/app/stage/in", &json!({"seq": 0}))
        .await
        .unwrap();
    assert_eq!(
        timeout(Duration::from_secs(5), sub.recv()).await.unwrap().unwrap(),
        r#"{"seq":0}"#
    );

    server.drop_connections();

    // Publish (with retries) until the reconnected subscription hears one;
    // events published into the gap are allowed to be lost.
    let mut delivered = None;
    for seq in 1..=50 {
        conn.publish("/sst/app/stage/in", &json!({"seq": seq}))
            .await
            .unwrap();
        if let Ok(Some(event)) = timeout(Duration::from_millis(300), sub.recv()).await {
            delivered = Some(event);
            break;
        }
    }
    let delivered = delivered.expect("subscription should deliver after reconnect");
    assert!(
        delivered.starts_with(r#"{"seq":"#),
        "unexpected event after reconnect: {delivered}"
    );
    assert_ne!(delivered, "ok", "handshake sentinel must not leak as data");

    token.cancel();
}

/// Keep-alive expiry resets the connection; the client dials again on its
/// own and keeps serving the same subscriptions.
#[tokio::test]
async fn keep_alive_expiry_triggers_a_reconnect() {
    let server = mock_appsync::MockAppsync::builder()
        .connection_timeout_ms(300)
        .ka_interval(Duration::from_secs(3600))
        .start()
        .await;
    let token = CancellationToken::new();
    let conn = dial(&server, &token).await;

    let mut sub = conn.subscribe("/sst/app/ka/in").await.unwrap();

    // Wait past the keep-alive window so the client resets at least once.
    tokio::time::sleep(Duration::from_millis(900)).await;

    let mut delivered = false;
    for seq in 0..50 {
        conn.publish("/sst/app/ka/in", &json!({"seq": seq}))
            .await
            .unwrap();
        if timeout(Duration::from_millis(300), sub.recv()).await.is_ok() {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "subscription should deliver after keep-alive reset");

    token.cancel();
}

#[tokio::test]
async fn cancellation_closes_subscription_sinks() {
    let server = mock_appsync::MockAppsync::start().await;
    let token = CancellationToken::new();
    let conn = dial(&server, &token).await;

    let mut sub = conn.subscribe("/sst/app/stage/in").await.unwrap();
    token.cancel();

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            if sub.recv().await.is_none() {
                return;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "sink should close after cancellation");
}
