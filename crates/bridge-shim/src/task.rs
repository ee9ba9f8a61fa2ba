//! The container task shim.
//!
//! Runs as a task's entrypoint: announces `TaskStart` with the full
//! container environment (AWS credentials materialized so the local run
//! inherits the task role), then idles until the developer side reports
//! completion or the session goes quiet.

use std::time::Duration;

use appsync_events::{AuthConfig, Connection};
use aws_credential_types::provider::ProvideCredentials;
use bridge_protocol::{Client, MessageKind, TaskStartBody, channels, ids};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::TaskConfig;
use crate::environment;
use crate::error::{Error, Result};

/// Give up when the developer side has been silent this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the task shim with configuration taken from the process
/// environment.
pub async fn run(token: CancellationToken) -> Result<()> {
    let config = TaskConfig::load()?;
    let sdk = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.region.clone()))
        .load()
        .await;
    let auth = AuthConfig::from_sdk_config(&sdk)?;

    let credentials = sdk
        .credentials_provider()
        .ok_or(Error::MissingEnv("AWS credentials"))?
        .provide_credentials()
        .await
        .map_err(Error::Credentials)?;

    run_with(token, config, auth, credentials).await
}

/// Runs the task shim with explicit configuration.
pub async fn run_with(
    token: CancellationToken,
    config: TaskConfig,
    auth: AuthConfig,
    credentials: aws_credential_types::Credentials,
) -> Result<()> {
    let worker_id = ids::ascending();
    let prefix = channels::prefix(&config.app, &config.stage);
    tracing::info!(%worker_id, %prefix, task_id = %config.task_id, "starting task shim");

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

    let mut start = TaskStartBody {
        task_id: config.task_id.clone(),
        environment: environment::all(),
    };
    start
        .environment
        .push(format!("AWS_ACCESS_KEY_ID={}", credentials.access_key_id()));
    start.environment.push(format!(
        "AWS_SECRET_ACCESS_KEY={}",
        credentials.secret_access_key()
    ));
    if let Some(session_token) = credentials.session_token() {
        start
            .environment
            .push(format!("AWS_SESSION_TOKEN={session_token}"));
    }

    let mut writer = client.writer(MessageKind::TaskStart, &channels::dev_inbox(&prefix));
    writer.write_json(&start).await?;
    writer.close().await?;
    tracing::info!("sent task start");

    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            message = timeout(IDLE_TIMEOUT, inbox.recv()) => {
                let message = match message {
                    Err(_) => {
                        tracing::info!("idle timeout, exiting");
                        return Ok(());
                    }
                    Ok(None) => return Ok(()),
                    Ok(Some(message)) => message,
                };
                if message.source != "dev" {
                    continue;
                }
                match message.kind {
                    MessageKind::Ping => {
                        tracing::debug!("dev ping");
                    }
                    MessageKind::TaskComplete => {
                        tracing::info!("task complete");
                        return Ok(());
                    }
                    other => {
                        tracing::debug!(kind = ?other, "ignoring message");
                    }
                }
            }
        }
    }
}
