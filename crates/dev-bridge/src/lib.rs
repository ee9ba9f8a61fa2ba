//! # Dev Bridge
//!
//! The local side of the live-lambda dev bridge. Remote Lambda containers
//! run a small shim instead of the customer handler; this crate receives
//! their traffic over an AppSync Events connection and runs the real
//! function code in worker processes on the developer's machine.
//!
//! ## Pieces
//!
//! - A **worker controller** actor owns all function-side state: build
//!   targets, cached build outputs, and live workers. It reacts to bridge
//!   messages (`Init`, `Ping`, `Next`, tunneled replies), file-change
//!   events, and stage redeploys.
//! - The **runtime abstraction** ([`runtime::Runtime`]) hides languages
//!   behind build/run/should-rebuild operations; [`provided::ProvidedRuntime`]
//!   runs prebuilt bootstrap binaries.
//! - The **local adapter** serves the Lambda Runtime API to worker
//!   processes under `/lambda/{workerId}/…` and translates every HTTP
//!   interaction into bridge messages.
//! - A **task controller** runs container tasks locally when their remote
//!   shim announces `TaskStart`.
//! - Everything observable is published on the [`bus::Bus`]; a file logger
//!   mirrors function events into per-request log files.
//!
//! [`start`] wires all of it together and returns a handle with the local
//! adapter's address.

pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod provided;
pub mod runtime;

pub(crate) mod adapter;
pub(crate) mod controller;
pub(crate) mod exchange;
pub(crate) mod logs;
pub(crate) mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;

use appsync_events::Connection;
use bridge_protocol::{Client, Message, MessageKind, channels};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use bus::Bus;
pub use config::Config;
pub use error::{Error, Result};

use crate::adapter::AdapterState;
use crate::controller::Controller;
use crate::exchange::Exchanges;
use crate::runtime::RuntimeRegistry;
use crate::tasks::TaskController;

/// Bound on messages queued for each handler subsystem.
const ROUTE_BUFFER: usize = 1000;

/// The bridge client identifies the local side as `"dev"` on the wire.
const DEV_SOURCE: &str = "dev";

/// A running dev bridge.
pub struct DevBridge {
    /// Address the local Runtime API adapter is bound to.
    pub addr: SocketAddr,
}

impl DevBridge {
    /// The `host:port/lambda/` base workers are pointed at; a worker's full
    /// Runtime API address is this plus its worker id.
    pub fn server(&self) -> String {
        format!("{}/lambda/", self.addr)
    }
}

/// Starts the bridge: subscribes to the dev inbox, binds the local
/// adapter, and spawns the controller, task, and logging actors.
///
/// All spawned work stops when `token` is cancelled.
pub async fn start(
    token: CancellationToken,
    config: Config,
    conn: Connection,
    registry: Arc<RuntimeRegistry>,
    bus: Bus,
) -> Result<DevBridge> {
    let prefix = channels::prefix(&config.app, &config.stage);
    let (client, messages) =
        Client::start(conn, DEV_SOURCE, &channels::dev_inbox(&prefix)).await?;
    let exchanges = Arc::new(Exchanges::new());

    let listener = tokio::net::TcpListener::bind(config.bind.as_str()).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "local runtime api listening");

    let app = adapter::router(AdapterState {
        client: client.clone(),
        exchanges: Arc::clone(&exchanges),
        bus: bus.clone(),
        prefix: prefix.clone(),
    });
    {
        let token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                tracing::error!(error = %err, "local adapter server failed");
            }
        });
    }

    let (function_tx, function_rx) = mpsc::channel(ROUTE_BUFFER);
    let (task_tx, task_rx) = mpsc::channel(ROUTE_BUFFER);
    tokio::spawn(route(messages, function_tx, task_tx));

    let controller = Controller::new(
        client.clone(),
        registry,
        bus.clone(),
        Arc::clone(&exchanges),
        prefix.clone(),
        format!("{addr}/lambda/"),
    );
    tokio::spawn(controller.run(function_rx, token.clone()));

    let task_controller = TaskController::new(client, bus.clone(), prefix);
    tokio::spawn(task_controller.run(task_rx, token.clone()));

    logs::start(&bus, config.log_directory.clone(), token);

    Ok(DevBridge { addr })
}

/// Fans inbound messages out to the function and task subsystems.
async fn route(
    mut messages: mpsc::Receiver<Message>,
    function_tx: mpsc::Sender<Message>,
    task_tx: mpsc::Sender<Message>,
) {
    while let Some(message) = messages.recv().await {
        let result = match message.kind {
            MessageKind::TaskStart | MessageKind::TaskComplete => task_tx.send(message).await,
            _ => function_tx.send(message).await,
        };
        if result.is_err() {
            return;
        }
    }
}
