//! The worker controller: one actor owning all function-side state.
//!
//! All maps live on a single task; inputs arrive over channels and are
//! multiplexed with `select!`, so no lock is ever shared with another
//! task. Log scanners, init-error posts, and outbound bridge sends are
//! spawned off the actor so it never blocks on I/O it does not own.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bridge_protocol::{
    Client, InitBody, Message, MessageKind, PingBody, RebootBody, channels,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::events::{Event, FunctionBuildEvent, FunctionLogEvent};
use crate::exchange::Exchanges;
use crate::runtime::{BuildInput, BuildOutput, RunInput, RuntimeRegistry, Worker};

/// Body posted to close out an invocation whose function cannot build.
const BUILD_FAILURE_BODY: &str = r#"{"errorMessage":"Function failed to build"}"#;

/// Bound on the fallback GET that drains a pending invocation after an
/// init-error was rejected.
const FALLBACK_NEXT_TIMEOUT: Duration = Duration::from_secs(30);

struct WorkerEntry {
    function_id: String,
    /// Monotonic instance number; shutdown notices carry it so cleanup
    /// never deletes a replacement worker.
    instance: u64,
    worker: Box<dyn Worker>,
    current_request_id: Arc<StdMutex<String>>,
}

/// The controller actor. Constructed by the bridge composition root and
/// consumed by [`Controller::run`].
pub(crate) struct Controller {
    client: Client,
    registry: Arc<RuntimeRegistry>,
    bus: Bus,
    exchanges: Arc<Exchanges>,
    prefix: String,
    /// `host:port/lambda/` base of the local adapter.
    server: String,
    http: reqwest::Client,

    targets: HashMap<String, BuildInput>,
    builds: HashMap<String, BuildOutput>,
    workers: HashMap<String, WorkerEntry>,
    worker_env: HashMap<String, Vec<String>>,
    instances: u64,
    shutdown_tx: mpsc::Sender<(String, u64)>,
    shutdown_rx: Option<mpsc::Receiver<(String, u64)>>,
}

impl Controller {
    pub(crate) fn new(
        client: Client,
        registry: Arc<RuntimeRegistry>,
        bus: Bus,
        exchanges: Arc<Exchanges>,
        prefix: String,
        server: String,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1000);
        Self {
            client,
            registry,
            bus,
            exchanges,
            prefix,
            server,
            http: reqwest::Client::new(),
            targets: HashMap::new(),
            builds: HashMap::new(),
            workers: HashMap::new(),
            worker_env: HashMap::new(),
            instances: 0,
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        }
    }

    /// Runs the actor until the token is cancelled or every input closes.
    pub(crate) async fn run(
        mut self,
        mut messages: mpsc::Receiver<Message>,
        token: CancellationToken,
    ) {
        let mut events = self.bus.subscribe();
        let mut shutdown_rx = self.shutdown_rx.take().expect("run called twice");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => self.on_message(message).await,
                    None => break,
                },
                notice = shutdown_rx.recv() => {
                    if let Some((worker_id, instance)) = notice {
                        self.on_worker_shutdown(&worker_id, instance);
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "controller lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        for (_, mut entry) in self.workers.drain() {
            entry.worker.stop();
        }
    }

    async fn on_message(&mut self, mut message: Message) {
        match message.kind {
            MessageKind::Init => {
                let init: InitBody = match message.body.json().await {
                    Ok(init) => init,
                    Err(err) => {
                        tracing::warn!(error = %err, "dropping malformed init");
                        return;
                    }
                };
                let worker_id = message.source;
                if !self.targets.contains_key(&init.function_id) {
                    tracing::info!(function_id = %init.function_id, "dev not ready yet, dropping init");
                    return;
                }
                tracing::info!(%worker_id, function_id = %init.function_id, "worker init");
                self.worker_env
                    .insert(worker_id.clone(), init.environment.clone());
                self.exchanges.set_function(&worker_id, &init.function_id);
                if !self.start_worker(&init.function_id, &worker_id).await {
                    self.post_build_failure(&worker_id);
                }
            }
            MessageKind::Ping => {
                let worker_id = message.source;
                tracing::debug!(%worker_id, "ping");
                self.send_to_worker(&worker_id, MessageKind::Ping, PingBody {});
                if self.workers.contains_key(&worker_id) {
                    return;
                }
                // A ping with no live worker: either the worker crashed
                // (env and target are still known, run it again) or this
                // side restarted (ask the container to re-init).
                let known = self
                    .exchanges
                    .function_of(&worker_id)
                    .filter(|function_id| self.targets.contains_key(function_id))
                    .filter(|_| self.worker_env.contains_key(&worker_id));
                match known {
                    Some(function_id) => {
                        if !self.start_worker(&function_id, &worker_id).await {
                            self.post_build_failure(&worker_id);
                        }
                    }
                    None => self.send_to_worker(&worker_id, MessageKind::Reboot, RebootBody {}),
                }
            }
            MessageKind::Next => {
                let worker_id = message.source;
                if !self.workers.contains_key(&worker_id) {
                    tracing::info!(%worker_id, "next for missing worker, sending reboot");
                    self.send_to_worker(&worker_id, MessageKind::Reboot, RebootBody {});
                }
                self.exchanges.push_next(&worker_id, message.body);
            }
            MessageKind::Response | MessageKind::Error => {
                if !self.exchanges.resolve_reply(&message.id, message.body) {
                    tracing::debug!(id = %message.id, "reply with no pending exchange");
                }
            }
            other => {
                tracing::debug!(kind = ?other, "unexpected message kind on function path");
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::Target(input) => {
                self.targets.insert(input.function_id.clone(), input);
            }
            Event::FileChanged(evt) => self.on_file_changed(&evt.path).await,
            Event::Complete(_) => {
                tracing::info!("stage redeployed, recycling workers and builds");
                for (_, mut entry) in self.workers.drain() {
                    entry.worker.stop();
                }
                self.builds.clear();
                self.worker_env.clear();
                self.exchanges.clear();
            }
            Event::FunctionInvoked(evt) => {
                if let Some(entry) = self.workers.get(&evt.worker_id) {
                    *entry
                        .current_request_id
                        .lock()
                        .expect("request id lock poisoned") = evt.request_id.clone();
                }
            }
            _ => {}
        }
    }

    fn on_worker_shutdown(&mut self, worker_id: &str, instance: u64) {
        let stale = self
            .workers
            .get(worker_id)
            .map(|entry| entry.instance == instance)
            .unwrap_or(false);
        // Only delete if a replacement has not already been started.
        if stale {
            tracing::info!(%worker_id, "worker died");
            self.workers.remove(worker_id);
            self.exchanges.clear_worker(worker_id);
        }
    }

    async fn on_file_changed(&mut self, path: &Path) {
        tracing::debug!(path = %path.display(), "checking if code needs to be rebuilt");
        let registry = Arc::clone(&self.registry);

        let mut stale: Vec<String> = Vec::new();
        for function_id in self.builds.keys() {
            let Some(target) = self.targets.get(function_id) else {
                continue;
            };
            let Some(runtime) = registry.find(&target.runtime) else {
                continue;
            };
            if runtime.should_rebuild(function_id, path) {
                stale.push(function_id.clone());
            }
        }
        if stale.is_empty() {
            return;
        }

        let mut restart: Vec<(String, String)> = Vec::new();
        for (worker_id, entry) in self.workers.iter_mut() {
            if stale.contains(&entry.function_id) {
                tracing::info!(%worker_id, function_id = %entry.function_id, "stopping for rebuild");
                entry.worker.stop();
                restart.push((worker_id.clone(), entry.function_id.clone()));
            }
        }

        for function_id in &stale {
            self.builds.remove(function_id);
        }
        let mut rebuilt: HashSet<String> = HashSet::new();
        for function_id in &stale {
            if self.get_build_output(function_id).await.is_some() {
                rebuilt.insert(function_id.clone());
            }
        }
        for (worker_id, function_id) in restart {
            if rebuilt.contains(&function_id) {
                self.start_worker(&function_id, &worker_id).await;
            }
        }
    }

    /// Returns the cached build for a function, building it on demand.
    /// Publishes a `FunctionBuild` event either way; `None` means the
    /// build is unusable.
    async fn get_build_output(&mut self, function_id: &str) -> Option<BuildOutput> {
        if let Some(build) = self.builds.get(function_id) {
            return Some(build.clone());
        }
        let target = self.targets.get(function_id)?.clone();
        let registry = Arc::clone(&self.registry);
        let Some(runtime) = registry.find(&target.runtime) else {
            self.bus.publish(Event::FunctionBuild(FunctionBuildEvent {
                function_id: function_id.to_string(),
                errors: vec![format!("unsupported runtime: {}", target.runtime)],
            }));
            return None;
        };

        match runtime.build(&target).await {
            Ok(output) => {
                self.bus.publish(Event::FunctionBuild(FunctionBuildEvent {
                    function_id: function_id.to_string(),
                    errors: output.errors.clone(),
                }));
                if output.errors.is_empty() {
                    self.builds
                        .insert(function_id.to_string(), output.clone());
                    Some(output)
                } else {
                    None
                }
            }
            Err(err) => {
                self.bus.publish(Event::FunctionBuild(FunctionBuildEvent {
                    function_id: function_id.to_string(),
                    errors: vec![err.to_string()],
                }));
                None
            }
        }
    }

    /// Builds (if needed) and starts a worker. Any previous worker with the
    /// same id is stopped first, so at most one runs per worker id.
    async fn start_worker(&mut self, function_id: &str, worker_id: &str) -> bool {
        let Some(build) = self.get_build_output(function_id).await else {
            return false;
        };
        let Some(target) = self.targets.get(function_id) else {
            return false;
        };
        let registry = Arc::clone(&self.registry);
        let Some(runtime) = registry.find(&target.runtime) else {
            return false;
        };

        let run = runtime
            .run(RunInput {
                runtime: target.runtime.clone(),
                server: format!("{}{}", self.server, worker_id),
                worker_id: worker_id.to_string(),
                function_id: function_id.to_string(),
                build,
                env: self.worker_env.get(worker_id).cloned().unwrap_or_default(),
            })
            .await;

        let mut worker = match run {
            Ok(worker) => worker,
            Err(err) => {
                tracing::error!(%worker_id, error = %err, "failed to run worker");
                return false;
            }
        };

        if let Some(mut old) = self.workers.remove(worker_id) {
            old.worker.stop();
        }

        self.instances += 1;
        let instance = self.instances;
        let current_request_id = Arc::new(StdMutex::new(String::new()));

        if let Some(mut logs) = worker.take_logs() {
            let bus = self.bus.clone();
            let shutdown = self.shutdown_tx.clone();
            let function_id = function_id.to_string();
            let scanner_worker_id = worker_id.to_string();
            let current = Arc::clone(&current_request_id);
            tokio::spawn(async move {
                while let Some(line) = logs.recv().await {
                    bus.publish(Event::FunctionLog(FunctionLogEvent {
                        function_id: function_id.clone(),
                        worker_id: scanner_worker_id.clone(),
                        request_id: current
                            .lock()
                            .expect("request id lock poisoned")
                            .clone(),
                        line,
                    }));
                }
                let _ = shutdown.send((scanner_worker_id, instance)).await;
            });
        }

        self.workers.insert(
            worker_id.to_string(),
            WorkerEntry {
                function_id: function_id.to_string(),
                instance,
                worker,
                current_request_id,
            },
        );
        true
    }

    /// Fails the pending invocation cleanly when a worker cannot start:
    /// post an init-error through the local adapter; if the shim rejects
    /// it, drain the pending invocation and fail it by request id.
    fn post_build_failure(&self, worker_id: &str) {
        let http = self.http.clone();
        let base = format!("http://{}{}/runtime", self.server, worker_id);
        tokio::spawn(async move {
            let response = http
                .post(format!("{base}/init/error"))
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(BUILD_FAILURE_BODY)
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(error = %err, "init-error post failed");
                    return;
                }
            };
            tracing::info!(status = %response.status(), "init-error posted");
            if response.status().as_u16() == 202 {
                return;
            }

            let next = http
                .get(format!("{base}/invocation/next"))
                .timeout(FALLBACK_NEXT_TIMEOUT)
                .send()
                .await;
            let next = match next {
                Ok(next) => next,
                Err(err) => {
                    tracing::warn!(error = %err, "fallback next failed");
                    return;
                }
            };
            let request_id = next
                .headers()
                .get("lambda-runtime-aws-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            if request_id.is_empty() {
                return;
            }
            let _ = http
                .post(format!("{base}/invocation/{request_id}/error"))
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(BUILD_FAILURE_BODY)
                .send()
                .await;
        });
    }

    /// Fire-and-forget JSON message to a worker's inbox.
    fn send_to_worker<T>(&self, worker_id: &str, kind: MessageKind, body: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let client = self.client.clone();
        let channel = channels::worker_inbox(&self.prefix, worker_id);
        tokio::spawn(async move {
            let mut writer = client.writer(kind, &channel);
            let sent = match writer.write_json(&body).await {
                Ok(()) => writer.close().await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                tracing::warn!(?kind, error = %err, "failed to send to worker");
            }
        });
    }
}
