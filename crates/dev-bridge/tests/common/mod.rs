//! Shared fixtures for dev-bridge integration tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use appsync_events::{AuthConfig, Connection};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_credential_types::provider::SharedCredentialsProvider;
use dev_bridge::runtime::{
    BuildInput, BuildOutput, LogStream, RunInput, Runtime, RuntimeError, Worker,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub fn test_auth() -> AuthConfig {
    AuthConfig::new(
        SharedCredentialsProvider::new(Credentials::new("AKIDEXAMPLE", "secret", None, None, "test")),
        "us-east-1",
    )
}

pub async fn dial(server: &mock_appsync::MockAppsync, token: &CancellationToken) -> Connection {
    Connection::dial(
        token.clone(),
        test_auth(),
        server.http_endpoint(),
        server.realtime_endpoint(),
    )
    .await
    .expect("dial mock appsync")
}

pub fn target(function_id: &str) -> BuildInput {
    BuildInput {
        function_id: function_id.to_string(),
        runtime: "test".to_string(),
        handler: PathBuf::from("ignored"),
        out: PathBuf::from("ignored"),
        properties: serde_json::json!({}),
    }
}

/// A runtime that counts builds/runs/stops and never spawns a process.
/// Workers are inert: their log stream stays open until `stop`.
pub struct CountingRuntime {
    pub builds: AtomicUsize,
    pub runs: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    pub run_log: Mutex<Vec<String>>,
    /// Paths that `should_rebuild` accepts.
    pub rebuild_suffix: &'static str,
    /// When true, builds report a compile error.
    pub fail_builds: bool,
}

impl CountingRuntime {
    pub fn new() -> Self {
        Self {
            builds: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            run_log: Mutex::new(Vec::new()),
            rebuild_suffix: "trigger.txt",
            fail_builds: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_builds: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl Runtime for CountingRuntime {
    fn matches(&self, runtime: &str) -> bool {
        runtime == "test"
    }

    async fn build(&self, input: &BuildInput) -> Result<BuildOutput, RuntimeError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let errors = if self.fail_builds {
            vec!["compile error: something is wrong".to_string()]
        } else {
            vec![]
        };
        Ok(BuildOutput {
            handler: "handler".into(),
            out: input.out.clone(),
            errors,
            sourcemaps: vec![],
        })
    }

    async fn run(&self, input: RunInput) -> Result<Box<dyn Worker>, RuntimeError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.run_log.lock().unwrap().push(input.worker_id.clone());
        let (keep_open, logs) = mpsc::channel(4);
        Ok(Box::new(InertWorker {
            logs: Some(logs),
            keep_open: Some(keep_open),
            stops: Arc::clone(&self.stops),
        }))
    }

    fn should_rebuild(&self, _function_id: &str, path: &Path) -> bool {
        path.to_string_lossy().ends_with(self.rebuild_suffix)
    }
}

// Tests hold onto the runtime to assert on its counters, so the registry
// gets a shared handle. `Arc<CountingRuntime>` can't implement the foreign
// `Runtime` trait directly (orphan rules), so this newtype wraps it.
pub struct SharedRuntime<T>(pub Arc<T>);

#[async_trait]
impl<T: Runtime> Runtime for SharedRuntime<T> {
    fn matches(&self, runtime: &str) -> bool {
        self.0.matches(runtime)
    }

    async fn build(&self, input: &BuildInput) -> Result<BuildOutput, RuntimeError> {
        self.0.build(input).await
    }

    async fn run(&self, input: RunInput) -> Result<Box<dyn Worker>, RuntimeError> {
        self.0.run(input).await
    }

    fn should_rebuild(&self, function_id: &str, path: &Path) -> bool {
        self.0.should_rebuild(function_id, path)
    }
}

struct InertWorker {
    logs: Option<LogStream>,
    /// Dropped on stop so the log scanner observes EOF, like a real
    /// process exiting.
    keep_open: Option<mpsc::Sender<String>>,
    stops: Arc<AtomicUsize>,
}

impl Worker for InertWorker {
    fn take_logs(&mut self) -> Option<LogStream> {
        self.logs.take()
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.keep_open.take();
    }
}
