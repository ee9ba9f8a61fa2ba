//! The `provided` runtime: runs a prebuilt bootstrap binary.
//!
//! Used for languages that compile to a self-contained executable. The
//! "build" locates the artifact and remembers its directory so file
//! changes under it trigger a rebuild; "run" spawns the binary with the
//! captured environment plus the local Runtime API address.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::runtime::{
    BuildInput, BuildOutput, LogStream, RunInput, Runtime, RuntimeError, Worker,
};

const LOG_BUFFER: usize = 256;

/// Runtime for prebuilt `bootstrap` executables.
#[derive(Default)]
pub struct ProvidedRuntime {
    /// Function id to artifact directory, for rebuild checks.
    directories: Mutex<HashMap<String, PathBuf>>,
}

impl ProvidedRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Runtime for ProvidedRuntime {
    fn matches(&self, runtime: &str) -> bool {
        runtime == "provided" || runtime.starts_with("provided.")
    }

    async fn build(&self, input: &BuildInput) -> Result<BuildOutput, RuntimeError> {
        let artifact = &input.handler;
        if !artifact.is_file() {
            return Ok(BuildOutput {
                handler: String::new(),
                out: input.out.clone(),
                errors: vec![format!("artifact not found: {}", artifact.display())],
                sourcemaps: vec![],
            });
        }

        let out = artifact
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let handler = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("bootstrap")
            .to_string();

        self.directories
            .lock()
            .expect("directories lock poisoned")
            .insert(input.function_id.clone(), out.clone());

        Ok(BuildOutput {
            handler,
            out,
            errors: vec![],
            sourcemaps: vec![],
        })
    }

    async fn run(&self, input: RunInput) -> Result<Box<dyn Worker>, RuntimeError> {
        let binary = input.build.out.join(&input.build.handler);
        let mut cmd = Command::new(&binary);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for pair in &input.env {
            if let Some((key, value)) = pair.split_once('=') {
                cmd.env(key, value);
            }
        }
        cmd.env("AWS_LAMBDA_RUNTIME_API", &input.server);
        cmd.env("SST_FUNCTION_ID", &input.function_id);
        cmd.env("SST_WORKER_ID", &input.worker_id);

        let mut child = cmd.spawn().map_err(RuntimeError::Spawn)?;
        tracing::debug!(
            worker_id = %input.worker_id,
            binary = %binary.display(),
            "spawned worker"
        );

        let (log_tx, log_rx) = mpsc::channel(LOG_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, log_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, log_tx));
        }

        Ok(Box::new(ProvidedWorker {
            child,
            logs: Some(log_rx),
        }))
    }

    fn should_rebuild(&self, function_id: &str, path: &Path) -> bool {
        self.directories
            .lock()
            .expect("directories lock poisoned")
            .get(function_id)
            .map(|dir| path.starts_with(dir))
            .unwrap_or(false)
    }
}

struct ProvidedWorker {
    child: Child,
    logs: Option<LogStream>,
}

impl Worker for ProvidedWorker {
    fn take_logs(&mut self) -> Option<LogStream> {
        self.logs.take()
    }

    fn stop(&mut self) {
        let _ = self.child.start_kill();
    }
}

async fn pump_lines<R>(reader: R, lines: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if lines.send(line).await.is_err() {
            return;
        }
    }
}
