//! The runtime abstraction: per-language build and run capabilities.
//!
//! The worker controller treats languages abstractly through [`Runtime`];
//! a [`RuntimeRegistry`] dispatches on the runtime name. Implementations
//! must make `build` idempotent: repeated builds of the same input produce
//! functionally equivalent artifacts.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from runtime implementations.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The build tool itself failed (as opposed to compile errors, which
    /// are reported through `BuildOutput::errors`).
    #[error("build failed: {0}")]
    Build(String),

    /// The worker process could not be spawned.
    #[error("failed to spawn worker")]
    Spawn(#[source] std::io::Error),

    /// No registered runtime matches the requested name.
    #[error("unsupported runtime: {0}")]
    Unsupported(String),
}

/// What to build: one function's handler and language.
#[derive(Debug, Clone)]
pub struct BuildInput {
    pub function_id: String,
    /// Runtime name, e.g. `provided.al2023`.
    pub runtime: String,
    /// Path to the handler source or artifact, interpreted per runtime.
    pub handler: PathBuf,
    /// Directory the build writes its artifact into.
    pub out: PathBuf,
    /// Runtime-specific properties, passed through opaquely.
    pub properties: serde_json::Value,
}

/// A built artifact, cached per function until invalidated.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Entry point within `out`, interpreted per runtime.
    pub handler: String,
    pub out: PathBuf,
    /// Compile errors; non-empty means the build is unusable.
    pub errors: Vec<String>,
    pub sourcemaps: Vec<String>,
}

/// Everything needed to start one worker process.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub runtime: String,
    /// `host:port/lambda/{workerId}` base the worker's Runtime API client
    /// must talk to, advertised via `AWS_LAMBDA_RUNTIME_API`.
    pub server: String,
    pub worker_id: String,
    pub function_id: String,
    pub build: BuildOutput,
    /// `KEY=value` pairs captured from the remote execution environment.
    pub env: Vec<String>,
}

/// Stream of merged stdout/stderr lines from a worker.
pub type LogStream = mpsc::Receiver<String>;

/// A live worker process.
pub trait Worker: Send {
    /// Takes the log stream; yields lines until the process exits, then
    /// closes. Can only be taken once.
    fn take_logs(&mut self) -> Option<LogStream>;

    /// Kills the process. Idempotent.
    fn stop(&mut self);
}

/// A language runtime capability.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Whether this runtime handles the named language.
    fn matches(&self, runtime: &str) -> bool;

    /// Produces an artifact for the target. May be called concurrently;
    /// implementations handle their own mutual exclusion.
    async fn build(&self, input: &BuildInput) -> Result<BuildOutput, RuntimeError>;

    /// Starts a worker from a previously built artifact.
    async fn run(&self, input: RunInput) -> Result<Box<dyn Worker>, RuntimeError>;

    /// Whether a change to `path` invalidates the function's cached build.
    fn should_rebuild(&self, function_id: &str, path: &Path) -> bool;
}

/// Dispatches runtime operations by name.
pub struct RuntimeRegistry {
    runtimes: Vec<Box<dyn Runtime>>,
}

impl RuntimeRegistry {
    pub fn new(runtimes: Vec<Box<dyn Runtime>>) -> Self {
        Self { runtimes }
    }

    /// Finds the runtime claiming `name`.
    pub fn find(&self, name: &str) -> Option<&dyn Runtime> {
        self.runtimes
            .iter()
            .map(|r| r.as_ref())
            .find(|r| r.matches(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl Runtime for Fixed {
        fn matches(&self, runtime: &str) -> bool {
            runtime == self.0
        }
        async fn build(&self, _input: &BuildInput) -> Result<BuildOutput, RuntimeError> {
            unimplemented!()
        }
        async fn run(&self, _input: RunInput) -> Result<Box<dyn Worker>, RuntimeError> {
            unimplemented!()
        }
        fn should_rebuild(&self, _function_id: &str, _path: &Path) -> bool {
            false
        }
    }

    #[test]
    fn registry_dispatches_by_match() {
        let registry = RuntimeRegistry::new(vec![Box::new(Fixed("node")), Box::new(Fixed("go"))]);
        assert!(registry.find("go").is_some());
        assert!(registry.find("node").is_some());
        assert!(registry.find("dotnet").is_none());
    }
}
