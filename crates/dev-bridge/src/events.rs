//! Events published on the dev-session bus.
//!
//! Everything observable about functions and tasks flows through these:
//! the TUI, the per-request file logger, and tests all consume the same
//! stream.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::runtime::BuildInput;

/// A deployed container task, as reported by the deploy engine.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: String,
    /// Command line to run locally; `None` if the task has no dev command.
    pub command: Option<String>,
    pub directory: PathBuf,
}

/// Published by the deploy engine when a stage deploy completes.
#[derive(Debug, Clone, Default)]
pub struct CompleteEvent {
    pub tasks: HashMap<String, TaskDefinition>,
}

/// An invocation reached a local worker.
#[derive(Debug, Clone)]
pub struct FunctionInvokedEvent {
    pub function_id: String,
    pub worker_id: String,
    pub request_id: String,
    pub input: Vec<u8>,
}

/// A local worker answered an invocation.
#[derive(Debug, Clone)]
pub struct FunctionResponseEvent {
    pub function_id: String,
    pub worker_id: String,
    pub request_id: String,
    pub output: Vec<u8>,
}

/// A local worker reported an invocation or init error.
#[derive(Debug, Clone)]
pub struct FunctionErrorEvent {
    pub function_id: String,
    pub worker_id: String,
    pub request_id: String,
    pub error_type: String,
    pub error_message: String,
    pub trace: Vec<String>,
}

/// A build finished; `errors` is empty on success.
#[derive(Debug, Clone)]
pub struct FunctionBuildEvent {
    pub function_id: String,
    pub errors: Vec<String>,
}

/// One line of worker output, attributed to the in-flight request.
#[derive(Debug, Clone)]
pub struct FunctionLogEvent {
    pub function_id: String,
    pub worker_id: String,
    pub request_id: String,
    pub line: String,
}

/// A container task started locally.
#[derive(Debug, Clone)]
pub struct TaskStartEvent {
    pub task_id: String,
    pub worker_id: String,
    pub command: String,
}

/// One line of task output.
#[derive(Debug, Clone)]
pub struct TaskLogEvent {
    pub task_id: String,
    pub worker_id: String,
    pub line: String,
}

/// A container task exited.
#[derive(Debug, Clone)]
pub struct TaskCompleteEvent {
    pub task_id: String,
    pub worker_id: String,
}

/// A task was asked to start but has no dev command configured.
#[derive(Debug, Clone)]
pub struct TaskMissingCommandEvent {
    pub name: String,
}

/// A file changed under the watched project root.
#[derive(Debug, Clone)]
pub struct FileChangedEvent {
    pub path: PathBuf,
}

/// The union of everything the bus carries.
#[derive(Debug, Clone)]
pub enum Event {
    /// The deploy engine announced a build target for a function.
    Target(BuildInput),
    FileChanged(FileChangedEvent),
    Complete(CompleteEvent),
    FunctionInvoked(FunctionInvokedEvent),
    FunctionResponse(FunctionResponseEvent),
    FunctionError(FunctionErrorEvent),
    FunctionBuild(FunctionBuildEvent),
    FunctionLog(FunctionLogEvent),
    TaskStart(TaskStartEvent),
    TaskLog(TaskLogEvent),
    TaskComplete(TaskCompleteEvent),
    TaskMissingCommand(TaskMissingCommandEvent),
}
