//! The task controller: runs container tasks locally.
//!
//! When a remote task container starts, its shim announces `TaskStart`
//! with the container environment. The controller runs the task's dev
//! command locally instead, streams its output onto the bus, keeps the
//! remote shim alive with periodic pings, and tells it to exit when the
//! local process finishes.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use bridge_protocol::{
    Client, Message, MessageKind, PingBody, TaskCompleteBody, TaskStartBody, channels,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::events::{
    Event, TaskCompleteEvent, TaskDefinition, TaskLogEvent, TaskMissingCommandEvent,
    TaskStartEvent,
};

/// Cadence of keep-alive pings to a running task's shim.
const TASK_PING_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct TaskController {
    client: Client,
    bus: Bus,
    prefix: String,
    tasks: HashMap<String, TaskDefinition>,
}

impl TaskController {
    pub(crate) fn new(client: Client, bus: Bus, prefix: String) -> Self {
        Self {
            client,
            bus,
            prefix,
            tasks: HashMap::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut messages: mpsc::Receiver<Message>,
        token: CancellationToken,
    ) {
        let mut events = self.bus.subscribe();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => self.on_message(message, &token).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(Event::Complete(complete)) => self.tasks = complete.tasks,
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "task controller lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn on_message(&mut self, mut message: Message, token: &CancellationToken) {
        if message.kind != MessageKind::TaskStart {
            tracing::debug!(kind = ?message.kind, "unexpected message kind on task path");
            return;
        }
        let body: TaskStartBody = match message.body.json().await {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed task start");
                return;
            }
        };
        let Some(definition) = self.tasks.get(&body.task_id).cloned() else {
            tracing::info!(task_id = %body.task_id, "task start for unknown task");
            return;
        };
        let Some(command) = definition.command.clone() else {
            self.bus
                .publish(Event::TaskMissingCommand(TaskMissingCommandEvent {
                    name: definition.name.clone(),
                }));
            return;
        };

        tracing::info!(task_id = %body.task_id, %command, "starting task");
        tokio::spawn(run_task(
            self.client.clone(),
            self.bus.clone(),
            self.prefix.clone(),
            definition,
            command,
            body,
            message.source,
            token.clone(),
        ));
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task(
    client: Client,
    bus: Bus,
    prefix: String,
    definition: TaskDefinition,
    command: String,
    body: TaskStartBody,
    worker_id: String,
    token: CancellationToken,
) {
    let fields: Vec<&str> = command.split_whitespace().collect();
    let Some((program, args)) = fields.split_first() else {
        bus.publish(Event::TaskMissingCommand(TaskMissingCommandEvent {
            name: definition.name,
        }));
        return;
    };

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&definition.directory)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd.env_clear();
    for pair in &body.environment {
        if let Some((key, value)) = pair.split_once('=') {
            cmd.env(key, value);
        }
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(task_id = %body.task_id, error = %err, "failed to spawn task");
            return;
        }
    };

    bus.publish(Event::TaskStart(TaskStartEvent {
        task_id: body.task_id.clone(),
        worker_id: worker_id.clone(),
        command,
    }));

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_task_logs(
            stdout,
            bus.clone(),
            body.task_id.clone(),
            worker_id.clone(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_task_logs(
            stderr,
            bus.clone(),
            body.task_id.clone(),
            worker_id.clone(),
        ));
    }

    let inbox = channels::worker_inbox(&prefix, &worker_id);
    loop {
        send_json(&client, MessageKind::Ping, &inbox, &PingBody {}).await;
        tokio::select! {
            _ = token.cancelled() => {
                let _ = child.start_kill();
                return;
            }
            status = child.wait() => {
                tracing::info!(task_id = %body.task_id, ?status, "task finished");
                send_json(&client, MessageKind::TaskComplete, &inbox, &TaskCompleteBody {}).await;
                bus.publish(Event::TaskComplete(TaskCompleteEvent {
                    task_id: body.task_id,
                    worker_id,
                }));
                return;
            }
            _ = tokio::time::sleep(TASK_PING_INTERVAL) => {}
        }
    }
}

async fn pump_task_logs<R>(reader: R, bus: Bus, task_id: String, worker_id: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        bus.publish(Event::TaskLog(TaskLogEvent {
            task_id: task_id.clone(),
            worker_id: worker_id.clone(),
            line,
        }));
    }
}

async fn send_json<T: serde::Serialize>(
    client: &Client,
    kind: MessageKind,
    channel: &str,
    body: &T,
) {
    let mut writer = client.writer(kind, channel);
    let sent = match writer.write_json(body).await {
        Ok(()) => writer.close().await,
        Err(err) => Err(err),
    };
    if let Err(err) = sent {
        tracing::warn!(?kind, error = %err, "failed to send task message");
    }
}
