//! Per-request file logger.
//!
//! Mirrors the function event stream into one log file per invocation
//! under `{log_directory}/lambda/{functionId}/{unix}-{requestId}`:
//! the input payload, every worker log line attributed to the request,
//! and the response or error that closed it out.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::events::Event;

pub(crate) fn start(bus: &Bus, directory: PathBuf, token: CancellationToken) -> JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        let mut logger = FileLogger {
            directory,
            open: HashMap::new(),
        };
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => logger.on_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    })
}

struct FileLogger {
    directory: PathBuf,
    open: HashMap<String, tokio::fs::File>,
}

impl FileLogger {
    async fn on_event(&mut self, event: Event) {
        match event {
            Event::FunctionInvoked(evt) => {
                let Some(file) = self.file(&evt.function_id, &evt.request_id).await else {
                    return;
                };
                let mut header = format!("invocation {}\n", evt.request_id).into_bytes();
                header.extend_from_slice(&evt.input);
                header.push(b'\n');
                let _ = file.write_all(&header).await;
            }
            Event::FunctionLog(evt) => {
                if let Some(file) = self.file(&evt.function_id, &evt.request_id).await {
                    let _ = file.write_all(format!("{}\n", evt.line).as_bytes()).await;
                }
            }
            Event::FunctionResponse(evt) => {
                if let Some(file) = self.file(&evt.function_id, &evt.request_id).await {
                    let mut tail = format!("response {}\n", evt.request_id).into_bytes();
                    tail.extend_from_slice(&evt.output);
                    tail.push(b'\n');
                    let _ = file.write_all(&tail).await;
                    let _ = file.flush().await;
                }
                self.open.remove(&evt.request_id);
            }
            Event::FunctionError(evt) => {
                if let Some(file) = self.file(&evt.function_id, &evt.request_id).await {
                    let line = format!("{}: {}\n", evt.error_type, evt.error_message);
                    let _ = file.write_all(line.as_bytes()).await;
                    let _ = file.flush().await;
                }
                self.open.remove(&evt.request_id);
            }
            _ => {}
        }
    }

    async fn file(&mut self, function_id: &str, request_id: &str) -> Option<&mut tokio::fs::File> {
        if !self.open.contains_key(request_id) {
            let dir = self.directory.join("lambda").join(function_id);
            if tokio::fs::create_dir_all(&dir).await.is_err() {
                return None;
            }
            let name = format!("{}-{}", chrono::Utc::now().timestamp(), request_id);
            let file = tokio::fs::File::create(dir.join(name)).await.ok()?;
            self.open.insert(request_id.to_string(), file);
        }
        self.open.get_mut(request_id)
    }
}
