//! Shared state between the controller and the HTTP adapter.
//!
//! The controller feeds inbound bridge traffic in; adapter handlers block
//! on it. Two flows live here: queued `Next` bodies per worker (the
//! long-poll side) and one-shot reply slots keyed by message id (the
//! tunneled request/response side).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bridge_protocol::BodyReader;
use tokio::sync::{Notify, oneshot};

#[derive(Default)]
struct NextQueue {
    items: VecDeque<BodyReader>,
    notify: Arc<Notify>,
}

/// Rendezvous point for bridge traffic addressed to local workers.
#[derive(Default)]
pub(crate) struct Exchanges {
    next: Mutex<HashMap<String, NextQueue>>,
    replies: Mutex<HashMap<String, oneshot::Sender<BodyReader>>>,
    functions: Mutex<HashMap<String, String>>,
}

impl Exchanges {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a `Next` body for a worker's long poll.
    pub(crate) fn push_next(&self, worker_id: &str, body: BodyReader) {
        let mut map = self.next.lock().expect("next lock poisoned");
        let queue = map.entry(worker_id.to_string()).or_default();
        queue.items.push_back(body);
        // notify_one stores a permit, so a poll that checks just after the
        // push still wakes.
        queue.notify.notify_one();
    }

    /// Waits for the next queued body for a worker.
    pub(crate) async fn pop_next(&self, worker_id: &str) -> BodyReader {
        loop {
            let notify = {
                let mut map = self.next.lock().expect("next lock poisoned");
                let queue = map.entry(worker_id.to_string()).or_default();
                if let Some(body) = queue.items.pop_front() {
                    return body;
                }
                Arc::clone(&queue.notify)
            };
            notify.notified().await;
        }
    }

    /// Drops a worker's queued bodies (worker shutdown or replacement).
    pub(crate) fn clear_worker(&self, worker_id: &str) {
        self.next
            .lock()
            .expect("next lock poisoned")
            .remove(worker_id);
    }

    /// Registers interest in the reply to a tunneled exchange.
    pub(crate) fn register_reply(&self, id: &str) -> oneshot::Receiver<BodyReader> {
        let (tx, rx) = oneshot::channel();
        self.replies
            .lock()
            .expect("replies lock poisoned")
            .insert(id.to_string(), tx);
        rx
    }

    /// Delivers a reply body. Returns false if nobody is waiting for `id`.
    pub(crate) fn resolve_reply(&self, id: &str, body: BodyReader) -> bool {
        let sender = self.replies.lock().expect("replies lock poisoned").remove(id);
        match sender {
            Some(sender) => sender.send(body).is_ok(),
            None => false,
        }
    }

    /// Forgets a reply slot (timeout or handler teardown).
    pub(crate) fn cancel_reply(&self, id: &str) {
        self.replies.lock().expect("replies lock poisoned").remove(id);
    }

    /// Records which function a worker runs, for event attribution.
    pub(crate) fn set_function(&self, worker_id: &str, function_id: &str) {
        self.functions
            .lock()
            .expect("functions lock poisoned")
            .insert(worker_id.to_string(), function_id.to_string());
    }

    pub(crate) fn function_of(&self, worker_id: &str) -> Option<String> {
        self.functions
            .lock()
            .expect("functions lock poisoned")
            .get(worker_id)
            .cloned()
    }

    /// Drops all per-worker state (stage redeploy).
    pub(crate) fn clear(&self) {
        self.next.lock().expect("next lock poisoned").clear();
        self.functions.lock().expect("functions lock poisoned").clear();
    }
}
