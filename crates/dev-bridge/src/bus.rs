//! The dev-session event bus.
//!
//! A thin wrapper over a broadcast channel. Publishing never blocks; a
//! subscriber that falls behind loses the oldest events (surfaced as
//! `Lagged` by the underlying channel), which is acceptable for
//! observability consumers.

use tokio::sync::broadcast;

use crate::events::Event;

const BUS_CAPACITY: usize = 10_000;

/// Publish/subscribe handle for session events. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publishes an event to every current subscriber.
    pub fn publish(&self, event: Event) {
        // An error only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Opens a new subscription receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, FunctionBuildEvent};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = Bus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::FunctionBuild(FunctionBuildEvent {
            function_id: "fn".into(),
            errors: vec![],
        }));

        match rx.recv().await.unwrap() {
            Event::FunctionBuild(evt) => assert_eq!(evt.function_id, "fn"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let bus = Bus::new();
        bus.publish(Event::FunctionBuild(FunctionBuildEvent {
            function_id: "fn".into(),
            errors: vec![],
        }));
    }
}
