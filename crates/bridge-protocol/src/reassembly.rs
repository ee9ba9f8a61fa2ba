//! Ordered reassembly of packets arriving out of order.

use std::collections::{HashMap, VecDeque};

use appsync_events::Subscription;

use crate::packet::Packet;

/// Restores strict per-id index order over an unordered packet arrival
/// sequence.
///
/// For each message id the reassembler buffers out-of-order packets and
/// yields the longest consecutive run starting at the next expected index.
/// Once a `final` packet is yielded the id's buffers are discarded; the
/// index floor outlives them so late duplicates stay dead.
#[derive(Default)]
pub struct Reassembler {
    history: HashMap<String, HashMap<u32, Packet>>,
    next: HashMap<String, u32>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one packet and returns every packet that became deliverable.
    pub fn push(&mut self, packet: Packet) -> Vec<Packet> {
        let mut out = Vec::new();
        let id = packet.id.clone();

        let expected = self.next.entry(id.clone()).or_insert(0);
        if packet.index < *expected {
            return out;
        }

        let buffered = self.history.entry(id.clone()).or_default();
        buffered.insert(packet.index, packet);

        let mut finished = false;
        while let Some(ready) = buffered.remove(expected) {
            *expected += 1;
            finished = ready.is_final;
            out.push(ready);
            if finished {
                break;
            }
        }
        if finished {
            self.history.remove(&id);
        }
        out
    }

    /// Number of ids with undelivered buffered packets.
    pub fn pending(&self) -> usize {
        self.history.values().filter(|b| !b.is_empty()).count()
    }
}

/// An async source of ordered packets drawn from a subscription.
pub struct SortedPackets {
    subscription: Subscription,
    reassembler: Reassembler,
    ready: VecDeque<Packet>,
}

impl SortedPackets {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription,
            reassembler: Reassembler::new(),
            ready: VecDeque::new(),
        }
    }

    /// Yields the next in-order packet, or `None` once the subscription
    /// closes. Malformed events are logged and dropped; they never abort
    /// the stream.
    pub async fn next(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Some(packet);
            }
            let raw = self.subscription.recv().await?;
            match serde_json::from_str::<Packet>(&raw) {
                Ok(packet) => self.ready.extend(self.reassembler.push(packet)),
                Err(err) => {
                    tracing::debug!(error = %err, "dropping malformed packet");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MessageKind;

    fn packet(id: &str, index: u32, data: &str, is_final: bool) -> Packet {
        Packet {
            kind: MessageKind::Response,
            source: "w".into(),
            id: id.into(),
            index,
            data: data.into(),
            is_final,
        }
    }

    #[test]
    fn in_order_packets_pass_straight_through() {
        let mut r = Reassembler::new();
        assert_eq!(r.push(packet("a", 0, "x", false)).len(), 1);
        assert_eq!(r.push(packet("a", 1, "y", false)).len(), 1);
        assert_eq!(r.push(packet("a", 2, "z", true)).len(), 1);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn out_of_order_packets_are_held_until_the_gap_fills() {
        let mut r = Reassembler::new();
        assert!(r.push(packet("a", 2, "z", true)).is_empty());
        assert!(r.push(packet("a", 1, "y", false)).is_empty());
        let run = r.push(packet("a", 0, "x", false));
        assert_eq!(
            run.iter().map(|p| p.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(run[2].is_final);
    }

    #[test]
    fn duplicates_are_delivered_exactly_once() {
        let mut r = Reassembler::new();
        assert_eq!(r.push(packet("a", 0, "x", false)).len(), 1);
        assert!(r.push(packet("a", 0, "x", false)).is_empty());
        assert_eq!(r.push(packet("a", 1, "y", true)).len(), 1);
        // Late duplicates after the final packet stay dead.
        assert!(r.push(packet("a", 0, "x", false)).is_empty());
        assert!(r.push(packet("a", 1, "y", true)).is_empty());
    }

    #[test]
    fn ids_are_reassembled_independently() {
        let mut r = Reassembler::new();
        assert!(r.push(packet("b", 1, "y", true)).is_empty());
        assert_eq!(r.push(packet("a", 0, "x", true)).len(), 1);
        assert_eq!(r.push(packet("b", 0, "x", false)).len(), 2);
    }

    #[test]
    fn buffers_are_dropped_after_final() {
        let mut r = Reassembler::new();
        r.push(packet("a", 1, "tail", true));
        assert_eq!(r.pending(), 1);
        r.push(packet("a", 0, "head", false));
        assert_eq!(r.pending(), 0);
    }
}
