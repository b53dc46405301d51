//! Broadcaster over a tokio broadcast channel

use crate::ports::Broadcaster;
use mindcycle_core::{EventMessage, MindMoment, Percept, PhaseEvent};
use tokio::sync::broadcast;
use tracing::trace;

/// Publishes engine output as `EventMessage`s to every subscribed receiver.
/// Sending with no receivers is not an error.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<EventMessage>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventMessage> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<EventMessage> {
        self.tx.clone()
    }

    fn send(&self, msg: EventMessage) {
        if self.tx.send(msg).is_err() {
            trace!("no display clients subscribed");
        }
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish_phase(&self, event: &PhaseEvent) {
        self.send(EventMessage::phase(event));
    }

    fn publish_moment(&self, moment: &MindMoment) {
        self.send(EventMessage::moment(moment));
    }

    fn publish_percept(&self, percept: &Percept, replayed: bool) {
        self.send(EventMessage::percept(percept, replayed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let b = ChannelBroadcaster::new(4);
        b.publish_moment(&MindMoment::text_only(1, "nobody listening"));
    }

    #[tokio::test]
    async fn subscribers_receive_event_envelopes() {
        let b = ChannelBroadcaster::new(4);
        let mut rx = b.subscribe();
        b.publish_percept(&Percept::visual(serde_json::json!("a bird")), false);
        b.publish_moment(&MindMoment::text_only(2, "hello"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event, "percept");
        assert_eq!(first.data["replayed"], false);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event, "moment");
        assert_eq!(second.data["cycle"], 2);
    }
}
