//! In-process pub/sub: a broadcast channel of typed events.
//!
//! Every subscriber gets an independent bounded queue. When a slow
//! subscriber's queue fills, its oldest events are dropped for that
//! subscriber only and counted; the publisher never blocks.

use tokio::sync::broadcast;

use hark_types::BusEvent;

/// Default per-subscriber queue capacity.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Broadcast bus for [`BusEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    /// Deliver an event to every live subscription. A bus with no
    /// subscribers accepts and discards the event.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.tx.send(event);
    }

    /// Open an independent subscription starting at the current position.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            dropped: 0,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(DEFAULT_BUS_CAPACITY)
    }
}

/// One subscriber's view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    dropped: u64,
}

impl Subscription {
    /// Receive the next event in publication order.
    ///
    /// Skips over any events this subscriber lost to queue overflow,
    /// accounting for them in [`dropped`](Subscription::dropped). Returns
    /// `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    tracing::debug!(lost = n, total = self.dropped, "subscriber lagged, dropped oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// How many events this subscriber has lost so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hark_types::RelayStatus;

    fn state_event(status: RelayStatus) -> BusEvent {
        BusEvent::StateChanged {
            status,
            turn_id: None,
        }
    }

    fn chunk(i: usize) -> BusEvent {
        BusEvent::TextChunk {
            turn_id: None,
            text: format!("chunk-{i}"),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe();

        bus.publish(state_event(RelayStatus::Listening));
        bus.publish(state_event(RelayStatus::Thinking));
        bus.publish(state_event(RelayStatus::Idle));

        assert_eq!(sub.recv().await, Some(state_event(RelayStatus::Listening)));
        assert_eq!(sub.recv().await, Some(state_event(RelayStatus::Thinking)));
        assert_eq!(sub.recv().await, Some(state_event(RelayStatus::Idle)));
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn subscribers_are_independent() {
        let bus = EventBus::new(16);
        let mut first = bus.subscribe();
        bus.publish(chunk(1));
        // A subscription opened later does not see earlier events.
        let mut second = bus.subscribe();
        bus.publish(chunk(2));

        assert_eq!(first.recv().await, Some(chunk(1)));
        assert_eq!(first.recv().await, Some(chunk(2)));
        assert_eq!(second.recv().await, Some(chunk(2)));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();

        for i in 0..10 {
            bus.publish(chunk(i));
        }

        // The first recv skips the overflowed prefix and resumes at the
        // oldest retained event.
        let event = sub.recv().await.unwrap();
        assert_eq!(event, chunk(6));
        assert_eq!(sub.dropped(), 6);

        // The rest of the retained window arrives intact and in order.
        assert_eq!(sub.recv().await, Some(chunk(7)));
        assert_eq!(sub.recv().await, Some(chunk(8)));
        assert_eq!(sub.recv().await, Some(chunk(9)));
        assert_eq!(sub.dropped(), 6);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(chunk(0));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
