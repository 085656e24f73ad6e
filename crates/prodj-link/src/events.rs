//! Command/Event Surface (spec.md §4.8).
//!
//! Grounded in `sparesparrow-rtp-midi`'s `event_bus::EventBus`: a closed
//! `Event` enum broadcast over a single bounded `tokio::sync::broadcast`
//! channel. The broadcast channel's built-in lagged-receiver behavior is
//! exactly the "dropped (not blocked) if a slow subscriber exceeds a bounded
//! queue" semantics spec.md asks for, so no hand-rolled per-kind queue is
//! needed.

use tokio::sync::broadcast;

use prodj_protocol::model::TrackRef;

/// Default bound per spec.md §4.8 ("default 64 events").
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum Event {
    DeviceFound { device_number: u8 },
    DeviceLost { device_number: u8 },
    PlayerUpdate { device_number: u8 },
    Beat { device_number: u8 },
    MasterChanged { new_master: Option<u8> },
    ClockSourceChanged { stale: bool },
    MidiUnderrun { ticks_late: u32 },
    MidiSinkError { message: String },
    TrackLoaded { device_number: u8, track_ref: TrackRef },
    Play { device_number: u8 },
    Cue { device_number: u8 },
}

/// Event bus observers subscribe to.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Best-effort publish: no subscribers or a full/lagged queue is not an
    /// error, matching the wire protocol's own lossy-by-design posture.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(Event::DeviceFound { device_number: 2 });
        bus.publish(Event::DeviceLost { device_number: 2 });

        match rx.recv().await.unwrap() {
            Event::DeviceFound { device_number } => assert_eq!(device_number, 2),
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            Event::DeviceLost { device_number } => assert_eq!(device_number, 2),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_instead_of_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        // Publish more events than the bounded queue holds; the publisher
        // must never block on this.
        for i in 0..10u8 {
            bus.publish(Event::DeviceFound { device_number: i });
        }

        // The lagging receiver observes a Lagged error rather than hanging.
        let first = rx.recv().await;
        assert!(matches!(first, Err(broadcast::error::RecvError::Lagged(_))) || first.is_ok());
    }
}
