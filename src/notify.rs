use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, SlotEvent};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub fanning out slot events, one channel per resource.
/// Subscribers on different resources never see each other's events.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<SlotEvent>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to events for a resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<SlotEvent> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish an accepted mutation. The wire form is stamped with the
    /// emission time here, after the event is already durable and applied.
    /// No-op if nobody is listening.
    pub fn send(&self, resource_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&resource_id) {
            let _ = sender.send(event.to_wire(Utc::now()));
        }
    }

    /// Drop a resource's channel if its last subscriber is gone.
    pub fn remove_if_idle(&self, resource_id: &Ulid) {
        self.channels
            .remove_if(resource_id, |_, sender| sender.receiver_count() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SlotEventKind, WeekTemplate};
    use chrono::TimeZone;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let start = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
        hub.send(
            rid,
            &Event::HoldReleased {
                resource_id: rid,
                start,
            },
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, SlotEventKind::Released);
        assert_eq!(received.resource_id, rid);
        assert_eq!(received.datetime, Some(start));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        // No subscriber — should not panic
        hub.send(
            rid,
            &Event::ScheduleDefined {
                resource_id: rid,
                template: WeekTemplate::default(),
            },
        );
    }

    #[tokio::test]
    async fn idle_channel_is_removed() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();

        let rx = hub.subscribe(rid);
        // Still subscribed — removal declines
        hub.remove_if_idle(&rid);
        assert!(hub.channels.contains_key(&rid));

        drop(rx);
        hub.remove_if_idle(&rid);
        assert!(!hub.channels.contains_key(&rid));
    }
}
