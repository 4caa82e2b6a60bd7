use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use tokio::sync::{broadcast, mpsc};

/// Broadcast fan-out used for session events and the live protocol stream.
///
/// Emission is best-effort; lagged subscribers are handled by `broadcast`.
#[derive(Debug)]
pub struct EventHub<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> EventHub<T> {
    /// Create a hub retaining up to `buffer` undelivered events per subscriber.
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Per-room fan-out with an unbounded queue for every subscriber.
///
/// Traffic for other rooms never reaches, and so never evicts, a room's queue.
#[derive(Debug)]
pub struct RoomFeeds<T> {
    senders: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Default for RoomFeeds<T> {
    fn default() -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> RoomFeeds<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to items emitted for `room_id` after this call.
    pub fn subscribe(&self, room_id: &str) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room_id.to_owned())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver `item` to every open subscriber of `room_id`, pruning closed ones.
    pub fn emit(&self, room_id: &str, item: &T) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(room) = senders.get_mut(room_id) else {
            return;
        };
        room.retain(|tx| tx.send(item.clone()).is_ok());
        if room.is_empty() {
            senders.remove(room_id);
        }
    }

    /// Open subscribers across all rooms.
    pub fn subscriber_count(&self) -> usize {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .filter(|tx| !tx.is_closed())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SessionEvent, SessionState};

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let hub = EventHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.emit(SessionEvent::StateChanged {
            state: SessionState::Authenticating,
        });

        let event_a = a.recv().await.expect("subscriber a should receive event");
        let event_b = b.recv().await.expect("subscriber b should receive event");
        assert_eq!(event_a, event_b);
    }

    #[test]
    fn emitting_without_subscribers_is_a_no_op() {
        let hub: EventHub<u32> = EventHub::new(0);
        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(7);
    }

    #[test]
    fn room_feeds_only_deliver_their_room_and_never_lag() {
        let feeds = RoomFeeds::new();
        let mut mine = feeds.subscribe("!mine:x");

        feeds.emit("!mine:x", &0_u32);
        for n in 1..=1_000 {
            feeds.emit("!other:x", &n);
        }
        feeds.emit("!mine:x", &1_001);

        assert_eq!(mine.try_recv().ok(), Some(0));
        assert_eq!(mine.try_recv().ok(), Some(1_001));
        assert!(mine.try_recv().is_err());
    }

    #[test]
    fn dropped_room_subscribers_are_pruned() {
        let feeds = RoomFeeds::new();
        let kept = feeds.subscribe("!a:x");
        let dropped = feeds.subscribe("!a:x");
        assert_eq!(feeds.subscriber_count(), 2);

        drop(dropped);
        assert_eq!(feeds.subscriber_count(), 1);
        feeds.emit("!a:x", &7_u8);
        drop(kept);
        feeds.emit("!a:x", &8_u8);
        assert_eq!(feeds.subscriber_count(), 0);
    }
}
