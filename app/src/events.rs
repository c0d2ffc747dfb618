//! Typed publish/subscribe hub for phone events.
//!
//! Observers subscribe before the tasks start, so nothing can be announced
//! to an empty room; delivery follows subscription order.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};

use crate::messages::PhoneEvent;

#[derive(Debug, Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Sender<PhoneEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<PhoneEvent> {
        let (tx, rx) = channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber in subscription order; subscribers
    /// that went away are dropped.
    pub fn broadcast(&self, event: PhoneEvent) {
        self.lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sender<PhoneEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_subscription_order() {
        let hub = EventHub::new();
        let first = hub.subscribe();
        let second = hub.subscribe();

        hub.broadcast(PhoneEvent::CallRinging);
        assert_eq!(first.try_recv().unwrap(), PhoneEvent::CallRinging);
        assert_eq!(second.try_recv().unwrap(), PhoneEvent::CallRinging);
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let hub = EventHub::new();
        drop(hub.subscribe());
        let live = hub.subscribe();

        hub.broadcast(PhoneEvent::SessionEstablished);
        hub.broadcast(PhoneEvent::SessionEstablished);
        assert_eq!(live.iter().take(2).count(), 2);
    }
}
