//! Device-change fan-out.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::device::{DeviceRef, DevicesChangedCallback};

#[derive(Default)]
struct Slots {
    next_id: u64,
    subscribers: Vec<(u64, DevicesChangedCallback)>,
}

/// Subscriber list for `(removed, added)` events.
///
/// Subscribers run in registration order, outside the list lock, so a
/// subscriber may subscribe or unsubscribe from inside its callback.
#[derive(Clone, Default)]
pub struct ChangeSignal {
    slots: Arc<Mutex<Slots>>,
}

impl ChangeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: DevicesChangedCallback) -> Subscription {
        let mut slots = self.slots.lock();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.subscribers.push((id, callback));
        Subscription {
            id,
            slots: Arc::downgrade(&self.slots),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots.lock().subscribers.len()
    }

    /// Deliver one event to every current subscriber.
    pub fn raise(&self, removed: &[DeviceRef], added: &[DeviceRef]) {
        let snapshot: Vec<DevicesChangedCallback> = self
            .slots
            .lock()
            .subscribers
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in snapshot {
            cb(removed, added);
        }
    }
}

/// Keeps a subscription alive. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    slots: Weak<Mutex<Slots>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.upgrade() {
            slots.lock().subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}
