//! Thread-safe FIFO of pending events with mask-based suppression.
//!
//! Masks apply only at enqueue time: an event that is already queued is
//! never dropped because of a mask added afterwards.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EventError, EventResult};
use crate::event::{Action, Event};

/// A device/action filter. `None` on either field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMask {
    /// Device basename to mask, or any device.
    pub device: Option<String>,
    /// Action to mask, or any action.
    pub action: Option<Action>,
}

impl EventMask {
    /// Returns true if this mask suppresses `event`.
    pub fn matches(&self, event: &Event) -> bool {
        self.device
            .as_deref()
            .map_or(true, |d| d == event.device_name())
            && self.action.as_ref().map_or(true, |a| a == event.action())
    }
}

/// Opaque handle returned by [`EventQueue::mask_add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskHandle(u64);

#[derive(Default)]
struct QueueInner {
    events: VecDeque<Event>,
    masks: Vec<(MaskHandle, EventMask)>,
    next_mask: u64,
}

/// FIFO of events awaiting dispatch.
#[derive(Default)]
pub struct EventQueue {
    inner: Mutex<QueueInner>,
}

impl EventQueue {
    /// Create an empty queue with no masks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event` unless an active mask matches it.
    ///
    /// Returns true if the event was queued.
    pub fn enqueue(&self, event: Event) -> bool {
        let mut inner = self.inner.lock();
        if let Some((handle, _)) = inner.masks.iter().find(|(_, m)| m.matches(&event)) {
            debug!("{} suppressed by mask {:?}", event, handle);
            return false;
        }
        inner.events.push_back(event);
        true
    }

    /// Remove and return the oldest event.
    pub fn dequeue(&self) -> EventResult<Event> {
        self.inner.lock().events.pop_front().ok_or(EventError::QueueEmpty)
    }

    /// Add a mask; `None` means "any" for that field.
    pub fn mask_add(&self, device: Option<&str>, action: Option<Action>) -> MaskHandle {
        let mut inner = self.inner.lock();
        let handle = MaskHandle(inner.next_mask);
        inner.next_mask += 1;
        inner.masks.push((
            handle,
            EventMask {
                device: device.map(str::to_string),
                action,
            },
        ));
        handle
    }

    /// Remove a mask. Unknown handles are ignored.
    pub fn mask_remove(&self, handle: MaskHandle) {
        self.inner.lock().masks.retain(|(h, _)| *h != handle);
    }

    /// Snapshot of the pending events, oldest first.
    pub fn pending(&self) -> Vec<Event> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().events.is_empty()
    }

    /// Drop every pending event. Masks are kept.
    pub fn clear(&self) {
        self.inner.lock().events.clear();
    }
}
