//! Kernel device-state notifications.
//!
//! An [`Event`] is an immutable record of one uevent: what happened
//! ([`Action`]), the raw attribute map delivered with it, and when it was
//! received.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::udev;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

/// Raw attribute map of a uevent (`KEY=VALUE` pairs).
pub type Attributes = BTreeMap<String, String>;

/// What the kernel reported about a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Device appeared.
    Add,
    /// Device attributes or contents changed.
    Change,
    /// Device went away (or was deactivated).
    Remove,
    /// Any other action string (bind, unbind, move, online, ...).
    Unknown(String),
}

impl Action {
    /// Parse a kernel action string.
    pub fn parse(action: &str) -> Self {
        match action {
            "add" => Action::Add,
            "change" => Action::Change,
            "remove" => Action::Remove,
            other => Action::Unknown(other.to_string()),
        }
    }

    /// The kernel's spelling of this action.
    pub fn as_str(&self) -> &str {
        match self {
            Action::Add => "add",
            Action::Change => "change",
            Action::Remove => "remove",
            Action::Unknown(s) => s.as_str(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kernel notification. Never mutated after construction.
#[derive(Debug, Clone)]
pub struct Event {
    id: u64,
    action: Action,
    attributes: Attributes,
    device: String,
    created_at: Instant,
}

impl Event {
    /// Build an event stamped with the current monotonic time and the next id.
    pub fn new(action: Action, attributes: Attributes) -> Self {
        Self::with_timestamp(action, attributes, Instant::now())
    }

    /// Build an event with an explicit creation time.
    pub fn with_timestamp(action: Action, attributes: Attributes, created_at: Instant) -> Self {
        let device = udev::device_name(&attributes);
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            action,
            attributes,
            device,
            created_at,
        }
    }

    /// Build an event from a raw attribute map, taking the action from `ACTION`.
    pub fn from_attributes(attributes: Attributes) -> Self {
        let action = attributes
            .get("ACTION")
            .map(|a| Action::parse(a))
            .unwrap_or_else(|| Action::Unknown(String::new()));
        Self::new(action, attributes)
    }

    /// Unique, monotonically assigned id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The reported action.
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// The raw attribute map.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Look up one attribute.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Friendly basename of the device this event acted upon.
    pub fn device_name(&self) -> &str {
        &self.device
    }

    /// Monotonic time at which the event was received.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} [{}]", self.action, self.device, self.id)
    }
}
