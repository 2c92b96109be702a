//! Attribute constraints used to tie a candidate event to an operation.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::Event;

/// Constraint on a single uevent attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequiredValue {
    /// The attribute must be present, with any value.
    Present,
    /// The attribute must not be present.
    Absent,
    /// The attribute must be present with exactly this value.
    Exactly(String),
}

impl RequiredValue {
    fn holds(&self, value: Option<&str>) -> bool {
        match (self, value) {
            (RequiredValue::Present, v) => v.is_some(),
            (RequiredValue::Absent, v) => v.is_none(),
            (RequiredValue::Exactly(want), Some(v)) => want == v,
            (RequiredValue::Exactly(_), None) => false,
        }
    }
}

/// Required/forbidden attributes plus a timestamp floor.
#[derive(Debug, Clone, Default)]
pub struct EventValidator {
    required: BTreeMap<String, RequiredValue>,
    timestamp_floor: Option<Instant>,
}

impl EventValidator {
    /// A validator that accepts every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all requirements and the timestamp floor.
    pub fn reset(&mut self) {
        self.required.clear();
        self.timestamp_floor = None;
    }

    /// Merge requirements; later values for the same key replace earlier ones.
    pub fn update_requirements<I, K>(&mut self, requirements: I)
    where
        I: IntoIterator<Item = (K, RequiredValue)>,
        K: Into<String>,
    {
        self.required
            .extend(requirements.into_iter().map(|(k, v)| (k.into(), v)));
    }

    /// Remove the requirement for `key`, if any.
    pub fn remove_requirement(&mut self, key: &str) {
        self.required.remove(key);
    }

    /// Current requirements.
    pub fn requirements(&self) -> &BTreeMap<String, RequiredValue> {
        &self.required
    }

    /// Reject events created before `floor`.
    pub fn set_timestamp_floor(&mut self, floor: Instant) {
        self.timestamp_floor = Some(floor);
    }

    /// The current timestamp floor.
    pub fn timestamp_floor(&self) -> Option<Instant> {
        self.timestamp_floor
    }

    /// Returns true if `event` is recent enough and satisfies every requirement.
    pub fn validate(&self, event: &Event) -> bool {
        debug!("validating {} against {:?}", event, self.required);
        if let Some(floor) = self.timestamp_floor {
            if event.created_at() < floor {
                debug!("{} predates the operation", event);
                return false;
            }
        }

        let valid = self
            .required
            .iter()
            .all(|(key, req)| req.holds(event.get(key)));
        debug!("{} valid: {}", event, valid);
        valid
    }
}
