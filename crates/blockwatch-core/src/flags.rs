//! Mutually exclusive operation phase flags.
//!
//! Each synchronizer guards one storage operation at a time. The kind of
//! operation is recorded as a single active [`Phase`]; activating a second
//! phase while one is set is a contract violation and fails loudly.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{EventError, EventResult};

/// Kind of storage operation a synchronizer is guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Device activation (setup).
    Starting,
    /// Device deactivation (teardown).
    Stopping,
    /// Device or format creation.
    Creating,
    /// Device or format destruction.
    Destroying,
    /// Device resize.
    Resizing,
    /// Generic change confirmed through a validator.
    Changing,
}

impl Phase {
    /// All phases, in declaration order.
    pub const ALL: [Phase; 6] = [
        Phase::Starting,
        Phase::Stopping,
        Phase::Creating,
        Phase::Destroying,
        Phase::Resizing,
        Phase::Changing,
    ];

    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Starting => "starting",
            Phase::Stopping => "stopping",
            Phase::Creating => "creating",
            Phase::Destroying => "destroying",
            Phase::Resizing => "resizing",
            Phase::Changing => "changing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of phase flags of one synchronizer. At most one is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationFlags {
    active: Option<Phase>,
}

impl OperationFlags {
    /// Create a flag set with no active phase.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if any phase is active.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// The currently active phase, if any.
    pub fn active(&self) -> Option<Phase> {
        self.active
    }

    /// Returns true if `phase` is the active phase.
    pub fn get(&self, phase: Phase) -> bool {
        self.active == Some(phase)
    }

    /// Set or clear one phase flag.
    ///
    /// Setting a phase while a different one is active fails with
    /// [`EventError::SynchronizationConflict`] and leaves the active phase
    /// untouched. Re-setting the already active phase is also a conflict,
    /// since it means two operations were started on the same entity.
    /// Clearing a phase that is not active is a no-op.
    pub fn set(&mut self, sync_id: u64, phase: Phase, value: bool) -> EventResult<()> {
        if !value {
            if self.active == Some(phase) {
                self.active = None;
            }
            return Ok(());
        }

        if let Some(active) = self.active {
            error!("{} is already active on sync {}", active, sync_id);
            return Err(EventError::SynchronizationConflict {
                sync_id,
                requested: phase,
                active,
            });
        }

        self.active = Some(phase);
        Ok(())
    }

    /// Clear every flag.
    pub fn reset(&mut self) {
        self.active = None;
    }
}
