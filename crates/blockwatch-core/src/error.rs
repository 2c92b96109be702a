//! Error types for the uevent pipeline and operation synchronization.

use thiserror::Error;

use crate::flags::Phase;

/// Result type alias for event-handling operations.
pub type EventResult<T> = Result<T, EventError>;

/// Error variants for event handling and synchronization.
#[derive(Debug, Error)]
pub enum EventError {
    /// Dequeue was attempted on an empty queue.
    #[error("Event queue is empty")]
    QueueEmpty,

    /// Event handling was enabled before a handler was registered.
    #[error("Event manager not configured: {0}")]
    NotConfigured(String),

    /// A second phase flag was set while another was still active.
    #[error("Cannot set {requested} on sync {sync_id}: {active} is already active")]
    SynchronizationConflict {
        /// The synchronizer on which the conflict occurred.
        sync_id: u64,
        /// The phase the caller tried to activate.
        requested: Phase,
        /// The phase that was already active.
        active: Phase,
    },

    /// A handshake call was made out of order.
    #[error("Synchronization protocol error: {0}")]
    ProtocolError(String),

    /// A change event targets a device the model believes does not exist.
    #[error("Inconsistent model: change event for non-existent device {device}")]
    ReconciliationInconsistency {
        /// Name of the device the event refers to.
        device: String,
    },

    /// The kernel notification source failed.
    #[error("Uevent source error: {0}")]
    Source(String),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
