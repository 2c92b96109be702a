//! Error types for the management surface.

use blockwatch_core::EventError;
use thiserror::Error;

/// Result type alias for management operations.
pub type MgmtResult<T> = Result<T, MgmtError>;

/// Error variants for management operations.
#[derive(Debug, Error)]
pub enum MgmtError {
    /// No device matches the given specification.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// The event pipeline failed.
    #[error("Event pipeline error: {0}")]
    Event(#[from] EventError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_spec() {
        let err = MgmtError::NotFound("LABEL=home".to_string());
        assert_eq!(err.to_string(), "Device not found: LABEL=home");
    }

    #[test]
    fn test_from_event_error() {
        let err: MgmtError = EventError::QueueEmpty.into();
        assert!(matches!(err, MgmtError::Event(EventError::QueueEmpty)));
    }
}
