//! Error types for the orchestration layer

use crate::session::Role;
use crate::substrate::DiscoveryError;
use thiserror::Error;

/// Errors that can occur while driving an Advertiser or Acquirer session
#[derive(Debug, Error)]
pub enum FlickError {
    /// A session for this role is already running
    #[error("{0} session already active")]
    AlreadyActive(Role),

    /// The discovery substrate refused the advertisement
    #[error("Registration failed: {0}")]
    RegistrationFailed(DiscoveryError),

    /// A discovered service could not be resolved to an endpoint
    #[error("Resolve failed: {0}")]
    ResolveFailed(DiscoveryError),

    /// Browsing could not be started or the substrate could not be opened
    #[error("Discovery error: {0}")]
    Discovery(DiscoveryError),

    /// The content store could not create the destination
    #[error("Could not create destination {name}: {reason}")]
    DestinationCreateFailed {
        /// Display name the destination was requested for
        name: String,
        /// Underlying cause
        reason: String,
    },

    /// The content store could not open the source
    #[error("Could not open source {path}: {reason}")]
    SourceOpenFailed {
        /// Path the caller asked for
        path: String,
        /// Underlying cause
        reason: String,
    },

    /// The transfer engine reported a failure
    #[error("Transfer failed: {0}")]
    EngineFailure(String),

    /// Size metadata could not be read from a handle
    #[error("Size probe failed: {0}")]
    SizeProbeFailed(String),

    /// The session was cancelled before setup finished
    #[error("Session cancelled")]
    Cancelled,

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlickError {
    /// Whether this error was raised synchronously by the re-entrancy guard
    #[must_use]
    pub fn is_already_active(&self) -> bool {
        matches!(self, Self::AlreadyActive(_))
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, FlickError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::FAILURE_MAX_LIMIT;

    #[test]
    fn test_error_display() {
        let err = FlickError::AlreadyActive(Role::Advertiser);
        assert_eq!(err.to_string(), "advertiser session already active");
        assert!(err.is_already_active());

        let err = FlickError::RegistrationFailed(DiscoveryError::Registration {
            code: FAILURE_MAX_LIMIT,
            reason: "too many services".into(),
        });
        assert!(err.to_string().contains("code 4"));
        assert!(!err.is_already_active());

        let err = FlickError::DestinationCreateFailed {
            name: "photo.jpg".into(),
            reason: "read-only".into(),
        };
        assert_eq!(
            err.to_string(),
            "Could not create destination photo.jpg: read-only"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FlickError = io.into();
        assert!(matches!(err, FlickError::Io(_)));
    }
}
