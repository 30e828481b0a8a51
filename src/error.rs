//! Error types for sdi-bridge

use thiserror::Error;

use crate::device::DeviceError;

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the capture and playback paths.
///
/// Every variant is logged where it is raised; callers get it back so they can
/// decide what to do, nothing in the crate retries on its own.
#[derive(Debug, Error)]
pub enum Error {
    /// The card does not support the requested mode, format or flag combination
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A device call returned a failure status
    #[error("{call} failed: {source}")]
    Device {
        call: &'static str,
        #[source]
        source: DeviceError,
    },

    /// A captured frame could not be turned into an image
    #[error("Conversion error: {0}")]
    Conversion(String),

    /// Worker threads could not be started
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Appending would exceed the command buffer capacity
    #[error("Command buffer overflow: {requested} bytes requested, {available} available")]
    CommandOverflow { requested: usize, available: usize },

    /// Unknown display mode name
    #[error("Unknown display mode: {0}")]
    InvalidMode(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Settings could not be loaded
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Create an Unsupported error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Wrap a failed device call
    pub fn device(call: &'static str, source: DeviceError) -> Self {
        Self::Device { call, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::device("EnableVideoInput", DeviceError::Status(0x8000_4005));
        assert_eq!(
            err.to_string(),
            "EnableVideoInput failed: device returned status 0x80004005"
        );

        let err = Error::CommandOverflow {
            requested: 12,
            available: 4,
        };
        assert_eq!(
            err.to_string(),
            "Command buffer overflow: 12 bytes requested, 4 available"
        );
    }

    #[test]
    fn test_error_creation() {
        let err = Error::unsupported("3D");
        assert!(matches!(err, Error::Unsupported(_)));
    }
}
