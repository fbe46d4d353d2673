//! Error taxonomy for a recording invocation.
//!
//! Every variant is terminal: an invocation either completes or fails with
//! exactly one of these, and the `Display` text is what the caller prints
//! after `ERROR: `.

use thiserror::Error;

/// Error type for recording operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The request was malformed. Raised before any hardware is touched.
    #[error("{0}")]
    Input(String),

    /// The device could not be opened (unavailable, busy, access denied).
    #[error("{0}")]
    Open(String),

    /// The recording sink could not be configured or prepared.
    #[error("{0}")]
    Config(String),

    /// The capture session negotiation was rejected by the device.
    #[error("{0}")]
    ConfigureFailed(String),

    /// The recording failed after it had started.
    #[error("{0}")]
    Runtime(String),

    /// The device went away while the invocation was in flight.
    #[error("Camera {0} disconnected")]
    Disconnected(u32),

    /// I/O error outside of the hardware pipeline.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// Short machine-readable category, used in log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Open(_) => "open",
            Self::Config(_) => "config",
            Self::ConfigureFailed(_) => "configure_failed",
            Self::Runtime(_) => "runtime",
            Self::Disconnected(_) => "disconnected",
            Self::Io(_) => "io",
        }
    }
}

/// Result type for recording operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_bare_message() {
        let err = CaptureError::Config("Unknown extension: xyz".to_owned());
        assert_eq!(err.to_string(), "Unknown extension: xyz");
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_disconnected_names_camera() {
        assert_eq!(CaptureError::Disconnected(2).to_string(), "Camera 2 disconnected");
    }
}
