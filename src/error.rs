//! Error types for packwire
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::build::result::BuildFailure;

/// All error types that can occur while talking to the worker
#[derive(Debug, Error)]
pub enum PackwireError {
    /// The channel to the worker is closed; every pending caller sees this
    #[error("{0}")]
    ServiceStopped(String),

    /// The worker announced a different version during the handshake
    #[error("Cannot start service: Host version \"{expected}\" does not match binary version \"{actual}\"")]
    VersionMismatch { expected: String, actual: String },

    /// Malformed frame or packet
    #[error("Invalid packet: {0}")]
    Protocol(String),

    /// A well-framed packet whose value has the wrong shape; the channel stays up
    #[error("Malformed value: {0}")]
    Malformed(String),

    /// An outbound packet too large for the frame length prefix or the configured limit
    #[error("Packet of {size} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { size: usize, max: usize },

    /// The worker answered a request with an error string
    #[error("{0}")]
    Worker(String),

    /// Rejected build or transform option
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// Misuse of the plugin API (registration, resolve before setup, ...)
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// A build or transform produced errors
    #[error(transparent)]
    BuildFailed(#[from] BuildFailure),

    /// A context method other than cancel/dispose called after dispose
    #[error("Cannot use a build context after it has been disposed")]
    Disposed,

    /// Client-side request timeout
    #[error("Request {id} timed out after {ms}ms")]
    Timeout { id: u32, ms: u64 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON conversion error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PackwireError {
    /// Whether this error means the whole channel is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ServiceStopped(_) | Self::VersionMismatch { .. } | Self::Protocol(_))
    }
}

impl Clone for PackwireError {
    fn clone(&self) -> Self {
        match self {
            Self::ServiceStopped(msg) => Self::ServiceStopped(msg.clone()),
            Self::VersionMismatch { expected, actual } => Self::VersionMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::Protocol(msg) => Self::Protocol(msg.clone()),
            Self::Malformed(msg) => Self::Malformed(msg.clone()),
            Self::FrameTooLarge { size, max } => Self::FrameTooLarge { size: *size, max: *max },
            Self::Worker(msg) => Self::Worker(msg.clone()),
            Self::InvalidOption(msg) => Self::InvalidOption(msg.clone()),
            Self::Plugin(msg) => Self::Plugin(msg.clone()),
            Self::BuildFailed(failure) => Self::BuildFailed(failure.clone()),
            Self::Disposed => Self::Disposed,
            Self::Timeout { id, ms } => Self::Timeout { id: *id, ms: *ms },
            // neither source error is Clone; keep kind and text
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Json(e) => Self::Json(<serde_json::Error as serde::de::Error>::custom(e.to_string())),
        }
    }
}

/// Result type alias for packwire operations
pub type Result<T> = std::result::Result<T, PackwireError>;
