//! Error types for Kino Protection

use thiserror::Error;

/// Result type alias for protection operations
pub type Result<T> = std::result::Result<T, Error>;

/// A rejection reported by the content-protection platform.
///
/// `name` carries the platform's exception name (`NotSupportedError`,
/// `InvalidStateError`, ...) and is what ends up in event diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{name}: {message}")]
pub struct PlatformError {
    pub name: String,
    pub message: String,
}

impl PlatformError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Platform does not support the requested key system or configuration
    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new("NotSupportedError", message)
    }

    /// Operation invoked on an object in the wrong state
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("InvalidStateError", message)
    }
}

/// Protection error types
#[derive(Error, Debug)]
pub enum Error {
    // Sequencing errors
    #[error("Can not {operation} until you have selected a key system")]
    KeySystemNotSelected { operation: &'static str },

    #[error("Key system already selected: {key_system}")]
    KeySystemAlreadySelected { key_system: String },

    #[error("Teardown already in progress")]
    TeardownInProgress,

    // Session errors
    #[error("Session already registered: {session_id}")]
    DuplicateSession { session_id: String },

    #[error("Update message not supported by key system {key_system}")]
    UnsupportedUpdate { key_system: String },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Platform errors
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a precondition error for an operation that needs a key system
    pub fn not_selected(operation: &'static str) -> Self {
        Error::KeySystemNotSelected { operation }
    }

    /// Returns true if this error reports a caller sequencing mistake
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::KeySystemNotSelected { .. }
                | Error::KeySystemAlreadySelected { .. }
                | Error::TeardownInProgress
        )
    }

    /// Returns the error code for logs and analytics
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::KeySystemNotSelected { .. } => "KEY_SYSTEM_NOT_SELECTED",
            Error::KeySystemAlreadySelected { .. } => "KEY_SYSTEM_ALREADY_SELECTED",
            Error::TeardownInProgress => "TEARDOWN_IN_PROGRESS",
            Error::DuplicateSession { .. } => "DUPLICATE_SESSION",
            Error::UnsupportedUpdate { .. } => "UNSUPPORTED_UPDATE",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Platform(_) => "PLATFORM",
            Error::Json(_) => "JSON",
            Error::Io(_) => "IO",
        }
    }
}
