//! Error types for the session runtime.
//!
//! Two layers of errors exist:
//!
//! ```text
//! RuntimeError                 -- returned by every public operation
//! ├── InvalidParameter(String)  -- absent/empty arguments, size mismatches
//! ├── OutOfMemory               -- host allocation failed
//! ├── Runtime(String)           -- compute, resize or session creation failed
//! ├── Unsupported(String)       -- rank > 8, multiple inputs/outputs, dynamic shapes on fixed paths
//! ├── ModelLoadFailed(String)   -- the backend could not parse the model bytes
//! ├── Config(String)            -- configuration file could not be parsed
//! └── Io(std::io::Error)        -- configuration/model file could not be read
//!
//! BackendError                 -- returned by `InferenceBackend` implementations
//! ```
//!
//! Backend errors are converted at the boundary, see `From<BackendError>`.

use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Stable numeric error codes.
///
/// These values are part of the public contract and match the codes used by
/// native bindings of the same runtime.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success = 0,
    InvalidParameter = 1,
    OutOfMemory = 2,
    RuntimeError = 3,
    Unsupported = 4,
    ModelLoadFailed = 5,
}

/// The error type for all public runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// An argument was absent, empty or had the wrong size. Never reaches the backend.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A host-side buffer could not be allocated.
    #[error("Out of memory")]
    OutOfMemory,

    /// Backend compute, resize or session creation failed.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The model or request uses a configuration this runtime does not handle.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The backend could not parse the model buffer.
    #[error("Model load failed: {0}")]
    ModelLoadFailed(String),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter(_) | Self::Config(_) => ErrorCode::InvalidParameter,
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::Runtime(_) | Self::Io(_) => ErrorCode::RuntimeError,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::ModelLoadFailed(_) => ErrorCode::ModelLoadFailed,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    pub(crate) fn lock_failed<T>(what: &str, err: PoisonError<T>) -> Self {
        Self::Runtime(format!("Failed to lock {}: {}", what, err))
    }
}

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors reported by an [`InferenceBackend`](crate::backend::InferenceBackend).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Failed to load model: {0}")]
    LoadFailed(String),

    #[error("Failed to create session: {0}")]
    SessionFailed(String),

    #[error("Compute failed: {0}")]
    ComputeFailed(String),

    #[error("Resize failed: {0}")]
    ResizeFailed(String),

    /// The buffer handle does not belong to the session or was invalidated by a resize.
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl From<BackendError> for RuntimeError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::LoadFailed(msg) => RuntimeError::ModelLoadFailed(msg),
            BackendError::OutOfMemory => RuntimeError::OutOfMemory,
            BackendError::Unsupported(msg) => RuntimeError::Unsupported(msg),
            other => RuntimeError::Runtime(other.to_string()),
        }
    }
}

/// Last-error message slot.
///
/// Every model, pool and unmanaged context owns one. Each failing call
/// overwrites the message; [`LastError::get`] returns an owned copy.
#[derive(Debug, Default)]
pub struct LastError {
    message: Mutex<String>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the most recent error message (empty if none).
    pub fn get(&self) -> String {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, message: impl Into<String>) {
        *self.message.lock().unwrap_or_else(PoisonError::into_inner) = message.into();
    }

    /// Stores the message of a failed result and passes the result through.
    pub fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.set(err.to_string());
        }
        result
    }
}
