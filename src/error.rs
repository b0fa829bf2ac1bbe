//! Error types for the volcap capture engine.

use std::collections::TryReserveError;
use std::io;
use thiserror::Error;

/// Resource exhaustion reported by the stream store and the security index
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("allocation failed: {0}")]
    Memory(#[from] TryReserveError),

    #[error("security ID space exhausted after {0} descriptors")]
    SecurityIds(usize),
}

/// Capture-related errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Failed to open volume `{device}`: {source}")]
    VolumeOpen {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to release volume `{device}`: {source}")]
    VolumeRelease {
        device: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open object {path}: {source}")]
    ObjectOpen {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Resource exhaustion while capturing {path}: {source}")]
    Allocation {
        path: String,
        #[source]
        source: ResourceError,
    },

    #[error("Failed to query security descriptor of {path}: {detail}")]
    SecurityQuery { path: String, detail: String },

    #[error("Unsupported object {path}: {reason}")]
    UnsupportedObject { path: String, reason: String },

    #[error("Failed to enumerate directory {path}: {source}")]
    Enumeration {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid name under {path}: {detail}")]
    InvalidName { path: String, detail: String },

    #[error("Invalid capture option `{key}`: {detail}")]
    InvalidConfig { key: String, detail: String },
}

/// Fieldless discriminant of [`CaptureError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    VolumeOpen,
    VolumeRelease,
    ObjectOpen,
    Read,
    Allocation,
    SecurityQuery,
    UnsupportedObject,
    Enumeration,
    InvalidName,
    InvalidConfig,
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::VolumeOpen { .. } => ErrorKind::VolumeOpen,
            CaptureError::VolumeRelease { .. } => ErrorKind::VolumeRelease,
            CaptureError::ObjectOpen { .. } => ErrorKind::ObjectOpen,
            CaptureError::Read { .. } => ErrorKind::Read,
            CaptureError::Allocation { .. } => ErrorKind::Allocation,
            CaptureError::SecurityQuery { .. } => ErrorKind::SecurityQuery,
            CaptureError::UnsupportedObject { .. } => ErrorKind::UnsupportedObject,
            CaptureError::Enumeration { .. } => ErrorKind::Enumeration,
            CaptureError::InvalidName { .. } => ErrorKind::InvalidName,
            CaptureError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
        }
    }

    /// Device, object path or option key the error refers to
    pub fn location(&self) -> &str {
        match self {
            CaptureError::VolumeOpen { device, .. } | CaptureError::VolumeRelease { device, .. } => {
                device
            }
            CaptureError::ObjectOpen { path, .. }
            | CaptureError::Read { path, .. }
            | CaptureError::Allocation { path, .. }
            | CaptureError::SecurityQuery { path, .. }
            | CaptureError::UnsupportedObject { path, .. }
            | CaptureError::Enumeration { path, .. }
            | CaptureError::InvalidName { path, .. } => path,
            CaptureError::InvalidConfig { key, .. } => key,
        }
    }

    pub(crate) fn read(path: impl Into<String>, source: io::Error) -> Self {
        CaptureError::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn allocation(path: impl Into<String>, source: impl Into<ResourceError>) -> Self {
        CaptureError::Allocation {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn unsupported(path: impl Into<String>, reason: impl Into<String>) -> Self {
        CaptureError::UnsupportedObject {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::VolumeOpen => "VolumeOpenError",
            ErrorKind::VolumeRelease => "VolumeReleaseError",
            ErrorKind::ObjectOpen => "ObjectOpenError",
            ErrorKind::Read => "ReadError",
            ErrorKind::Allocation => "AllocationError",
            ErrorKind::SecurityQuery => "SecurityQueryError",
            ErrorKind::UnsupportedObject => "UnsupportedObjectError",
            ErrorKind::Enumeration => "EnumerationError",
            ErrorKind::InvalidName => "InvalidNameError",
            ErrorKind::InvalidConfig => "InvalidConfigError",
        };
        f.write_str(name)
    }
}

/// Application-level errors (configuration, logging setup, CLI)
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Output error: {0}")]
    Output(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}
