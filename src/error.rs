//! Runtime error taxonomy.
//!
//! Every failure that can surface through a task future or a CLI exit code is
//! a variant of [`RuntimeError`]. Futures live in shared memory, so each
//! variant also maps onto a stable [`ErrorCode`] word that can be stored in a
//! future record and decoded by any attached process.

use thiserror::Error;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("runtime not initialized (segment missing or not ready)")]
    NotInitialized,

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("method not found: method {method} on module {module}")]
    MethodNotFound { module: String, method: u32 },

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("queue full")]
    QueueFull,

    #[error("out of memory: segment arena exhausted")]
    OutOfMemory,

    #[error("target full: {0}")]
    TargetFull(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("tag not found: {0}")]
    TagNotFound(String),

    #[error("io error (errno {errno}): {msg}")]
    Io { errno: i32, msg: String },

    #[error("cancelled")]
    Cancelled,

    #[error("timeout")]
    Timeout,

    #[error("runtime shutdown")]
    RuntimeShutdown,

    #[error("unreachable: node {0} is not in the address table")]
    Unreachable(u32),

    #[error("route stale: node {0}")]
    RouteStale(u32),

    #[error("fatal: module requested container destruction: {0}")]
    Fatal(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("serialization failed: {0}")]
    Serde(String),
}

/// Stable wire representation of the taxonomy, stored in future records.
///
/// The discriminants are part of the segment layout; do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    Ok = 0,
    ManifestInvalid = 1,
    NotInitialized = 2,
    PoolNotFound = 3,
    MethodNotFound = 4,
    ContainerNotFound = 5,
    QueueFull = 6,
    OutOfMemory = 7,
    TargetFull = 8,
    BlobNotFound = 9,
    TagNotFound = 10,
    Io = 11,
    Cancelled = 12,
    Timeout = 13,
    RuntimeShutdown = 14,
    Unreachable = 15,
    RouteStale = 16,
    Fatal = 17,
    Unsupported = 18,
    Serde = 19,
}

impl ErrorCode {
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::ManifestInvalid,
            2 => Self::NotInitialized,
            3 => Self::PoolNotFound,
            4 => Self::MethodNotFound,
            5 => Self::ContainerNotFound,
            6 => Self::QueueFull,
            7 => Self::OutOfMemory,
            8 => Self::TargetFull,
            9 => Self::BlobNotFound,
            10 => Self::TagNotFound,
            11 => Self::Io,
            13 => Self::Timeout,
            14 => Self::RuntimeShutdown,
            15 => Self::Unreachable,
            16 => Self::RouteStale,
            17 => Self::Fatal,
            18 => Self::Unsupported,
            19 => Self::Serde,
            _ => Self::Cancelled,
        }
    }
}

impl RuntimeError {
    /// The wire code published in a future record when this error terminates
    /// a task.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ManifestInvalid(_) => ErrorCode::ManifestInvalid,
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::PoolNotFound(_) => ErrorCode::PoolNotFound,
            Self::MethodNotFound { .. } => ErrorCode::MethodNotFound,
            Self::ContainerNotFound(_) => ErrorCode::ContainerNotFound,
            Self::QueueFull => ErrorCode::QueueFull,
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::TargetFull(_) => ErrorCode::TargetFull,
            Self::BlobNotFound(_) => ErrorCode::BlobNotFound,
            Self::TagNotFound(_) => ErrorCode::TagNotFound,
            Self::Io { .. } => ErrorCode::Io,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Timeout => ErrorCode::Timeout,
            Self::RuntimeShutdown => ErrorCode::RuntimeShutdown,
            Self::Unreachable(_) => ErrorCode::Unreachable,
            Self::RouteStale(_) => ErrorCode::RouteStale,
            Self::Fatal(_) => ErrorCode::Fatal,
            Self::Unsupported(_) => ErrorCode::Unsupported,
            Self::Serde(_) => ErrorCode::Serde,
        }
    }

    /// Rebuild a (message-less) error from a wire code read out of a future
    /// record. Used by waiters in processes other than the one that ran the
    /// task.
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Ok => unreachable!("Ok is not an error"),
            ErrorCode::ManifestInvalid => Self::ManifestInvalid(String::new()),
            ErrorCode::NotInitialized => Self::NotInitialized,
            ErrorCode::PoolNotFound => Self::PoolNotFound(String::new()),
            ErrorCode::MethodNotFound => Self::MethodNotFound {
                module: String::new(),
                method: 0,
            },
            ErrorCode::ContainerNotFound => Self::ContainerNotFound(String::new()),
            ErrorCode::QueueFull => Self::QueueFull,
            ErrorCode::OutOfMemory => Self::OutOfMemory,
            ErrorCode::TargetFull => Self::TargetFull(String::new()),
            ErrorCode::BlobNotFound => Self::BlobNotFound(String::new()),
            ErrorCode::TagNotFound => Self::TagNotFound(String::new()),
            ErrorCode::Io => Self::Io {
                errno: 0,
                msg: String::new(),
            },
            ErrorCode::Cancelled => Self::Cancelled,
            ErrorCode::Timeout => Self::Timeout,
            ErrorCode::RuntimeShutdown => Self::RuntimeShutdown,
            ErrorCode::Unreachable => Self::Unreachable(0),
            ErrorCode::RouteStale => Self::RouteStale(0),
            ErrorCode::Fatal => Self::Fatal(String::new()),
            ErrorCode::Unsupported => Self::Unsupported(String::new()),
            ErrorCode::Serde => Self::Serde(String::new()),
        }
    }

    /// Build an io-error from an `std::io::Error`, preserving the errno.
    pub fn io(err: std::io::Error) -> Self {
        Self::Io {
            errno: err.raw_os_error().unwrap_or(0),
            msg: err.to_string(),
        }
    }
}

impl From<std::io::Error> for RuntimeError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err)
    }
}

impl From<bincode::Error> for RuntimeError {
    fn from(err: bincode::Error) -> Self {
        Self::Serde(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trip_is_stable() {
        let errors = [
            RuntimeError::QueueFull,
            RuntimeError::OutOfMemory,
            RuntimeError::Cancelled,
            RuntimeError::Timeout,
            RuntimeError::RuntimeShutdown,
            RuntimeError::TagNotFound("t".into()),
        ];
        for err in errors {
            let code = err.code();
            assert_eq!(RuntimeError::from_code(code).code(), code);
        }
    }

    #[test]
    fn io_error_preserves_errno() {
        let err = std::io::Error::from_raw_os_error(libc::ENOENT);
        match RuntimeError::io(err) {
            RuntimeError::Io { errno, .. } => assert_eq!(errno, libc::ENOENT),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
