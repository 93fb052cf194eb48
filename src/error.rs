//! Error types for gpuml

use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Result type alias using gpuml's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in gpuml operations
///
/// The type is `Clone` because the weights compressor hands the same failure
/// to every caller that touches a poisoned pipeline.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Malformed descriptor, usage/layout mismatch or out-of-range count
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },

    /// A required handle or view is missing
    #[error("Null reference: {what}")]
    NullReference {
        /// What was missing
        what: &'static str,
    },

    /// Slot or pool index exceeds capacity
    #[error("Index {index} out of bounds for size {size}")]
    OutOfBounds {
        /// The invalid index
        index: usize,
        /// Number of valid entries
        size: usize,
    },

    /// Host or device allocation failure
    #[error("Out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// Unsupported usage, layout or codec combination
    #[error("Not implemented: {feature}")]
    NotImplemented {
        /// Description of the unimplemented feature
        feature: &'static str,
    },

    /// Element or byte count exceeds the 32-bit addressing ceiling
    #[error("Overflow: {bytes} bytes exceeds the 2GB buffer limit")]
    Overflow {
        /// Requested size in bytes
        bytes: u64,
    },

    /// A required CPU extension is absent
    #[error("Unsupported hardware: this operation requires {required}")]
    UnsupportedHardware {
        /// Human readable list of required extensions
        required: &'static str,
    },

    /// The tensor has no backing buffer yet
    #[error("Tensor is not initialized")]
    UninitializedResource,

    /// Second write to an immutable tensor
    #[error("Tensor is already initialized")]
    AlreadyInitialized,

    /// Enum value or state that should be unreachable for a valid caller
    #[error("Unexpected state: {reason}")]
    UnexpectedState {
        /// What was unexpected
        reason: String,
    },

    /// Compute device or driver failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Failure reading or writing a host stream
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Internal error (bug in gpuml)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Short stable name of the error kind, used in log records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::NullReference { .. } => "null_reference",
            Self::OutOfBounds { .. } => "out_of_bounds",
            Self::OutOfMemory { .. } => "out_of_memory",
            Self::NotImplemented { .. } => "not_implemented",
            Self::Overflow { .. } => "overflow",
            Self::UnsupportedHardware { .. } => "unsupported_hardware",
            Self::UninitializedResource => "uninitialized_resource",
            Self::AlreadyInitialized => "already_initialized",
            Self::UnexpectedState { .. } => "unexpected_state",
            Self::Backend(_) => "backend",
            Self::Io(_) => "io",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Log failures at the public Device/Context boundary
pub(crate) trait LogOnError {
    /// Emit an `error!` record naming `op` if `self` is an error
    fn log_on_error(self, op: &'static str) -> Self;
}

impl<T> LogOnError for Result<T> {
    fn log_on_error(self, op: &'static str) -> Self {
        if let Err(err) = &self {
            error!(op, kind = err.kind(), "{err}");
        }
        self
    }
}

/// Allocate a zero-filled vector, reporting failure as `OutOfMemory`
pub(crate) fn try_zeroed_vec<T: Clone + Default>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|_| Error::OutOfMemory {
        size: len.saturating_mul(std::mem::size_of::<T>()),
    })?;
    v.resize(len, T::default());
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts_and_clones() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short").into();
        let copy = err.clone();
        assert_eq!(copy.kind(), "io");
        assert!(copy.to_string().contains("short"));
    }

    #[test]
    fn test_try_zeroed_vec() {
        let v: Vec<u32> = try_zeroed_vec(17).unwrap();
        assert_eq!(v.len(), 17);
        assert!(v.iter().all(|&x| x == 0));

        let huge = try_zeroed_vec::<u64>(usize::MAX / 4);
        assert!(matches!(huge, Err(Error::OutOfMemory { .. })));
    }
}
