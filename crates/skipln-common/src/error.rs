//! Error types for the skip + layer-norm operator family

use thiserror::Error;

/// Top-level error for construction, negotiation, serialization and dispatch.
#[derive(Error, Debug)]
pub enum SkipLnError {
    /// Weight blob count does not match `ld`, or its dtype cannot be ingested.
    #[error("Invalid weights: {reason}")]
    InvalidWeights { reason: String },

    /// A format/precision combination the operator does not implement.
    ///
    /// Negotiation itself answers `false` rather than raising this; it is
    /// used when a rejected combination is forced through `configure`.
    #[error("Unsupported format: {reason}")]
    UnsupportedFormat { reason: String },

    /// The host passed a malformed slot or output index.
    #[error("Index {index} out of range for {what} (limit {limit})")]
    OutOfRange { what: &'static str, index: usize, limit: usize },

    /// Serialized blob is truncated, oversized or corrupt.
    #[error("Deserialization failed: {reason}")]
    Deserialization { reason: String },

    /// The kernel could not be dispatched for the supplied descriptors.
    #[error("Dispatch failure: {reason}")]
    Dispatch { reason: String },

    /// Lifecycle or configuration contract violated.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kernel error: {0}")]
    Kernel(#[from] KernelError),
}

/// Errors raised by the compute kernels themselves.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("Invalid kernel arguments: {reason}")]
    InvalidArguments { reason: String },

    #[error("Unsupported precision: {dtype}")]
    UnsupportedPrecision { dtype: String },

    #[error("GPU error: {reason}")]
    GpuError { reason: String },
}

pub type Result<T> = std::result::Result<T, SkipLnError>;

impl SkipLnError {
    pub fn invalid_weights(reason: impl Into<String>) -> Self {
        Self::InvalidWeights { reason: reason.into() }
    }

    pub fn deserialization(reason: impl Into<String>) -> Self {
        Self::Deserialization { reason: reason.into() }
    }

    pub fn dispatch(reason: impl Into<String>) -> Self {
        Self::Dispatch { reason: reason.into() }
    }

    /// Status code reported across the execution boundary.
    ///
    /// `0` is reserved for success; every error maps to a distinct nonzero
    /// value so host logs can tell dispatch failures from kernel faults.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidWeights { .. } => 1,
            Self::UnsupportedFormat { .. } => 2,
            Self::OutOfRange { .. } => 3,
            Self::Deserialization { .. } => 4,
            Self::Dispatch { .. } => 5,
            Self::Config(_) => 6,
            Self::Kernel(KernelError::InvalidArguments { .. }) => 7,
            Self::Kernel(KernelError::UnsupportedPrecision { .. }) => 8,
            Self::Kernel(KernelError::GpuError { .. }) => 9,
        }
    }
}

/// Status reported by `enqueue`: `0` on success, otherwise
/// [`SkipLnError::status_code`] of the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchStatus(i32);

impl DispatchStatus {
    pub const SUCCESS: Self = Self(0);

    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl From<&SkipLnError> for DispatchStatus {
    fn from(err: &SkipLnError) -> Self {
        Self(err.status_code())
    }
}

impl<T> From<&Result<T>> for DispatchStatus {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::SUCCESS,
            Err(e) => e.into(),
        }
    }
}
