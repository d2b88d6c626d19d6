//! Common types, errors and configuration for the fused skip + layer-norm
//! operator family.
//!
//! The kernel and plugin crates both build on the tensor descriptions and the
//! error taxonomy defined here.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DEFAULT_PARALLEL_MIN_ROWS, RuntimeConfig, SKIP_LAYER_NORM_EPSILON};
pub use error::{DispatchStatus, KernelError, Result, SkipLnError};
pub use types::{DataType, TensorDesc, TensorFormat, TensorMut, TensorRef, Weights};
