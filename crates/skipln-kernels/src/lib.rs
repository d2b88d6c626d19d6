//! Fused skip-connection + layer-normalization kernels
//!
//! - [`cpu`]: host implementations for f32/f16 storage and the int8
//!   dequantize → normalise → requantize path
//! - [`device`]: execution streams and parameter buffers
//! - [`dispatch`]: precision routing used by the operator on every launch
//! - `cuda` (feature `cuda`): NVRTC-compiled device kernels

pub mod cpu;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod dispatch;

pub use cpu::{NormParams, QuantScales, RowLayout, StorageFloat, quantize_i8};
pub use device::{DeviceBuffer, Stream};
pub use dispatch::{ParamBuffers, SkipLayerNormArgs, skip_layer_norm_forward};
