//! CUDA backend, compiled only with the `cuda` feature.
//!
//! Kernels are compiled from source at stream creation through NVRTC and
//! launched with `cudarc`. f16 activations have no device kernel yet and run
//! on the host path.

pub mod skip_layer_norm;

pub use skip_layer_norm::{CudaParams, CudaSkipLayerNorm, SKIP_LAYER_NORM_KERNEL_SRC, block_dim};
