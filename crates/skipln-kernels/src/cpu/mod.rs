//! Host kernel implementations

pub mod skip_layer_norm;

pub use skip_layer_norm::{
    NormParams, QuantScales, RowLayout, StorageFloat, quantize_i8, skip_layer_norm,
    skip_layer_norm_dqq,
};
