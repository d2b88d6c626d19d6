//! Fused skip-connection + layer normalization on the host.
//!
//! # Kernel strategy
//!
//! For each row of `ld` channels:
//!
//!   `c[i]   = input[i] + skip[i] (+ bias[i])`
//!   `y[i]   = ((c[i] - mean(c)) / sqrt(var(c) + eps)) * gamma[i] + beta[i]`
//!
//! The combined row `c` is never written to memory: it is recomputed from
//! `input`/`skip`/`bias` in each of the three passes (mean, centred variance,
//! normalise). Reductions accumulate in `f64` whatever the storage type.
//!
//! The int8 variant dequantizes `input` and `skip` with per-tensor scales
//! before the add, keeps `gamma`/`beta`/`bias` in half precision, and
//! requantizes the result with round-half-to-even and saturation to
//! `[-128, 127]`.
//!
//! Rows are independent, so large batches are split across the rayon pool
//! without changing a single output bit.

use half::f16;
use rayon::prelude::*;
use skipln_common::{DataType, KernelError, Result, RuntimeConfig, SKIP_LAYER_NORM_EPSILON};

/// Element type the float path can load from and store to.
pub trait StorageFloat: Copy + Send + Sync + 'static {
    const DTYPE: DataType;
    fn to_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl StorageFloat for f32 {
    const DTYPE: DataType = DataType::Float;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl StorageFloat for f16 {
    const DTYPE: DataType = DataType::Half;

    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

/// How rows are laid out in the activation buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
    /// Channels normalised together.
    pub ld: usize,
    /// Distance in elements between the starts of consecutive rows (`>= ld`).
    pub row_stride: usize,
    /// Number of rows to process.
    pub rows: usize,
}

impl RowLayout {
    /// Densely packed rows.
    pub fn contiguous(ld: usize, rows: usize) -> Self {
        Self { ld, row_stride: ld, rows }
    }

    /// Rows whose channel extent is padded up to a multiple of `vector_width`.
    pub fn padded(ld: usize, rows: usize, vector_width: usize) -> Self {
        let width = vector_width.max(1);
        Self { ld, row_stride: ld.div_ceil(width) * width, rows }
    }

    /// Elements every activation buffer must hold, `None` if that count
    /// does not fit in `usize`.
    pub fn required_len(&self) -> Option<usize> {
        self.rows.checked_mul(self.row_stride)
    }

    /// Check the layout against buffer lengths and return
    /// [`Self::required_len`].
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidArguments`] for a zero `ld`, a stride
    /// shorter than `ld`, a row count whose extent overflows `usize`, or any
    /// buffer shorter than the layout needs.
    pub fn validate(&self, input: usize, skip: usize, output: usize) -> Result<usize> {
        if self.ld == 0 {
            return Err(invalid("ld must be non-zero"));
        }
        if self.row_stride < self.ld {
            return Err(invalid(format!(
                "row stride {} shorter than ld {}",
                self.row_stride, self.ld
            )));
        }
        let need = self.required_len().ok_or_else(|| {
            invalid(format!("{} rows of stride {} overflow usize", self.rows, self.row_stride))
        })?;
        for (name, len) in [("input", input), ("skip", skip), ("output", output)] {
            if len < need {
                return Err(invalid(format!(
                    "{name} holds {len} elements, layout needs {need}"
                )));
            }
        }
        Ok(need)
    }
}

/// Per-channel parameters shared by every row.
#[derive(Debug, Clone, Copy)]
pub struct NormParams<'a, T> {
    /// Scale applied after normalisation.
    pub gamma: &'a [T],
    /// Shift applied after scaling.
    pub beta: &'a [T],
    /// Added to `input + skip` before normalisation.
    pub bias: Option<&'a [T]>,
}

impl<T> NormParams<'_, T> {
    pub(crate) fn validate(&self, ld: usize) -> Result<()> {
        if self.gamma.len() != ld {
            return Err(invalid(format!("gamma length {} != ld {ld}", self.gamma.len())));
        }
        if self.beta.len() != ld {
            return Err(invalid(format!("beta length {} != ld {ld}", self.beta.len())));
        }
        if let Some(bias) = self.bias
            && bias.len() != ld
        {
            return Err(invalid(format!("bias length {} != ld {ld}", bias.len())));
        }
        Ok(())
    }
}

/// Dequantization/requantization factors for the int8 path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantScales {
    /// Multiplier taking `input` codes to real values.
    pub dq_input: f32,
    /// Multiplier taking `skip` codes to real values.
    pub dq_skip: f32,
    /// Multiplier taking real outputs to int8 codes (reciprocal of the output scale).
    pub q_output: f32,
}

impl QuantScales {
    /// Build from the per-tensor scales the host attaches to each descriptor.
    ///
    /// # Errors
    ///
    /// Every scale must be finite and strictly positive.
    pub fn from_tensor_scales(input: f32, skip: f32, output: f32) -> Result<Self> {
        for (name, s) in [("input", input), ("skip", skip), ("output", output)] {
            if !s.is_finite() || s <= 0.0 {
                return Err(invalid(format!("{name} quantization scale must be positive, got {s}")));
            }
        }
        Ok(Self { dq_input: input, dq_skip: skip, q_output: 1.0 / output })
    }
}

/// Row statistics: mean and `1 / sqrt(var + eps)`.
#[inline(always)]
fn row_stats(ld: usize, combined: impl Fn(usize) -> f64) -> (f64, f64) {
    let n = ld as f64;
    let mut sum = 0.0f64;
    for i in 0..ld {
        sum += combined(i);
    }
    let mean = sum / n;

    let mut sq = 0.0f64;
    for i in 0..ld {
        let d = combined(i) - mean;
        sq += d * d;
    }
    let var = sq / n;
    (mean, 1.0 / (var + SKIP_LAYER_NORM_EPSILON as f64).sqrt())
}

#[inline(always)]
fn fused_row<T: StorageFloat>(
    ld: usize,
    input: &[T],
    skip: &[T],
    params: &NormParams<'_, T>,
    output: &mut [T],
) {
    let combined = |i: usize| {
        let mut v = input[i].to_f32() as f64 + skip[i].to_f32() as f64;
        if let Some(bias) = params.bias {
            v += bias[i].to_f32() as f64;
        }
        v
    };
    let (mean, inv_std) = row_stats(ld, &combined);
    for i in 0..ld {
        let normed = ((combined(i) - mean) * inv_std) as f32;
        output[i] = T::from_f32(normed * params.gamma[i].to_f32() + params.beta[i].to_f32());
    }
}

/// Round-half-to-even and saturate to the int8 range.
#[inline(always)]
pub fn quantize_i8(value: f32) -> i8 {
    if value.is_nan() {
        return 0;
    }
    value.round_ties_even().clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

#[inline(always)]
fn fused_row_dqq(
    ld: usize,
    input: &[i8],
    skip: &[i8],
    params: &NormParams<'_, f16>,
    output: &mut [i8],
    scales: QuantScales,
) {
    let combined = |i: usize| {
        let mut v = input[i] as f32 * scales.dq_input + skip[i] as f32 * scales.dq_skip;
        if let Some(bias) = params.bias {
            v += bias[i].to_f32();
        }
        v as f64
    };
    let (mean, inv_std) = row_stats(ld, &combined);
    for i in 0..ld {
        let normed = ((combined(i) - mean) * inv_std) as f32;
        let y = normed * params.gamma[i].to_f32() + params.beta[i].to_f32();
        output[i] = quantize_i8(y * scales.q_output);
    }
    // Padding lanes of an interleaved row carry no channel.
    output[ld..].fill(0);
}

/// Fused skip + layer norm for `f32` or `f16` storage.
///
/// # Errors
///
/// Returns [`KernelError::InvalidArguments`] if the layout or parameter
/// lengths are inconsistent with the buffers.
pub fn skip_layer_norm<T: StorageFloat>(
    layout: &RowLayout,
    input: &[T],
    skip: &[T],
    params: &NormParams<'_, T>,
    output: &mut [T],
    config: &RuntimeConfig,
) -> Result<()> {
    let need = layout.validate(input.len(), skip.len(), output.len())?;
    params.validate(layout.ld)?;
    if layout.rows == 0 {
        return Ok(());
    }

    let (input, skip, output) = (&input[..need], &skip[..need], &mut output[..need]);
    let (ld, stride) = (layout.ld, layout.row_stride);

    if config.use_parallel(layout.rows) {
        output
            .par_chunks_mut(stride)
            .zip(input.par_chunks(stride))
            .zip(skip.par_chunks(stride))
            .for_each(|((out, inp), sk)| fused_row(ld, inp, sk, params, out));
    } else {
        for ((out, inp), sk) in
            output.chunks_mut(stride).zip(input.chunks(stride)).zip(skip.chunks(stride))
        {
            fused_row(ld, inp, sk, params, out);
        }
    }
    Ok(())
}

/// Fused dequantize → skip + layer norm → requantize for int8 activations.
///
/// # Errors
///
/// Returns [`KernelError::InvalidArguments`] if the layout or parameter
/// lengths are inconsistent with the buffers.
pub fn skip_layer_norm_dqq(
    layout: &RowLayout,
    input: &[i8],
    skip: &[i8],
    params: &NormParams<'_, f16>,
    output: &mut [i8],
    scales: QuantScales,
    config: &RuntimeConfig,
) -> Result<()> {
    let need = layout.validate(input.len(), skip.len(), output.len())?;
    params.validate(layout.ld)?;
    if layout.rows == 0 {
        return Ok(());
    }

    let (input, skip, output) = (&input[..need], &skip[..need], &mut output[..need]);
    let (ld, stride) = (layout.ld, layout.row_stride);

    if config.use_parallel(layout.rows) {
        output
            .par_chunks_mut(stride)
            .zip(input.par_chunks(stride))
            .zip(skip.par_chunks(stride))
            .for_each(|((out, inp), sk)| fused_row_dqq(ld, inp, sk, params, out, scales));
    } else {
        for ((out, inp), sk) in
            output.chunks_mut(stride).zip(input.chunks(stride)).zip(skip.chunks(stride))
        {
            fused_row_dqq(ld, inp, sk, params, out, scales);
        }
    }
    Ok(())
}

fn invalid(reason: impl Into<String>) -> skipln_common::SkipLnError {
    KernelError::InvalidArguments { reason: reason.into() }.into()
}
