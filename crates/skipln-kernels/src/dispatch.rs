//! Precision dispatch for the fused skip + layer-norm kernel.
//!
//! [`skip_layer_norm_forward`] matches the element types of the activation
//! views against the parameter buffers and routes to the float or int8 path.
//! On a CUDA stream the f32 and int8 paths launch device kernels against the
//! parameters uploaded through that stream; everything else runs on the host.

use crate::cpu::{NormParams, QuantScales, RowLayout, skip_layer_norm, skip_layer_norm_dqq};
use crate::device::{DeviceBuffer, Stream};
use half::f16;
use skipln_common::{KernelError, Result, RuntimeConfig, TensorMut, TensorRef};

/// Parameter buffers as the kernel sees them.
#[derive(Debug, Clone, Copy)]
pub struct ParamBuffers<'a> {
    pub gamma: &'a DeviceBuffer,
    pub beta: &'a DeviceBuffer,
    pub bias: Option<&'a DeviceBuffer>,
}

impl<'a> ParamBuffers<'a> {
    fn as_f32(&self) -> Option<NormParams<'a, f32>> {
        let bias = match self.bias {
            Some(b) => Some(b.as_f32()?),
            None => None,
        };
        Some(NormParams { gamma: self.gamma.as_f32()?, beta: self.beta.as_f32()?, bias })
    }

    fn as_f16(&self) -> Option<NormParams<'a, f16>> {
        let bias = match self.bias {
            Some(b) => Some(b.as_f16()?),
            None => None,
        };
        Some(NormParams { gamma: self.gamma.as_f16()?, beta: self.beta.as_f16()?, bias })
    }

    #[cfg(feature = "cuda")]
    fn as_cuda(&self) -> Option<crate::cuda::CudaParams<'a>> {
        let bias = match self.bias {
            Some(b) => Some(b.cuda_slice()?),
            None => None,
        };
        Some(crate::cuda::CudaParams {
            gamma: self.gamma.cuda_slice()?,
            beta: self.beta.cuda_slice()?,
            bias,
        })
    }
}

/// Device kernels and device-resident parameters, when both exist.
#[cfg(feature = "cuda")]
fn cuda_target<'s, 'a>(
    stream: &'s Stream,
    params: &ParamBuffers<'a>,
) -> Option<(&'s crate::cuda::CudaSkipLayerNorm, crate::cuda::CudaParams<'a>)> {
    let kernels = stream.cuda_kernels()?;
    match params.as_cuda() {
        Some(device) => Some((kernels, device)),
        None => {
            log::warn!("parameters were not uploaded through this CUDA stream, running on host");
            None
        }
    }
}

/// Activations and output for one launch.
#[derive(Debug)]
pub struct SkipLayerNormArgs<'a, 'b> {
    pub input: TensorRef<'a>,
    pub skip: TensorRef<'a>,
    pub output: TensorMut<'b>,
    /// Required for the int8 path, ignored otherwise.
    pub scales: Option<QuantScales>,
}

/// Run the fused kernel on `stream`.
///
/// # Errors
///
/// [`KernelError::UnsupportedPrecision`] when the combination of activation
/// and parameter types has no kernel; [`KernelError::InvalidArguments`] for
/// inconsistent lengths or missing int8 scales.
pub fn skip_layer_norm_forward(
    stream: &Stream,
    layout: &RowLayout,
    params: ParamBuffers<'_>,
    args: SkipLayerNormArgs<'_, '_>,
    config: &RuntimeConfig,
) -> Result<()> {
    log::debug!(
        "skip_layer_norm launch: backend={}, dtype={}, ld={}, rows={}, stride={}, bias={}",
        stream.backend_name(),
        args.input.dtype(),
        layout.ld,
        layout.rows,
        layout.row_stride,
        params.bias.is_some(),
    );

    let SkipLayerNormArgs { input, skip, output, scales } = args;
    match (input, skip, output) {
        (TensorRef::F32(input), TensorRef::F32(skip), TensorMut::F32(output)) => {
            let host = params.as_f32().ok_or_else(|| mismatch("f32", &params))?;
            #[cfg(feature = "cuda")]
            if let Some((cuda, device)) = cuda_target(stream, &params) {
                cuda.launch_f32(layout, input, skip, &device, output)?;
                stream.record_launch();
                return Ok(());
            }
            skip_layer_norm(layout, input, skip, &host, output, config)?;
        }
        (TensorRef::F16(input), TensorRef::F16(skip), TensorMut::F16(output)) => {
            let params = params.as_f16().ok_or_else(|| mismatch("f16", &params))?;
            skip_layer_norm(layout, input, skip, &params, output, config)?;
        }
        (TensorRef::I8(input), TensorRef::I8(skip), TensorMut::I8(output)) => {
            let host = params.as_f16().ok_or_else(|| mismatch("int8", &params))?;
            let scales = scales.ok_or_else(|| KernelError::InvalidArguments {
                reason: "int8 launch requires quantization scales".into(),
            })?;
            #[cfg(feature = "cuda")]
            if let Some((cuda, device)) = cuda_target(stream, &params) {
                cuda.launch_i8(layout, input, skip, &device, output, scales)?;
                stream.record_launch();
                return Ok(());
            }
            skip_layer_norm_dqq(layout, input, skip, &host, output, scales, config)?;
        }
        (input, skip, output) => {
            return Err(KernelError::UnsupportedPrecision {
                dtype: format!(
                    "input={} skip={} output={}",
                    input.dtype(),
                    skip.dtype(),
                    output.dtype()
                ),
            }
            .into());
        }
    }
    stream.record_launch();
    Ok(())
}

fn mismatch(path: &str, params: &ParamBuffers<'_>) -> KernelError {
    KernelError::UnsupportedPrecision {
        dtype: format!("{path} activations with {} parameters", params.gamma.dtype()),
    }
}
