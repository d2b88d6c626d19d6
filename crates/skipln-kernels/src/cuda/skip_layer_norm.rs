//! Fused skip + layer-norm CUDA kernels.
//!
//! One thread-block per row. Each block makes three passes over its row
//! (sum, centred sum of squares, normalise) and recomputes
//! `input + skip (+ bias)` in every pass instead of staging it. Block-wide
//! sums use a warp shuffle followed by a shared-memory pass over the warp
//! partials, so the block size must be a multiple of the warp size.
//!
//! Parameters arrive as device-resident `f32` slices uploaded once by
//! [`crate::Stream::upload`]. The int8 kernel's half-precision parameters are
//! widened at that upload; the widening is exact.

use crate::cpu::{QuantScales, RowLayout};
use cudarc::driver::{
    CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchConfig, PushKernelArg,
};
use cudarc::nvrtc::compile_ptx;
use skipln_common::{KernelError, Result, SKIP_LAYER_NORM_EPSILON};
use std::sync::Arc;

pub const SKIP_LAYER_NORM_KERNEL_SRC: &str = r#"
extern "C" {

__device__ float block_reduce_sum(float v, float* shared) {
    const int lane = threadIdx.x & 31;
    const int warp = threadIdx.x >> 5;
    for (int o = 16; o > 0; o >>= 1) {
        v += __shfl_down_sync(0xFFFFFFFF, v, o);
    }
    if (lane == 0) {
        shared[warp] = v;
    }
    __syncthreads();
    const int nwarps = (blockDim.x + 31) >> 5;
    if (warp == 0) {
        v = (lane < nwarps) ? shared[lane] : 0.0f;
        for (int o = 16; o > 0; o >>= 1) {
            v += __shfl_down_sync(0xFFFFFFFF, v, o);
        }
        if (lane == 0) {
            shared[32] = v;
        }
    }
    __syncthreads();
    const float total = shared[32];
    __syncthreads();
    return total;
}

__global__ void skip_layer_norm_f32(
    const float* __restrict__ input,
    const float* __restrict__ skip,
    const float* __restrict__ gamma,
    const float* __restrict__ beta,
    const float* __restrict__ bias,
    float* __restrict__ output,
    int ld,
    int row_stride,
    int has_bias,
    float eps
) {
    __shared__ float shared[33];
    const size_t base = (size_t)blockIdx.x * row_stride;
    const float* in = input + base;
    const float* sk = skip + base;
    float* out = output + base;

    float sum = 0.0f;
    for (int i = threadIdx.x; i < ld; i += blockDim.x) {
        sum += in[i] + sk[i] + (has_bias ? bias[i] : 0.0f);
    }
    const float mean = block_reduce_sum(sum, shared) / (float)ld;

    float sq = 0.0f;
    for (int i = threadIdx.x; i < ld; i += blockDim.x) {
        const float d = in[i] + sk[i] + (has_bias ? bias[i] : 0.0f) - mean;
        sq += d * d;
    }
    const float inv_std = rsqrtf(block_reduce_sum(sq, shared) / (float)ld + eps);

    for (int i = threadIdx.x; i < ld; i += blockDim.x) {
        const float c = in[i] + sk[i] + (has_bias ? bias[i] : 0.0f);
        out[i] = (c - mean) * inv_std * gamma[i] + beta[i];
    }
}

__global__ void skip_layer_norm_dqq(
    const signed char* __restrict__ input,
    const signed char* __restrict__ skip,
    const float* __restrict__ gamma,
    const float* __restrict__ beta,
    const float* __restrict__ bias,
    signed char* __restrict__ output,
    int ld,
    int row_stride,
    int has_bias,
    float dq_input,
    float dq_skip,
    float q_output,
    float eps
) {
    __shared__ float shared[33];
    const size_t base = (size_t)blockIdx.x * row_stride;
    const signed char* in = input + base;
    const signed char* sk = skip + base;
    signed char* out = output + base;

    float sum = 0.0f;
    for (int i = threadIdx.x; i < ld; i += blockDim.x) {
        sum += in[i] * dq_input + sk[i] * dq_skip + (has_bias ? bias[i] : 0.0f);
    }
    const float mean = block_reduce_sum(sum, shared) / (float)ld;

    float sq = 0.0f;
    for (int i = threadIdx.x; i < ld; i += blockDim.x) {
        const float d = in[i] * dq_input + sk[i] * dq_skip + (has_bias ? bias[i] : 0.0f) - mean;
        sq += d * d;
    }
    const float inv_std = rsqrtf(block_reduce_sum(sq, shared) / (float)ld + eps);

    for (int i = threadIdx.x; i < row_stride; i += blockDim.x) {
        if (i < ld) {
            const float c = in[i] * dq_input + sk[i] * dq_skip + (has_bias ? bias[i] : 0.0f);
            const float y = ((c - mean) * inv_std * gamma[i] + beta[i]) * q_output;
            const int q = __float2int_rn(y);
            out[i] = (signed char)max(-128, min(127, q));
        } else {
            out[i] = 0;
        }
    }
}

} // extern "C"
"#;

/// Compiled skip + layer-norm kernels bound to one device.
pub struct CudaSkipLayerNorm {
    device_id: usize,
    _ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    _module: Arc<CudaModule>,
    f32_fn: CudaFunction,
    dqq_fn: CudaFunction,
}

/// Per-channel parameters already resident on the device.
#[derive(Debug, Clone, Copy)]
pub struct CudaParams<'a> {
    pub gamma: &'a CudaSlice<f32>,
    pub beta: &'a CudaSlice<f32>,
    pub bias: Option<&'a CudaSlice<f32>>,
}

impl CudaParams<'_> {
    fn validate(&self, ld: usize) -> Result<()> {
        let lens = [
            ("gamma", self.gamma.len()),
            ("beta", self.beta.len()),
            ("bias", self.bias.map_or(ld, CudaSlice::len)),
        ];
        for (name, len) in lens {
            if len != ld {
                return Err(KernelError::InvalidArguments {
                    reason: format!("device {name} length {len} != ld {ld}"),
                }
                .into());
            }
        }
        Ok(())
    }
}

fn gpu_err(what: &str, e: impl std::fmt::Debug) -> KernelError {
    KernelError::GpuError { reason: format!("{what}: {e:?}") }
}

/// Threads per block: enough warps to cover `ld`, capped at 1024.
pub fn block_dim(ld: usize) -> u32 {
    (ld.div_ceil(32) * 32).clamp(32, 1024) as u32
}

fn launch_dims(layout: &RowLayout) -> Result<(LaunchConfig, i32, i32)> {
    let too_large = |what: &str| KernelError::InvalidArguments {
        reason: format!("{what} exceeds the CUDA launch limits"),
    };
    let rows = u32::try_from(layout.rows).map_err(|_| too_large("row count"))?;
    let ld = i32::try_from(layout.ld).map_err(|_| too_large("ld"))?;
    let stride = i32::try_from(layout.row_stride).map_err(|_| too_large("row stride"))?;
    let config = LaunchConfig {
        grid_dim: (rows, 1, 1),
        block_dim: (block_dim(layout.ld), 1, 1),
        shared_mem_bytes: 0,
    };
    Ok((config, ld, stride))
}

impl CudaSkipLayerNorm {
    pub fn new(device_id: usize) -> Result<Self> {
        log::info!("Compiling skip_layer_norm kernels for CUDA device {device_id}");
        let ctx = CudaContext::new(device_id)
            .map_err(|e| gpu_err(&format!("Failed to create CUDA context {device_id}"), e))?;
        let stream = ctx.default_stream();
        let ptx = compile_ptx(SKIP_LAYER_NORM_KERNEL_SRC)
            .map_err(|e| gpu_err("Failed to compile PTX", e))?;
        let module = ctx.load_module(ptx).map_err(|e| gpu_err("Failed to load module", e))?;
        let f32_fn = module
            .load_function("skip_layer_norm_f32")
            .map_err(|e| gpu_err("Failed to load skip_layer_norm_f32", e))?;
        let dqq_fn = module
            .load_function("skip_layer_norm_dqq")
            .map_err(|e| gpu_err("Failed to load skip_layer_norm_dqq", e))?;
        Ok(Self { device_id, _ctx: ctx, stream, _module: module, f32_fn, dqq_fn })
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize().map_err(|e| gpu_err("Stream synchronize failed", e))?;
        Ok(())
    }

    pub(crate) fn to_device<T: cudarc::driver::DeviceRepr>(
        &self,
        data: &[T],
    ) -> Result<CudaSlice<T>> {
        Ok(self.stream.memcpy_stod(data).map_err(|e| gpu_err("Host-to-device copy failed", e))?)
    }

    pub fn launch_f32(
        &self,
        layout: &RowLayout,
        input: &[f32],
        skip: &[f32],
        params: &CudaParams<'_>,
        output: &mut [f32],
    ) -> Result<()> {
        let need = layout.validate(input.len(), skip.len(), output.len())?;
        params.validate(layout.ld)?;
        if layout.rows == 0 {
            return Ok(());
        }
        let (config, ld, stride) = launch_dims(layout)?;

        let input_dev = self.to_device(&input[..need])?;
        let skip_dev = self.to_device(&skip[..need])?;
        let mut out_dev: CudaSlice<f32> = self
            .stream
            .alloc_zeros(need)
            .map_err(|e| gpu_err("Failed to allocate output", e))?;

        let has_bias = i32::from(params.bias.is_some());
        let bias = params.bias.unwrap_or(params.beta);
        let eps = SKIP_LAYER_NORM_EPSILON;

        let mut builder = self.stream.launch_builder(&self.f32_fn);
        builder.arg(&input_dev);
        builder.arg(&skip_dev);
        builder.arg(params.gamma);
        builder.arg(params.beta);
        builder.arg(bias);
        builder.arg(&mut out_dev);
        builder.arg(&ld);
        builder.arg(&stride);
        builder.arg(&has_bias);
        builder.arg(&eps);
        unsafe { builder.launch(config) }
            .map_err(|e| gpu_err("Failed to launch skip_layer_norm_f32", e))?;

        let host: Vec<f32> = self
            .stream
            .memcpy_dtov(&out_dev)
            .map_err(|e| gpu_err("Device-to-host copy failed", e))?;
        output[..need].copy_from_slice(&host);
        Ok(())
    }

    pub fn launch_i8(
        &self,
        layout: &RowLayout,
        input: &[i8],
        skip: &[i8],
        params: &CudaParams<'_>,
        output: &mut [i8],
        scales: QuantScales,
    ) -> Result<()> {
        let need = layout.validate(input.len(), skip.len(), output.len())?;
        params.validate(layout.ld)?;
        if layout.rows == 0 {
            return Ok(());
        }
        let (config, ld, stride) = launch_dims(layout)?;

        let input_dev = self.to_device(&input[..need])?;
        let skip_dev = self.to_device(&skip[..need])?;
        let mut out_dev: CudaSlice<i8> = self
            .stream
            .alloc_zeros(need)
            .map_err(|e| gpu_err("Failed to allocate output", e))?;

        let has_bias = i32::from(params.bias.is_some());
        let bias = params.bias.unwrap_or(params.beta);
        let eps = SKIP_LAYER_NORM_EPSILON;

        let mut builder = self.stream.launch_builder(&self.dqq_fn);
        builder.arg(&input_dev);
        builder.arg(&skip_dev);
        builder.arg(params.gamma);
        builder.arg(params.beta);
        builder.arg(bias);
        builder.arg(&mut out_dev);
        builder.arg(&ld);
        builder.arg(&stride);
        builder.arg(&has_bias);
        builder.arg(&scales.dq_input);
        builder.arg(&scales.dq_skip);
        builder.arg(&scales.q_output);
        builder.arg(&eps);
        unsafe { builder.launch(config) }
            .map_err(|e| gpu_err("Failed to launch skip_layer_norm_dqq", e))?;

        let host: Vec<i8> = self
            .stream
            .memcpy_dtov(&out_dev)
            .map_err(|e| gpu_err("Device-to-host copy failed", e))?;
        output[..need].copy_from_slice(&host);
        Ok(())
    }
}
