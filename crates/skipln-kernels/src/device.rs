//! Execution streams and device-resident parameter buffers.
//!
//! A [`Stream`] orders the work the operator issues. The host stream executes
//! each submission eagerly on the calling thread; with the `cuda` feature a
//! stream may instead wrap a CUDA context, in which case kernels are launched
//! through [`crate::cuda`].
//!
//! [`DeviceBuffer`] is the element-typed allocation a parameter vector is
//! uploaded into. Values are converted from the host's `f32` staging copy to
//! the requested width at upload time. On a CUDA stream the buffer also owns
//! a device-resident `f32` image, widened once at upload, which every launch
//! reads without another host-to-device copy.

use half::f16;
use skipln_common::{DataType, KernelError, Result};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "cuda")]
use cudarc::driver::CudaSlice;

#[derive(Debug, Clone, PartialEq)]
enum HostImage {
    F32(Vec<f32>),
    F16(Vec<f16>),
}

impl HostImage {
    #[cfg(feature = "cuda")]
    fn widened(&self) -> Vec<f32> {
        match self {
            Self::F32(v) => v.clone(),
            Self::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }
}

/// Parameter vector resident on a stream's device.
pub struct DeviceBuffer {
    image: HostImage,
    #[cfg(feature = "cuda")]
    cuda: Option<CudaSlice<f32>>,
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("DeviceBuffer");
        d.field("dtype", &self.dtype()).field("len", &self.len());
        #[cfg(feature = "cuda")]
        {
            d.field("cuda", &self.cuda.is_some());
        }
        d.finish()
    }
}

impl DeviceBuffer {
    pub fn dtype(&self) -> DataType {
        match self.image {
            HostImage::F32(_) => DataType::Float,
            HostImage::F16(_) => DataType::Half,
        }
    }

    pub fn len(&self) -> usize {
        match &self.image {
            HostImage::F32(v) => v.len(),
            HostImage::F16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_len(&self) -> usize {
        self.len() * self.dtype().size()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.image {
            HostImage::F32(v) => Some(v),
            HostImage::F16(_) => None,
        }
    }

    pub fn as_f16(&self) -> Option<&[f16]> {
        match &self.image {
            HostImage::F16(v) => Some(v),
            HostImage::F32(_) => None,
        }
    }

    /// Device image uploaded through a CUDA stream, if any.
    #[cfg(feature = "cuda")]
    pub fn cuda_slice(&self) -> Option<&CudaSlice<f32>> {
        self.cuda.as_ref()
    }

    /// Little-endian image of the buffer contents.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match &self.image {
            HostImage::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            HostImage::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

enum StreamBackend {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(Arc<crate::cuda::CudaSkipLayerNorm>),
}

struct StreamInner {
    backend: StreamBackend,
    launches: AtomicU64,
    uploads: AtomicU64,
}

/// Handle to an ordered queue of device work. Cheap to clone.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("backend", &self.backend_name())
            .field("launches", &self.launches())
            .field("uploads", &self.uploads())
            .finish()
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self::host()
    }
}

impl Stream {
    /// Stream that runs every submission on the calling thread.
    pub fn host() -> Self {
        Self::with_backend(StreamBackend::Host)
    }

    /// Stream bound to a CUDA device.
    #[cfg(feature = "cuda")]
    pub fn cuda(device_id: usize) -> Result<Self> {
        let kernels = crate::cuda::CudaSkipLayerNorm::new(device_id)?;
        Ok(Self::with_backend(StreamBackend::Cuda(Arc::new(kernels))))
    }

    fn with_backend(backend: StreamBackend) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                backend,
                launches: AtomicU64::new(0),
                uploads: AtomicU64::new(0),
            }),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.inner.backend {
            StreamBackend::Host => "host",
            #[cfg(feature = "cuda")]
            StreamBackend::Cuda(_) => "cuda",
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn cuda_kernels(&self) -> Option<&crate::cuda::CudaSkipLayerNorm> {
        match &self.inner.backend {
            StreamBackend::Cuda(k) => Some(k),
            StreamBackend::Host => None,
        }
    }

    /// Kernel launches issued on this stream so far.
    pub fn launches(&self) -> u64 {
        self.inner.launches.load(Ordering::Relaxed)
    }

    /// Host-to-device parameter uploads issued on this stream so far.
    pub fn uploads(&self) -> u64 {
        self.inner.uploads.load(Ordering::Relaxed)
    }

    pub(crate) fn record_launch(&self) {
        self.inner.launches.fetch_add(1, Ordering::Relaxed);
    }

    /// Convert `values` to `dtype` and place them in a new device buffer.
    ///
    /// # Errors
    ///
    /// Only `Float` and `Half` parameter buffers exist; a CUDA stream also
    /// reports copy failures.
    pub fn upload(&self, values: &[f32], dtype: DataType) -> Result<DeviceBuffer> {
        let image = match dtype {
            DataType::Float => HostImage::F32(values.to_vec()),
            DataType::Half => HostImage::F16(values.iter().copied().map(f16::from_f32).collect()),
            other => {
                return Err(KernelError::UnsupportedPrecision { dtype: other.to_string() }.into());
            }
        };
        #[cfg(feature = "cuda")]
        let cuda = match &self.inner.backend {
            StreamBackend::Cuda(k) => {
                log::debug!("copying {} parameters to CUDA device {}", values.len(), k.device_id());
                Some(k.to_device(&image.widened())?)
            }
            StreamBackend::Host => None,
        };
        self.inner.uploads.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "upload on {} stream: {} elements as {}",
            self.backend_name(),
            values.len(),
            dtype
        );
        Ok(DeviceBuffer {
            image,
            #[cfg(feature = "cuda")]
            cuda,
        })
    }

    /// Wait for all submitted work. Host submissions complete eagerly.
    pub fn synchronize(&self) -> Result<()> {
        match &self.inner.backend {
            StreamBackend::Host => Ok(()),
            #[cfg(feature = "cuda")]
            StreamBackend::Cuda(k) => k.synchronize(),
        }
    }
}
