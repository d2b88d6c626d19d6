//! Host and device copies of the per-channel parameters.
//!
//! The host copy is always `f32` so serialization and cloning never depend on
//! the runtime precision. Device buffers are materialized at the parameter
//! precision derived from the operator precision and live exactly as long as
//! the owning [`DeviceParams`].

use skipln_common::{DataType, Result, SkipLnError, Weights};
use skipln_kernels::{DeviceBuffer, ParamBuffers, Stream};
use std::fmt;

/// Which parameter vector a weight blob fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightRole {
    /// Multiplicative `gamma`.
    Scale,
    /// Additive `beta`.
    Shift,
    /// Added to `input + skip` before normalization.
    Bias,
}

impl fmt::Display for WeightRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scale => write!(f, "gamma"),
            Self::Shift => write!(f, "beta"),
            Self::Bias => write!(f, "bias"),
        }
    }
}

/// Parameter vectors resident on a stream's device, at one precision.
///
/// Dropping the handle releases the buffers.
#[derive(Debug)]
pub struct DeviceParams {
    precision: DataType,
    scale: DeviceBuffer,
    shift: DeviceBuffer,
    bias: Option<DeviceBuffer>,
}

impl DeviceParams {
    /// Operator precision the buffers were materialized for.
    pub fn precision(&self) -> DataType {
        self.precision
    }

    /// Element type of the buffers themselves.
    pub fn param_type(&self) -> DataType {
        self.scale.dtype()
    }

    pub fn scale(&self) -> &DeviceBuffer {
        &self.scale
    }

    pub fn shift(&self) -> &DeviceBuffer {
        &self.shift
    }

    pub fn bias(&self) -> Option<&DeviceBuffer> {
        self.bias.as_ref()
    }

    /// Total device bytes held.
    pub fn byte_len(&self) -> usize {
        self.scale.byte_len()
            + self.shift.byte_len()
            + self.bias.as_ref().map_or(0, DeviceBuffer::byte_len)
    }

    pub fn buffers(&self) -> ParamBuffers<'_> {
        ParamBuffers { gamma: &self.scale, beta: &self.shift, bias: self.bias.as_ref() }
    }
}

impl Drop for DeviceParams {
    fn drop(&mut self) {
        log::debug!("releasing {} device parameter bytes ({})", self.byte_len(), self.precision);
    }
}

/// Host master copy of scale/shift/bias plus their optional device image.
#[derive(Debug)]
pub struct ParameterStore {
    ld: usize,
    scale: Vec<f32>,
    shift: Vec<f32>,
    bias: Option<Vec<f32>>,
    device: Option<DeviceParams>,
}

/// Clones carry the host weights only; the copy starts without device buffers.
impl Clone for ParameterStore {
    fn clone(&self) -> Self {
        Self {
            ld: self.ld,
            scale: self.scale.clone(),
            shift: self.shift.clone(),
            bias: self.bias.clone(),
            device: None,
        }
    }
}

impl ParameterStore {
    /// Build a store from the raw weight blobs.
    ///
    /// # Errors
    ///
    /// [`SkipLnError::InvalidWeights`] when `ld` is zero or any blob has the
    /// wrong element count or an element type that cannot be ingested.
    pub fn from_weights(
        ld: usize,
        scale: Weights<'_>,
        shift: Weights<'_>,
        bias: Option<Weights<'_>>,
    ) -> Result<Self> {
        if ld == 0 {
            return Err(SkipLnError::invalid_weights("ld must be non-zero"));
        }
        let mut store =
            Self { ld, scale: Vec::new(), shift: Vec::new(), bias: None, device: None };
        store.ingest(scale, WeightRole::Scale)?;
        store.ingest(shift, WeightRole::Shift)?;
        if let Some(bias) = bias {
            store.ingest(bias, WeightRole::Bias)?;
        }
        Ok(store)
    }

    /// Rebuild a store from already-decoded host vectors.
    pub(crate) fn from_host(
        ld: usize,
        scale: Vec<f32>,
        shift: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Self {
        Self { ld, scale, shift, bias, device: None }
    }

    /// Deep-copy `raw` into the host vector for `role`, widening to `f32`.
    ///
    /// Replacing a vector invalidates any device image.
    ///
    /// # Errors
    ///
    /// [`SkipLnError::InvalidWeights`] for a count other than `ld` or an
    /// integer blob.
    pub fn ingest(&mut self, raw: Weights<'_>, role: WeightRole) -> Result<()> {
        if raw.len() != self.ld {
            return Err(SkipLnError::invalid_weights(format!(
                "{role} has {} values, expected ld = {}",
                raw.len(),
                self.ld
            )));
        }
        let values: Vec<f32> = match raw {
            Weights::F32(v) => v.to_vec(),
            Weights::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            other => {
                return Err(SkipLnError::invalid_weights(format!(
                    "{role} weights of type {} cannot be ingested",
                    other.dtype()
                )));
            }
        };
        match role {
            WeightRole::Scale => self.scale = values,
            WeightRole::Shift => self.shift = values,
            WeightRole::Bias => self.bias = Some(values),
        }
        self.release();
        Ok(())
    }

    pub fn ld(&self) -> usize {
        self.ld
    }

    pub fn scale(&self) -> &[f32] {
        &self.scale
    }

    pub fn shift(&self) -> &[f32] {
        &self.shift
    }

    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    pub fn has_bias(&self) -> bool {
        self.bias.is_some()
    }

    /// Upload the parameters for an operator running in `precision`.
    ///
    /// Buffers already resident at the same precision are reused; a different
    /// precision replaces them.
    ///
    /// # Errors
    ///
    /// [`SkipLnError::UnsupportedFormat`] when `precision` has no parameter
    /// type; upload failures from the stream.
    pub fn materialize_on_device(
        &mut self,
        precision: DataType,
        stream: &Stream,
    ) -> Result<&DeviceParams> {
        let param_type = precision.param_type().ok_or_else(|| SkipLnError::UnsupportedFormat {
            reason: format!("no parameter storage for {precision} operators"),
        })?;

        if self.device.as_ref().is_some_and(|d| d.precision == precision) {
            log::debug!("parameters already on device as {param_type}");
        } else {
            let bias = match &self.bias {
                Some(b) => Some(stream.upload(b, param_type)?),
                None => None,
            };
            let params = DeviceParams {
                precision,
                scale: stream.upload(&self.scale, param_type)?,
                shift: stream.upload(&self.shift, param_type)?,
                bias,
            };
            log::info!(
                "materialized {} parameter bytes as {param_type} on {} stream",
                params.byte_len(),
                stream.backend_name()
            );
            self.device = Some(params);
        }

        // Populated just above when absent.
        self.device.as_ref().ok_or_else(|| SkipLnError::Config("device parameters missing".into()))
    }

    /// Drop the device image. Safe to call repeatedly.
    pub fn release(&mut self) {
        self.device = None;
    }

    pub fn device(&self) -> Option<&DeviceParams> {
        self.device.as_ref()
    }

    pub fn params_on_device(&self) -> bool {
        self.device.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    fn store() -> ParameterStore {
        ParameterStore::from_weights(
            3,
            Weights::F32(&[1.0, 2.0, 3.0]),
            Weights::F32(&[0.5, 0.25, 0.125]),
            None,
        )
        .unwrap()
    }

    #[test]
    fn wrong_count_is_rejected() {
        let err = ParameterStore::from_weights(
            4,
            Weights::F32(&[1.0, 2.0, 3.0]),
            Weights::F32(&[0.0; 4]),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SkipLnError::InvalidWeights { .. }));
        assert!(err.to_string().contains("gamma has 3 values"));
    }

    #[test]
    fn integer_weights_are_rejected() {
        let mut s = store();
        let err = s.ingest(Weights::I8(&[1, 2, 3]), WeightRole::Bias).unwrap_err();
        assert!(err.to_string().contains("Int8"));
        assert!(!s.has_bias());
    }

    #[test]
    fn zero_ld_is_rejected() {
        let empty = ParameterStore::from_weights(0, Weights::F32(&[]), Weights::F32(&[]), None);
        assert!(empty.is_err());
    }

    #[test]
    fn half_blobs_are_widened() {
        let halves = [f16::from_f32(0.5), f16::from_f32(-1.0)];
        let s = ParameterStore::from_weights(
            2,
            Weights::F16(&halves),
            Weights::F32(&[0.0, 0.0]),
            Some(Weights::F16(&halves)),
        )
        .unwrap();
        assert_eq!(s.scale(), &[0.5, -1.0]);
        assert_eq!(s.bias(), Some(&[0.5f32, -1.0][..]));
    }

    #[test]
    fn materialize_is_idempotent_per_precision() {
        let stream = Stream::host();
        let mut s = store();
        s.materialize_on_device(DataType::Float, &stream).unwrap();
        s.materialize_on_device(DataType::Float, &stream).unwrap();
        assert_eq!(stream.uploads(), 2);
        assert_eq!(s.device().unwrap().param_type(), DataType::Float);

        let d = s.materialize_on_device(DataType::Int8, &stream).unwrap();
        assert_eq!(d.param_type(), DataType::Half);
        assert_eq!(d.byte_len(), 12);
        assert_eq!(stream.uploads(), 4);
    }

    #[test]
    fn release_is_idempotent() {
        let stream = Stream::host();
        let mut s = store();
        s.materialize_on_device(DataType::Half, &stream).unwrap();
        assert!(s.params_on_device());
        s.release();
        s.release();
        assert!(!s.params_on_device());
    }

    #[test]
    fn clone_drops_device_image() {
        let stream = Stream::host();
        let mut s = store();
        s.materialize_on_device(DataType::Float, &stream).unwrap();
        let copy = s.clone();
        assert!(!copy.params_on_device());
        assert_eq!(copy.scale(), s.scale());
    }

    #[test]
    fn int32_operator_has_no_param_type() {
        let err = store().materialize_on_device(DataType::Int32, &Stream::host()).unwrap_err();
        assert!(matches!(err, SkipLnError::UnsupportedFormat { .. }));
    }
}
