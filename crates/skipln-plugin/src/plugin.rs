//! The skip + layer-norm operator and the host-facing plugin trait.
//!
//! A [`SkipLayerNormPlugin`] is generic over its [`RowAddressing`] strategy;
//! [`SkipLayerNormPluginDynamic`] and [`SkipLayerNormVarSeqlenPlugin`] are the
//! two variants the creators hand out.
//!
//! Lifecycle:
//!
//! ```text
//! Constructed --configure--> Configured --initialize--> Initialized
//!      |                                                  ^     |
//!      +------------------initialize----------------------+  terminate
//!                                                         |     v
//!                                                         +- Terminated
//! ```
//!
//! Device parameters exist exactly while the instance is `Initialized`.

use crate::blob::PluginBlob;
use crate::layout::{
    FixedRows, RowAddressing, SKIP_LAYER_NORM_NAME, VarSeqRows, activation_format,
};
use crate::negotiate;
use crate::params::ParameterStore;
use crate::shape::{self, DimsExprs, ExprBuilder};
use skipln_common::{
    DataType, DispatchStatus, Result, RuntimeConfig, SkipLnError, TensorDesc, TensorMut, TensorRef,
    Weights,
};
use skipln_kernels::{QuantScales, SkipLayerNormArgs, Stream, skip_layer_norm_forward};
use std::marker::PhantomData;

/// Where an instance's parameters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    FromWeights,
    FromBlob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Configured,
    Initialized,
    Terminated,
}

/// Every call the host makes on an operator instance.
pub trait DynamicPlugin: Send + Sync {
    fn plugin_type(&self) -> &'static str;
    fn plugin_version(&self) -> &'static str;
    fn name(&self) -> &str;

    fn nb_outputs(&self) -> usize {
        1
    }

    fn output_data_type(&self, index: usize, input_types: &[DataType]) -> Result<DataType>;

    fn output_dimensions(
        &self,
        output_index: usize,
        inputs: &[DimsExprs],
        builder: &mut dyn ExprBuilder,
    ) -> Result<DimsExprs>;

    fn supports_format_combination(
        &self,
        pos: usize,
        in_out: &[TensorDesc],
        nb_inputs: usize,
        nb_outputs: usize,
    ) -> Result<bool>;

    fn configure(&mut self, inputs: &[TensorDesc], outputs: &[TensorDesc]) -> Result<()>;

    fn workspace_size(&self, _inputs: &[TensorDesc], _outputs: &[TensorDesc]) -> usize {
        0
    }

    fn enqueue(
        &self,
        input_desc: &[TensorDesc],
        output_desc: &[TensorDesc],
        inputs: &[TensorRef<'_>],
        outputs: &mut [TensorMut<'_>],
        workspace: &mut [u8],
        stream: &Stream,
    ) -> DispatchStatus;

    fn initialize(&mut self, stream: &Stream) -> Result<()>;
    fn terminate(&mut self);

    fn serialization_size(&self) -> usize;
    fn serialize(&self, buffer: &mut [u8]) -> Result<usize>;

    fn clone_plugin(&self) -> Box<dyn DynamicPlugin>;

    fn namespace(&self) -> &str;
    fn set_namespace(&mut self, namespace: &str);
}

/// Fused `LayerNorm(input + skip (+ bias)) * gamma + beta`.
#[derive(Debug)]
pub struct SkipLayerNormPlugin<R> {
    name: String,
    namespace: String,
    requested: DataType,
    configured: Option<DataType>,
    params: ParameterStore,
    state: LifecycleState,
    origin: Origin,
    config: RuntimeConfig,
    _rows: PhantomData<fn() -> R>,
}

/// Fixed-layout variant, rows over every leading axis.
pub type SkipLayerNormPluginDynamic = SkipLayerNormPlugin<FixedRows>;
/// Packed variable-sequence variant with a cumulative offsets input.
pub type SkipLayerNormVarSeqlenPlugin = SkipLayerNormPlugin<VarSeqRows>;

/// Copies share host weights, name and namespace and start unconfigured.
impl<R: RowAddressing> Clone for SkipLayerNormPlugin<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            requested: self.requested,
            configured: None,
            params: self.params.clone(),
            state: LifecycleState::Constructed,
            origin: Origin::FromWeights,
            config: self.config.clone(),
            _rows: PhantomData,
        }
    }
}

fn check_precision(precision: DataType) -> Result<()> {
    if precision.is_compute_precision() {
        Ok(())
    } else {
        Err(SkipLnError::UnsupportedFormat {
            reason: format!("operator cannot run in {precision}"),
        })
    }
}

impl<R: RowAddressing> SkipLayerNormPlugin<R> {
    /// Build from weight blobs. `gamma`/`beta`/`bias` must each hold `ld`
    /// values.
    ///
    /// # Errors
    ///
    /// [`SkipLnError::UnsupportedFormat`] for an `Int32` precision;
    /// [`SkipLnError::InvalidWeights`] for malformed blobs.
    pub fn new(
        name: &str,
        precision: DataType,
        ld: usize,
        beta: Weights<'_>,
        gamma: Weights<'_>,
        bias: Option<Weights<'_>>,
    ) -> Result<Self> {
        check_precision(precision)?;
        let params = ParameterStore::from_weights(ld, gamma, beta, bias)?;
        log::debug!(
            "{name}: constructed {} v{} with ld={ld}, precision={precision}, bias={}",
            SKIP_LAYER_NORM_NAME,
            R::VERSION,
            params.has_bias()
        );
        Ok(Self::assemble(name, precision, params, Origin::FromWeights))
    }

    /// Rebuild from an image written by [`DynamicPlugin::serialize`].
    ///
    /// # Errors
    ///
    /// [`SkipLnError::Deserialization`] for any malformed image.
    pub fn deserialize(name: &str, data: &[u8]) -> Result<Self> {
        let decoded = PluginBlob::decode(data)?;
        let params =
            ParameterStore::from_host(decoded.ld, decoded.scale, decoded.shift, decoded.bias);
        log::debug!(
            "{name}: deserialized {} bytes, ld={}, precision={}",
            data.len(),
            decoded.ld,
            decoded.layer_type
        );
        Ok(Self::assemble(name, decoded.layer_type, params, Origin::FromBlob))
    }

    fn assemble(name: &str, precision: DataType, params: ParameterStore, origin: Origin) -> Self {
        Self {
            name: name.to_owned(),
            namespace: String::new(),
            requested: precision,
            configured: None,
            params,
            state: LifecycleState::Constructed,
            origin,
            config: RuntimeConfig::global().clone(),
            _rows: PhantomData,
        }
    }

    /// Replace the runtime configuration snapshot taken at construction.
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn ld(&self) -> usize {
        self.params.ld()
    }

    pub fn has_bias(&self) -> bool {
        self.params.has_bias()
    }

    /// Precision named at construction.
    pub fn requested_precision(&self) -> DataType {
        self.requested
    }

    /// Precision fixed by `configure`, if it has run.
    pub fn configured_precision(&self) -> Option<DataType> {
        self.configured
    }

    /// Precision the operator runs in: configured, else requested.
    pub fn precision(&self) -> DataType {
        self.configured.unwrap_or(self.requested)
    }

    pub fn param_type(&self) -> Option<DataType> {
        self.precision().param_type()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    fn blob(&self) -> PluginBlob<'_> {
        PluginBlob {
            layer_type: self.precision(),
            ld: self.params.ld(),
            shift: self.params.shift(),
            scale: self.params.scale(),
            bias: self.params.bias(),
        }
    }

    fn check_slots(
        &self,
        inputs: usize,
        outputs: usize,
        what: &'static str,
    ) -> Result<()> {
        if inputs != R::NB_INPUTS {
            return Err(SkipLnError::OutOfRange { what, index: inputs, limit: R::NB_INPUTS });
        }
        if outputs != 1 {
            return Err(SkipLnError::OutOfRange { what, index: outputs, limit: 1 });
        }
        Ok(())
    }

    fn try_configure(&mut self, inputs: &[TensorDesc], outputs: &[TensorDesc]) -> Result<()> {
        self.check_slots(inputs.len(), outputs.len(), "configure descriptors")?;
        let input = &inputs[0];
        let precision = input.dtype;
        if precision != self.requested {
            return Err(SkipLnError::UnsupportedFormat {
                reason: format!("input is {precision}, operator was built for {}", self.requested),
            });
        }
        if input.format != activation_format(precision) {
            return Err(SkipLnError::UnsupportedFormat {
                reason: format!("{precision} input in {:?} layout", input.format),
            });
        }
        for (slot, desc) in [(1, &inputs[1]), (R::NB_INPUTS, &outputs[0])] {
            if desc.dtype != input.dtype || desc.format != input.format {
                return Err(SkipLnError::UnsupportedFormat {
                    reason: format!(
                        "slot {slot} is {} {:?}, slot 0 is {} {:?}",
                        desc.dtype, desc.format, input.dtype, input.format
                    ),
                });
            }
        }
        if let Some(slot) = R::OFFSETS_SLOT
            && inputs[slot].dtype != DataType::Int32
        {
            return Err(SkipLnError::UnsupportedFormat {
                reason: format!("sequence offsets must be Int32, got {}", inputs[slot].dtype),
            });
        }
        R::check_input(self.ld(), input)?;

        if let Some(previous) = self.configured
            && previous != precision
        {
            return Err(SkipLnError::Config(format!(
                "precision already fixed to {previous}, cannot reconfigure as {precision}"
            )));
        }
        self.configured = Some(precision);
        if self.state == LifecycleState::Constructed {
            self.state = LifecycleState::Configured;
        }
        Ok(())
    }

    fn try_enqueue(
        &self,
        input_desc: &[TensorDesc],
        output_desc: &[TensorDesc],
        inputs: &[TensorRef<'_>],
        outputs: &mut [TensorMut<'_>],
        stream: &Stream,
    ) -> Result<()> {
        let device = match (self.state, self.params.device()) {
            (LifecycleState::Initialized, Some(device)) => device,
            (state, _) => {
                return Err(SkipLnError::dispatch(format!("enqueue while {state:?}")));
            }
        };
        self.check_slots(input_desc.len(), output_desc.len(), "enqueue descriptors")?;
        self.check_slots(inputs.len(), outputs.len(), "enqueue tensors")?;

        let desc = &input_desc[0];
        if !desc.is_concrete() {
            return Err(SkipLnError::dispatch(format!(
                "dynamic extents {:?} at enqueue",
                desc.dims
            )));
        }
        if desc.volume().is_none() {
            return Err(SkipLnError::dispatch(format!(
                "input extents {:?} hold more elements than fit in memory",
                desc.dims
            )));
        }
        for (slot, other) in [("skip", &input_desc[1]), ("output", &output_desc[0])] {
            if other.dims != desc.dims {
                return Err(SkipLnError::dispatch(format!(
                    "{slot} extents {:?} differ from input extents {:?}",
                    other.dims, desc.dims
                )));
            }
        }
        if desc.dtype != device.precision() {
            return Err(SkipLnError::dispatch(format!(
                "{} activations, parameters initialized for {}",
                desc.dtype,
                device.precision()
            )));
        }
        let offsets = match R::OFFSETS_SLOT.map(|slot| inputs[slot]) {
            None => None,
            Some(TensorRef::I32(offsets)) => Some(offsets),
            Some(other) => {
                return Err(SkipLnError::dispatch(format!(
                    "sequence offsets must be Int32, got {}",
                    other.dtype()
                )));
            }
        };
        let layout = R::row_layout(self.ld(), desc, offsets)?;
        let scales = if desc.dtype == DataType::Int8 {
            Some(QuantScales::from_tensor_scales(
                desc.scale,
                input_desc[1].scale,
                output_desc[0].scale,
            )?)
        } else {
            None
        };

        let args = SkipLayerNormArgs {
            input: inputs[0],
            skip: inputs[1],
            output: outputs[0].reborrow(),
            scales,
        };
        skip_layer_norm_forward(stream, &layout, device.buffers(), args, &self.config)
    }
}

impl<R: RowAddressing> DynamicPlugin for SkipLayerNormPlugin<R> {
    fn plugin_type(&self) -> &'static str {
        SKIP_LAYER_NORM_NAME
    }

    fn plugin_version(&self) -> &'static str {
        R::VERSION
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn output_data_type(&self, index: usize, input_types: &[DataType]) -> Result<DataType> {
        shape::output_data_type(index, input_types)
    }

    fn output_dimensions(
        &self,
        output_index: usize,
        inputs: &[DimsExprs],
        builder: &mut dyn ExprBuilder,
    ) -> Result<DimsExprs> {
        shape::output_dimensions(output_index, inputs, builder)
    }

    fn supports_format_combination(
        &self,
        pos: usize,
        in_out: &[TensorDesc],
        nb_inputs: usize,
        nb_outputs: usize,
    ) -> Result<bool> {
        negotiate::supports_format_combination::<R>(
            self.requested,
            self.ld(),
            pos,
            in_out,
            nb_inputs,
            nb_outputs,
        )
    }

    fn configure(&mut self, inputs: &[TensorDesc], outputs: &[TensorDesc]) -> Result<()> {
        self.try_configure(inputs, outputs).inspect_err(|e| {
            log::warn!("{}: configure rejected: {e}", self.name);
        })?;
        log::debug!("{}: configured as {}", self.name, self.precision());
        Ok(())
    }

    fn enqueue(
        &self,
        input_desc: &[TensorDesc],
        output_desc: &[TensorDesc],
        inputs: &[TensorRef<'_>],
        outputs: &mut [TensorMut<'_>],
        _workspace: &mut [u8],
        stream: &Stream,
    ) -> DispatchStatus {
        let result = self.try_enqueue(input_desc, output_desc, inputs, outputs, stream);
        if let Err(e) = &result {
            log::error!("{}: enqueue failed: {e}", self.name);
        }
        DispatchStatus::from(&result)
    }

    fn initialize(&mut self, stream: &Stream) -> Result<()> {
        if self.configured.is_none() {
            if self.config.strict {
                return Err(SkipLnError::Config(format!(
                    "{}: initialize before configure in strict mode",
                    self.name
                )));
            }
            log::warn!(
                "{}: initialize before configure, using requested precision {}",
                self.name,
                self.requested
            );
        }
        let precision = self.precision();
        self.params.materialize_on_device(precision, stream)?;
        self.state = LifecycleState::Initialized;
        log::info!(
            "{}: initialized for {precision} on {} stream",
            self.name,
            stream.backend_name()
        );
        Ok(())
    }

    fn terminate(&mut self) {
        self.params.release();
        if self.state == LifecycleState::Initialized {
            self.state = LifecycleState::Terminated;
            log::info!("{}: terminated", self.name);
        }
    }

    fn serialization_size(&self) -> usize {
        // Precision is validated at construction, so the blob always encodes.
        self.blob().byte_len().unwrap_or(0)
    }

    fn serialize(&self, buffer: &mut [u8]) -> Result<usize> {
        self.blob().write_to(buffer)
    }

    fn clone_plugin(&self) -> Box<dyn DynamicPlugin> {
        Box::new(self.clone())
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn set_namespace(&mut self, namespace: &str) {
        namespace.clone_into(&mut self.namespace);
    }
}
