//! Factories the host registers to build operators by name.

use crate::layout::{FixedRows, RowAddressing, SKIP_LAYER_NORM_NAME, VarSeqRows};
use crate::plugin::{DynamicPlugin, SkipLayerNormPlugin};
use half::f16;
use skipln_common::{DataType, Result, SkipLnError, Weights};
use std::marker::PhantomData;

/// Payload of one creation field.
#[derive(Debug, Clone, PartialEq)]
pub enum PluginFieldData {
    Int32(Vec<i32>),
    Float32(Vec<f32>),
    Float16(Vec<f16>),
    Int8(Vec<i8>),
}

impl PluginFieldData {
    pub fn dtype(&self) -> DataType {
        self.as_weights().dtype()
    }

    pub fn len(&self) -> usize {
        self.as_weights().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_weights(&self) -> Weights<'_> {
        match self {
            Self::Int32(v) => Weights::I32(v),
            Self::Float32(v) => Weights::F32(v),
            Self::Float16(v) => Weights::F16(v),
            Self::Int8(v) => Weights::I8(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginField {
    pub name: String,
    pub data: PluginFieldData,
}

/// Named fields handed to [`PluginCreator::create_plugin`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginFieldCollection {
    pub fields: Vec<PluginField>,
}

impl PluginFieldCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, data: PluginFieldData) -> Self {
        self.fields.push(PluginField { name: name.to_owned(), data });
        self
    }

    /// First field called `name`.
    pub fn get(&self, name: &str) -> Option<&PluginFieldData> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.data)
    }
}

/// Field a creator advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub dtype: DataType,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, dtype: DataType) -> Self {
        Self { name, dtype, required: true }
    }

    pub const fn optional(name: &'static str, dtype: DataType) -> Self {
        Self { name, dtype, required: false }
    }
}

pub trait PluginCreator: Send + Sync {
    fn plugin_name(&self) -> &'static str;
    fn plugin_version(&self) -> &'static str;
    fn field_names(&self) -> &'static [FieldSpec];
    fn create_plugin(
        &self,
        name: &str,
        fields: &PluginFieldCollection,
    ) -> Result<Box<dyn DynamicPlugin>>;
    fn deserialize_plugin(&self, name: &str, data: &[u8]) -> Result<Box<dyn DynamicPlugin>>;
    fn namespace(&self) -> &str;
    fn set_namespace(&mut self, namespace: &str);
}

/// Creator for one [`RowAddressing`] variant.
#[derive(Debug)]
pub struct SkipLayerNormCreator<R> {
    namespace: String,
    _rows: PhantomData<fn() -> R>,
}

pub type SkipLayerNormPluginCreator = SkipLayerNormCreator<FixedRows>;
pub type SkipLayerNormVarSeqlenPluginCreator = SkipLayerNormCreator<VarSeqRows>;

impl<R> Default for SkipLayerNormCreator<R> {
    fn default() -> Self {
        Self { namespace: String::new(), _rows: PhantomData }
    }
}

fn single_i32(fields: &PluginFieldCollection, name: &str) -> Result<Option<i32>> {
    match fields.get(name) {
        None => Ok(None),
        Some(PluginFieldData::Int32(v)) if v.len() == 1 => Ok(Some(v[0])),
        Some(other) => Err(SkipLnError::invalid_weights(format!(
            "field {name} must be a single Int32, got {} x {}",
            other.len(),
            other.dtype()
        ))),
    }
}

fn weights<'a>(fields: &'a PluginFieldCollection, name: &str) -> Result<Weights<'a>> {
    fields
        .get(name)
        .map(PluginFieldData::as_weights)
        .ok_or_else(|| SkipLnError::invalid_weights(format!("missing field {name}")))
}

impl<R: RowAddressing> SkipLayerNormCreator<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a concrete operator from creation fields.
    ///
    /// `ld` defaults to the length of `beta`; when given it must agree. An
    /// `ld` field is ignored by variants that do not list it.
    pub fn create(
        &self,
        name: &str,
        fields: &PluginFieldCollection,
    ) -> Result<SkipLayerNormPlugin<R>> {
        let type_id = single_i32(fields, "type_id")?
            .ok_or_else(|| SkipLnError::invalid_weights("missing field type_id"))?;
        let precision = u32::try_from(type_id)
            .ok()
            .and_then(DataType::from_tag)
            .ok_or_else(|| SkipLnError::invalid_weights(format!("unknown type_id {type_id}")))?;

        let beta = weights(fields, "beta")?;
        let gamma = weights(fields, "gamma")?;
        let bias = fields.get("bias").map(PluginFieldData::as_weights);

        let explicit_ld = if R::FIELDS.iter().any(|f| f.name == "ld") {
            single_i32(fields, "ld")?
        } else {
            if fields.get("ld").is_some() {
                log::debug!("{name}: ignoring ld field, not read by version {}", R::VERSION);
            }
            None
        };
        let ld = match explicit_ld {
            Some(ld) => usize::try_from(ld)
                .map_err(|_| SkipLnError::invalid_weights(format!("negative ld {ld}")))?,
            None => beta.len(),
        };

        log::debug!(
            "creating {name}: type_id={type_id}, ld={ld}, bias={}",
            bias.is_some()
        );
        let mut plugin = SkipLayerNormPlugin::<R>::new(name, precision, ld, beta, gamma, bias)?;
        plugin.set_namespace(&self.namespace);
        Ok(plugin)
    }
}

impl<R: RowAddressing> PluginCreator for SkipLayerNormCreator<R> {
    fn plugin_name(&self) -> &'static str {
        SKIP_LAYER_NORM_NAME
    }

    fn plugin_version(&self) -> &'static str {
        R::VERSION
    }

    fn field_names(&self) -> &'static [FieldSpec] {
        R::FIELDS
    }

    fn create_plugin(
        &self,
        name: &str,
        fields: &PluginFieldCollection,
    ) -> Result<Box<dyn DynamicPlugin>> {
        Ok(Box::new(self.create(name, fields)?))
    }

    fn deserialize_plugin(&self, name: &str, data: &[u8]) -> Result<Box<dyn DynamicPlugin>> {
        let mut plugin = SkipLayerNormPlugin::<R>::deserialize(name, data)?;
        plugin.set_namespace(&self.namespace);
        Ok(Box::new(plugin))
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn set_namespace(&mut self, namespace: &str) {
        namespace.clone_into(&mut self.namespace);
    }
}
