//! Skip-connection + layer-normalization operator for a dynamic-shape
//! inference host.
//!
//! The host drives each instance through the [`DynamicPlugin`] trait:
//! negotiate formats slot by slot, infer the output shape, `configure`,
//! `initialize` (parameters are uploaded to the stream's device), then
//! `enqueue` any number of times. Instances serialize to a compact
//! little-endian image and are rebuilt from it by the matching
//! [`PluginCreator`].
//!
//! Two variants share one implementation:
//!
//! - [`SkipLayerNormPluginDynamic`] (version `"1"`): rows are every position
//!   of the axes before the normalized one.
//! - [`SkipLayerNormVarSeqlenPlugin`] (version `"2"`): tokens are packed along
//!   axis 0 and a third `Int32` input carries cumulative sequence offsets.

pub mod blob;
pub mod creator;
pub mod layout;
pub mod negotiate;
pub mod params;
pub mod plugin;
pub mod shape;

pub use blob::{DecodedBlob, PluginBlob};
pub use creator::{
    FieldSpec, PluginCreator, PluginField, PluginFieldCollection, PluginFieldData,
    SkipLayerNormCreator, SkipLayerNormPluginCreator, SkipLayerNormVarSeqlenPluginCreator,
};
pub use layout::{
    FixedRows, RowAddressing, SKIP_LAYER_NORM_NAME, SKIP_LAYER_NORM_VAR_SEQLEN_VERSION,
    SKIP_LAYER_NORM_VERSION, VarSeqRows,
};
pub use params::{DeviceParams, ParameterStore, WeightRole};
pub use plugin::{
    DynamicPlugin, LifecycleState, Origin, SkipLayerNormPlugin, SkipLayerNormPluginDynamic,
    SkipLayerNormVarSeqlenPlugin,
};
pub use shape::{DimExpr, DimOp, DimsExprs, ExprBuilder, SymbolicExprBuilder};
