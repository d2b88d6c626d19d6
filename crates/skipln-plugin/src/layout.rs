//! Row addressing strategies.
//!
//! The two operator variants differ only in how rows are found in the input
//! tensor and in the extra offsets slot the packed variant carries. Both are
//! expressed as a [`RowAddressing`] implementation so the operator itself is
//! written once.

use crate::creator::FieldSpec;
use skipln_common::{DataType, Result, SkipLnError, TensorDesc, TensorFormat};
use skipln_kernels::RowLayout;

/// Plugin name shared by both variants.
pub const SKIP_LAYER_NORM_NAME: &str = "ForwardSkipLayerNormPluginDynamic";
/// Version of the fixed-layout variant.
pub const SKIP_LAYER_NORM_VERSION: &str = "1";
/// Version of the packed variable-sequence variant.
pub const SKIP_LAYER_NORM_VAR_SEQLEN_VERSION: &str = "2";

/// Activation layout an operator negotiates for `precision`.
pub fn activation_format(precision: DataType) -> TensorFormat {
    if precision == DataType::Int8 { TensorFormat::Chw4 } else { TensorFormat::Linear }
}

/// How an operator variant maps an input descriptor onto rows.
pub trait RowAddressing: Send + Sync + 'static {
    /// Value reported by `plugin_version`.
    const VERSION: &'static str;
    /// Number of input slots, including any auxiliary slot.
    const NB_INPUTS: usize;
    /// Slot carrying the `Int32` cumulative sequence offsets, if any.
    const OFFSETS_SLOT: Option<usize>;
    /// Fields the creator for this variant understands.
    const FIELDS: &'static [FieldSpec];

    /// Check that `input` normalizes over `ld` channels. Non-normalized
    /// extents may still be dynamic.
    fn check_input(ld: usize, input: &TensorDesc) -> Result<()>;

    /// Resolve rows and row stride for a concrete input.
    fn row_layout(ld: usize, input: &TensorDesc, offsets: Option<&[i32]>) -> Result<RowLayout>;
}

/// Index of the normalized axis: the last axis of extent `ld` with only unit
/// extents after it.
fn normalized_axis(ld: usize, input: &TensorDesc) -> Result<usize> {
    let ld = ld as i64;
    for (axis, &extent) in input.dims.iter().enumerate().rev() {
        if extent == ld {
            return Ok(axis);
        }
        if extent != 1 {
            break;
        }
    }
    Err(SkipLnError::UnsupportedFormat {
        reason: format!("input dims {:?} do not end in a normalized axis of {ld}", input.dims),
    })
}

/// Index of the channel axis of a vectorized (`Chw4`/`Chw32`) input.
///
/// Channels are interleaved along axis `rank - 3`, so a row is contiguous only
/// when both trailing spatial extents are 1. Anything else would have the
/// kernel read interleaved lanes as neighbouring channels.
fn interleaved_axis(ld: usize, input: &TensorDesc) -> Result<usize> {
    let dims = &input.dims;
    let reject = |why: &str| SkipLnError::UnsupportedFormat {
        reason: format!("{:?} input {dims:?} {why}", input.format),
    };
    let Some(axis) = dims.len().checked_sub(3) else {
        return Err(reject("needs rank 3 or more"));
    };
    if dims[axis] != ld as i64 {
        return Err(reject(&format!("must carry {ld} channels on axis {axis}")));
    }
    if dims[axis + 1..] != [1i64, 1] {
        return Err(reject("must have unit trailing spatial extents"));
    }
    Ok(axis)
}

/// Axis normalized over, according to the input's layout.
fn channel_axis(ld: usize, input: &TensorDesc) -> Result<usize> {
    if input.format.vector_width() > 1 {
        interleaved_axis(ld, input)
    } else {
        normalized_axis(ld, input)
    }
}

fn padded_layout(ld: usize, rows: usize, format: TensorFormat) -> RowLayout {
    RowLayout::padded(ld, rows, format.vector_width())
}

fn concrete_extent(extent: i64) -> Result<usize> {
    usize::try_from(extent)
        .map_err(|_| SkipLnError::dispatch(format!("dynamic extent {extent} at enqueue")))
}

/// Rows are every position of the leading axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedRows;

impl RowAddressing for FixedRows {
    const VERSION: &'static str = SKIP_LAYER_NORM_VERSION;
    const NB_INPUTS: usize = 2;
    const OFFSETS_SLOT: Option<usize> = None;
    const FIELDS: &'static [FieldSpec] = &[
        FieldSpec::required("type_id", DataType::Int32),
        FieldSpec::optional("ld", DataType::Int32),
        FieldSpec::required("beta", DataType::Float),
        FieldSpec::required("gamma", DataType::Float),
        FieldSpec::optional("bias", DataType::Float),
    ];

    fn check_input(ld: usize, input: &TensorDesc) -> Result<()> {
        channel_axis(ld, input).map(|_| ())
    }

    fn row_layout(ld: usize, input: &TensorDesc, _offsets: Option<&[i32]>) -> Result<RowLayout> {
        let axis = channel_axis(ld, input)?;
        let mut rows = 1usize;
        for &extent in &input.dims[..axis] {
            rows = rows
                .checked_mul(concrete_extent(extent)?)
                .ok_or_else(|| SkipLnError::dispatch("row count overflows usize"))?;
        }
        Ok(padded_layout(ld, rows, input.format))
    }
}

/// Packed tokens along axis 0; an `Int32` table of cumulative sequence
/// offsets rides in the third input slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VarSeqRows;

impl VarSeqRows {
    /// Offsets must start at zero, never decrease, and end inside the packed
    /// token range.
    pub fn validate_offsets(offsets: &[i32], tokens: usize) -> Result<()> {
        let Some(&first) = offsets.first() else {
            return Err(SkipLnError::dispatch("empty sequence offset table"));
        };
        if first != 0 {
            return Err(SkipLnError::dispatch(format!("sequence offsets start at {first}, not 0")));
        }
        if let Some(w) = offsets.windows(2).find(|w| w[1] < w[0]) {
            return Err(SkipLnError::dispatch(format!(
                "sequence offsets decrease from {} to {}",
                w[0], w[1]
            )));
        }
        let last = offsets[offsets.len() - 1];
        if !usize::try_from(last).is_ok_and(|l| l <= tokens) {
            return Err(SkipLnError::dispatch(format!(
                "sequence offsets end at {last}, past {tokens} packed tokens"
            )));
        }
        Ok(())
    }
}

impl RowAddressing for VarSeqRows {
    const VERSION: &'static str = SKIP_LAYER_NORM_VAR_SEQLEN_VERSION;
    const NB_INPUTS: usize = 3;
    const OFFSETS_SLOT: Option<usize> = Some(2);
    const FIELDS: &'static [FieldSpec] = &[
        FieldSpec::required("type_id", DataType::Int32),
        FieldSpec::required("beta", DataType::Float),
        FieldSpec::required("gamma", DataType::Float),
        FieldSpec::optional("bias", DataType::Float),
    ];

    fn check_input(ld: usize, input: &TensorDesc) -> Result<()> {
        match channel_axis(ld, input)? {
            1 => Ok(()),
            axis => Err(SkipLnError::UnsupportedFormat {
                reason: format!(
                    "packed input {:?} must normalize axis 1, found axis {axis}",
                    input.dims
                ),
            }),
        }
    }

    fn row_layout(ld: usize, input: &TensorDesc, offsets: Option<&[i32]>) -> Result<RowLayout> {
        Self::check_input(ld, input)?;
        let tokens = concrete_extent(input.dims[0])?;
        let offsets =
            offsets.ok_or_else(|| SkipLnError::dispatch("missing sequence offset table"))?;
        Self::validate_offsets(offsets, tokens)?;
        Ok(padded_layout(ld, tokens, input.format))
    }
}
