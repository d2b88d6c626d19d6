//! Host-facing tensor descriptions and borrowed tensor views

use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Element type of a tensor slot, tagged with the host's wire numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum DataType {
    Float = 0,
    Half = 1,
    Int8 = 2,
    Int32 = 3,
}

impl DataType {
    /// Byte width of one element.
    pub const fn size(self) -> usize {
        match self {
            Self::Float | Self::Int32 => 4,
            Self::Half => 2,
            Self::Int8 => 1,
        }
    }

    pub const fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(Self::Float),
            1 => Some(Self::Half),
            2 => Some(Self::Int8),
            3 => Some(Self::Int32),
            _ => None,
        }
    }

    /// Whether the operator can run its main path in this precision.
    pub const fn is_compute_precision(self) -> bool {
        matches!(self, Self::Float | Self::Half | Self::Int8)
    }

    /// Storage type for scale/shift/bias when the operator runs in `self`.
    ///
    /// Int8 activations keep their parameters in half precision.
    pub const fn param_type(self) -> Option<DataType> {
        match self {
            Self::Float => Some(Self::Float),
            Self::Half | Self::Int8 => Some(Self::Half),
            Self::Int32 => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float => write!(f, "Float"),
            Self::Half => write!(f, "Half"),
            Self::Int8 => write!(f, "Int8"),
            Self::Int32 => write!(f, "Int32"),
        }
    }
}

/// Memory layout of a tensor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorFormat {
    /// Row-major, densely packed.
    Linear,
    /// Channels interleaved in groups of 4, channel extent padded to a multiple of 4.
    Chw4,
    /// Channels interleaved in groups of 32.
    Chw32,
}

impl TensorFormat {
    /// Number of channels packed per interleaved vector.
    pub const fn vector_width(self) -> usize {
        match self {
            Self::Linear => 1,
            Self::Chw4 => 4,
            Self::Chw32 => 32,
        }
    }
}

/// Description of one input or output slot as seen by the host.
///
/// `dims` may contain `-1` for extents that are still dynamic when the host
/// configures the operator; descriptors handed to `enqueue` must be concrete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dims: Vec<i64>,
    pub dtype: DataType,
    pub format: TensorFormat,
    /// Per-tensor quantization scale (meaningful for `Int8` only).
    pub scale: f32,
}

impl TensorDesc {
    pub fn new(dims: impl Into<Vec<i64>>, dtype: DataType, format: TensorFormat) -> Self {
        Self { dims: dims.into(), dtype, format, scale: 1.0 }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// True when every extent is known.
    pub fn is_concrete(&self) -> bool {
        self.dims.iter().all(|&d| d >= 0)
    }

    /// Number of logical elements, or `None` while any extent is dynamic.
    pub fn volume(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, &d| {
            usize::try_from(d).ok().and_then(|d| acc.checked_mul(d))
        })
    }
}

/// Borrowed, typed view of a tensor or weight buffer.
#[derive(Debug, Clone, Copy)]
pub enum TensorRef<'a> {
    F32(&'a [f32]),
    F16(&'a [f16]),
    I8(&'a [i8]),
    I32(&'a [i32]),
}

/// Weight blobs share the tensor view representation.
pub type Weights<'a> = TensorRef<'a>;

impl TensorRef<'_> {
    pub fn dtype(&self) -> DataType {
        match self {
            Self::F32(_) => DataType::Float,
            Self::F16(_) => DataType::Half,
            Self::I8(_) => DataType::Int8,
            Self::I32(_) => DataType::Int32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(s) => s.len(),
            Self::F16(s) => s.len(),
            Self::I8(s) => s.len(),
            Self::I32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Mutable counterpart of [`TensorRef`] used for outputs.
#[derive(Debug)]
pub enum TensorMut<'a> {
    F32(&'a mut [f32]),
    F16(&'a mut [f16]),
    I8(&'a mut [i8]),
    I32(&'a mut [i32]),
}

impl TensorMut<'_> {
    pub fn dtype(&self) -> DataType {
        match self {
            Self::F32(_) => DataType::Float,
            Self::F16(_) => DataType::Half,
            Self::I8(_) => DataType::Int8,
            Self::I32(_) => DataType::Int32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::F32(s) => s.len(),
            Self::F16(s) => s.len(),
            Self::I8(s) => s.len(),
            Self::I32(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shorter-lived view of the same storage.
    pub fn reborrow(&mut self) -> TensorMut<'_> {
        match self {
            Self::F32(s) => TensorMut::F32(&mut **s),
            Self::F16(s) => TensorMut::F16(&mut **s),
            Self::I8(s) => TensorMut::I8(&mut **s),
            Self::I32(s) => TensorMut::I32(&mut **s),
        }
    }
}
