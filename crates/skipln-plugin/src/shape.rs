//! Symbolic output shapes.
//!
//! The host describes each input extent as an expression that may only be
//! resolved at execution time. The operator never inspects these beyond
//! copying them: the output has exactly the shape of input 0.

use skipln_common::{DataType, Result, SkipLnError};
use std::fmt;
use std::sync::Arc;

/// Binary operations the host's expression builder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DimOp {
    Sum,
    Prod,
    Max,
}

/// One symbolic extent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimExpr {
    Constant(i64),
    /// Extent bound by the host at execution time.
    Symbol(Arc<str>),
    Op(DimOp, Arc<DimExpr>, Arc<DimExpr>),
}

impl DimExpr {
    pub fn symbol(name: &str) -> Self {
        Self::Symbol(Arc::from(name))
    }

    pub fn as_constant(&self) -> Option<i64> {
        match self {
            Self::Constant(v) => Some(*v),
            _ => None,
        }
    }

    /// Resolve with `bind` supplying each symbol's value.
    pub fn evaluate(&self, bind: &impl Fn(&str) -> Option<i64>) -> Option<i64> {
        match self {
            Self::Constant(v) => Some(*v),
            Self::Symbol(name) => bind(name),
            Self::Op(op, a, b) => {
                let (a, b) = (a.evaluate(bind)?, b.evaluate(bind)?);
                match op {
                    DimOp::Sum => a.checked_add(b),
                    DimOp::Prod => a.checked_mul(b),
                    DimOp::Max => Some(a.max(b)),
                }
            }
        }
    }
}

impl fmt::Display for DimExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant(v) => write!(f, "{v}"),
            Self::Symbol(name) => write!(f, "{name}"),
            Self::Op(op, a, b) => write!(f, "{op:?}({a}, {b})"),
        }
    }
}

/// Symbolic extents of one tensor.
pub type DimsExprs = Vec<DimExpr>;

/// Factory the host supplies for building new extents.
pub trait ExprBuilder {
    fn constant(&mut self, value: i64) -> DimExpr;
    fn operation(&mut self, op: DimOp, a: &DimExpr, b: &DimExpr) -> DimExpr;
}

/// Builder that folds constant operands and leaves the rest symbolic.
#[derive(Debug, Default)]
pub struct SymbolicExprBuilder;

impl ExprBuilder for SymbolicExprBuilder {
    fn constant(&mut self, value: i64) -> DimExpr {
        DimExpr::Constant(value)
    }

    fn operation(&mut self, op: DimOp, a: &DimExpr, b: &DimExpr) -> DimExpr {
        let folded = DimExpr::Op(op, Arc::new(a.clone()), Arc::new(b.clone()));
        match (a.as_constant(), b.as_constant()) {
            (Some(_), Some(_)) => folded.evaluate(&|_| None).map_or(folded, DimExpr::Constant),
            _ => folded,
        }
    }
}

const NO_INPUTS: SkipLnError = SkipLnError::OutOfRange { what: "input", index: 0, limit: 0 };

/// Output extents: those of input 0, unchanged.
///
/// # Errors
///
/// [`SkipLnError::OutOfRange`] for an output index other than 0 or an empty
/// input list.
pub fn output_dimensions(
    output_index: usize,
    inputs: &[DimsExprs],
    _builder: &mut dyn ExprBuilder,
) -> Result<DimsExprs> {
    if output_index != 0 {
        return Err(SkipLnError::OutOfRange { what: "output", index: output_index, limit: 1 });
    }
    inputs.first().cloned().ok_or(NO_INPUTS)
}

/// Output element type: that of input 0.
///
/// # Errors
///
/// [`SkipLnError::OutOfRange`] as for [`output_dimensions`].
pub fn output_data_type(output_index: usize, input_types: &[DataType]) -> Result<DataType> {
    if output_index != 0 {
        return Err(SkipLnError::OutOfRange { what: "output", index: output_index, limit: 1 });
    }
    input_types.first().copied().ok_or(NO_INPUTS)
}
