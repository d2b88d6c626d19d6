//! Per-slot format negotiation.
//!
//! The host proposes a descriptor for one slot at a time, with every earlier
//! slot already fixed. Slot 0 decides the precision and layout; every other
//! activation slot must follow it. Every activation slot must also be
//! addressable as rows of `ld` channels in its layout. The var-seq offsets
//! slot is always a linear `Int32` table.

use crate::layout::{RowAddressing, activation_format};
use skipln_common::{DataType, Result, SkipLnError, TensorDesc, TensorFormat};

/// Answer whether `in_out[pos]` is acceptable for an operator requested at
/// `requested` precision over `ld` channels.
///
/// # Errors
///
/// [`SkipLnError::OutOfRange`] when the host's slot counts, the descriptor
/// list length, or `pos` disagree with the variant's signature. A rejected
/// combination is `Ok(false)`.
pub fn supports_format_combination<R: RowAddressing>(
    requested: DataType,
    ld: usize,
    pos: usize,
    in_out: &[TensorDesc],
    nb_inputs: usize,
    nb_outputs: usize,
) -> Result<bool> {
    if nb_inputs != R::NB_INPUTS {
        return Err(SkipLnError::OutOfRange {
            what: "input count",
            index: nb_inputs,
            limit: R::NB_INPUTS,
        });
    }
    if nb_outputs != 1 {
        return Err(SkipLnError::OutOfRange { what: "output count", index: nb_outputs, limit: 1 });
    }
    let total = nb_inputs + nb_outputs;
    if in_out.len() != total {
        return Err(SkipLnError::OutOfRange {
            what: "descriptor list",
            index: in_out.len(),
            limit: total,
        });
    }
    if pos >= total {
        return Err(SkipLnError::OutOfRange { what: "slot", index: pos, limit: total });
    }

    let desc = &in_out[pos];
    if R::OFFSETS_SLOT == Some(pos) {
        return Ok(desc.dtype == DataType::Int32 && desc.format == TensorFormat::Linear);
    }
    if desc.dtype != requested || R::check_input(ld, desc).is_err() {
        return Ok(false);
    }
    if pos == 0 {
        return Ok(desc.format == activation_format(requested));
    }
    let lead = &in_out[0];
    Ok(desc.dtype == lead.dtype && desc.format == lead.format)
}
