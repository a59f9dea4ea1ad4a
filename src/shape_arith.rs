//! Runtime-shape arithmetic as a graph transform.
//!
//! [`shape_minus`] appends `cast(shape(t), int32) - offsets` to a graph. The
//! result is a 1-D int32 shape tensor that other operations (for example a
//! slice) can consume as a size operand. Nothing is evaluated here; axes of
//! `t` that are dynamic stay unknown until the plan is specialized.

use crate::builder::{GraphBuilder, OperandHandle};
use crate::error::GraphError;
use crate::graph::DataType;

pub fn shape_minus(
    builder: &mut GraphBuilder,
    tensor: &OperandHandle,
    offsets: &[i32],
) -> Result<OperandHandle, GraphError> {
    if offsets.len() != tensor.rank() {
        return Err(GraphError::RankMismatch {
            operation: "shape_minus".to_string(),
            expected: tensor.rank(),
            actual: offsets.len(),
        });
    }
    let shape = builder.shape(tensor);
    let shape = builder.cast(&shape, DataType::Int32)?;
    let offsets = builder.constant_i32(offsets);
    builder.sub(&shape, &offsets)
}
