/// Shape inference and shape-tensor folding for the supported operations
use crate::error::GraphError;
use crate::graph::{DataType, Dim};

/// Per-element values of a 1-D integer shape tensor. `None` marks an element
/// that depends on a dynamic axis and is only known after specialization.
pub type KnownValues = Vec<Option<i64>>;

/// Compute the broadcasted shape for two operands following NumPy broadcasting rules
///
/// A dynamic axis broadcast against a fixed extent other than 1 takes that
/// extent; the runtime re-checks it once the dynamic axis is known.
pub fn broadcast_shapes(shape_a: &[Dim], shape_b: &[Dim]) -> Result<Vec<Dim>, GraphError> {
    let max_rank = shape_a.len().max(shape_b.len());
    let mut result = Vec::with_capacity(max_rank);

    for i in 0..max_rank {
        let dim_a = if i < shape_a.len() {
            shape_a[shape_a.len() - 1 - i]
        } else {
            Dim::Fixed(1)
        };
        let dim_b = if i < shape_b.len() {
            shape_b[shape_b.len() - 1 - i]
        } else {
            Dim::Fixed(1)
        };

        let dim = match (dim_a, dim_b) {
            (Dim::Fixed(a), Dim::Fixed(b)) if a == b || a == 1 || b == 1 => Dim::Fixed(a.max(b)),
            (Dim::Fixed(a), Dim::Fixed(b)) => {
                return Err(GraphError::ShapeInferenceFailed {
                    reason: format!(
                        "Incompatible shapes for broadcasting: {:?} and {:?} (dimension {} incompatible: {} vs {})",
                        shape_a, shape_b, i, a, b
                    ),
                });
            }
            (Dim::Fixed(1), other) | (other, Dim::Fixed(1)) => other,
            (Dim::Dynamic, Dim::Dynamic) => Dim::Dynamic,
            (Dim::Fixed(n), Dim::Dynamic) | (Dim::Dynamic, Dim::Fixed(n)) => Dim::Fixed(n),
        };
        result.push(dim);
    }

    result.reverse();
    Ok(result)
}

/// Values produced by a shape-of operation on a tensor of the given shape.
pub fn shape_of_values(shape: &[Dim]) -> KnownValues {
    shape.iter().map(|dim| dim.fixed().map(i64::from)).collect()
}

/// Convert shape values to `to`, failing when a known value does not fit.
pub fn cast_values(values: &[Option<i64>], to: DataType) -> Result<KnownValues, GraphError> {
    if !to.is_integer() {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!("shape tensors can only be cast to integer types, got {:?}", to),
        });
    }
    for value in values.iter().flatten() {
        if to == DataType::Int32 && i32::try_from(*value).is_err() {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!("shape value {} does not fit in int32", value),
            });
        }
    }
    Ok(values.to_vec())
}

/// Element-wise `a - b` on shape values, broadcasting length-1 operands.
pub fn sub_values(a: &[Option<i64>], b: &[Option<i64>]) -> Result<KnownValues, GraphError> {
    let len = match (a.len(), b.len()) {
        (x, y) if x == y => x,
        (1, y) => y,
        (x, 1) => x,
        (x, y) => {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!("cannot subtract shape vectors of length {} and {}", x, y),
            });
        }
    };
    let pick = |values: &[Option<i64>], idx: usize| {
        if values.len() == 1 {
            values[0]
        } else {
            values[idx]
        }
    };
    (0..len)
        .map(|idx| match (pick(a, idx), pick(b, idx)) {
            (Some(x), Some(y)) => x.checked_sub(y).map(Some).ok_or_else(|| {
                GraphError::ShapeInferenceFailed {
                    reason: format!("shape subtraction {} - {} overflows", x, y),
                }
            }),
            _ => Ok(None),
        })
        .collect()
}

/// Output extent of one sliced axis.
///
/// `size` is the number of output elements along the axis; the last element
/// read is `start + (size - 1) * stride`, which must stay inside the input.
pub fn slice_axis_extent(
    axis: usize,
    input: Option<u32>,
    start: u32,
    size: Option<i64>,
    stride: u32,
) -> Result<Dim, GraphError> {
    if stride == 0 {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!("Slice stride for dimension {} must be positive", axis),
        });
    }
    if let Some(input_dim) = input
        && start >= input_dim
    {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "Slice start {} for dimension {} exceeds input dimension size {}",
                start, axis, input_dim
            ),
        });
    }
    let Some(size) = size else {
        return Ok(Dim::Dynamic);
    };
    if size <= 0 || size > u32::MAX as i64 {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "Slice size {} for dimension {} must be a positive extent",
                size, axis
            ),
        });
    }
    if let Some(input_dim) = input {
        let last = start as u64 + (size as u64 - 1) * stride as u64;
        if last >= input_dim as u64 {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!(
                    "Slice end {} (start {} + size {} x stride {}) for dimension {} exceeds input dimension size {}",
                    last + 1,
                    start,
                    size,
                    stride,
                    axis,
                    input_dim
                ),
            });
        }
    }
    Ok(Dim::Fixed(size as u32))
}

/// Infer output shape for a strided slice whose sizes may only be partly known
pub fn infer_slice_shape(
    input_shape: &[Dim],
    starts: &[u32],
    sizes: &[Option<i64>],
    strides: &[u32],
) -> Result<Vec<Dim>, GraphError> {
    let rank = input_shape.len();
    for (label, len) in [
        ("starts", starts.len()),
        ("sizes", sizes.len()),
        ("strides", strides.len()),
    ] {
        if len != rank {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!(
                    "Slice {} length {} must match input rank {}, input shape: {:?}",
                    label, len, rank, input_shape
                ),
            });
        }
    }

    (0..rank)
        .map(|axis| {
            slice_axis_extent(
                axis,
                input_shape[axis].fixed(),
                starts[axis],
                sizes[axis],
                strides[axis],
            )
        })
        .collect()
}
