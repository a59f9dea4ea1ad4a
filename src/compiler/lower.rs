use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;

use super::TargetProperties;
use super::program::{AxisRange, Node, Precision, Program, SizeSource, SlotKind, TensorSlot};
use crate::error::GraphError;
use crate::graph::{DataType, GraphInfo, OperandKind, Operation};
use crate::profile::OptimizationProfile;
use crate::tensor::TensorIoMode;

/// Lower a validated graph into a [`Program`] for `target`.
///
/// Slots mirror the operand table one-to-one. `max_dims` is left empty; the
/// compiler fills it once the envelope has been evaluated.
pub(crate) fn lower(
    graph: &GraphInfo,
    target: &TargetProperties,
    profile: &OptimizationProfile,
    precision: Precision,
) -> Result<Program, GraphError> {
    if precision == Precision::Fp16 && !target.supports_fp16 {
        return Err(GraphError::LoweringFailed {
            target: target.name.clone(),
            reason: "reduced precision is not available on this target".to_string(),
        });
    }

    let mut shape_slots = HashSet::new();
    let mut tensors = Vec::with_capacity(graph.operands.len());
    let mut nodes = Vec::with_capacity(graph.operations.len());

    for (idx, operand) in graph.operands.iter().enumerate() {
        let id = idx as u32;
        let io_mode = if graph.input_operands.contains(&id) {
            TensorIoMode::Input
        } else if graph.output_operands.contains(&id) {
            TensorIoMode::Output
        } else {
            TensorIoMode::None
        };
        let is_shape = match operand.kind {
            OperandKind::Constant => {
                let handle = graph
                    .constant_operand_ids_to_handles
                    .get(&id)
                    .ok_or(GraphError::MissingConstantData { operand: id })?;
                let values = handle.to_i64(operand.descriptor.data_type).ok_or_else(|| {
                    GraphError::LoweringFailed {
                        target: target.name.clone(),
                        reason: format!(
                            "constant operand {} of type {:?} cannot be embedded; only integer extents are supported",
                            id, operand.descriptor.data_type
                        ),
                    }
                })?;
                nodes.push(Node::Constant { dst: id, values });
                true
            }
            _ => graph
                .producer(id)
                .is_some_and(|op| matches!(op.op_type.as_str(), "shape" | "cast" | "sub")),
        };
        if is_shape {
            shape_slots.insert(id);
        }
        tensors.push(TensorSlot {
            name: operand.name.clone().unwrap_or_else(|| format!("%{}", id)),
            data_type: operand.descriptor.data_type,
            dims: operand.descriptor.shape.clone(),
            max_dims: Vec::new(),
            io_mode,
            kind: if is_shape { SlotKind::Shape } else { SlotKind::Data },
        });
    }

    for operation in &graph.operations {
        if !target.supported_ops.contains(operation.op_type.as_str()) {
            return Err(GraphError::UnsupportedOperation {
                operation: operation.op_type.clone(),
                target: target.name.clone(),
            });
        }
        let node = lower_operation(graph, target, &shape_slots, operation)?;
        debug!(op = node.op_name(), output = operation.output_operand, "lowered operation");
        nodes.push(node);
    }

    let mut ranges = Vec::new();
    for (tensor, axis, range) in profile.iter() {
        let (slot, _) = graph
            .input_named(tensor)
            .ok_or_else(|| GraphError::UnexpectedShapeRange {
                tensor: tensor.to_string(),
                axis,
            })?;
        ranges.push(AxisRange {
            slot,
            axis: axis as u32,
            range,
        });
    }

    Ok(Program {
        target: target.name.clone(),
        precision,
        tensors,
        nodes,
        ranges,
    })
}

fn lower_operation(
    graph: &GraphInfo,
    target: &TargetProperties,
    shape_slots: &HashSet<u32>,
    operation: &Operation,
) -> Result<Node, GraphError> {
    let op_name = operation.display_name();
    let dst = operation.output_operand;
    let expect_inputs = |count: &[usize]| {
        if count.contains(&operation.input_operands.len()) {
            Ok(())
        } else {
            Err(GraphError::InvalidAttribute {
                operation: op_name.clone(),
                reason: format!(
                    "expected {:?} input operands, got {}",
                    count,
                    operation.input_operands.len()
                ),
            })
        }
    };
    let expect_shape = |slot: u32| {
        if shape_slots.contains(&slot) {
            Ok(slot)
        } else {
            Err(GraphError::InvalidAttribute {
                operation: op_name.clone(),
                reason: format!("operand {} is not an integer shape tensor", slot),
            })
        }
    };

    match operation.op_type.as_str() {
        "shape" => {
            expect_inputs(&[1])?;
            Ok(Node::ShapeOf {
                src: operation.input_operands[0],
                dst,
            })
        }
        "cast" => {
            expect_inputs(&[1])?;
            let to = operation
                .attributes
                .get("to")
                .and_then(Value::as_str)
                .and_then(DataType::parse)
                .filter(|data_type| data_type.is_integer())
                .ok_or_else(|| GraphError::InvalidAttribute {
                    operation: op_name.clone(),
                    reason: "`to` must name an integer data type".to_string(),
                })?;
            Ok(Node::Cast {
                src: expect_shape(operation.input_operands[0])?,
                dst,
                to,
            })
        }
        "sub" => {
            expect_inputs(&[2])?;
            Ok(Node::Sub {
                lhs: expect_shape(operation.input_operands[0])?,
                rhs: expect_shape(operation.input_operands[1])?,
                dst,
            })
        }
        "slice" => {
            expect_inputs(&[1, 2])?;
            let src = operation.input_operands[0];
            let data_type = graph
                .operand(src)
                .map(|operand| operand.descriptor.data_type)
                .ok_or(GraphError::InvalidOperandReference {
                    operation: op_name.clone(),
                    operand: src,
                })?;
            if data_type != DataType::Float32 || shape_slots.contains(&src) {
                return Err(GraphError::LoweringFailed {
                    target: target.name.clone(),
                    reason: format!(
                        "slice kernels move float32 data only, operand {} is {:?}",
                        src, data_type
                    ),
                });
            }
            let sizes = match operation.input_operands.get(1) {
                Some(&slot) => SizeSource::Slot(expect_shape(slot)?),
                None => SizeSource::Literal(u32_list(operation, "sizes")?),
            };
            Ok(Node::Slice {
                src,
                dst,
                starts: u32_list(operation, "starts")?,
                strides: u32_list(operation, "strides")?,
                sizes,
            })
        }
        other => Err(GraphError::UnsupportedOperation {
            operation: other.to_string(),
            target: target.name.clone(),
        }),
    }
}

fn u32_list(operation: &Operation, key: &str) -> Result<Vec<u32>, GraphError> {
    let invalid = || GraphError::InvalidAttribute {
        operation: operation.display_name(),
        reason: format!("`{}` must be a list of non-negative 32-bit integers", key),
    };
    operation
        .attributes
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(invalid)?
        .iter()
        .map(|value| {
            value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(invalid)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DimRange, negotiate};
    use crate::topology::{RegionSpec, define_region_graph};

    fn region() -> (GraphInfo, OptimizationProfile) {
        let graph = define_region_graph(&RegionSpec::default()).unwrap();
        let profile = negotiate(&graph, DimRange::default()).unwrap();
        (graph, profile)
    }

    #[test]
    fn lowers_region_graph_in_order() {
        let (graph, profile) = region();
        let program = lower(&graph, &TargetProperties::default(), &profile, Precision::Fp32).unwrap();
        let names: Vec<_> = program.nodes.iter().map(Node::op_name).collect();
        assert_eq!(names, vec!["constant", "shape", "cast", "sub", "slice"]);
        assert_eq!(program.tensors.len(), graph.operands.len());
        assert_eq!(program.ranges.len(), 1);

        let (_, input) = program.slot("input").unwrap();
        assert_eq!(input.io_mode, TensorIoMode::Input);
        assert_eq!(input.kind, SlotKind::Data);
        let (_, output) = program.slot("output").unwrap();
        assert_eq!(output.io_mode, TensorIoMode::Output);
        let shape_slots = program
            .tensors
            .iter()
            .filter(|slot| slot.kind == SlotKind::Shape)
            .count();
        assert_eq!(shape_slots, 4);
    }

    #[test]
    fn unsupported_op_types_fail_lowering() {
        let (mut graph, profile) = region();
        graph.operations[3].op_type = "gather".to_string();
        let err = lower(&graph, &TargetProperties::default(), &profile, Precision::Fp32).unwrap_err();
        assert!(matches!(err, GraphError::UnsupportedOperation { .. }));
    }

    #[test]
    fn malformed_attributes_are_reported() {
        let (mut graph, profile) = region();
        graph.operations[3].attributes = serde_json::json!({"starts": [0, 0, -1, 0], "strides": [1, 1, 2, 2]});
        let err = lower(&graph, &TargetProperties::default(), &profile, Precision::Fp32).unwrap_err();
        assert!(matches!(err, GraphError::InvalidAttribute { .. }));
    }

    #[test]
    fn fp16_requires_target_support() {
        let (graph, profile) = region();
        let target = TargetProperties {
            supports_fp16: false,
            ..TargetProperties::default()
        };
        assert!(matches!(
            lower(&graph, &target, &profile, Precision::Fp16),
            Err(GraphError::LoweringFailed { .. })
        ));
    }
}
