use std::collections::{HashMap, HashSet};

use serde_json::json;
use tracing::debug;

use crate::error::GraphError;
use crate::graph::{
    ConstantData, DataType, Dim, GraphInfo, Operand, OperandDescriptor, OperandKind, Operation,
};
use crate::shape_inference::{
    KnownValues, broadcast_shapes, cast_values, infer_slice_shape, shape_of_values, sub_values,
};
use crate::validator::{ContextProperties, GraphValidator};

/// A tensor node created by [`GraphBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandHandle {
    pub(crate) id: u32,
    pub(crate) descriptor: OperandDescriptor,
}

impl OperandHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn descriptor(&self) -> &OperandDescriptor {
        &self.descriptor
    }

    pub fn rank(&self) -> usize {
        self.descriptor.rank()
    }
}

/// Where a slice takes its output extents from.
#[derive(Debug, Clone, Copy)]
pub enum SliceSizes<'a> {
    Literal(&'a [u32]),
    /// A 1-D integer shape tensor evaluated when the input shape is known.
    Operand(&'a OperandHandle),
}

/// Builder for constructing computation graphs
///
/// Integer shape tensors carry their graph-time known values so that
/// downstream descriptors are as static as the input shape allows.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    operands: Vec<Operand>,
    operations: Vec<Operation>,
    input_operands: Vec<u32>,
    output_operands: Vec<u32>,
    constant_data_map: HashMap<u32, ConstantData>,
    known_values: HashMap<u32, KnownValues>,
    names: HashSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a named graph input.
    pub fn input(
        &mut self,
        name: &str,
        shape: Vec<Dim>,
        data_type: DataType,
    ) -> Result<OperandHandle, GraphError> {
        let id = self.next_id();
        if name.is_empty() {
            return Err(GraphError::MissingInputName { operand: id });
        }
        self.claim_name(name)?;
        let handle = self.push_operand(
            OperandKind::Input,
            OperandDescriptor::new(data_type, shape),
            Some(name.to_string()),
        );
        self.input_operands.push(handle.id);
        Ok(handle)
    }

    /// Embed a 1-D int32 constant.
    pub fn constant_i32(&mut self, values: &[i32]) -> OperandHandle {
        let descriptor = OperandDescriptor::fixed(DataType::Int32, &[values.len() as u32]);
        let handle = self.push_operand(OperandKind::Constant, descriptor, None);
        self.constant_data_map
            .insert(handle.id, ConstantData::from_i32(values));
        self.known_values.insert(
            handle.id,
            values.iter().map(|&v| Some(i64::from(v))).collect(),
        );
        handle
    }

    /// Shape-of: a 1-D int64 tensor holding the live extents of `tensor`.
    pub fn shape(&mut self, tensor: &OperandHandle) -> OperandHandle {
        let descriptor = OperandDescriptor::fixed(DataType::Int64, &[tensor.rank() as u32]);
        let values = shape_of_values(&tensor.descriptor.shape);
        let handle = self.push_operation("shape", &[tensor], descriptor, json!({}));
        self.known_values.insert(handle.id, values);
        handle
    }

    pub fn cast(
        &mut self,
        tensor: &OperandHandle,
        to: DataType,
    ) -> Result<OperandHandle, GraphError> {
        let values = self.shape_values("cast", tensor)?;
        let values = cast_values(&values, to)?;
        let descriptor = OperandDescriptor::new(to, tensor.descriptor.shape.clone());
        let handle = self.push_operation("cast", &[tensor], descriptor, json!({ "to": to.name() }));
        self.known_values.insert(handle.id, values);
        Ok(handle)
    }

    /// Element-wise subtraction of two integer shape tensors.
    pub fn sub(
        &mut self,
        a: &OperandHandle,
        b: &OperandHandle,
    ) -> Result<OperandHandle, GraphError> {
        let lhs = self.shape_values("sub", a)?;
        let rhs = self.shape_values("sub", b)?;
        if a.descriptor.data_type != b.descriptor.data_type {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!(
                    "sub operands must share a data type, got {:?} and {:?}",
                    a.descriptor.data_type, b.descriptor.data_type
                ),
            });
        }
        let shape = broadcast_shapes(&a.descriptor.shape, &b.descriptor.shape)?;
        let values = sub_values(&lhs, &rhs)?;
        let descriptor = OperandDescriptor::new(a.descriptor.data_type, shape);
        let handle = self.push_operation("sub", &[a, b], descriptor, json!({}));
        self.known_values.insert(handle.id, values);
        Ok(handle)
    }

    /// Strided slice of `input`. Output extents come either from a literal or
    /// from a shape tensor built in this graph.
    pub fn slice(
        &mut self,
        input: &OperandHandle,
        starts: &[u32],
        sizes: SliceSizes<'_>,
        strides: &[u32],
    ) -> Result<OperandHandle, GraphError> {
        let (known_sizes, inputs, attributes) = match sizes {
            SliceSizes::Literal(sizes) => (
                sizes.iter().map(|&s| Some(i64::from(s))).collect::<Vec<_>>(),
                vec![input],
                json!({ "starts": starts, "sizes": sizes, "strides": strides }),
            ),
            SliceSizes::Operand(sizes) => {
                if sizes.rank() != 1 {
                    return Err(GraphError::RankMismatch {
                        operation: "slice".to_string(),
                        expected: 1,
                        actual: sizes.rank(),
                    });
                }
                let values = self.shape_values("slice", sizes)?;
                if values.len() != input.rank() {
                    return Err(GraphError::RankMismatch {
                        operation: "slice".to_string(),
                        expected: input.rank(),
                        actual: values.len(),
                    });
                }
                (
                    values,
                    vec![input, sizes],
                    json!({ "starts": starts, "strides": strides }),
                )
            }
        };
        let shape = infer_slice_shape(&input.descriptor.shape, starts, &known_sizes, strides)?;
        let descriptor = OperandDescriptor::new(input.descriptor.data_type, shape);
        Ok(self.push_operation("slice", &inputs, descriptor, attributes))
    }

    /// Name `tensor` and export it as a graph output.
    pub fn mark_output(&mut self, tensor: &OperandHandle, name: &str) -> Result<(), GraphError> {
        if name.is_empty() {
            return Err(GraphError::MissingOutputName { operand: tensor.id });
        }
        let operand = self
            .operands
            .get(tensor.id as usize)
            .filter(|operand| operand.kind == OperandKind::Output)
            .ok_or(GraphError::OutputNotProduced { operand: tensor.id })?;
        if operand.name.is_some() {
            return Err(GraphError::DuplicateTensorName {
                name: name.to_string(),
            });
        }
        self.claim_name(name)?;
        self.operands[tensor.id as usize].name = Some(name.to_string());
        self.output_operands.push(tensor.id);
        Ok(())
    }

    /// Graph-time values of an integer shape tensor.
    pub fn known_values(&self, tensor: &OperandHandle) -> Option<&KnownValues> {
        self.known_values.get(&tensor.id)
    }

    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    pub fn build(self) -> Result<GraphInfo, GraphError> {
        self.build_with(ContextProperties::default())
    }

    /// Finish the graph and validate it against `context`.
    pub fn build_with(self, context: ContextProperties) -> Result<GraphInfo, GraphError> {
        let graph = GraphInfo {
            operands: self.operands,
            input_operands: self.input_operands,
            output_operands: self.output_operands,
            operations: self.operations,
            constant_operand_ids_to_handles: self.constant_data_map,
        };
        GraphValidator::new(&graph, context).validate()?;
        debug!(
            operands = graph.operands.len(),
            operations = graph.operations.len(),
            "graph built"
        );
        Ok(graph)
    }

    fn next_id(&self) -> u32 {
        self.operands.len() as u32
    }

    fn claim_name(&mut self, name: &str) -> Result<(), GraphError> {
        if !self.names.insert(name.to_string()) {
            return Err(GraphError::DuplicateTensorName {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn shape_values(
        &self,
        operation: &str,
        tensor: &OperandHandle,
    ) -> Result<KnownValues, GraphError> {
        if !tensor.descriptor.data_type.is_integer() {
            return Err(GraphError::ShapeInferenceFailed {
                reason: format!(
                    "{} expects an integer shape tensor, operand {} is {:?}",
                    operation, tensor.id, tensor.descriptor.data_type
                ),
            });
        }
        self.known_values
            .get(&tensor.id)
            .cloned()
            .ok_or_else(|| GraphError::ShapeInferenceFailed {
                reason: format!(
                    "{} expects a shape tensor, operand {} does not carry extents",
                    operation, tensor.id
                ),
            })
    }

    fn push_operand(
        &mut self,
        kind: OperandKind,
        descriptor: OperandDescriptor,
        name: Option<String>,
    ) -> OperandHandle {
        let id = self.next_id();
        self.operands.push(Operand {
            kind,
            descriptor: descriptor.clone(),
            name,
        });
        OperandHandle { id, descriptor }
    }

    fn push_operation(
        &mut self,
        op_type: &str,
        inputs: &[&OperandHandle],
        descriptor: OperandDescriptor,
        attributes: serde_json::Value,
    ) -> OperandHandle {
        let handle = self.push_operand(OperandKind::Output, descriptor, None);
        self.operations.push(Operation {
            op_type: op_type.to_string(),
            input_operands: inputs.iter().map(|operand| operand.id).collect(),
            output_operand: handle.id,
            attributes,
            label: None,
        });
        handle
    }
}
