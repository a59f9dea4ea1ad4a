//! Lowered form of a graph: tensor slots, host-evaluated shape steps, and
//! device kernels, in graph order.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::{DataType, Dim};
use crate::profile::DimRange;
use crate::shape_inference::{cast_values, slice_axis_extent, sub_values};
use crate::tensor::TensorIoMode;

/// Numeric mode the kernels run in. Never changes output shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    /// Values are rounded through IEEE binary16 inside kernels.
    Fp16,
}

impl Precision {
    /// Relative error bound against [`Precision::Fp32`] for values in the
    /// normal binary16 range.
    pub fn relative_tolerance(self) -> f32 {
        match self {
            Precision::Fp32 => 0.0,
            Precision::Fp16 => 1.0 / 2048.0,
        }
    }

    pub fn round(self, value: f32) -> f32 {
        match self {
            Precision::Fp32 => value,
            Precision::Fp16 => half::f16::from_f32(value).to_f32(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Element data resident on the device.
    Data,
    /// 1-D integer extents evaluated on the host during specialization.
    Shape,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSlot {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<Dim>,
    /// Extents at the maximum corner of the shape range.
    pub max_dims: Vec<u32>,
    pub io_mode: TensorIoMode,
    pub kind: SlotKind,
}

impl TensorSlot {
    pub fn max_bytes(&self) -> usize {
        byte_length(&self.max_dims, self.data_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizeSource {
    Literal(Vec<u32>),
    Slot(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    ShapeOf { src: u32, dst: u32 },
    Cast { src: u32, dst: u32, to: DataType },
    Sub { lhs: u32, rhs: u32, dst: u32 },
    Constant { dst: u32, values: Vec<i64> },
    Slice {
        src: u32,
        dst: u32,
        starts: Vec<u32>,
        strides: Vec<u32>,
        sizes: SizeSource,
    },
}

impl Node {
    pub fn op_name(&self) -> &'static str {
        match self {
            Node::ShapeOf { .. } => "shape",
            Node::Cast { .. } => "cast",
            Node::Sub { .. } => "sub",
            Node::Constant { .. } => "constant",
            Node::Slice { .. } => "slice",
        }
    }

    fn slots(&self) -> Vec<u32> {
        match self {
            Node::ShapeOf { src, dst } | Node::Cast { src, dst, .. } => vec![*src, *dst],
            Node::Sub { lhs, rhs, dst } => vec![*lhs, *rhs, *dst],
            Node::Constant { dst, .. } => vec![*dst],
            Node::Slice {
                src, dst, sizes, ..
            } => match sizes {
                SizeSource::Slot(slot) => vec![*src, *dst, *slot],
                SizeSource::Literal(_) => vec![*src, *dst],
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisRange {
    pub slot: u32,
    pub axis: u32,
    pub range: DimRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub target: String,
    pub precision: Precision,
    pub tensors: Vec<TensorSlot>,
    pub nodes: Vec<Node>,
    pub ranges: Vec<AxisRange>,
}

/// A slice kernel with every extent resolved for one input shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceLaunch {
    pub src: u32,
    pub dst: u32,
    pub src_dims: Vec<u32>,
    pub starts: Vec<u32>,
    pub strides: Vec<u32>,
    pub out_dims: Vec<u32>,
}

/// Shapes and launches for one concrete set of input shapes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub shapes: HashMap<u32, Vec<u32>>,
    pub values: HashMap<u32, Vec<i64>>,
    pub launches: Vec<SliceLaunch>,
}

impl Resolution {
    pub fn shape(&self, slot: u32) -> Option<&[u32]> {
        self.shapes.get(&slot).map(Vec::as_slice)
    }
}

pub fn byte_length(dims: &[u32], data_type: DataType) -> usize {
    dims.iter().map(|&d| d as usize).product::<usize>() * data_type.bytes_per_element()
}

impl Program {
    pub fn slot(&self, name: &str) -> Option<(u32, &TensorSlot)> {
        self.tensors
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.name == name)
            .map(|(idx, slot)| (idx as u32, slot))
    }

    pub fn io_slots(&self) -> impl Iterator<Item = (u32, &TensorSlot)> {
        self.tensors
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.io_mode != TensorIoMode::None)
            .map(|(idx, slot)| (idx as u32, slot))
    }

    pub fn axis_range(&self, slot: u32, axis: usize) -> Option<DimRange> {
        self.ranges
            .iter()
            .find(|r| r.slot == slot && r.axis as usize == axis)
            .map(|r| r.range)
    }

    /// Every slot index a node or range mentions must exist.
    pub fn check_references(&self) -> Result<(), String> {
        let count = self.tensors.len() as u32;
        for node in &self.nodes {
            if let Some(slot) = node.slots().into_iter().find(|&slot| slot >= count) {
                return Err(format!(
                    "{} node references slot {} of {}",
                    node.op_name(),
                    slot,
                    count
                ));
            }
        }
        if let Some(range) = self.ranges.iter().find(|r| r.slot >= count) {
            return Err(format!("shape range references slot {} of {}", range.slot, count));
        }
        Ok(())
    }

    /// Run the shape steps for concrete input shapes and resolve every kernel.
    ///
    /// Input shapes must already be complete; range checks are the caller's job.
    pub fn evaluate(&self, inputs: &HashMap<u32, Vec<u32>>) -> Result<Resolution, GraphError> {
        let mut resolution = Resolution::default();
        for (&slot, dims) in inputs {
            resolution.shapes.insert(slot, dims.clone());
        }

        for node in &self.nodes {
            match node {
                Node::ShapeOf { src, dst } => {
                    let dims = known_shape(&resolution, *src, "shape")?;
                    let values = dims.iter().map(|&d| i64::from(d)).collect::<Vec<_>>();
                    resolution.shapes.insert(*dst, vec![values.len() as u32]);
                    resolution.values.insert(*dst, values);
                }
                Node::Cast { src, dst, to } => {
                    let values = known_values(&resolution, *src, "cast")?;
                    let known: Vec<Option<i64>> = values.iter().copied().map(Some).collect();
                    let cast = cast_values(&known, *to)?;
                    let values: Vec<i64> = cast.into_iter().flatten().collect();
                    resolution.shapes.insert(*dst, vec![values.len() as u32]);
                    resolution.values.insert(*dst, values);
                }
                Node::Sub { lhs, rhs, dst } => {
                    let lhs: Vec<Option<i64>> = known_values(&resolution, *lhs, "sub")?
                        .iter()
                        .copied()
                        .map(Some)
                        .collect();
                    let rhs: Vec<Option<i64>> = known_values(&resolution, *rhs, "sub")?
                        .iter()
                        .copied()
                        .map(Some)
                        .collect();
                    let values: Vec<i64> = sub_values(&lhs, &rhs)?.into_iter().flatten().collect();
                    resolution.shapes.insert(*dst, vec![values.len() as u32]);
                    resolution.values.insert(*dst, values);
                }
                Node::Constant { dst, values } => {
                    resolution.shapes.insert(*dst, vec![values.len() as u32]);
                    resolution.values.insert(*dst, values.clone());
                }
                Node::Slice {
                    src,
                    dst,
                    starts,
                    strides,
                    sizes,
                } => {
                    let src_dims = known_shape(&resolution, *src, "slice")?.to_vec();
                    let sizes: Vec<i64> = match sizes {
                        SizeSource::Literal(sizes) => sizes.iter().map(|&s| i64::from(s)).collect(),
                        SizeSource::Slot(slot) => known_values(&resolution, *slot, "slice")?.to_vec(),
                    };
                    let rank = src_dims.len();
                    if sizes.len() != rank || starts.len() != rank || strides.len() != rank {
                        return Err(GraphError::ShapeInferenceFailed {
                            reason: format!(
                                "slice of rank-{} tensor got {} starts, {} sizes, {} strides",
                                rank,
                                starts.len(),
                                sizes.len(),
                                strides.len()
                            ),
                        });
                    }
                    let mut out_dims = Vec::with_capacity(rank);
                    for axis in 0..rank {
                        let extent = slice_axis_extent(
                            axis,
                            Some(src_dims[axis]),
                            starts[axis],
                            Some(sizes[axis]),
                            strides[axis],
                        )?;
                        // Known size always yields a fixed extent.
                        out_dims.push(extent.fixed().unwrap_or_default());
                    }
                    resolution.shapes.insert(*dst, out_dims.clone());
                    resolution.launches.push(SliceLaunch {
                        src: *src,
                        dst: *dst,
                        src_dims,
                        starts: starts.clone(),
                        strides: strides.clone(),
                        out_dims,
                    });
                }
            }
        }
        Ok(resolution)
    }
}

fn known_shape<'r>(
    resolution: &'r Resolution,
    slot: u32,
    operation: &str,
) -> Result<&'r [u32], GraphError> {
    resolution
        .shape(slot)
        .ok_or_else(|| GraphError::ShapeInferenceFailed {
            reason: format!("{} reads slot {} before its shape is known", operation, slot),
        })
}

fn known_values<'r>(
    resolution: &'r Resolution,
    slot: u32,
    operation: &str,
) -> Result<&'r [i64], GraphError> {
    resolution
        .values
        .get(&slot)
        .map(Vec::as_slice)
        .ok_or_else(|| GraphError::ShapeInferenceFailed {
            reason: format!("{} reads slot {} which holds no shape values", operation, slot),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(name: &str, data_type: DataType, dims: Vec<Dim>, kind: SlotKind) -> TensorSlot {
        TensorSlot {
            name: name.to_string(),
            data_type,
            dims,
            max_dims: vec![],
            io_mode: TensorIoMode::None,
            kind,
        }
    }

    /// input(0) -> shape(1) -> cast(2) - const(3) = sizes(4); slice(0, 4) -> 5
    fn region_program() -> Program {
        Program {
            target: "test".to_string(),
            precision: Precision::Fp32,
            tensors: vec![
                slot(
                    "input",
                    DataType::Float32,
                    vec![Dim::Dynamic, Dim::Fixed(3), Dim::Fixed(8), Dim::Fixed(8)],
                    SlotKind::Data,
                ),
                slot("%1", DataType::Int64, vec![Dim::Fixed(4)], SlotKind::Shape),
                slot("%2", DataType::Int32, vec![Dim::Fixed(4)], SlotKind::Shape),
                slot("%3", DataType::Int32, vec![Dim::Fixed(4)], SlotKind::Shape),
                slot("%4", DataType::Int32, vec![Dim::Fixed(4)], SlotKind::Shape),
                slot(
                    "output",
                    DataType::Float32,
                    vec![Dim::Dynamic, Dim::Fixed(3), Dim::Fixed(4), Dim::Fixed(4)],
                    SlotKind::Data,
                ),
            ],
            nodes: vec![
                Node::Constant {
                    dst: 3,
                    values: vec![0, 0, 4, 4],
                },
                Node::ShapeOf { src: 0, dst: 1 },
                Node::Cast {
                    src: 1,
                    dst: 2,
                    to: DataType::Int32,
                },
                Node::Sub {
                    lhs: 2,
                    rhs: 3,
                    dst: 4,
                },
                Node::Slice {
                    src: 0,
                    dst: 5,
                    starts: vec![0; 4],
                    strides: vec![1, 1, 2, 2],
                    sizes: SizeSource::Slot(4),
                },
            ],
            ranges: vec![AxisRange {
                slot: 0,
                axis: 0,
                range: DimRange::new(1, 2, 4),
            }],
        }
    }

    #[test]
    fn evaluates_runtime_shape_arithmetic() {
        let program = region_program();
        let inputs = HashMap::from([(0, vec![3, 3, 8, 8])]);
        let resolution = program.evaluate(&inputs).unwrap();
        assert_eq!(resolution.values[&4], vec![3, 3, 4, 4]);
        assert_eq!(resolution.shape(5), Some(&[3, 3, 4, 4][..]));
        assert_eq!(resolution.launches.len(), 1);
        assert_eq!(resolution.launches[0].src_dims, vec![3, 3, 8, 8]);
        assert_eq!(resolution.launches[0].out_dims, vec![3, 3, 4, 4]);
    }

    #[test]
    fn missing_input_shape_is_reported() {
        let program = region_program();
        let err = program.evaluate(&HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("before its shape is known"));
    }

    #[test]
    fn finds_slots_and_ranges() {
        let program = region_program();
        assert_eq!(program.slot("output").map(|(idx, _)| idx), Some(5));
        assert_eq!(program.axis_range(0, 0), Some(DimRange::new(1, 2, 4)));
        assert_eq!(program.axis_range(0, 1), None);
        assert!(program.check_references().is_ok());
    }

    #[test]
    fn dangling_slot_reference_is_detected() {
        let mut program = region_program();
        program.nodes.push(Node::ShapeOf { src: 0, dst: 42 });
        assert!(program.check_references().unwrap_err().contains("slot 42"));
    }

    #[test]
    fn fp16_rounding_stays_within_tolerance() {
        let tolerance = Precision::Fp16.relative_tolerance();
        for value in [0.5f32, 1.0 / 3.0, 123.456, -7.77] {
            let rounded = Precision::Fp16.round(value);
            assert!(((rounded - value) / value).abs() <= tolerance);
        }
        assert_eq!(Precision::Fp16.round(0.5), 0.5);
        assert_eq!(Precision::Fp32.round(1.0 / 3.0), 1.0 / 3.0);
    }
}
