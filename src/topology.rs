//! The region-extraction graph: a batch-dynamic NCHW input sliced down to a
//! half-resolution region whose extents are computed from the live input
//! shape.

use serde::{Deserialize, Serialize};

use crate::builder::{GraphBuilder, SliceSizes};
use crate::error::GraphError;
use crate::graph::{DataType, Dim, GraphInfo};
use crate::shape_arith::shape_minus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionSpec {
    pub input_name: String,
    pub output_name: String,
    pub channels: u32,
    pub height: u32,
    pub width: u32,
    /// Literal slice strides in NCHW order.
    pub strides: [u32; 4],
}

impl Default for RegionSpec {
    fn default() -> Self {
        Self {
            input_name: "input".to_string(),
            output_name: "output".to_string(),
            channels: 3,
            height: 960,
            width: 960,
            strides: [1, 1, 2, 2],
        }
    }
}

impl RegionSpec {
    /// Declared input shape; the batch axis is dynamic.
    pub fn input_shape(&self) -> Vec<Dim> {
        vec![
            Dim::Dynamic,
            Dim::Fixed(self.channels),
            Dim::Fixed(self.height),
            Dim::Fixed(self.width),
        ]
    }

    /// Offsets subtracted from the live input shape to get the slice extents.
    pub fn extent_offsets(&self) -> [i32; 4] {
        [0, 0, (self.height / 2) as i32, (self.width / 2) as i32]
    }

    /// Concrete input shape for `batch`.
    pub fn input_dims(&self, batch: u32) -> [u32; 4] {
        [batch, self.channels, self.height, self.width]
    }

    /// Output shape implied by the shape arithmetic for `batch`.
    pub fn output_dims(&self, batch: u32) -> [u32; 4] {
        let [_, _, dh, dw] = self.extent_offsets();
        [
            batch,
            self.channels,
            self.height - dh as u32,
            self.width - dw as u32,
        ]
    }
}

/// Define the region graph described by `spec`.
pub fn define_region_graph(spec: &RegionSpec) -> Result<GraphInfo, GraphError> {
    if spec.height > i32::MAX as u32 || spec.width > i32::MAX as u32 {
        return Err(GraphError::ShapeInferenceFailed {
            reason: format!(
                "spatial extents {}x{} do not fit the int32 shape arithmetic",
                spec.height, spec.width
            ),
        });
    }
    let mut builder = GraphBuilder::new();
    let input = builder.input(&spec.input_name, spec.input_shape(), DataType::Float32)?;
    let sizes = shape_minus(&mut builder, &input, &spec.extent_offsets())?;
    let region = builder.slice(
        &input,
        &[0, 0, 0, 0],
        SliceSizes::Operand(&sizes),
        &spec.strides,
    )?;
    builder.mark_output(&region, &spec.output_name)?;
    builder.build()
}
