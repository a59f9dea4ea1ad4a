//! Host-side tensors and the I/O roles tensors play in a compiled plan.

use std::fmt;

use crate::graph::DataType;

/// Host-resident tensor stored in CPU memory
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Row-major element data
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub dtype: DataType,
}

impl HostTensor {
    /// Create a zero-filled host tensor with the given shape and data type
    pub fn new(shape: Vec<usize>, dtype: DataType) -> Self {
        let total_elements: usize = shape.iter().product();
        let data = vec![0.0f32; total_elements];
        Self { data, shape, dtype }
    }

    /// Create a host tensor where every element equals `value`
    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let total_elements: usize = shape.iter().product();
        Self {
            data: vec![value; total_elements],
            shape,
            dtype: DataType::Float32,
        }
    }

    /// Create a host tensor from existing data
    pub fn from_data(data: Vec<f32>, shape: Vec<usize>, dtype: DataType) -> Self {
        Self { data, shape, dtype }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Raw native-endian bytes of the tensor data, as copied to the device.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }
}

/// Role a named tensor plays in a compiled plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorIoMode {
    None,
    Input,
    Output,
}

impl fmt::Display for TensorIoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorIoMode::None => write!(f, "none"),
            TensorIoMode::Input => write!(f, "input"),
            TensorIoMode::Output => write!(f, "output"),
        }
    }
}
