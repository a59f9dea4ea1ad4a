use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float16,
    Float32,
    Int32,
    Int64,
}

impl DataType {
    pub fn bytes_per_element(self) -> usize {
        match self {
            DataType::Float16 => 2,
            DataType::Float32 => 4,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int32 | DataType::Int64)
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "float16" => Some(DataType::Float16),
            "float32" => Some(DataType::Float32),
            "int32" => Some(DataType::Int32),
            "int64" => Some(DataType::Int64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Float16 => "float16",
            DataType::Float32 => "float32",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
        }
    }
}

/// One axis of a declared shape. JSON encodes a dynamic axis as `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Dim {
    Fixed(u32),
    Dynamic,
}

impl Dim {
    pub fn fixed(self) -> Option<u32> {
        match self {
            Dim::Fixed(extent) => Some(extent),
            Dim::Dynamic => None,
        }
    }

    pub fn is_dynamic(self) -> bool {
        matches!(self, Dim::Dynamic)
    }
}

impl TryFrom<i64> for Dim {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Dim::Dynamic),
            v if v >= 0 && v <= u32::MAX as i64 => Ok(Dim::Fixed(v as u32)),
            v => Err(format!("dimension {v} is neither -1 nor a u32 extent")),
        }
    }
}

impl From<Dim> for i64 {
    fn from(dim: Dim) -> Self {
        match dim {
            Dim::Fixed(extent) => extent as i64,
            Dim::Dynamic => -1,
        }
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(extent) => write!(f, "{extent}"),
            Dim::Dynamic => write!(f, "?"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandDescriptor {
    pub data_type: DataType,
    #[serde(default)]
    pub shape: Vec<Dim>,
}

impl OperandDescriptor {
    pub fn new(data_type: DataType, shape: Vec<Dim>) -> Self {
        Self { data_type, shape }
    }

    pub fn fixed(data_type: DataType, shape: &[u32]) -> Self {
        Self {
            data_type,
            shape: shape.iter().copied().map(Dim::Fixed).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn is_static(&self) -> bool {
        self.shape.iter().all(|dim| !dim.is_dynamic())
    }

    /// Element count with every dynamic axis counted as one.
    pub fn element_count(&self) -> Option<usize> {
        let mut count = 1usize;
        for dim in &self.shape {
            let extent = dim.fixed().unwrap_or(1);
            count = count.checked_mul(extent as usize)?;
        }
        Some(count)
    }

    pub fn byte_length(&self) -> Option<usize> {
        let elements = self.element_count()?;
        elements.checked_mul(self.data_type.bytes_per_element())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperandKind {
    Input,
    Constant,
    Output,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operand {
    pub kind: OperandKind,
    pub descriptor: OperandDescriptor,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub input_operands: Vec<u32>,
    pub output_operand: u32,
    #[serde(default)]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub label: Option<String>,
}

impl Operation {
    pub fn display_name(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.op_type.clone())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstantData {
    #[serde_as(as = "Base64")]
    pub data: Vec<u8>,
    #[serde(default)]
    pub label: Option<String>,
}

impl ConstantData {
    pub fn from_i32(values: &[i32]) -> Self {
        Self {
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            label: None,
        }
    }

    /// Decodes the payload as little-endian integers of `data_type`.
    pub fn to_i64(&self, data_type: DataType) -> Option<Vec<i64>> {
        match data_type {
            DataType::Int32 => Some(
                self.data
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as i64)
                    .collect(),
            ),
            DataType::Int64 => Some(
                self.data
                    .chunks_exact(8)
                    .map(|c| {
                        i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect(),
            ),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphInfo {
    pub operands: Vec<Operand>,
    #[serde(default)]
    pub input_operands: Vec<u32>,
    #[serde(default)]
    pub output_operands: Vec<u32>,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub constant_operand_ids_to_handles: HashMap<u32, ConstantData>,
}

impl GraphInfo {
    pub fn operand(&self, id: u32) -> Option<&Operand> {
        self.operands.get(id as usize)
    }

    /// Operation producing `operand`, if any.
    pub fn producer(&self, operand: u32) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|operation| operation.output_operand == operand)
    }

    pub fn input_named(&self, name: &str) -> Option<(u32, &Operand)> {
        self.input_operands.iter().find_map(|&id| {
            let operand = self.operand(id)?;
            (operand.name.as_deref() == Some(name)).then_some((id, operand))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_dims_use_minus_one_in_json() {
        let descriptor = OperandDescriptor::new(
            DataType::Float32,
            vec![Dim::Dynamic, Dim::Fixed(3), Dim::Fixed(960), Dim::Fixed(960)],
        );
        let json = serde_json::to_string(&descriptor).unwrap();
        assert!(json.contains("[-1,3,960,960]"));
        let back: OperandDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn rejects_negative_extents_other_than_dynamic() {
        let err = serde_json::from_str::<OperandDescriptor>(
            r#"{"data_type":"float32","shape":[-2,3]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn element_count_treats_dynamic_axes_as_one() {
        let descriptor = OperandDescriptor::new(
            DataType::Float32,
            vec![Dim::Dynamic, Dim::Fixed(3), Dim::Fixed(4)],
        );
        assert_eq!(descriptor.element_count(), Some(12));
        assert_eq!(descriptor.byte_length(), Some(48));
        assert!(!descriptor.is_static());
    }

    #[test]
    fn constant_payload_decodes_as_integers() {
        let data = ConstantData::from_i32(&[0, 0, 480, -7]);
        assert_eq!(data.data.len(), 16);
        assert_eq!(data.to_i64(DataType::Int32), Some(vec![0, 0, 480, -7]));
        assert_eq!(data.to_i64(DataType::Float32), None);
    }

    #[test]
    fn constant_payload_is_base64_in_json() {
        let data = ConstantData::from_i32(&[1]);
        let json = serde_json::to_value(&data).unwrap();
        assert_eq!(json["data"], "AQAAAA==");
    }
}
