//! Persisted plan format.
//!
//! A plan file is the 4-byte magic `DYNP` followed by a protobuf
//! [`wire::PlanEnvelope`]. The envelope carries the format version, the target
//! the plan was lowered for, and the encoded [`Program`] together with its
//! SHA-256 digest. Anything that does not check out is rejected as
//! [`GraphError::IncompatiblePlan`]; a blob is never partially interpreted.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use prost::Message;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::compiler::program::{
    AxisRange, Node, Precision, Program, SizeSource, SlotKind, TensorSlot,
};
use crate::error::GraphError;
use crate::graph::{DataType, Dim};
use crate::profile::DimRange;
use crate::tensor::TensorIoMode;

pub const MAGIC: &[u8; 4] = b"DYNP";
pub const FORMAT_VERSION: u32 = 1;

/// Immutable compiled plan. Clones share the same bytes and program.
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    bytes: Arc<[u8]>,
    program: Arc<Program>,
}

impl CompiledPlan {
    pub(crate) fn encode(program: Arc<Program>, format_version: u32) -> Self {
        let payload = wire::ProgramProto::from(program.as_ref()).encode_to_vec();
        let envelope = wire::PlanEnvelope {
            format_version,
            target: program.target.clone(),
            digest: Sha256::digest(&payload).to_vec(),
            program: payload,
        };
        let mut bytes = Vec::with_capacity(MAGIC.len() + envelope.encoded_len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend(envelope.encode_to_vec());
        Self {
            bytes: bytes.into(),
            program,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GraphError> {
        let body = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| GraphError::incompatible("missing plan magic"))?;
        let envelope = wire::PlanEnvelope::decode(body)
            .map_err(|err| GraphError::incompatible(format!("undecodable envelope: {}", err)))?;
        if envelope.format_version != FORMAT_VERSION {
            return Err(GraphError::incompatible(format!(
                "format version {} is not supported (expected {})",
                envelope.format_version, FORMAT_VERSION
            )));
        }
        if Sha256::digest(&envelope.program).as_slice() != envelope.digest.as_slice() {
            return Err(GraphError::incompatible("program digest mismatch"));
        }
        let proto = wire::ProgramProto::decode(envelope.program.as_slice())
            .map_err(|err| GraphError::incompatible(format!("undecodable program: {}", err)))?;
        let program = Program::try_from(proto)?;
        if program.target != envelope.target {
            return Err(GraphError::incompatible(format!(
                "envelope target `{}` disagrees with program target `{}`",
                envelope.target, program.target
            )));
        }
        program.check_references().map_err(GraphError::incompatible)?;
        debug!(accel = %program.target, bytes = bytes.len(), "decoded plan");
        Ok(Self {
            bytes: bytes.into(),
            program: Arc::new(program),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn target(&self) -> &str {
        &self.program.target
    }

    pub fn precision(&self) -> Precision {
        self.program.precision
    }

    pub fn write_to<W: Write>(&self, mut sink: W) -> Result<(), GraphError> {
        sink.write_all(&self.bytes)
            .and_then(|_| sink.flush())
            .map_err(|source| GraphError::PlanIo { source })
    }

    pub fn read_from<R: Read>(mut source: R) -> Result<Self, GraphError> {
        let mut bytes = Vec::new();
        source
            .read_to_end(&mut bytes)
            .map_err(|source| GraphError::PlanIo { source })?;
        Self::from_bytes(&bytes)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), GraphError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| GraphError::export(parent, err))?;
        }
        fs::write(path, &self.bytes).map_err(|err| GraphError::export(path, err))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|err| GraphError::io(path, err))?;
        Self::from_bytes(&bytes)
    }
}

pub(crate) mod wire {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct PlanEnvelope {
        #[prost(uint32, tag = "1")]
        pub format_version: u32,
        #[prost(string, tag = "2")]
        pub target: String,
        #[prost(bytes = "vec", tag = "3")]
        pub digest: Vec<u8>,
        #[prost(bytes = "vec", tag = "4")]
        pub program: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ProgramProto {
        #[prost(string, tag = "1")]
        pub target: String,
        #[prost(enumeration = "PrecisionProto", tag = "2")]
        pub precision: i32,
        #[prost(message, repeated, tag = "3")]
        pub tensors: Vec<TensorSlotProto>,
        #[prost(message, repeated, tag = "4")]
        pub nodes: Vec<NodeProto>,
        #[prost(message, repeated, tag = "5")]
        pub ranges: Vec<AxisRangeProto>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TensorSlotProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(enumeration = "DataTypeProto", tag = "2")]
        pub data_type: i32,
        #[prost(int64, repeated, tag = "3")]
        pub dims: Vec<i64>,
        #[prost(uint32, repeated, tag = "4")]
        pub max_dims: Vec<u32>,
        #[prost(enumeration = "IoModeProto", tag = "5")]
        pub io_mode: i32,
        #[prost(enumeration = "SlotKindProto", tag = "6")]
        pub kind: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct NodeProto {
        #[prost(oneof = "node_proto::Kind", tags = "1, 2, 3, 4, 5")]
        pub kind: Option<node_proto::Kind>,
    }

    pub mod node_proto {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            ShapeOf(super::ShapeOfProto),
            #[prost(message, tag = "2")]
            Cast(super::CastProto),
            #[prost(message, tag = "3")]
            Sub(super::SubProto),
            #[prost(message, tag = "4")]
            Constant(super::ConstantProto),
            #[prost(message, tag = "5")]
            Slice(super::SliceProto),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ShapeOfProto {
        #[prost(uint32, tag = "1")]
        pub src: u32,
        #[prost(uint32, tag = "2")]
        pub dst: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct CastProto {
        #[prost(uint32, tag = "1")]
        pub src: u32,
        #[prost(uint32, tag = "2")]
        pub dst: u32,
        #[prost(enumeration = "DataTypeProto", tag = "3")]
        pub to: i32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SubProto {
        #[prost(uint32, tag = "1")]
        pub lhs: u32,
        #[prost(uint32, tag = "2")]
        pub rhs: u32,
        #[prost(uint32, tag = "3")]
        pub dst: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ConstantProto {
        #[prost(uint32, tag = "1")]
        pub dst: u32,
        #[prost(int64, repeated, tag = "2")]
        pub values: Vec<i64>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct SliceProto {
        #[prost(uint32, tag = "1")]
        pub src: u32,
        #[prost(uint32, tag = "2")]
        pub dst: u32,
        #[prost(uint32, repeated, tag = "3")]
        pub starts: Vec<u32>,
        #[prost(uint32, repeated, tag = "4")]
        pub strides: Vec<u32>,
        #[prost(uint32, repeated, tag = "5")]
        pub literal_sizes: Vec<u32>,
        #[prost(uint32, optional, tag = "6")]
        pub sizes_slot: Option<u32>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AxisRangeProto {
        #[prost(uint32, tag = "1")]
        pub slot: u32,
        #[prost(uint32, tag = "2")]
        pub axis: u32,
        #[prost(uint32, tag = "3")]
        pub min: u32,
        #[prost(uint32, tag = "4")]
        pub opt: u32,
        #[prost(uint32, tag = "5")]
        pub max: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum PrecisionProto {
        Fp32 = 0,
        Fp16 = 1,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum DataTypeProto {
        Float32 = 0,
        Float16 = 1,
        Int32 = 2,
        Int64 = 3,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum IoModeProto {
        None = 0,
        Input = 1,
        Output = 2,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum SlotKindProto {
        Data = 0,
        Shape = 1,
    }
}

use wire::node_proto::Kind;
use wire::{DataTypeProto, IoModeProto, PrecisionProto, SlotKindProto};

fn data_type_to_wire(data_type: DataType) -> i32 {
    let proto = match data_type {
        DataType::Float32 => DataTypeProto::Float32,
        DataType::Float16 => DataTypeProto::Float16,
        DataType::Int32 => DataTypeProto::Int32,
        DataType::Int64 => DataTypeProto::Int64,
    };
    proto as i32
}

fn data_type_from_wire(value: i32) -> Result<DataType, GraphError> {
    match DataTypeProto::try_from(value) {
        Ok(DataTypeProto::Float32) => Ok(DataType::Float32),
        Ok(DataTypeProto::Float16) => Ok(DataType::Float16),
        Ok(DataTypeProto::Int32) => Ok(DataType::Int32),
        Ok(DataTypeProto::Int64) => Ok(DataType::Int64),
        Err(_) => Err(GraphError::incompatible(format!("unknown data type {}", value))),
    }
}

impl From<&Program> for wire::ProgramProto {
    fn from(program: &Program) -> Self {
        let precision = match program.precision {
            Precision::Fp32 => PrecisionProto::Fp32,
            Precision::Fp16 => PrecisionProto::Fp16,
        };
        let tensors = program
            .tensors
            .iter()
            .map(|slot| {
                let io_mode = match slot.io_mode {
                    TensorIoMode::None => IoModeProto::None,
                    TensorIoMode::Input => IoModeProto::Input,
                    TensorIoMode::Output => IoModeProto::Output,
                };
                let kind = match slot.kind {
                    SlotKind::Data => SlotKindProto::Data,
                    SlotKind::Shape => SlotKindProto::Shape,
                };
                wire::TensorSlotProto {
                    name: slot.name.clone(),
                    data_type: data_type_to_wire(slot.data_type),
                    dims: slot.dims.iter().map(|&d| i64::from(d)).collect(),
                    max_dims: slot.max_dims.clone(),
                    io_mode: io_mode as i32,
                    kind: kind as i32,
                }
            })
            .collect();
        let nodes = program
            .nodes
            .iter()
            .map(|node| {
                let kind = match node {
                    Node::ShapeOf { src, dst } => Kind::ShapeOf(wire::ShapeOfProto {
                        src: *src,
                        dst: *dst,
                    }),
                    Node::Cast { src, dst, to } => Kind::Cast(wire::CastProto {
                        src: *src,
                        dst: *dst,
                        to: data_type_to_wire(*to),
                    }),
                    Node::Sub { lhs, rhs, dst } => Kind::Sub(wire::SubProto {
                        lhs: *lhs,
                        rhs: *rhs,
                        dst: *dst,
                    }),
                    Node::Constant { dst, values } => Kind::Constant(wire::ConstantProto {
                        dst: *dst,
                        values: values.clone(),
                    }),
                    Node::Slice {
                        src,
                        dst,
                        starts,
                        strides,
                        sizes,
                    } => {
                        let (literal_sizes, sizes_slot) = match sizes {
                            SizeSource::Literal(sizes) => (sizes.clone(), None),
                            SizeSource::Slot(slot) => (Vec::new(), Some(*slot)),
                        };
                        Kind::Slice(wire::SliceProto {
                            src: *src,
                            dst: *dst,
                            starts: starts.clone(),
                            strides: strides.clone(),
                            literal_sizes,
                            sizes_slot,
                        })
                    }
                };
                wire::NodeProto { kind: Some(kind) }
            })
            .collect();
        let ranges = program
            .ranges
            .iter()
            .map(|r| wire::AxisRangeProto {
                slot: r.slot,
                axis: r.axis,
                min: r.range.min,
                opt: r.range.opt,
                max: r.range.max,
            })
            .collect();
        wire::ProgramProto {
            target: program.target.clone(),
            precision: precision as i32,
            tensors,
            nodes,
            ranges,
        }
    }
}

impl TryFrom<wire::ProgramProto> for Program {
    type Error = GraphError;

    fn try_from(proto: wire::ProgramProto) -> Result<Self, Self::Error> {
        let precision = match PrecisionProto::try_from(proto.precision) {
            Ok(PrecisionProto::Fp32) => Precision::Fp32,
            Ok(PrecisionProto::Fp16) => Precision::Fp16,
            Err(_) => {
                return Err(GraphError::incompatible(format!(
                    "unknown precision {}",
                    proto.precision
                )));
            }
        };

        let mut tensors = Vec::with_capacity(proto.tensors.len());
        for slot in proto.tensors {
            let io_mode = match IoModeProto::try_from(slot.io_mode) {
                Ok(IoModeProto::None) => TensorIoMode::None,
                Ok(IoModeProto::Input) => TensorIoMode::Input,
                Ok(IoModeProto::Output) => TensorIoMode::Output,
                Err(_) => {
                    return Err(GraphError::incompatible(format!(
                        "tensor `{}` has unknown io mode {}",
                        slot.name, slot.io_mode
                    )));
                }
            };
            let kind = match SlotKindProto::try_from(slot.kind) {
                Ok(SlotKindProto::Data) => SlotKind::Data,
                Ok(SlotKindProto::Shape) => SlotKind::Shape,
                Err(_) => {
                    return Err(GraphError::incompatible(format!(
                        "tensor `{}` has unknown slot kind {}",
                        slot.name, slot.kind
                    )));
                }
            };
            let dims = slot
                .dims
                .iter()
                .map(|&d| Dim::try_from(d))
                .collect::<Result<Vec<_>, _>>()
                .map_err(GraphError::incompatible)?;
            tensors.push(TensorSlot {
                data_type: data_type_from_wire(slot.data_type)?,
                name: slot.name,
                dims,
                max_dims: slot.max_dims,
                io_mode,
                kind,
            });
        }

        let mut nodes = Vec::with_capacity(proto.nodes.len());
        for node in proto.nodes {
            let node = match node.kind {
                Some(Kind::ShapeOf(n)) => Node::ShapeOf {
                    src: n.src,
                    dst: n.dst,
                },
                Some(Kind::Cast(n)) => Node::Cast {
                    src: n.src,
                    dst: n.dst,
                    to: data_type_from_wire(n.to)?,
                },
                Some(Kind::Sub(n)) => Node::Sub {
                    lhs: n.lhs,
                    rhs: n.rhs,
                    dst: n.dst,
                },
                Some(Kind::Constant(n)) => Node::Constant {
                    dst: n.dst,
                    values: n.values,
                },
                Some(Kind::Slice(n)) => Node::Slice {
                    src: n.src,
                    dst: n.dst,
                    starts: n.starts,
                    strides: n.strides,
                    sizes: match n.sizes_slot {
                        Some(slot) => SizeSource::Slot(slot),
                        None => SizeSource::Literal(n.literal_sizes),
                    },
                },
                None => return Err(GraphError::incompatible("node without a kind")),
            };
            nodes.push(node);
        }

        let ranges = proto
            .ranges
            .into_iter()
            .map(|r| AxisRange {
                slot: r.slot,
                axis: r.axis,
                range: DimRange::new(r.min, r.opt, r.max),
            })
            .collect();

        Ok(Program {
            target: proto.target,
            precision,
            tensors,
            nodes,
            ranges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::PlanCompiler;
    use crate::profile::negotiate;
    use crate::topology::{RegionSpec, define_region_graph};

    fn small_plan(precision: Precision) -> CompiledPlan {
        let spec = RegionSpec {
            height: 8,
            width: 6,
            ..RegionSpec::default()
        };
        let graph = define_region_graph(&spec).unwrap();
        let profile = negotiate(&graph, DimRange::default()).unwrap();
        PlanCompiler::default()
            .compile(&graph, &profile, precision)
            .unwrap()
    }

    fn envelope(plan: &CompiledPlan) -> wire::PlanEnvelope {
        wire::PlanEnvelope::decode(&plan.as_bytes()[MAGIC.len()..]).unwrap()
    }

    fn reframe(envelope: &wire::PlanEnvelope) -> Vec<u8> {
        let mut bytes = MAGIC.to_vec();
        bytes.extend(envelope.encode_to_vec());
        bytes
    }

    #[test]
    fn decoded_plan_matches_compiled_program() {
        let plan = small_plan(Precision::Fp16);
        assert!(plan.as_bytes().starts_with(MAGIC));
        let decoded = CompiledPlan::from_bytes(plan.as_bytes()).unwrap();
        assert_eq!(decoded.program(), plan.program());
        assert_eq!(decoded.precision(), Precision::Fp16);
        assert_eq!(decoded.as_bytes(), plan.as_bytes());
    }

    #[test]
    fn stream_and_file_persistence() {
        let plan = small_plan(Precision::Fp32);
        let mut sink = Vec::new();
        plan.write_to(&mut sink).unwrap();
        let from_stream = CompiledPlan::read_from(sink.as_slice()).unwrap();
        assert_eq!(from_stream.program(), plan.program());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights").join("test.engine");
        plan.save(&path).unwrap();
        let loaded = CompiledPlan::load(&path).unwrap();
        assert_eq!(loaded.as_bytes(), plan.as_bytes());
    }

    #[test]
    fn rejects_foreign_blobs() {
        for bytes in [&b""[..], &b"ONNX\x08\x01"[..], &b"DYNP\xff\xff\xff"[..]] {
            let err = CompiledPlan::from_bytes(bytes).unwrap_err();
            assert!(matches!(err, GraphError::IncompatiblePlan { .. }), "{err}");
        }
    }

    #[test]
    fn rejects_tampered_program() {
        let plan = small_plan(Precision::Fp32);
        let mut tampered = envelope(&plan);
        let last = tampered.program.len() - 1;
        tampered.program[last] ^= 0x01;
        let err = CompiledPlan::from_bytes(&reframe(&tampered)).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
    }

    #[test]
    fn rejects_unknown_format_version() {
        let plan = small_plan(Precision::Fp32);
        let mut future = envelope(&plan);
        future.format_version = FORMAT_VERSION + 1;
        let err = CompiledPlan::from_bytes(&reframe(&future)).unwrap_err();
        assert!(err.to_string().contains("format version"));
    }

    #[test]
    fn rejects_mismatched_envelope_target() {
        let plan = small_plan(Precision::Fp32);
        let mut relabelled = envelope(&plan);
        relabelled.target = "other-accel".to_string();
        let err = CompiledPlan::from_bytes(&reframe(&relabelled)).unwrap_err();
        assert!(matches!(err, GraphError::IncompatiblePlan { .. }));
    }

    #[test]
    fn missing_plan_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CompiledPlan::load(dir.path().join("absent.engine")).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Io);
    }
}
