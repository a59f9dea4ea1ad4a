use std::path::PathBuf;

use crate::device::DeviceError;
use crate::graph::DataType;
use crate::tensor::TensorIoMode;
use serde_json::Error as JsonError;
use thiserror::Error;

/// Coarse failure class, used by callers to decide whether the engine is
/// still usable after an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed graph; nothing was built.
    Build,
    /// The plan compiler refused the graph or its shape range.
    Compile,
    /// A persisted plan could not be used by this runtime.
    Plan,
    /// Buffers or tensor roles could not be bound; the engine instance is unusable.
    Binding,
    /// A single invocation was rejected; the engine stays usable.
    Invocation,
    /// Copy/compute/synchronize failed; stream and buffers must be torn down.
    Stream,
    /// Host filesystem or serialization failure.
    Io,
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("file {path} could not be read: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON could not be parsed: {source}")]
    Parse {
        #[from]
        source: JsonError,
    },
    #[error("{path} could not be written: {source}")]
    ExportIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("plan stream I/O failed: {source}")]
    PlanIo {
        #[source]
        source: std::io::Error,
    },

    #[error("graph must declare operands, operations, and outputs")]
    EmptyGraph,
    #[error("graph declares {count} operands which exceeds the u32 id space")]
    TooManyOperands { count: usize },
    #[error("operand {operand} has a shape that overflows element count")]
    OperandElementCountOverflow { operand: u32 },
    #[error("operand {operand} exceeds tensor byte limit ({byte_length} > {limit})")]
    TensorLimit {
        operand: u32,
        byte_length: usize,
        limit: usize,
    },
    #[error("input operand {operand} is missing a name")]
    MissingInputName { operand: u32 },
    #[error("output operand {operand} is missing a name")]
    MissingOutputName { operand: u32 },
    #[error("tensor name `{name}` is used more than once")]
    DuplicateTensorName { name: String },
    #[error("graph must declare exactly one input, found {count}")]
    InputCount { count: usize },
    #[error("graph must declare exactly one output, found {count}")]
    OutputCount { count: usize },
    #[error("operand {operand} uses unsupported IO data type {data_type:?}")]
    UnsupportedIoDataType { operand: u32, data_type: DataType },
    #[error("constant operand {operand} does not have data associated with it")]
    MissingConstantData { operand: u32 },
    #[error("constant operand {operand} byte mismatch (expected {expected}, got {actual})")]
    ConstantLengthMismatch {
        operand: u32,
        expected: usize,
        actual: usize,
    },
    #[error("graph contains unused constant data entries")]
    UnusedConstantHandles,
    #[error("graph input operand list does not match operand table")]
    InputOperandListMismatch,
    #[error("graph output operand list does not match operand table")]
    OutputOperandListMismatch,
    #[error("operand id {operand} referenced by `{operation}` is invalid")]
    InvalidOperandReference { operation: String, operand: u32 },
    #[error("operation `{operation}` consumes operand {operand} before it is produced")]
    OperandNotReady { operation: String, operand: u32 },
    #[error("operation `{operation}` attempts to reuse operand {operand} as output")]
    OperandProducedTwice { operation: String, operand: u32 },
    #[error("graph output operand {operand} is never produced by any operation")]
    OutputNotProduced { operand: u32 },
    #[error("operand {operand} never feeds any operation")]
    OperandNeverUsed { operand: u32 },
    #[error("graph output operand {operand} is not reachable from the graph input")]
    UnreachableOutput { operand: u32 },
    #[error("operation `{operation}` expects rank {expected}, got {actual}")]
    RankMismatch {
        operation: String,
        expected: usize,
        actual: usize,
    },
    #[error("operation `{operation}` has an invalid attribute: {reason}")]
    InvalidAttribute { operation: String, reason: String },
    #[error("shape inference failed: {reason}")]
    ShapeInferenceFailed { reason: String },

    #[error(
        "unsatisfiable shape range for `{tensor}` axis {axis}: min {min}, opt {opt}, max {max}"
    )]
    InvalidShapeRange {
        tensor: String,
        axis: usize,
        min: u32,
        opt: u32,
        max: u32,
    },
    #[error("dynamic axis {axis} of `{tensor}` has no shape range")]
    MissingShapeRange { tensor: String, axis: usize },
    #[error("shape range given for `{tensor}` axis {axis}, which is not a dynamic axis of a graph input")]
    UnexpectedShapeRange { tensor: String, axis: usize },
    #[error("operation `{operation}` is not supported by target `{target}`")]
    UnsupportedOperation { operation: String, target: String },
    #[error("lowering for target `{target}` failed: {reason}")]
    LoweringFailed { target: String, reason: String },

    #[error("plan is incompatible with this runtime: {reason}")]
    IncompatiblePlan { reason: String },

    #[error("tensor `{name}` is not an I/O tensor of this plan")]
    UnknownTensor { name: String },
    #[error("tensor `{name}` should be an {expected} tensor but the plan reports {actual}")]
    TensorRoleMismatch {
        name: String,
        expected: TensorIoMode,
        actual: TensorIoMode,
    },
    #[error("tensor `{name}` has no device address bound")]
    UnboundTensor { name: String },
    #[error("device allocation of {bytes} bytes for `{tensor}` failed: {source}")]
    Allocation {
        tensor: String,
        bytes: usize,
        #[source]
        source: DeviceError,
    },

    #[error("`{tensor}` axis {axis} = {value} lies outside the compiled range [{min}, {max}]")]
    ShapeOutOfRange {
        tensor: String,
        axis: usize,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid invocation: {reason}")]
    InvalidInvocation { reason: String },
    #[error("`{operation}` is not allowed while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl GraphError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GraphError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn export(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GraphError::ExportIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn incompatible(reason: impl Into<String>) -> Self {
        GraphError::IncompatiblePlan {
            reason: reason.into(),
        }
    }

    pub(crate) fn invocation(reason: impl Into<String>) -> Self {
        GraphError::InvalidInvocation {
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        use GraphError::*;
        match self {
            Io { .. } | Parse { .. } | ExportIo { .. } | PlanIo { .. } => ErrorClass::Io,
            InvalidShapeRange { .. }
            | MissingShapeRange { .. }
            | UnexpectedShapeRange { .. }
            | UnsupportedOperation { .. }
            | LoweringFailed { .. } => ErrorClass::Compile,
            IncompatiblePlan { .. } => ErrorClass::Plan,
            UnknownTensor { .. }
            | TensorRoleMismatch { .. }
            | UnboundTensor { .. }
            | Allocation { .. } => ErrorClass::Binding,
            ShapeOutOfRange { .. } | InvalidInvocation { .. } | InvalidState { .. } => {
                ErrorClass::Invocation
            }
            Device(_) => ErrorClass::Stream,
            _ => ErrorClass::Build,
        }
    }

    /// Accelerator error code attached to binding and stream failures.
    pub fn device_code(&self) -> Option<crate::device::DeviceErrorCode> {
        match self {
            GraphError::Allocation { source, .. } | GraphError::Device(source) => {
                Some(source.code)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceErrorCode;

    #[test]
    fn classifies_invocation_and_stream_errors() {
        let out_of_range = GraphError::ShapeOutOfRange {
            tensor: "input".to_string(),
            axis: 0,
            value: 17,
            min: 1,
            max: 16,
        };
        assert_eq!(out_of_range.class(), ErrorClass::Invocation);
        assert!(out_of_range.device_code().is_none());

        let stream = GraphError::from(DeviceError::new(
            "memcpy_async",
            DeviceErrorCode::IllegalAddress,
        ));
        assert_eq!(stream.class(), ErrorClass::Stream);
        assert_eq!(stream.device_code(), Some(DeviceErrorCode::IllegalAddress));
        assert!(stream.to_string().contains("memcpy_async"));
    }

    #[test]
    fn allocation_failure_is_a_binding_error() {
        let err = GraphError::Allocation {
            tensor: "input".to_string(),
            bytes: 64,
            source: DeviceError::new("malloc", DeviceErrorCode::MemoryAllocation),
        };
        assert_eq!(err.class(), ErrorClass::Binding);
        assert_eq!(err.device_code(), Some(DeviceErrorCode::MemoryAllocation));
    }

    #[test]
    fn role_mismatch_message_names_both_roles() {
        let err = GraphError::TensorRoleMismatch {
            name: "output".to_string(),
            expected: TensorIoMode::Output,
            actual: TensorIoMode::Input,
        };
        let message = err.to_string();
        assert!(message.contains("should be an output tensor"));
        assert!(message.contains("reports input"));
        assert_eq!(err.class(), ErrorClass::Binding);
    }
}
