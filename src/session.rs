//! The engine state machine driving one bound plan:
//! bind → specialize → dispatch → synchronize, looping back to specialize.

use std::fmt;

use tracing::{info, warn};

use crate::device::{DeviceBuffer, Stream};
use crate::error::GraphError;
use crate::graph::DataType;
use crate::runtime::{Engine, ExecutionContext};
use crate::tensor::{HostTensor, TensorIoMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Bound,
    Specialized,
    Dispatched,
    Synchronized,
    /// A stream or binding failure; only `release` is accepted.
    Failed,
    Released,
}

impl EngineState {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineState::Bound => "bound",
            EngineState::Specialized => "specialized",
            EngineState::Dispatched => "dispatched",
            EngineState::Synchronized => "synchronized",
            EngineState::Failed => "failed",
            EngineState::Released => "released",
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct Bindings {
    input: DeviceBuffer,
    output: DeviceBuffer,
}

/// An engine with device buffers bound for the maximum shape, one execution
/// context, and one stream.
pub struct InferenceSession {
    engine: Engine,
    context: ExecutionContext,
    stream: Stream,
    bindings: Option<Bindings>,
    input_name: String,
    output_name: String,
    input_dims: Vec<u32>,
    output_dims: Vec<u32>,
    state: EngineState,
}

impl InferenceSession {
    /// Verify tensor roles, allocate max-shape buffers, and bind them.
    pub fn bind(engine: Engine, input_name: &str, output_name: &str) -> Result<Self, GraphError> {
        for (name, expected) in [
            (input_name, TensorIoMode::Input),
            (output_name, TensorIoMode::Output),
        ] {
            let actual = engine.tensor_io_mode(name);
            if actual != expected {
                return Err(GraphError::TensorRoleMismatch {
                    name: name.to_string(),
                    expected,
                    actual,
                });
            }
            if engine.tensor_data_type(name) != Some(DataType::Float32) {
                return Err(GraphError::invocation(format!(
                    "`{}` must be a float32 tensor to exchange host data",
                    name
                )));
            }
        }

        let input = allocate(&engine, input_name)?;
        let output = allocate(&engine, output_name)?;
        let mut context = engine.create_execution_context()?;
        context.set_tensor_address(input_name, &input)?;
        context.set_tensor_address(output_name, &output)?;
        let stream = engine.device().create_stream()?;

        info!(
            input = input_name,
            input_bytes = input.len(),
            output = output_name,
            output_bytes = output.len(),
            "bound engine buffers"
        );
        Ok(Self {
            engine,
            context,
            stream,
            bindings: Some(Bindings { input, output }),
            input_name: input_name.to_string(),
            output_name: output_name.to_string(),
            input_dims: Vec::new(),
            output_dims: Vec::new(),
            state: EngineState::Bound,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Commands accepted by this session's stream so far.
    pub fn stream_submitted(&self) -> u64 {
        self.stream.submitted()
    }

    /// Set the input shape for the next invocation and return the output shape.
    ///
    /// An out-of-range shape is rejected here, before any stream work, and
    /// leaves the session usable.
    pub fn specialize(&mut self, dims: &[u32]) -> Result<Vec<u32>, GraphError> {
        self.require(
            "specialize",
            &[
                EngineState::Bound,
                EngineState::Specialized,
                EngineState::Synchronized,
            ],
        )?;
        self.context.set_input_shape(&self.input_name, dims)?;
        let output_dims = self
            .context
            .tensor_shape(&self.output_name)
            .map(<[u32]>::to_vec)
            .ok_or_else(|| GraphError::invocation("output shape did not resolve"))?;
        self.input_dims = dims.to_vec();
        self.output_dims = output_dims.clone();
        self.state = EngineState::Specialized;
        Ok(output_dims)
    }

    /// Queue input upload, compute, and output download for the current shape.
    pub fn dispatch(&mut self, data: &[f32]) -> Result<(), GraphError> {
        self.require("dispatch", &[EngineState::Specialized])?;
        let expected: usize = self.input_dims.iter().map(|&d| d as usize).product();
        if data.len() != expected {
            return Err(GraphError::invocation(format!(
                "input holds {} values but shape {:?} needs {}",
                data.len(),
                self.input_dims,
                expected
            )));
        }
        let (input_ptr, output_ptr) = match &self.bindings {
            Some(bindings) => (bindings.input.ptr(), bindings.output.ptr()),
            None => return Err(self.invalid_state("dispatch")),
        };
        let output_bytes = self
            .context
            .tensor_bytes(&self.output_name)
            .ok_or_else(|| GraphError::invocation("output shape did not resolve"))?;

        let queued = self
            .stream
            .memcpy_htod_async(input_ptr, bytemuck::cast_slice(data).to_vec())
            .map_err(GraphError::from)
            .and_then(|_| self.context.enqueue(&self.stream))
            .and_then(|_| {
                self.stream
                    .memcpy_dtoh_async(output_ptr, output_bytes)
                    .map_err(GraphError::from)
            });
        if let Err(err) = queued {
            return Err(self.fail(err));
        }
        self.state = EngineState::Dispatched;
        Ok(())
    }

    /// Wait for the dispatched invocation and return its output.
    pub fn synchronize(&mut self) -> Result<HostTensor, GraphError> {
        self.require("synchronize", &[EngineState::Dispatched])?;
        let staged = match self.stream.synchronize().and_then(|_| self.stream.take_staged()) {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.fail(err.into())),
        };
        let data: Vec<f32> = staged
            .chunks_exact(std::mem::size_of::<f32>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        let shape = self.output_dims.iter().map(|&d| d as usize).collect();
        self.state = EngineState::Synchronized;
        Ok(HostTensor::from_data(data, shape, DataType::Float32))
    }

    /// One full invocation.
    pub fn infer(&mut self, input: &HostTensor) -> Result<HostTensor, GraphError> {
        let dims = input
            .shape
            .iter()
            .map(|&d| u32::try_from(d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| GraphError::invocation("input extent does not fit in u32"))?;
        self.specialize(&dims)?;
        self.dispatch(&input.data)?;
        self.synchronize()
    }

    /// Drain the stream and free the device buffers.
    pub fn release(&mut self) -> Result<(), GraphError> {
        if self.state == EngineState::Released {
            return Err(self.invalid_state("release"));
        }
        // A poisoned stream reports its error here again; the buffers go anyway.
        let _ = self.stream.synchronize();
        self.state = EngineState::Released;
        if let Some(bindings) = self.bindings.take() {
            bindings.input.release()?;
            bindings.output.release()?;
        }
        info!("released engine buffers");
        Ok(())
    }

    fn require(&self, operation: &'static str, allowed: &[EngineState]) -> Result<(), GraphError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.invalid_state(operation))
        }
    }

    fn invalid_state(&self, operation: &'static str) -> GraphError {
        GraphError::InvalidState {
            operation,
            state: self.state.as_str(),
        }
    }

    fn fail(&mut self, err: GraphError) -> GraphError {
        if err.class() == crate::error::ErrorClass::Stream {
            warn!(error = %err, "stream failed; session must be released");
            self.state = EngineState::Failed;
        }
        err
    }
}

fn allocate(engine: &Engine, name: &str) -> Result<DeviceBuffer, GraphError> {
    let bytes = engine
        .tensor_max_bytes(name)
        .ok_or_else(|| GraphError::UnknownTensor {
            name: name.to_string(),
        })?;
    engine
        .device()
        .malloc(bytes)
        .map_err(|source| GraphError::Allocation {
            tensor: name.to_string(),
            bytes,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::PlanCompiler;
    use crate::compiler::program::Precision;
    use crate::device::{Device, DeviceErrorCode, DeviceMemory};
    use crate::error::ErrorClass;
    use crate::profile::{DimRange, negotiate};
    use crate::runtime::Runtime;
    use crate::topology::{RegionSpec, define_region_graph};

    fn engine_on(device: Device) -> Engine {
        let spec = RegionSpec {
            height: 6,
            width: 4,
            ..RegionSpec::default()
        };
        let graph = define_region_graph(&spec).unwrap();
        let profile = negotiate(&graph, DimRange::default()).unwrap();
        let plan = PlanCompiler::default()
            .compile(&graph, &profile, Precision::Fp32)
            .unwrap();
        Runtime::new(device).load_plan(&plan).unwrap()
    }

    #[test]
    fn walks_the_state_machine() {
        let mut session = InferenceSession::bind(engine_on(Device::with_capacity(1 << 20)), "input", "output").unwrap();
        assert_eq!(session.state(), EngineState::Bound);
        assert!(matches!(
            session.dispatch(&[]),
            Err(GraphError::InvalidState { operation: "dispatch", state: "bound" })
        ));

        assert_eq!(session.specialize(&[2, 3, 6, 4]).unwrap(), vec![2, 3, 3, 2]);
        assert_eq!(session.state(), EngineState::Specialized);
        let input: Vec<f32> = (0..2 * 3 * 6 * 4).map(|v| v as f32).collect();
        session.dispatch(&input).unwrap();
        assert_eq!(session.state(), EngineState::Dispatched);
        assert_eq!(session.stream_submitted(), 3);

        let output = session.synchronize().unwrap();
        assert_eq!(session.state(), EngineState::Synchronized);
        assert_eq!(output.shape, vec![2, 3, 3, 2]);
        // First row of the first plane: columns 0 and 2 of row 0.
        assert_eq!(&output.data[..2], &[0.0, 2.0]);
        // Second row: row 2 of the input plane starts at 8.
        assert_eq!(&output.data[2..4], &[8.0, 10.0]);
    }

    #[test]
    fn rejected_batches_leave_the_session_usable() {
        let device = Device::with_capacity(1 << 20);
        let mut session = InferenceSession::bind(engine_on(device.clone()), "input", "output").unwrap();
        let used = device.memory_used();

        for batch in [0, 17] {
            let err = session.infer(&HostTensor::filled(vec![batch, 3, 6, 4], 0.5)).unwrap_err();
            assert!(matches!(err, GraphError::ShapeOutOfRange { .. }));
            assert_eq!(err.class(), ErrorClass::Invocation);
        }
        assert_eq!(session.stream_submitted(), 0);
        assert_eq!(device.memory_used(), used);

        let output = session.infer(&HostTensor::filled(vec![1, 3, 6, 4], 0.5)).unwrap();
        assert_eq!(output.shape, vec![1, 3, 3, 2]);
    }

    #[test]
    fn wrong_roles_are_a_binding_error() {
        let err = InferenceSession::bind(engine_on(Device::with_capacity(1 << 20)), "output", "input")
            .err()
            .unwrap();
        assert!(matches!(
            err,
            GraphError::TensorRoleMismatch {
                expected: TensorIoMode::Input,
                actual: TensorIoMode::Output,
                ..
            }
        ));
        assert_eq!(err.class(), ErrorClass::Binding);
    }

    #[test]
    fn allocation_failure_names_the_tensor() {
        let err = InferenceSession::bind(engine_on(Device::with_capacity(1024)), "input", "output")
            .err()
            .unwrap();
        assert!(matches!(&err, GraphError::Allocation { tensor, .. } if tensor == "input"));
        assert_eq!(err.device_code(), Some(DeviceErrorCode::MemoryAllocation));
    }

    #[test]
    fn stream_failure_moves_to_failed() {
        let device = Device::with_capacity(1 << 20);
        let mut session = InferenceSession::bind(engine_on(device.clone()), "input", "output").unwrap();
        session
            .stream()
            .launch(
                "injected_fault",
                Box::new(|_: &mut DeviceMemory| Err(DeviceErrorCode::LaunchFailure)),
            )
            .unwrap();

        let err = session.infer(&HostTensor::filled(vec![1, 3, 6, 4], 0.5)).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Stream);
        assert_eq!(err.device_code(), Some(DeviceErrorCode::LaunchFailure));
        assert!(err.to_string().contains("injected_fault"));
        assert_eq!(session.state(), EngineState::Failed);
        assert!(matches!(
            session.specialize(&[1, 3, 6, 4]),
            Err(GraphError::InvalidState { state: "failed", .. })
        ));

        session.release().unwrap();
        assert_eq!(session.state(), EngineState::Released);
        assert_eq!(device.memory_used(), 0);
    }
}
