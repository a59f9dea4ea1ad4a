//! Plan execution: [`Runtime`] rehydrates plans into [`Engine`]s, and an
//! [`ExecutionContext`] binds device addresses, specializes input shapes, and
//! enqueues kernels on a [`Stream`].

use std::collections::HashMap;

use tracing::{debug, info};

use crate::compiler::program::{Precision, Resolution, SlotKind, TensorSlot, byte_length};
use crate::device::{Device, DeviceBuffer, DeviceMemory, DevicePtr, Stream};
use crate::error::GraphError;
use crate::graph::{DataType, Dim};
use crate::kernels::strided_slice;
use crate::plan::CompiledPlan;
use crate::profile::DimRange;
use crate::tensor::TensorIoMode;

pub struct Runtime {
    device: Device,
}

impl Runtime {
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn deserialize_plan(&self, bytes: &[u8]) -> Result<Engine, GraphError> {
        let plan = CompiledPlan::from_bytes(bytes)?;
        self.load_plan(&plan)
    }

    pub fn load_plan(&self, plan: &CompiledPlan) -> Result<Engine, GraphError> {
        if plan.target() != self.device.target() {
            return Err(GraphError::incompatible(format!(
                "plan targets `{}` but device {} runs `{}`",
                plan.target(),
                self.device.ordinal(),
                self.device.target()
            )));
        }
        info!(
            accel = plan.target(),
            precision = ?plan.precision(),
            tensors = plan.program().tensors.len(),
            "loaded plan"
        );
        Ok(Engine {
            plan: plan.clone(),
            device: self.device.clone(),
        })
    }
}

/// A plan loaded onto a device.
#[derive(Debug, Clone)]
pub struct Engine {
    plan: CompiledPlan,
    device: Device,
}

impl Engine {
    pub fn plan(&self) -> &CompiledPlan {
        &self.plan
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn precision(&self) -> Precision {
        self.plan.precision()
    }

    pub fn io_tensor_names(&self) -> Vec<&str> {
        self.plan
            .program()
            .io_slots()
            .map(|(_, slot)| slot.name.as_str())
            .collect()
    }

    /// Role of `name`; [`TensorIoMode::None`] for anything that is not an I/O tensor.
    pub fn tensor_io_mode(&self, name: &str) -> TensorIoMode {
        self.io_slot(name)
            .map(|(_, slot)| slot.io_mode)
            .unwrap_or(TensorIoMode::None)
    }

    pub fn tensor_data_type(&self, name: &str) -> Option<DataType> {
        self.io_slot(name).map(|(_, slot)| slot.data_type)
    }

    /// Declared shape with dynamic axes left open.
    pub fn tensor_shape(&self, name: &str) -> Option<&[Dim]> {
        self.io_slot(name).map(|(_, slot)| slot.dims.as_slice())
    }

    pub fn tensor_max_shape(&self, name: &str) -> Option<&[u32]> {
        self.io_slot(name).map(|(_, slot)| slot.max_dims.as_slice())
    }

    pub fn tensor_max_bytes(&self, name: &str) -> Option<usize> {
        self.io_slot(name).map(|(_, slot)| slot.max_bytes())
    }

    pub fn axis_range(&self, name: &str, axis: usize) -> Option<DimRange> {
        let (slot, _) = self.io_slot(name)?;
        self.plan.program().axis_range(slot, axis)
    }

    /// New execution context. Intermediate data tensors get scratch
    /// allocations sized for the maximum shape.
    pub fn create_execution_context(&self) -> Result<ExecutionContext, GraphError> {
        let mut scratch = HashMap::new();
        for (idx, slot) in self.plan.program().tensors.iter().enumerate() {
            if slot.io_mode != TensorIoMode::None || slot.kind != SlotKind::Data {
                continue;
            }
            let bytes = slot.max_bytes();
            let buffer = self
                .device
                .malloc(bytes)
                .map_err(|source| GraphError::Allocation {
                    tensor: slot.name.clone(),
                    bytes,
                    source,
                })?;
            scratch.insert(idx as u32, buffer);
        }
        Ok(ExecutionContext {
            plan: self.plan.clone(),
            addresses: HashMap::new(),
            scratch,
            input_shapes: HashMap::new(),
            resolution: None,
        })
    }

    fn io_slot(&self, name: &str) -> Option<(u32, &TensorSlot)> {
        self.plan
            .program()
            .slot(name)
            .filter(|(_, slot)| slot.io_mode != TensorIoMode::None)
    }
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    ptr: DevicePtr,
    capacity: usize,
}

/// Per-invocation state of one engine.
///
/// Holds at most one in-flight invocation; callers serialize access.
#[derive(Debug)]
pub struct ExecutionContext {
    plan: CompiledPlan,
    addresses: HashMap<u32, Binding>,
    scratch: HashMap<u32, DeviceBuffer>,
    input_shapes: HashMap<u32, Vec<u32>>,
    resolution: Option<Resolution>,
}

impl ExecutionContext {
    pub fn set_tensor_address(&mut self, name: &str, buffer: &DeviceBuffer) -> Result<(), GraphError> {
        let (slot, _) = self.io_slot(name)?;
        self.addresses.insert(
            slot,
            Binding {
                ptr: buffer.ptr(),
                capacity: buffer.len(),
            },
        );
        debug!(tensor = name, ptr = %buffer.ptr(), bytes = buffer.len(), "bound tensor address");
        Ok(())
    }

    /// Specialize the plan for a concrete input shape.
    ///
    /// Rejected shapes leave the previous specialization in place.
    pub fn set_input_shape(&mut self, name: &str, dims: &[u32]) -> Result<(), GraphError> {
        let (slot, tensor) = self.io_slot(name)?;
        if tensor.io_mode != TensorIoMode::Input {
            return Err(GraphError::TensorRoleMismatch {
                name: name.to_string(),
                expected: TensorIoMode::Input,
                actual: tensor.io_mode,
            });
        }
        if dims.len() != tensor.dims.len() {
            return Err(GraphError::invocation(format!(
                "`{}` has rank {}, got a rank-{} shape",
                name,
                tensor.dims.len(),
                dims.len()
            )));
        }
        for (axis, (&value, dim)) in dims.iter().zip(&tensor.dims).enumerate() {
            match dim {
                Dim::Fixed(extent) if *extent != value => {
                    return Err(GraphError::invocation(format!(
                        "`{}` axis {} is fixed at {}, got {}",
                        name, axis, extent, value
                    )));
                }
                Dim::Fixed(_) => {}
                Dim::Dynamic => {
                    let range = self.plan.program().axis_range(slot, axis).ok_or_else(|| {
                        GraphError::invocation(format!("`{}` axis {} has no compiled range", name, axis))
                    })?;
                    if !range.contains(value) {
                        return Err(GraphError::ShapeOutOfRange {
                            tensor: name.to_string(),
                            axis,
                            value,
                            min: range.min,
                            max: range.max,
                        });
                    }
                }
            }
        }

        let mut input_shapes = self.input_shapes.clone();
        input_shapes.insert(slot, dims.to_vec());
        let resolution = if self.all_inputs_specified_in(&input_shapes) {
            let resolution = self
                .plan
                .program()
                .evaluate(&input_shapes)
                .map_err(|err| GraphError::invocation(err.to_string()))?;
            Some(resolution)
        } else {
            None
        };
        self.input_shapes = input_shapes;
        self.resolution = resolution;
        debug!(tensor = name, ?dims, "input shape specialized");
        Ok(())
    }

    pub fn all_input_shapes_specified(&self) -> bool {
        self.all_inputs_specified_in(&self.input_shapes)
    }

    /// Current extents of an I/O tensor, once every input shape is known.
    pub fn tensor_shape(&self, name: &str) -> Option<&[u32]> {
        let (slot, _) = self.io_slot(name).ok()?;
        self.resolution.as_ref()?.shape(slot)
    }

    /// Bytes `name` occupies at its current shape.
    pub fn tensor_bytes(&self, name: &str) -> Option<usize> {
        let (_, slot) = self.io_slot(name).ok()?;
        self.tensor_shape(name)
            .map(|dims| byte_length(dims, slot.data_type))
    }

    /// Queue the plan's kernels for the current shapes.
    pub fn enqueue(&self, stream: &Stream) -> Result<(), GraphError> {
        let resolution = self
            .resolution
            .as_ref()
            .ok_or_else(|| GraphError::invocation("input shapes have not been specified"))?;
        let program = self.plan.program();

        for (slot, tensor) in program.io_slots() {
            let binding = self
                .addresses
                .get(&slot)
                .ok_or_else(|| GraphError::UnboundTensor {
                    name: tensor.name.clone(),
                })?;
            let needed = resolution
                .shape(slot)
                .map(|dims| byte_length(dims, tensor.data_type))
                .unwrap_or_default();
            if needed > binding.capacity {
                return Err(GraphError::invocation(format!(
                    "`{}` needs {} bytes but the bound buffer holds {}",
                    tensor.name, needed, binding.capacity
                )));
            }
        }

        let mut launches = Vec::with_capacity(resolution.launches.len());
        for launch in &resolution.launches {
            launches.push((self.address(launch.src)?, self.address(launch.dst)?, launch.clone()));
        }
        let precision = program.precision;
        for (src, dst, launch) in launches {
            debug!(out_dims = ?launch.out_dims, "enqueue strided_slice");
            stream.launch(
                "strided_slice",
                Box::new(move |memory: &mut DeviceMemory| {
                    strided_slice(memory, src, dst, &launch, precision)
                }),
            )?;
        }
        Ok(())
    }

    fn address(&self, slot: u32) -> Result<DevicePtr, GraphError> {
        if let Some(binding) = self.addresses.get(&slot) {
            return Ok(binding.ptr);
        }
        if let Some(buffer) = self.scratch.get(&slot) {
            return Ok(buffer.ptr());
        }
        let name = self
            .plan
            .program()
            .tensors
            .get(slot as usize)
            .map(|tensor| tensor.name.clone())
            .unwrap_or_else(|| format!("%{}", slot));
        Err(GraphError::UnboundTensor { name })
    }

    fn all_inputs_specified_in(&self, shapes: &HashMap<u32, Vec<u32>>) -> bool {
        self.plan
            .program()
            .io_slots()
            .filter(|(_, slot)| slot.io_mode == TensorIoMode::Input)
            .all(|(idx, _)| shapes.contains_key(&idx))
    }

    fn io_slot(&self, name: &str) -> Result<(u32, &TensorSlot), GraphError> {
        self.plan
            .program()
            .slot(name)
            .filter(|(_, slot)| slot.io_mode != TensorIoMode::None)
            .ok_or_else(|| GraphError::UnknownTensor {
                name: name.to_string(),
            })
    }
}
