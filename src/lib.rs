pub mod builder;
pub mod compiler;
pub mod config;
pub mod debug;
pub mod device;
pub mod error;
pub mod graph;
pub mod graphviz;
pub mod kernels;
pub mod loader;
pub mod pipeline;
pub mod plan;
pub mod profile;
pub mod runtime;
pub mod session;
pub mod shape_arith;
pub mod shape_inference;
pub mod tensor;
pub mod topology;
pub mod validator;

pub use builder::{GraphBuilder, OperandHandle, SliceSizes};
pub use compiler::program::Precision;
pub use compiler::{PlanCompiler, SIM_TARGET, TargetProperties};
pub use config::EngineConfig;
pub use device::{Device, DeviceBuffer, DeviceConfig, DeviceError, DeviceErrorCode, Stream};
pub use error::{ErrorClass, GraphError};
pub use graph::{
    ConstantData, DataType, Dim, GraphInfo, Operand, OperandDescriptor, OperandKind, Operation,
};
pub use graphviz::graph_to_dot;
pub use loader::{load_config_from_path, load_graph_from_path, save_graph_to_path};
pub use plan::CompiledPlan;
pub use profile::{DimRange, OptimizationProfile, ProfileSelector, negotiate};
pub use runtime::{Engine, ExecutionContext, Runtime};
pub use session::{EngineState, InferenceSession};
pub use shape_arith::shape_minus;
pub use tensor::{HostTensor, TensorIoMode};
pub use topology::{RegionSpec, define_region_graph};
pub use validator::{ContextProperties, GraphValidator, ValidationArtifacts};
