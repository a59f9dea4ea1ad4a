//! The two ways of obtaining a plan, plus a single end-to-end invocation.
//!
//! [`build_plan`] and [`load_plan`] are independent constructors that both
//! yield a [`CompiledPlan`]; the caller picks one from configuration.

use std::path::Path;

use tracing::info;

use crate::compiler::PlanCompiler;
use crate::config::EngineConfig;
use crate::device::Device;
use crate::error::GraphError;
use crate::plan::CompiledPlan;
use crate::profile::negotiate;
use crate::runtime::Runtime;
use crate::session::InferenceSession;
use crate::tensor::HostTensor;
use crate::topology::define_region_graph;

/// Define the region graph, negotiate its batch range, and compile it.
pub fn build_plan(config: &EngineConfig) -> Result<CompiledPlan, GraphError> {
    let graph = define_region_graph(&config.region)?;
    let profile = negotiate(&graph, config.batch)?;
    PlanCompiler::default().compile(&graph, &profile, config.precision)
}

pub fn load_plan(path: impl AsRef<Path>) -> Result<CompiledPlan, GraphError> {
    let path = path.as_ref();
    let plan = CompiledPlan::load(path)?;
    info!(path = %path.display(), bytes = plan.as_bytes().len(), "loaded persisted plan");
    Ok(plan)
}

/// Build and persist, or load, according to `config.build`.
pub fn obtain_plan(config: &EngineConfig) -> Result<CompiledPlan, GraphError> {
    if config.build {
        let plan = build_plan(config)?;
        plan.save(&config.engine_path)?;
        info!(path = %config.engine_path.display(), "persisted plan");
        Ok(plan)
    } else {
        load_plan(&config.engine_path)
    }
}

/// Bind `plan` on a fresh device and run one invocation on `input`.
pub fn run_once(
    config: &EngineConfig,
    plan: &CompiledPlan,
    input: &HostTensor,
) -> Result<HostTensor, GraphError> {
    let runtime = Runtime::new(Device::new(&config.device));
    let engine = runtime.load_plan(plan)?;
    let mut session =
        InferenceSession::bind(engine, &config.region.input_name, &config.region.output_name)?;
    let output = session.infer(input);
    session.release()?;
    output
}

/// The input a single CLI run feeds the engine: every element is 0.5.
pub fn uniform_input(config: &EngineConfig, value: f32) -> HostTensor {
    let dims = config.region.input_dims(config.invocation_batch);
    HostTensor::filled(dims.iter().map(|&d| d as usize).collect(), value)
}
