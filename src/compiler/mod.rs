//! Plan compiler: validates a graph against a target, proves the shape range
//! envelope, and lowers to a serialized [`CompiledPlan`].

mod lower;
pub mod program;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::GraphError;
use crate::graph::GraphInfo;
use crate::plan::{CompiledPlan, FORMAT_VERSION};
use crate::profile::{OptimizationProfile, ProfileSelector};
use crate::validator::{ContextProperties, GraphValidator};

use program::{Precision, Program, SlotKind, byte_length};

/// Name of the built-in software accelerator target.
pub const SIM_TARGET: &str = "sim-accel";

/// What a compilation target accepts.
#[derive(Debug, Clone)]
pub struct TargetProperties {
    pub name: String,
    pub format_version: u32,
    pub context: ContextProperties,
    pub supported_ops: HashSet<&'static str>,
    pub supports_fp16: bool,
}

impl Default for TargetProperties {
    fn default() -> Self {
        Self {
            name: SIM_TARGET.to_string(),
            format_version: FORMAT_VERSION,
            context: ContextProperties::default(),
            supported_ops: ["shape", "cast", "sub", "slice"].into_iter().collect(),
            supports_fp16: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanCompiler {
    target: TargetProperties,
}

impl PlanCompiler {
    pub fn new(target: TargetProperties) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &TargetProperties {
        &self.target
    }

    pub fn compile(
        &self,
        graph: &GraphInfo,
        profile: &OptimizationProfile,
        precision: Precision,
    ) -> Result<CompiledPlan, GraphError> {
        GraphValidator::new(graph, self.target.context.clone()).validate()?;
        profile.check(graph)?;

        let mut program = lower::lower(graph, &self.target, profile, precision)?;
        self.prove_envelope(graph, profile, &mut program)?;
        self.check_byte_limits(&program)?;

        let plan = CompiledPlan::encode(Arc::new(program), self.target.format_version);
        info!(
            accel = %self.target.name,
            ?precision,
            bytes = plan.as_bytes().len(),
            "compiled plan"
        );
        Ok(plan)
    }

    /// Evaluate the shape program at every profile corner. Records the
    /// extents at the maximum corner as the allocation size of each slot.
    fn prove_envelope(
        &self,
        graph: &GraphInfo,
        profile: &OptimizationProfile,
        program: &mut Program,
    ) -> Result<(), GraphError> {
        for selector in ProfileSelector::ALL {
            let mut inputs = HashMap::new();
            for &id in &graph.input_operands {
                let Some(operand) = graph.operand(id) else {
                    continue;
                };
                let name = operand.name.as_deref().unwrap_or_default();
                let dims = profile
                    .dims(name, &operand.descriptor.shape, selector)
                    .ok_or_else(|| GraphError::MissingShapeRange {
                        tensor: name.to_string(),
                        axis: 0,
                    })?;
                inputs.insert(id, dims);
            }

            let resolution = program.evaluate(&inputs).map_err(|err| GraphError::LoweringFailed {
                target: self.target.name.clone(),
                reason: format!("shape program fails at the {:?} profile shape: {}", selector, err),
            })?;
            debug!(?selector, launches = resolution.launches.len(), "envelope corner resolved");

            if selector == ProfileSelector::Max {
                for (idx, slot) in program.tensors.iter_mut().enumerate() {
                    if let Some(dims) = resolution.shape(idx as u32) {
                        slot.max_dims = dims.to_vec();
                    }
                }
            }
        }
        Ok(())
    }

    fn check_byte_limits(&self, program: &Program) -> Result<(), GraphError> {
        let limit = self.target.context.tensor_byte_length_limit;
        for slot in program.tensors.iter().filter(|slot| slot.kind == SlotKind::Data) {
            let bytes = byte_length(&slot.max_dims, slot.data_type);
            if bytes > limit {
                return Err(GraphError::LoweringFailed {
                    target: self.target.name.clone(),
                    reason: format!(
                        "tensor `{}` needs {} bytes at the maximum shape, limit is {}",
                        slot.name, bytes, limit
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DimRange, negotiate};
    use crate::topology::{RegionSpec, define_region_graph};

    fn small_spec() -> RegionSpec {
        RegionSpec {
            height: 8,
            width: 8,
            ..RegionSpec::default()
        }
    }

    #[test]
    fn compiles_region_graph_with_max_extents() {
        let graph = define_region_graph(&RegionSpec::default()).unwrap();
        let profile = negotiate(&graph, DimRange::default()).unwrap();
        let plan = PlanCompiler::default()
            .compile(&graph, &profile, Precision::Fp16)
            .unwrap();

        let program = plan.program();
        assert_eq!(program.target, SIM_TARGET);
        assert_eq!(program.precision, Precision::Fp16);
        assert_eq!(program.slot("input").unwrap().1.max_dims, vec![16, 3, 960, 960]);
        assert_eq!(program.slot("output").unwrap().1.max_dims, vec![16, 3, 480, 480]);
    }

    #[test]
    fn compilation_is_deterministic() {
        let graph = define_region_graph(&small_spec()).unwrap();
        let profile = negotiate(&graph, DimRange::default()).unwrap();
        let compiler = PlanCompiler::default();
        let first = compiler.compile(&graph, &profile, Precision::Fp32).unwrap();
        let second = compiler.compile(&graph, &profile, Precision::Fp32).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn unsatisfiable_profile_is_a_compile_error() {
        let graph = define_region_graph(&small_spec()).unwrap();
        let mut profile = OptimizationProfile::new();
        profile.set_range("input", 0, DimRange::new(16, 4, 1));
        let err = PlanCompiler::default()
            .compile(&graph, &profile, Precision::Fp32)
            .unwrap_err();
        assert!(matches!(err, GraphError::InvalidShapeRange { .. }));
        assert_eq!(err.class(), crate::error::ErrorClass::Compile);
    }

    #[test]
    fn oversized_maximum_shape_fails_lowering() {
        let graph = define_region_graph(&RegionSpec::default()).unwrap();
        let profile = negotiate(&graph, DimRange::new(1, 4, 1024)).unwrap();
        let err = PlanCompiler::default()
            .compile(&graph, &profile, Precision::Fp32)
            .unwrap_err();
        assert!(matches!(err, GraphError::LoweringFailed { .. }));
        assert!(err.to_string().contains("`input`"));
    }

    #[test]
    fn disconnected_output_fails_validation() {
        let mut graph = define_region_graph(&small_spec()).unwrap();
        let profile = negotiate(&graph, DimRange::default()).unwrap();
        graph.output_operands.clear();
        assert!(
            PlanCompiler::default()
                .compile(&graph, &profile, Precision::Fp32)
                .is_err()
        );
    }
}
