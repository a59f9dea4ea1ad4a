//! Shape ranges for dynamic input axes.
//!
//! An [`OptimizationProfile`] records, per dynamic axis of a graph input, the
//! `(min, opt, max)` extents a compiled plan must accept. The plan compiler
//! treats it as the legality envelope; the runtime rejects any extent outside
//! `[min, max]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;
use crate::graph::{Dim, GraphInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimRange {
    pub min: u32,
    pub opt: u32,
    pub max: u32,
}

impl DimRange {
    pub const fn new(min: u32, opt: u32, max: u32) -> Self {
        Self { min, opt, max }
    }

    pub fn contains(&self, extent: u32) -> bool {
        (self.min..=self.max).contains(&extent)
    }

    /// `0 < min <= opt <= max`.
    pub fn is_satisfiable(&self) -> bool {
        self.min > 0 && self.min <= self.opt && self.opt <= self.max
    }
}

impl Default for DimRange {
    fn default() -> Self {
        Self::new(1, 4, 16)
    }
}

/// Which corner of the profile to materialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSelector {
    Min,
    Opt,
    Max,
}

impl ProfileSelector {
    pub const ALL: [ProfileSelector; 3] =
        [ProfileSelector::Min, ProfileSelector::Opt, ProfileSelector::Max];

    fn pick(self, range: &DimRange) -> u32 {
        match self {
            ProfileSelector::Min => range.min,
            ProfileSelector::Opt => range.opt,
            ProfileSelector::Max => range.max,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizationProfile {
    ranges: BTreeMap<(String, usize), DimRange>,
}

impl OptimizationProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_range(&mut self, tensor: &str, axis: usize, range: DimRange) -> &mut Self {
        self.ranges.insert((tensor.to_string(), axis), range);
        self
    }

    pub fn range(&self, tensor: &str, axis: usize) -> Option<DimRange> {
        self.ranges.get(&(tensor.to_string(), axis)).copied()
    }

    /// Ranges in `(tensor, axis)` order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, DimRange)> {
        self.ranges
            .iter()
            .map(|((tensor, axis), range)| (tensor.as_str(), *axis, *range))
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Check the profile against the declared graph inputs: every range is
    /// satisfiable, every dynamic input axis has a range, and nothing else does.
    pub fn check(&self, graph: &GraphInfo) -> Result<(), GraphError> {
        for ((tensor, axis), range) in &self.ranges {
            if !range.is_satisfiable() {
                return Err(GraphError::InvalidShapeRange {
                    tensor: tensor.clone(),
                    axis: *axis,
                    min: range.min,
                    opt: range.opt,
                    max: range.max,
                });
            }
            let dynamic = graph
                .input_named(tensor)
                .and_then(|(_, operand)| operand.descriptor.shape.get(*axis).copied())
                .is_some_and(Dim::is_dynamic);
            if !dynamic {
                return Err(GraphError::UnexpectedShapeRange {
                    tensor: tensor.clone(),
                    axis: *axis,
                });
            }
        }
        for &id in &graph.input_operands {
            let Some(operand) = graph.operand(id) else {
                continue;
            };
            let name = operand.name.clone().unwrap_or_default();
            for (axis, dim) in operand.descriptor.shape.iter().enumerate() {
                if dim.is_dynamic() && self.range(&name, axis).is_none() {
                    return Err(GraphError::MissingShapeRange { tensor: name, axis });
                }
            }
        }
        Ok(())
    }

    /// Concrete shape of `tensor` at one corner of the profile.
    pub fn dims(&self, tensor: &str, shape: &[Dim], selector: ProfileSelector) -> Option<Vec<u32>> {
        shape
            .iter()
            .enumerate()
            .map(|(axis, dim)| match dim {
                Dim::Fixed(extent) => Some(*extent),
                Dim::Dynamic => self.range(tensor, axis).map(|range| selector.pick(&range)),
            })
            .collect()
    }
}

/// Shape-range negotiation for a graph with a single dynamic axis: assigns
/// `range` to whichever input axis is dynamic.
pub fn negotiate(graph: &GraphInfo, range: DimRange) -> Result<OptimizationProfile, GraphError> {
    let mut profile = OptimizationProfile::new();
    for &id in &graph.input_operands {
        let Some(operand) = graph.operand(id) else {
            continue;
        };
        let name = operand.name.as_deref().unwrap_or_default();
        for (axis, dim) in operand.descriptor.shape.iter().enumerate() {
            if dim.is_dynamic() {
                profile.set_range(name, axis, range);
            }
        }
    }
    profile.check(graph)?;
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{RegionSpec, define_region_graph};

    #[test]
    fn negotiates_the_batch_axis() {
        let graph = define_region_graph(&RegionSpec::default()).unwrap();
        let profile = negotiate(&graph, DimRange::default()).unwrap();
        assert_eq!(profile.range("input", 0), Some(DimRange::new(1, 4, 16)));
        assert_eq!(profile.iter().count(), 1);

        let shape = &graph.input_named("input").unwrap().1.descriptor.shape;
        assert_eq!(
            profile.dims("input", shape, ProfileSelector::Max),
            Some(vec![16, 3, 960, 960])
        );
        assert_eq!(
            profile.dims("input", shape, ProfileSelector::Min),
            Some(vec![1, 3, 960, 960])
        );
    }

    #[test]
    fn rejects_unsatisfiable_ranges() {
        let graph = define_region_graph(&RegionSpec::default()).unwrap();
        for range in [
            DimRange::new(8, 4, 16),
            DimRange::new(1, 17, 16),
            DimRange::new(0, 0, 4),
        ] {
            assert!(matches!(
                negotiate(&graph, range),
                Err(GraphError::InvalidShapeRange { .. })
            ));
        }
    }

    #[test]
    fn rejects_ranges_on_fixed_axes_and_missing_ranges() {
        let graph = define_region_graph(&RegionSpec::default()).unwrap();
        let mut profile = OptimizationProfile::new();
        profile.set_range("input", 1, DimRange::new(3, 3, 3));
        assert!(matches!(
            profile.check(&graph),
            Err(GraphError::UnexpectedShapeRange { axis: 1, .. })
        ));

        let empty = OptimizationProfile::new();
        assert!(matches!(
            empty.check(&graph),
            Err(GraphError::MissingShapeRange { axis: 0, .. })
        ));
    }

    #[test]
    fn range_membership() {
        let range = DimRange::default();
        assert!(range.contains(1));
        assert!(range.contains(16));
        assert!(!range.contains(0));
        assert!(!range.contains(17));
    }
}
