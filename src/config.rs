use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::compiler::program::Precision;
use crate::device::DeviceConfig;
use crate::profile::DimRange;
use crate::topology::RegionSpec;

/// Everything needed to build or load a plan and run it. Every field has a
/// default, so a config file only lists what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where the compiled plan is persisted or loaded from.
    pub engine_path: PathBuf,
    /// Compile and persist a fresh plan (`true`) or load `engine_path` (`false`).
    pub build: bool,
    pub precision: Precision,
    /// Shape range of the dynamic batch axis.
    pub batch: DimRange,
    /// Batch size used by a single CLI invocation.
    pub invocation_batch: u32,
    pub region: RegionSpec,
    pub device: DeviceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_path: PathBuf::from("weights/test.engine"),
            build: true,
            precision: Precision::Fp16,
            batch: DimRange::default(),
            invocation_batch: 4,
            region: RegionSpec::default(),
            device: DeviceConfig::default(),
        }
    }
}
