use std::fs;
use std::path::Path;

use crate::config::EngineConfig;
use crate::error::GraphError;
use crate::graph::GraphInfo;

/// Load a graph from its JSON form.
///
/// Dynamic axes are written as `-1`; constant payloads are base64.
pub fn load_graph_from_path(path: impl AsRef<Path>) -> Result<GraphInfo, GraphError> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|err| GraphError::io(path_ref, err))?;
    Ok(serde_json::from_str(&contents)?)
}

pub fn save_graph_to_path(graph: &GraphInfo, path: impl AsRef<Path>) -> Result<(), GraphError> {
    let path_ref = path.as_ref();
    let json = serde_json::to_string_pretty(graph)?;
    fs::write(path_ref, json).map_err(|err| GraphError::export(path_ref, err))
}

pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<EngineConfig, GraphError> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|err| GraphError::io(path_ref, err))?;
    Ok(serde_json::from_str(&contents)?)
}
