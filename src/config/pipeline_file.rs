//! JSON pipeline definition files
//!
//! A file holds a `pipeline_config_list`. Each pipeline names its request
//! inputs, its nodes and the response outputs. Every node input and every
//! response output points at a `node_name` + `data_item` pair, where
//! `request` is the entry node:
//!
//! ```json
//! {
//!     "pipeline_config_list": [{
//!         "name": "dummy_pipeline",
//!         "inputs": ["in"],
//!         "nodes": [{
//!             "name": "dummy_node",
//!             "type": "DL model",
//!             "model_name": "dummy",
//!             "inputs": [{"b": {"node_name": "request", "data_item": "in"}}],
//!             "outputs": [{"data_item": "a", "alias": "out"}]
//!         }],
//!         "outputs": [{"result": {"node_name": "dummy_node", "data_item": "out"}}]
//!     }]
//! }
//! ```

use crate::config::SchedulerSettings;
use crate::error::{EngineError, Result};
use crate::pipeline::definition::{connect, Connections, NodeInfo, PipelineDefinition};
use crate::pipeline::{ENTRY_NODE_NAME, EXIT_NODE_NAME};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Largest accepted `demultiply_count`
pub const MAX_DEMULTIPLY_COUNT: i64 = 10_000;

/// Root of a pipeline definition file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfigFile {
    #[serde(default)]
    pub pipeline_config_list: Vec<PipelineConfig>,
}

/// Where a node input or a response output comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceNode {
    pub node_name: String,
    pub data_item: String,
}

/// Input name -> source, one entry per map in the file
pub type SourceMapping = BTreeMap<String, SourceNode>;

/// Exposes a model or library output under another name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputAlias {
    pub data_item: String,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "DL model")]
    Dl,
    #[serde(rename = "custom")]
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library_name: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
    pub inputs: Vec<SourceMapping>,
    pub outputs: Vec<OutputAlias>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demultiply_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gather_from_node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub name: String,
    pub inputs: Vec<String>,
    pub nodes: Vec<NodeConfig>,
    pub outputs: Vec<SourceMapping>,
    /// Makes the entry node a demultiplexer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demultiply_count: Option<i64>,
}

fn check_demultiply_count(owner: &str, count: Option<i64>) -> Result<()> {
    match count {
        Some(c) if !(-1..=MAX_DEMULTIPLY_COUNT).contains(&c) => Err(EngineError::Config(format!(
            "{}: demultiply_count {} is outside -1..={}",
            owner, c, MAX_DEMULTIPLY_COUNT
        ))),
        _ => Ok(()),
    }
}

impl NodeConfig {
    fn to_node_info(&self, pipeline: &str) -> Result<NodeInfo> {
        let owner = format!("pipeline {} node {}", pipeline, self.name);
        if self.name == ENTRY_NODE_NAME || self.name == EXIT_NODE_NAME {
            return Err(EngineError::Config(format!(
                "{}: name is reserved",
                owner
            )));
        }
        check_demultiply_count(&owner, self.demultiply_count)?;

        let mut info = match self.node_type {
            NodeType::Dl => {
                if self.library_name.is_some() {
                    return Err(EngineError::Config(format!(
                        "{}: DL model node cannot have library_name",
                        owner
                    )));
                }
                let model = self.model_name.as_deref().ok_or_else(|| {
                    EngineError::Config(format!("{}: missing model_name", owner))
                })?;
                NodeInfo::dl(&self.name, model, self.version)
            }
            NodeType::Custom => {
                if self.model_name.is_some() {
                    return Err(EngineError::Config(format!(
                        "{}: custom node cannot have model_name",
                        owner
                    )));
                }
                let library = self.library_name.as_deref().ok_or_else(|| {
                    EngineError::Config(format!("{}: missing library_name", owner))
                })?;
                NodeInfo::custom(&self.name, library, self.params.clone())
            }
        };

        for output in &self.outputs {
            info = info.with_output_alias(&output.alias, &output.data_item);
        }
        if let Some(count) = self.demultiply_count {
            info = info.with_demultiply(count);
        }
        if let Some(source) = &self.gather_from_node {
            info = info.with_gather_from(source);
        }
        Ok(info)
    }
}

fn connect_sources(connections: &mut Connections, dependant: &str, mappings: &[SourceMapping]) {
    for (input, source) in mappings.iter().flatten() {
        connect(
            connections,
            &source.node_name,
            dependant,
            &[(source.data_item.as_str(), input.as_str())],
        );
    }
}

impl PipelineConfig {
    /// Node infos and connections of this pipeline, entry and exit included
    pub fn to_topology(&self) -> Result<(Vec<NodeInfo>, Connections)> {
        check_demultiply_count(&format!("pipeline {}", self.name), self.demultiply_count)?;

        let inputs: Vec<&str> = self.inputs.iter().map(String::as_str).collect();
        let mut entry = NodeInfo::entry(ENTRY_NODE_NAME, &inputs);
        if let Some(count) = self.demultiply_count {
            entry = entry.with_demultiply(count);
        }

        let mut nodes = Vec::with_capacity(self.nodes.len() + 2);
        nodes.push(entry);
        let mut connections = Connections::new();
        for node in &self.nodes {
            nodes.push(node.to_node_info(&self.name)?);
            connect_sources(&mut connections, &node.name, &node.inputs);
        }
        nodes.push(NodeInfo::exit(EXIT_NODE_NAME));
        connect_sources(&mut connections, EXIT_NODE_NAME, &self.outputs);

        Ok((nodes, connections))
    }
}

impl PipelineConfigFile {
    /// Parse a definition file from a JSON string
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse pipeline config: {}", e)))
    }

    /// Load a definition file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read pipeline config {:?}: {}", path, e))
        })?;
        Self::from_json(&content)
    }

    /// Save the definition file to disk as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Serialization(format!("pipeline config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            EngineError::Config(format!("Failed to write pipeline config {:?}: {}", path, e))
        })
    }

    /// Build one unvalidated definition per pipeline
    pub fn definitions(&self, settings: &SchedulerSettings) -> Result<Vec<PipelineDefinition>> {
        let mut seen = std::collections::HashSet::new();
        self.pipeline_config_list
            .iter()
            .map(|pipeline| {
                if !seen.insert(pipeline.name.as_str()) {
                    return Err(EngineError::Config(format!(
                        "Duplicate pipeline name {}",
                        pipeline.name
                    )));
                }
                let (nodes, connections) = pipeline.to_topology()?;
                tracing::debug!(
                    pipeline = %pipeline.name,
                    "Loaded pipeline config with {} nodes",
                    nodes.len()
                );
                Ok(PipelineDefinition::new(
                    &pipeline.name,
                    nodes,
                    connections,
                    settings.clone(),
                ))
            })
            .collect()
    }
}
