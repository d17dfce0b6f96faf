//! CustomNode: runs a user-provided node library synchronously.
//!
//! Libraries are looked up by name in a [`NodeLibraryRegistry`]. Their
//! outputs are validated before anything downstream can see them.

use super::NodeContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node_session::NodeSession;
use crate::types::{Precision, Tensor, TensorInfoMap, TensorMap};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Library parameters from the pipeline definition
pub type NodeParams = BTreeMap<String, String>;

/// One output produced by a node library
#[derive(Debug, Clone, PartialEq)]
pub struct CustomNodeTensor {
    pub name: String,
    pub precision: Precision,
    pub dims: Vec<usize>,
    pub data: Vec<u8>,
}

/// User-provided processing step. Errors are library-defined status codes.
pub trait CustomNodeLibrary: Send + Sync {
    fn execute(&self, inputs: &TensorMap, params: &NodeParams) -> Result<Vec<CustomNodeTensor>, i32>;

    fn inputs_info(&self, params: &NodeParams) -> Result<TensorInfoMap, i32>;

    fn outputs_info(&self, params: &NodeParams) -> Result<TensorInfoMap, i32>;
}

/// Node libraries by name
#[derive(Clone, Default)]
pub struct NodeLibraryRegistry {
    libraries: HashMap<String, Arc<dyn CustomNodeLibrary>>,
}

impl NodeLibraryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, library: Arc<dyn CustomNodeLibrary>) {
        let name = name.into();
        tracing::info!("Registered node library {}", name);
        self.libraries.insert(name, library);
    }

    pub fn get(&self, name: &str) -> PipelineResult<Arc<dyn CustomNodeLibrary>> {
        self.libraries
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::InvalidNodeLibrary(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.libraries.contains_key(name)
    }
}

/// Turn library outputs into tensors, rejecting malformed ones.
pub fn validate_outputs(outputs: Vec<CustomNodeTensor>) -> PipelineResult<TensorMap> {
    if outputs.is_empty() {
        return Err(PipelineError::NodeLibraryOutputsCorruptedCount);
    }
    let mut tensors = TensorMap::new();
    for output in outputs {
        if output.name.is_empty() {
            return Err(PipelineError::NodeLibraryOutputMissingName);
        }
        if output.dims.is_empty() {
            return Err(PipelineError::NodeLibraryInvalidShape(output.name));
        }
        let expected = output
            .dims
            .iter()
            .try_fold(output.precision.size(), |acc, &dim| acc.checked_mul(dim));
        let Some(expected) = expected else {
            return Err(PipelineError::NodeLibraryInvalidShape(output.name));
        };
        if output.data.len() != expected {
            return Err(PipelineError::NodeLibraryInvalidContentSize {
                name: output.name,
                expected,
                actual: output.data.len(),
            });
        }
        let tensor = Tensor::new(output.precision, output.dims, output.data)?;
        tensors.insert(output.name, tensor);
    }
    Ok(tensors)
}

pub struct CustomNode {
    library_name: String,
    library: Arc<dyn CustomNodeLibrary>,
    params: NodeParams,
    /// Output alias -> library output name
    output_aliases: BTreeMap<String, String>,
}

impl CustomNode {
    pub fn new(
        library_name: impl Into<String>,
        library: Arc<dyn CustomNodeLibrary>,
        params: NodeParams,
        output_aliases: BTreeMap<String, String>,
    ) -> Self {
        Self {
            library_name: library_name.into(),
            library,
            params,
            output_aliases,
        }
    }

    pub fn library_name(&self) -> &str {
        &self.library_name
    }

    /// Run the library and keep its outputs on the session.
    pub fn execute(&self, session: &mut NodeSession, ctx: &NodeContext) -> PipelineResult<()> {
        let inputs = session.input_handler().get_inputs();
        let outputs = self.library.execute(&inputs, &self.params).map_err(|code| {
            tracing::warn!(
                node = %ctx.node_name,
                "Node library {} failed with code {}",
                self.library_name,
                code
            );
            PipelineError::NodeLibraryExecutionFailed(code)
        })?;
        for (name, tensor) in validate_outputs(outputs)? {
            session.outputs_mut().set_output(name, tensor);
        }
        session.input_handler().clear_inputs();
        ctx.events.push(ctx.node_id, session.key().clone());
        Ok(())
    }

    pub fn fetch_results(
        &self,
        session: &mut NodeSession,
        required_outputs: &BTreeSet<String>,
    ) -> PipelineResult<TensorMap> {
        let produced = session.outputs_mut().take();
        let mut outputs = TensorMap::new();
        for alias in required_outputs {
            let real_name = self.output_aliases.get(alias).ok_or_else(|| {
                PipelineError::InvalidMissingOutput(format!(
                    "library {} has no output aliased {}",
                    self.library_name, alias
                ))
            })?;
            let tensor = produced
                .get(real_name)
                .ok_or_else(|| PipelineError::NodeLibraryMissingOutput(real_name.clone()))?;
            outputs.insert(alias.clone(), tensor.clone());
        }
        Ok(outputs)
    }
}
