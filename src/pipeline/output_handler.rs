//! Outputs produced by a node session, held until the scheduler fetches them.

use crate::types::{Tensor, TensorMap};

#[derive(Debug, Default)]
pub struct NodeOutputHandler {
    outputs: TensorMap,
}

impl NodeOutputHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.outputs.insert(name.into(), tensor);
    }

    pub fn output(&self, name: &str) -> Option<&Tensor> {
        self.outputs.get(name)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Move the outputs out, leaving the handler empty.
    pub fn take(&mut self) -> TensorMap {
        std::mem::take(&mut self.outputs)
    }
}
