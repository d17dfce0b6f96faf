//! EntryNode: seeds a request's graph with the request tensors.

use super::NodeContext;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node_session::NodeSession;
use crate::types::{InferenceRequest, TensorMap};
use std::sync::Arc;

pub struct EntryNode {
    request: Arc<InferenceRequest>,
    /// Pipeline input names this node exposes as outputs
    input_names: Vec<String>,
}

impl EntryNode {
    pub fn new(request: Arc<InferenceRequest>, input_names: Vec<String>) -> Self {
        Self {
            request,
            input_names,
        }
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Nothing to compute; completes immediately.
    pub fn execute(&self, session: &mut NodeSession, ctx: &NodeContext) -> PipelineResult<()> {
        ctx.events.push(ctx.node_id, session.key().clone());
        Ok(())
    }

    pub fn fetch_results(&self) -> PipelineResult<TensorMap> {
        self.input_names
            .iter()
            .map(|name| {
                self.request
                    .inputs
                    .get(name)
                    .map(|tensor| (name.clone(), tensor.clone()))
                    .ok_or_else(|| {
                        PipelineError::InvalidMissingInput(format!(
                            "request is missing pipeline input {}",
                            name
                        ))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tensor;

    #[test]
    fn test_fetch_reports_missing_input() {
        let request = InferenceRequest::new()
            .with_input("a", Tensor::from_f32(vec![1, 1], &[1.0]).unwrap());
        let node = EntryNode::new(Arc::new(request), vec!["a".into(), "b".into()]);
        assert!(matches!(
            node.fetch_results(),
            Err(PipelineError::InvalidMissingInput(msg)) if msg.contains(" b")
        ));

        let node = EntryNode::new(node.request.clone(), vec!["a".into()]);
        assert_eq!(node.fetch_results().unwrap().len(), 1);
    }
}
