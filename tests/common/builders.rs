//! Test data builders for creating pipeline definitions and requests

use dagserve::config::SchedulerSettings;
use dagserve::pipeline::{
    connect, Connections, NodeInfo, PipelineDefinition, ENTRY_NODE_NAME, EXIT_NODE_NAME,
};
use dagserve::types::{InferenceRequest, Tensor};

/// Builder for pipeline definitions
///
/// Starts with an entry node taking `inputs` and an exit node; nodes and
/// connections are added in between.
pub struct DefinitionBuilder {
    name: String,
    nodes: Vec<NodeInfo>,
    exit: NodeInfo,
    connections: Connections,
    settings: SchedulerSettings,
}

impl DefinitionBuilder {
    pub fn new(name: &str, inputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            nodes: vec![NodeInfo::entry(ENTRY_NODE_NAME, inputs)],
            exit: NodeInfo::exit(EXIT_NODE_NAME),
            connections: Connections::new(),
            settings: SchedulerSettings::default(),
        }
    }

    /// Make the entry node demultiply its inputs
    pub fn demultiply_entry(mut self, count: i64) -> Self {
        let entry = self.nodes.remove(0).with_demultiply(count);
        self.nodes.insert(0, entry);
        self
    }

    pub fn node(mut self, node: NodeInfo) -> Self {
        self.nodes.push(node);
        self
    }

    /// Connect `dependency`'s output to `dependant`'s input
    pub fn edge(mut self, dependency: &str, output: &str, dependant: &str, input: &str) -> Self {
        connect(&mut self.connections, dependency, dependant, &[(output, input)]);
        self
    }

    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(mut self) -> PipelineDefinition {
        self.nodes.push(self.exit);
        PipelineDefinition::new(self.name, self.nodes, self.connections, self.settings)
    }
}

/// entry("in") -> dummy_node (b -> a) -> exit("out")
pub fn single_dummy_definition(model: &str) -> PipelineDefinition {
    DefinitionBuilder::new("single_dummy", &["in"])
        .node(NodeInfo::dl("dummy_node", model, None).with_output_alias("a", "a"))
        .edge(ENTRY_NODE_NAME, "in", "dummy_node", "b")
        .edge("dummy_node", "a", EXIT_NODE_NAME, "out")
        .build()
}

/// Request with a single f32 input
pub fn f32_request(input: &str, shape: &[usize], values: &[f32]) -> InferenceRequest {
    let tensor = Tensor::from_f32(shape.to_vec(), values).expect("valid test tensor");
    InferenceRequest::new().with_input(input, tensor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_builder() {
        let definition = DefinitionBuilder::new("p", &["in"])
            .demultiply_entry(-1)
            .node(NodeInfo::dl("d", "dummy", None))
            .edge(ENTRY_NODE_NAME, "in", "d", "b")
            .build();

        let nodes = definition.node_infos();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].demultiply_count, Some(-1));
        assert!(nodes[2].is_exit());
    }
}
