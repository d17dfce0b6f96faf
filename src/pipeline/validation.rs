//! Static checks of a pipeline definition.
//!
//! Runs once per (re)load, never on the request path. Checks are applied
//! in order: node set, node targets (models, libraries, gather sources),
//! connections, cycles, reachability of the exit node, and finally the
//! nesting of demultiplexer and gather levels along every path.

use crate::accelerator::ModelManager;
use crate::pipeline::definition::{Connections, NodeInfo, NodeKindInfo};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::nodes::NodeLibraryRegistry;
use crate::types::TensorInfoMap;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Declared inputs and outputs of a model or library node
struct NodeSpecs {
    inputs: TensorInfoMap,
    outputs: TensorInfoMap,
}

/// Validate a topology. Returns the demultiplexer levels the exit node
/// has to gather.
pub fn validate(
    nodes: &[NodeInfo],
    connections: &Connections,
    manager: &dyn ModelManager,
    libraries: &NodeLibraryRegistry,
) -> PipelineResult<BTreeSet<String>> {
    let by_name = validate_node_set(nodes)?;
    let specs = resolve_specs(nodes, manager, libraries)?;
    validate_gather_sources(nodes, &by_name)?;
    validate_connections(nodes, connections, &by_name, &specs)?;
    let order = topological_order(nodes, connections)?;
    validate_all_reach_exit(nodes, connections)?;
    demultiplexer_levels(&order, connections, &by_name)
}

fn validate_node_set(nodes: &[NodeInfo]) -> PipelineResult<HashMap<&str, &NodeInfo>> {
    let entries = nodes.iter().filter(|n| n.is_entry()).count();
    let exits = nodes.iter().filter(|n| n.is_exit()).count();
    if entries == 0 || exits == 0 {
        return Err(PipelineError::MissingEntryOrExit);
    }
    if entries > 1 {
        return Err(PipelineError::MultipleEntryNodes);
    }
    if exits > 1 {
        return Err(PipelineError::MultipleExitNodes);
    }

    let mut by_name = HashMap::with_capacity(nodes.len());
    for node in nodes {
        if by_name.insert(node.name.as_str(), node).is_some() {
            return Err(PipelineError::NodeNameDuplicate(node.name.clone()));
        }
    }
    Ok(by_name)
}

fn resolve_specs<'a>(
    nodes: &'a [NodeInfo],
    manager: &dyn ModelManager,
    libraries: &NodeLibraryRegistry,
) -> PipelineResult<HashMap<&'a str, NodeSpecs>> {
    let mut specs = HashMap::new();
    for node in nodes {
        let node_specs = match &node.kind {
            NodeKindInfo::Dl {
                model_name,
                model_version,
            } => {
                let (model, _guard) = manager
                    .find_model_instance(model_name, *model_version)
                    .map_err(|e| {
                        tracing::debug!(node = %node.name, "Model lookup failed: {}", e);
                        PipelineError::NodeReferringToMissingModel {
                            node: node.name.clone(),
                            model: model_name.clone(),
                        }
                    })?;
                NodeSpecs {
                    inputs: model.inputs_info(),
                    outputs: model.outputs_info(),
                }
            }
            NodeKindInfo::Custom {
                library_name,
                params,
            } => {
                let library = libraries.get(library_name)?;
                let info_failed = |what: &str, code: i32| {
                    PipelineError::InvalidNodeLibrary(format!(
                        "{}: {} failed with code {}",
                        library_name, what, code
                    ))
                };
                NodeSpecs {
                    inputs: library
                        .inputs_info(params)
                        .map_err(|code| info_failed("inputs_info", code))?,
                    outputs: library
                        .outputs_info(params)
                        .map_err(|code| info_failed("outputs_info", code))?,
                }
            }
            NodeKindInfo::Entry { .. } | NodeKindInfo::Exit => continue,
        };
        specs.insert(node.name.as_str(), node_specs);
    }
    Ok(specs)
}

fn validate_gather_sources(
    nodes: &[NodeInfo],
    by_name: &HashMap<&str, &NodeInfo>,
) -> PipelineResult<()> {
    for node in nodes {
        for source in &node.gather_from {
            let Some(demultiplexer) = by_name.get(source.as_str()) else {
                return Err(PipelineError::NodeGatherFromNotExistingNode {
                    node: node.name.clone(),
                    gather_from: source.clone(),
                });
            };
            if demultiplexer.demultiply_count.is_none() {
                return Err(PipelineError::NodeGatherFromNotDemultiplexer {
                    node: node.name.clone(),
                    gather_from: source.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_connections(
    nodes: &[NodeInfo],
    connections: &Connections,
    by_name: &HashMap<&str, &NodeInfo>,
    specs: &HashMap<&str, NodeSpecs>,
) -> PipelineResult<()> {
    for (dependant_name, dependencies) in connections {
        let Some(dependant) = by_name.get(dependant_name.as_str()) else {
            if let Some(dependency) = dependencies.keys().next() {
                return Err(PipelineError::NodeReferringToMissingNode {
                    node: dependency.clone(),
                    missing: dependant_name.clone(),
                });
            }
            continue;
        };
        if dependant.is_entry() && !dependencies.is_empty() {
            return Err(PipelineError::Unsupported(format!(
                "entry node {} cannot have dependencies",
                dependant_name
            )));
        }

        let mut connected_inputs: HashSet<&str> = HashSet::new();
        for (dependency_name, aliases) in dependencies {
            let Some(dependency) = by_name.get(dependency_name.as_str()) else {
                return Err(PipelineError::NodeReferringToMissingNode {
                    node: dependant_name.clone(),
                    missing: dependency_name.clone(),
                });
            };
            if dependency.is_exit() {
                return Err(PipelineError::ExitUsedAsNodeDependency(dependency_name.clone()));
            }

            for (output, input) in aliases {
                if !produces_output(dependency, specs.get(dependency_name.as_str()), output) {
                    return Err(PipelineError::NodeReferringToMissingModelOutput {
                        node: dependant_name.clone(),
                        dependency: dependency_name.clone(),
                        output: output.clone(),
                    });
                }
                if let Some(dependant_specs) = specs.get(dependant_name.as_str()) {
                    if !dependant_specs.inputs.contains_key(input) {
                        return Err(PipelineError::ConnectionToMissingModelInput {
                            node: dependant_name.clone(),
                            input: input.clone(),
                        });
                    }
                }
                if !connected_inputs.insert(input.as_str()) {
                    return Err(PipelineError::ModelInputConnectedToMultipleDataSources {
                        node: dependant_name.clone(),
                        input: input.clone(),
                    });
                }
            }
        }
    }

    for node in nodes {
        let Some(node_specs) = specs.get(node.name.as_str()) else {
            continue;
        };
        let connected: HashSet<&str> = connections
            .get(&node.name)
            .into_iter()
            .flat_map(|deps| deps.values())
            .flat_map(|aliases| aliases.iter().map(|(_, input)| input.as_str()))
            .collect();
        if let Some(missing) = node_specs
            .inputs
            .keys()
            .find(|input| !connected.contains(input.as_str()))
        {
            return Err(PipelineError::NotAllInputsConnected {
                node: node.name.clone(),
                input: missing.clone(),
            });
        }
    }
    Ok(())
}

fn produces_output(dependency: &NodeInfo, specs: Option<&NodeSpecs>, alias: &str) -> bool {
    match &dependency.kind {
        NodeKindInfo::Entry { inputs } => inputs.iter().any(|i| i == alias),
        NodeKindInfo::Dl { .. } | NodeKindInfo::Custom { .. } => {
            match (dependency.output_aliases.get(alias), specs) {
                (Some(real_name), Some(specs)) => specs.outputs.contains_key(real_name),
                _ => false,
            }
        }
        NodeKindInfo::Exit => false,
    }
}

/// Kahn's algorithm over dependency -> dependant edges.
fn topological_order<'a>(
    nodes: &'a [NodeInfo],
    connections: &Connections,
) -> PipelineResult<Vec<&'a str>> {
    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), i))
        .collect();
    let n = nodes.len();
    let mut in_degree = vec![0u32; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (dependant, dependencies) in connections {
        let Some(&to) = index.get(dependant.as_str()) else {
            continue;
        };
        for dependency in dependencies.keys() {
            if let Some(&from) = index.get(dependency.as_str()) {
                adj[from].push(to);
                in_degree[to] += 1;
            }
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(node) = queue.pop() {
        order.push(nodes[node].name.as_str());
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push(next);
            }
        }
    }

    if order.len() != n {
        tracing::debug!("Only {} of {} nodes could be ordered", order.len(), n);
        return Err(PipelineError::CycleFound);
    }
    Ok(order)
}

fn validate_all_reach_exit(nodes: &[NodeInfo], connections: &Connections) -> PipelineResult<()> {
    let Some(exit) = nodes.iter().find(|n| n.is_exit()) else {
        return Err(PipelineError::MissingEntryOrExit);
    };
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![exit.name.as_str()];
    while let Some(name) = stack.pop() {
        if !visited.insert(name) {
            continue;
        }
        if let Some(dependencies) = connections.get(name) {
            stack.extend(dependencies.keys().map(String::as_str));
        }
    }
    if let Some(unconnected) = nodes.iter().find(|n| !visited.contains(n.name.as_str())) {
        tracing::debug!(node = %unconnected.name, "Node does not lead to the exit node");
        return Err(PipelineError::ContainsUnconnectedNodes);
    }
    Ok(())
}

/// Track the open demultiplexer levels through the graph in topological
/// order. Gathers must close the innermost levels, every dependency of a
/// node must carry the same levels, and whatever is still open at the exit
/// node is gathered there.
fn demultiplexer_levels(
    order: &[&str],
    connections: &Connections,
    by_name: &HashMap<&str, &NodeInfo>,
) -> PipelineResult<BTreeSet<String>> {
    let mut levels_out: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut exit_gather = BTreeSet::new();

    for &name in order {
        let Some(node) = by_name.get(name) else {
            continue;
        };
        let mut incoming = connections
            .get(name)
            .into_iter()
            .flat_map(|deps| deps.keys())
            .map(|dep| levels_out.get(dep.as_str()).cloned().unwrap_or_default());
        let levels_in = incoming.next().unwrap_or_default();
        if incoming.any(|other| other != levels_in) {
            return Err(PipelineError::WrongDemultiplexerGatherNodesOrder(format!(
                "inputs of node {} come from different demultiplexer levels",
                name
            )));
        }

        let gathered = node.gather_from.len();
        if gathered > 0 {
            let innermost: BTreeSet<String> = levels_in
                .iter()
                .rev()
                .take(gathered)
                .cloned()
                .collect();
            if gathered > levels_in.len() || innermost != node.gather_from {
                return Err(PipelineError::WrongDemultiplexerGatherNodesOrder(format!(
                    "node {} gathers from [{}] but the innermost open levels are [{}]",
                    name,
                    node.gather_from.iter().cloned().collect::<Vec<_>>().join(", "),
                    levels_in.join(", ")
                )));
            }
        }

        let mut out = if node.is_exit() {
            exit_gather = levels_in.iter().cloned().collect();
            Vec::new()
        } else {
            levels_in[..levels_in.len() - gathered].to_vec()
        };
        if node.demultiply_count.is_some() {
            if node.is_exit() {
                return Err(PipelineError::Unsupported(format!(
                    "exit node {} cannot demultiply",
                    name
                )));
            }
            out.push(name.to_string());
        }
        levels_out.insert(name, out);
    }
    Ok(exit_gather)
}

#[cfg(all(test, feature = "mock-accelerator"))]
mod tests {
    use super::*;
    use crate::accelerator::mock::{MockAcceleratorManager, MockModelConfig};
    use crate::pipeline::definition::connect;
    use crate::pipeline::nodes::{CustomNodeLibrary, CustomNodeTensor};
    use crate::pipeline::nodes::custom::NodeParams;
    use crate::types::{Precision, TensorInfo, TensorMap};
    use std::sync::Arc;

    fn manager() -> MockAcceleratorManager {
        let manager = MockAcceleratorManager::new().unwrap();
        manager.load(MockModelConfig::dummy("dummy", 10));
        manager
    }

    /// Library with one input "x" and one output "y".
    struct Passthrough;

    impl CustomNodeLibrary for Passthrough {
        fn execute(&self, _inputs: &TensorMap, _params: &NodeParams) -> Result<Vec<CustomNodeTensor>, i32> {
            Err(1)
        }
        fn inputs_info(&self, _params: &NodeParams) -> Result<TensorInfoMap, i32> {
            Ok([("x".to_string(), TensorInfo::new("x", Precision::FP32, &[1, 10]))].into())
        }
        fn outputs_info(&self, _params: &NodeParams) -> Result<TensorInfoMap, i32> {
            Ok([("y".to_string(), TensorInfo::new("y", Precision::FP32, &[1, 10]))].into())
        }
    }

    fn libraries() -> NodeLibraryRegistry {
        let mut libraries = NodeLibraryRegistry::new();
        libraries.register("passthrough", Arc::new(Passthrough));
        libraries
    }

    fn basic_nodes() -> Vec<NodeInfo> {
        vec![
            NodeInfo::entry("request", &["in"]),
            NodeInfo::dl("dummy_node", "dummy", None).with_output_alias("a_alias", "a"),
            NodeInfo::exit("response"),
        ]
    }

    fn basic_connections() -> Connections {
        let mut connections = Connections::new();
        connect(&mut connections, "request", "dummy_node", &[("in", "b")]);
        connect(&mut connections, "dummy_node", "response", &[("a_alias", "out")]);
        connections
    }

    fn check(nodes: &[NodeInfo], connections: &Connections) -> PipelineResult<BTreeSet<String>> {
        validate(nodes, connections, &manager(), &libraries())
    }

    #[test]
    fn test_valid_pipeline() {
        assert!(check(&basic_nodes(), &basic_connections()).unwrap().is_empty());
    }

    #[test]
    fn test_entry_exit_count() {
        let nodes = vec![NodeInfo::entry("request", &["in"])];
        assert_eq!(check(&nodes, &Connections::new()), Err(PipelineError::MissingEntryOrExit));

        let mut nodes = basic_nodes();
        nodes.push(NodeInfo::entry("request2", &["in"]));
        assert_eq!(check(&nodes, &basic_connections()), Err(PipelineError::MultipleEntryNodes));

        let mut nodes = basic_nodes();
        nodes.push(NodeInfo::exit("response2"));
        assert_eq!(check(&nodes, &basic_connections()), Err(PipelineError::MultipleExitNodes));
    }

    #[test]
    fn test_duplicate_names() {
        let mut nodes = basic_nodes();
        nodes.push(NodeInfo::dl("dummy_node", "dummy", None));
        assert_eq!(
            check(&nodes, &basic_connections()),
            Err(PipelineError::NodeNameDuplicate("dummy_node".into()))
        );
    }

    #[test]
    fn test_missing_model_and_library() {
        let mut nodes = basic_nodes();
        nodes[1] = NodeInfo::dl("dummy_node", "nope", None).with_output_alias("a_alias", "a");
        assert!(matches!(
            check(&nodes, &basic_connections()),
            Err(PipelineError::NodeReferringToMissingModel { model, .. }) if model == "nope"
        ));

        let mut nodes = basic_nodes();
        nodes.push(NodeInfo::custom("c", "unknown_lib", NodeParams::new()));
        assert_eq!(
            check(&nodes, &basic_connections()),
            Err(PipelineError::InvalidNodeLibrary("unknown_lib".into()))
        );
    }

    #[test]
    fn test_connection_errors() {
        let mut connections = basic_connections();
        connect(&mut connections, "ghost", "response", &[("x", "y")]);
        assert!(matches!(
            check(&basic_nodes(), &connections),
            Err(PipelineError::NodeReferringToMissingNode { missing, .. }) if missing == "ghost"
        ));

        let mut connections = basic_connections();
        connect(&mut connections, "response", "dummy_node", &[("out", "b2")]);
        assert_eq!(
            check(&basic_nodes(), &connections),
            Err(PipelineError::ExitUsedAsNodeDependency("response".into()))
        );

        let mut connections = basic_connections();
        connect(&mut connections, "dummy_node", "response", &[("missing_alias", "x")]);
        assert!(matches!(
            check(&basic_nodes(), &connections),
            Err(PipelineError::NodeReferringToMissingModelOutput { output, .. }) if output == "missing_alias"
        ));
    }

    #[test]
    fn test_model_input_errors() {
        let mut connections = Connections::new();
        connect(&mut connections, "request", "dummy_node", &[("in", "not_an_input")]);
        connect(&mut connections, "dummy_node", "response", &[("a_alias", "out")]);
        assert!(matches!(
            check(&basic_nodes(), &connections),
            Err(PipelineError::ConnectionToMissingModelInput { input, .. }) if input == "not_an_input"
        ));

        let mut connections = basic_connections();
        connect(&mut connections, "request", "dummy_node", &[("in", "b")]);
        assert!(matches!(
            check(&basic_nodes(), &connections),
            Err(PipelineError::ModelInputConnectedToMultipleDataSources { input, .. }) if input == "b"
        ));

        let mut connections = Connections::new();
        connect(&mut connections, "dummy_node", "response", &[("a_alias", "out")]);
        connect(&mut connections, "request", "response", &[("in", "echo")]);
        assert!(matches!(
            check(&basic_nodes(), &connections),
            Err(PipelineError::NotAllInputsConnected { input, .. }) if input == "b"
        ));
    }

    #[test]
    fn test_cycle_found() {
        let nodes = vec![
            NodeInfo::entry("request", &["in"]),
            NodeInfo::custom("c1", "passthrough", NodeParams::new()).with_output_alias("y", "y"),
            NodeInfo::custom("c2", "passthrough", NodeParams::new()).with_output_alias("y", "y"),
            NodeInfo::exit("response"),
        ];
        let mut connections = Connections::new();
        connect(&mut connections, "c2", "c1", &[("y", "x")]);
        connect(&mut connections, "c1", "c2", &[("y", "x")]);
        connect(&mut connections, "c2", "response", &[("y", "out")]);
        connect(&mut connections, "request", "response", &[("in", "echo")]);
        assert_eq!(check(&nodes, &connections), Err(PipelineError::CycleFound));
    }

    #[test]
    fn test_unconnected_node() {
        let mut nodes = basic_nodes();
        nodes.push(NodeInfo::custom("side", "passthrough", NodeParams::new()).with_output_alias("y", "y"));
        let mut connections = basic_connections();
        connect(&mut connections, "request", "side", &[("in", "x")]);
        assert_eq!(check(&nodes, &connections), Err(PipelineError::ContainsUnconnectedNodes));
    }

    #[test]
    fn test_gather_sources() {
        let mut nodes = basic_nodes();
        nodes[2] = NodeInfo::exit("response").with_gather_from("nowhere");
        assert!(matches!(
            check(&nodes, &basic_connections()),
            Err(PipelineError::NodeGatherFromNotExistingNode { .. })
        ));

        let mut nodes = basic_nodes();
        nodes[2] = NodeInfo::exit("response").with_gather_from("dummy_node");
        assert!(matches!(
            check(&nodes, &basic_connections()),
            Err(PipelineError::NodeGatherFromNotDemultiplexer { .. })
        ));
    }

    #[test]
    fn test_exit_gathers_open_levels_implicitly() {
        let mut nodes = basic_nodes();
        nodes[0] = NodeInfo::entry("request", &["in"]).with_demultiply(-1);
        assert_eq!(
            check(&nodes, &basic_connections()).unwrap(),
            ["request".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_gather_must_close_innermost_level() {
        let nodes = vec![
            NodeInfo::entry("request", &["in"]).with_demultiply(-1),
            NodeInfo::dl("dummy_node", "dummy", None)
                .with_output_alias("a_alias", "a")
                .with_demultiply(-1),
            NodeInfo::custom("c", "passthrough", NodeParams::new())
                .with_output_alias("y", "y")
                .with_gather_from("request"),
            NodeInfo::exit("response"),
        ];
        let mut connections = Connections::new();
        connect(&mut connections, "request", "dummy_node", &[("in", "b")]);
        connect(&mut connections, "dummy_node", "c", &[("a_alias", "x")]);
        connect(&mut connections, "c", "response", &[("y", "out")]);
        assert!(matches!(
            check(&nodes, &connections),
            Err(PipelineError::WrongDemultiplexerGatherNodesOrder(_))
        ));
    }

    #[test]
    fn test_mixed_levels_at_one_node() {
        let nodes = vec![
            NodeInfo::entry("request", &["in"]),
            NodeInfo::dl("dummy_node", "dummy", None)
                .with_output_alias("a_alias", "a")
                .with_demultiply(-1),
            NodeInfo::exit("response"),
        ];
        let mut connections = basic_connections();
        connect(&mut connections, "request", "response", &[("in", "echo")]);
        assert!(matches!(
            check(&nodes, &connections),
            Err(PipelineError::WrongDemultiplexerGatherNodesOrder(_))
        ));
    }
}
