//! Pipeline executor: the per-request event loop and graph scheduler.
//!
//! One [`Pipeline`] serves exactly one request. [`Pipeline::execute`] runs on
//! the caller's thread:
//! 1. Seed the entry node's root session and dispatch it.
//! 2. Block on the event queue for the next finished `(node, session)`.
//! 3. Fetch its results and route them to every dependant over that edge.
//! 4. Dispatch the sessions that became ready.
//! 5. Between events, retry sessions deferred for lack of a free stream.
//!
//! The first failure stops new dispatches. Deferred sessions are disarmed,
//! sessions whose inference is in flight are awaited and released, and the
//! failure becomes the request's result.

use crate::accelerator::ModelManager;
use crate::config::SchedulerSettings;
use crate::pipeline::definition::DefinitionUnloadGuard;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event_queue::{EventSender, PipelineEventQueue};
use crate::pipeline::id::{EdgeId, NodeId};
use crate::pipeline::node::{Dependency, Node};
use crate::pipeline::nodes::NodeKind;
use crate::pipeline::session_metadata::SessionKey;
use crate::types::InferenceResponse;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// A session waiting for a free stream
struct Deferred {
    node: NodeId,
    key: SessionKey,
    since: Instant,
}

/// Bookkeeping of one `execute` call
#[derive(Default)]
struct RunState {
    started: HashSet<(NodeId, SessionKey)>,
    finished: HashSet<(NodeId, SessionKey)>,
    deferred: Vec<Deferred>,
    first_error: Option<PipelineError>,
    exit_done: bool,
}

impl RunState {
    fn in_flight(&self) -> usize {
        self.started.len() - self.finished.len()
    }
}

/// The node graph of one request and its executor.
pub struct Pipeline {
    name: String,
    nodes: Vec<Node>,
    entry: NodeId,
    exit: NodeId,
    edge_count: u32,
    events: PipelineEventQueue,
    manager: Arc<dyn ModelManager>,
    settings: SchedulerSettings,
    response: Arc<Mutex<InferenceResponse>>,
    _definition_guard: Option<DefinitionUnloadGuard>,
}

impl Pipeline {
    pub fn new(
        name: impl Into<String>,
        manager: Arc<dyn ModelManager>,
        settings: SchedulerSettings,
        response: Arc<Mutex<InferenceResponse>>,
    ) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            entry: NodeId::INVALID,
            exit: NodeId::INVALID,
            edge_count: 0,
            events: PipelineEventQueue::new(),
            manager,
            settings,
            response,
            _definition_guard: None,
        }
    }

    /// Keep the owning definition loaded for as long as this pipeline lives.
    pub fn with_definition_guard(mut self, guard: DefinitionUnloadGuard) -> Self {
        self._definition_guard = Some(guard);
        self
    }

    // ── Graph building ──

    /// Add a node to the pipeline. Returns its NodeId.
    pub fn add_node(&mut self, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        node.set_id(id);
        match node.kind() {
            NodeKind::Entry(_) => self.entry = id,
            NodeKind::Exit(_) => self.exit = id,
            _ => {}
        }
        self.nodes.push(node);
        id
    }

    /// Connect `dependency` to `dependant`, delivering each
    /// `(output alias, input name)` pair over one edge.
    pub fn connect(
        &mut self,
        dependency: NodeId,
        dependant: NodeId,
        aliases: Vec<(String, String)>,
    ) -> PipelineResult<EdgeId> {
        if dependency.index() >= self.nodes.len() || dependant.index() >= self.nodes.len() {
            return Err(PipelineError::Internal(format!(
                "connecting unknown nodes {} -> {}",
                dependency, dependant
            )));
        }
        self.nodes[dependency.index()]
            .add_dependant(dependant, aliases.iter().map(|(out, _)| out.as_str()))?;
        let edge = EdgeId(self.edge_count);
        self.edge_count += 1;
        self.nodes[dependant.index()].add_dependency(Dependency {
            node: dependency,
            edge,
            aliases,
        });
        Ok(edge)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ── Execution ──

    /// Run the request to completion and return the exit node's response.
    pub fn execute(&mut self) -> PipelineResult<InferenceResponse> {
        if !self.entry.is_valid() || !self.exit.is_valid() {
            return Err(PipelineError::MissingEntryOrExit);
        }
        let started_at = Instant::now();
        tracing::debug!(pipeline = %self.name, "Started execution");

        let sender = self.events.sender();
        let mut run = RunState::default();
        let root = self.nodes[self.entry.index()].create_root_session();
        self.dispatch(self.entry, root, Instant::now(), &sender, &mut run);

        let poll_timeout = self.settings.event_poll_timeout();
        loop {
            if run.exit_done {
                break;
            }
            if run.first_error.is_some() && run.in_flight() == 0 {
                break;
            }
            match self.events.try_pull(poll_timeout) {
                Some((node, key)) => self.handle_completion(node, key, &sender, &mut run),
                None => {
                    tracing::trace!(
                        pipeline = %self.name,
                        in_flight = run.in_flight(),
                        deferred = run.deferred.len(),
                        "No completion within poll timeout"
                    );
                    if run.first_error.is_none()
                        && run.in_flight() == 0
                        && run.deferred.is_empty()
                        && self.events.is_empty()
                    {
                        self.fail(
                            PipelineError::Internal("pipeline stalled before reaching exit".into()),
                            &mut run,
                        );
                    }
                }
            }
            self.retry_deferred(&sender, &mut run);
        }

        if let Some(error) = run.first_error {
            tracing::warn!(
                pipeline = %self.name,
                "Execution failed after {:?}: {}",
                started_at.elapsed(),
                error
            );
            return Err(error);
        }
        tracing::debug!(pipeline = %self.name, "Finished execution in {:?}", started_at.elapsed());
        let mut response = self.response.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::take(&mut *response))
    }

    fn dispatch(
        &mut self,
        node: NodeId,
        key: SessionKey,
        since: Instant,
        sender: &EventSender,
        run: &mut RunState,
    ) {
        if run.first_error.is_some() {
            let node = &mut self.nodes[node.index()];
            node.try_disarm(&key);
            node.release(&key);
            return;
        }
        let result = self.nodes[node.index()].execute(
            &key,
            sender,
            self.manager.as_ref(),
            self.settings.stream_wait_timeout(),
        );
        match result {
            Ok(()) => {
                run.started.insert((node, key));
            }
            Err(PipelineError::StreamIdNotReadyYet) => {
                run.deferred.push(Deferred { node, key, since });
            }
            Err(error) => {
                self.nodes[node.index()].release(&key);
                self.fail(error, run);
            }
        }
    }

    fn retry_deferred(&mut self, sender: &EventSender, run: &mut RunState) {
        if run.deferred.is_empty() {
            return;
        }
        let residency = self.settings.max_deferred_residency();
        for deferred in std::mem::take(&mut run.deferred) {
            if let Some(limit) = residency {
                let waited = deferred.since.elapsed();
                if waited > limit {
                    let node = &mut self.nodes[deferred.node.index()];
                    let error = PipelineError::StreamAcquireTimeout {
                        node: node.name().to_string(),
                        waited_ms: waited.as_millis() as u64,
                    };
                    node.try_disarm(&deferred.key);
                    node.release(&deferred.key);
                    self.fail(error, run);
                    continue;
                }
            }
            self.dispatch(deferred.node, deferred.key, deferred.since, sender, run);
        }
    }

    fn handle_completion(
        &mut self,
        node: NodeId,
        key: SessionKey,
        sender: &EventSender,
        run: &mut RunState,
    ) {
        run.finished.insert((node, key.clone()));
        if run.first_error.is_some() {
            self.nodes[node.index()].release(&key);
            return;
        }

        let results = match self.nodes[node.index()].fetch_results(&key) {
            Ok(results) => results,
            Err(error) => {
                self.fail(error, run);
                return;
            }
        };
        tracing::debug!(
            pipeline = %self.name,
            node = %self.nodes[node.index()].name(),
            session = %key,
            "Session finished"
        );
        if node == self.exit {
            run.exit_done = true;
            return;
        }

        let dependants = self.nodes[node.index()].dependants().to_vec();
        for dependant in dependants {
            match self.nodes[dependant.index()].set_inputs(node, &results) {
                Ok(ready) => {
                    for ready_key in ready {
                        self.dispatch(dependant, ready_key, Instant::now(), sender, run);
                    }
                }
                Err(error) => {
                    self.fail(error, run);
                    return;
                }
            }
        }
    }

    /// Record the request's failure and disarm every deferred session.
    fn fail(&mut self, error: PipelineError, run: &mut RunState) {
        if run.first_error.is_none() {
            tracing::debug!(pipeline = %self.name, "Failing request: {}", error);
            run.first_error = Some(error);
        }
        for deferred in std::mem::take(&mut run.deferred) {
            let node = &mut self.nodes[deferred.node.index()];
            node.try_disarm(&deferred.key);
            node.release(&deferred.key);
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("entry", &self.entry)
            .field("exit", &self.exit)
            .finish()
    }
}

#[cfg(all(test, feature = "mock-accelerator"))]
mod tests {
    use super::*;
    use crate::accelerator::mock::{MockAcceleratorManager, MockKernel, MockModelConfig};
    use crate::pipeline::node::DemultiplyCount;
    use crate::pipeline::nodes::{
        CustomNode, CustomNodeLibrary, CustomNodeTensor, DlNode, EntryNode, ExitNode,
    };
    use crate::types::{InferenceRequest, Precision, Tensor, TensorInfoMap, TensorMap};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn aliases(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    fn output_aliases(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        aliases(pairs).into_iter().collect()
    }

    struct Fixture {
        pipeline: Pipeline,
        entry: NodeId,
        exit: NodeId,
    }

    fn fixture(
        manager: Arc<MockAcceleratorManager>,
        request: InferenceRequest,
        settings: SchedulerSettings,
        entry_demultiply: Option<DemultiplyCount>,
        exit_gathers: bool,
    ) -> Fixture {
        let response = Arc::new(Mutex::new(InferenceResponse::default()));
        let mut pipeline = Pipeline::new("test", manager, settings, response.clone());
        let mut entry = Node::new(
            "request",
            NodeKind::Entry(EntryNode::new(Arc::new(request), vec!["in".into()])),
        );
        if let Some(count) = entry_demultiply {
            entry = entry.with_demultiply(count, 100);
        }
        let mut exit = Node::new("response", NodeKind::Exit(ExitNode::new(response)));
        if exit_gathers {
            exit = exit.with_gather_from(["request".to_string()].into_iter().collect());
        }
        let entry = pipeline.add_node(entry);
        let exit = pipeline.add_node(exit);
        Fixture {
            pipeline,
            entry,
            exit,
        }
    }

    fn dummy_node(pipeline: &mut Pipeline) -> NodeId {
        pipeline.add_node(Node::new(
            "dummy",
            NodeKind::Dl(DlNode::new("dummy", None, output_aliases(&[("a", "a")]))),
        ))
    }

    fn input(shape: Vec<usize>, n: usize) -> InferenceRequest {
        let values: Vec<f32> = (0..n).map(|v| v as f32).collect();
        InferenceRequest::new().with_input("in", Tensor::from_f32(shape, &values).unwrap())
    }

    #[test]
    fn test_single_dl_node() {
        let manager = Arc::new(MockAcceleratorManager::new().unwrap());
        let model = manager.load(MockModelConfig::dummy("dummy", 10));
        let mut f = fixture(
            manager,
            input(vec![1, 10], 10),
            SchedulerSettings::default(),
            None,
            false,
        );
        let dl = dummy_node(&mut f.pipeline);
        f.pipeline.connect(f.entry, dl, aliases(&[("in", "b")])).unwrap();
        f.pipeline.connect(dl, f.exit, aliases(&[("a", "out")])).unwrap();

        let response = f.pipeline.execute().unwrap();
        let out = response.output("out").unwrap().to_f32_vec().unwrap();
        assert_eq!(out, (1..=10).map(|v| v as f32).collect::<Vec<_>>());
        let queue = crate::accelerator::ModelInstance::infer_requests_queue(model.as_ref());
        assert_eq!(queue.idle_count(), queue.size());
    }

    #[test]
    fn test_demultiplied_through_single_stream() {
        let manager = Arc::new(MockAcceleratorManager::new().unwrap());
        let model = manager.load(MockModelConfig::dummy("dummy", 5).with_nireq(1));
        let mut f = fixture(
            manager,
            input(vec![4, 1, 5], 20),
            SchedulerSettings::default(),
            Some(DemultiplyCount::Fixed(4)),
            true,
        );
        let dl = dummy_node(&mut f.pipeline);
        f.pipeline.connect(f.entry, dl, aliases(&[("in", "b")])).unwrap();
        f.pipeline.connect(dl, f.exit, aliases(&[("a", "out")])).unwrap();

        let response = f.pipeline.execute().unwrap();
        let out = response.output("out").unwrap();
        assert_eq!(out.shape(), &[4, 1, 5]);
        assert_eq!(
            out.to_f32_vec().unwrap(),
            (1..=20).map(|v| v as f32).collect::<Vec<_>>()
        );
        let queue = crate::accelerator::ModelInstance::infer_requests_queue(model.as_ref());
        let stats = queue.stats();
        assert_eq!(stats.acquires, 4);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn test_missing_model_fails_request() {
        let manager = Arc::new(MockAcceleratorManager::new().unwrap());
        let mut f = fixture(
            manager,
            input(vec![1, 10], 10),
            SchedulerSettings::default(),
            None,
            false,
        );
        let dl = dummy_node(&mut f.pipeline);
        f.pipeline.connect(f.entry, dl, aliases(&[("in", "b")])).unwrap();
        f.pipeline.connect(dl, f.exit, aliases(&[("a", "out")])).unwrap();

        assert_eq!(
            f.pipeline.execute().unwrap_err(),
            PipelineError::ModelMissing("dummy".into())
        );
    }

    #[test]
    fn test_kernel_failure_fails_request() {
        let manager = Arc::new(MockAcceleratorManager::new().unwrap());
        manager.load(
            MockModelConfig::dummy("dummy", 10)
                .with_kernel(MockKernel::custom(|_| Err("device lost".to_string()))),
        );
        let mut f = fixture(
            manager,
            input(vec![1, 10], 10),
            SchedulerSettings::default(),
            None,
            false,
        );
        let dl = dummy_node(&mut f.pipeline);
        f.pipeline.connect(f.entry, dl, aliases(&[("in", "b")])).unwrap();
        f.pipeline.connect(dl, f.exit, aliases(&[("a", "out")])).unwrap();

        assert!(matches!(
            f.pipeline.execute(),
            Err(PipelineError::AcceleratorInference(_))
        ));
    }

    #[test]
    fn test_deferred_session_times_out() {
        let manager = Arc::new(MockAcceleratorManager::new().unwrap());
        let model = manager.load(MockModelConfig::dummy("dummy", 5).with_nireq(1));
        let queue = crate::accelerator::ModelInstance::infer_requests_queue(model.as_ref());
        let held = queue.try_get_id(Duration::from_millis(10)).unwrap();

        let settings = SchedulerSettings::default()
            .with_event_poll_timeout(Duration::from_millis(1))
            .with_max_deferred_residency(Duration::from_millis(20));
        let mut f = fixture(
            manager,
            input(vec![1, 5], 5),
            settings,
            None,
            false,
        );
        let dl = dummy_node(&mut f.pipeline);
        f.pipeline.connect(f.entry, dl, aliases(&[("in", "b")])).unwrap();
        f.pipeline.connect(dl, f.exit, aliases(&[("a", "out")])).unwrap();

        assert!(matches!(
            f.pipeline.execute(),
            Err(PipelineError::StreamAcquireTimeout { node, .. }) if node == "dummy"
        ));
        queue.return_stream(held);
        assert_eq!(queue.idle_count(), 1);
    }

    struct Doubler;

    impl CustomNodeLibrary for Doubler {
        fn execute(
            &self,
            inputs: &TensorMap,
            _params: &BTreeMap<String, String>,
        ) -> Result<Vec<CustomNodeTensor>, i32> {
            let input = inputs.get("x").ok_or(1)?;
            let doubled: Vec<f32> = input.to_f32_vec().ok_or(2)?.iter().map(|v| v * 2.0).collect();
            Ok(vec![CustomNodeTensor {
                name: "y".into(),
                precision: Precision::FP32,
                dims: input.shape().to_vec(),
                data: bytemuck::cast_slice(doubled.as_slice()).to_vec(),
            }])
        }
        fn inputs_info(&self, _params: &BTreeMap<String, String>) -> Result<TensorInfoMap, i32> {
            Ok(TensorInfoMap::new())
        }
        fn outputs_info(&self, _params: &BTreeMap<String, String>) -> Result<TensorInfoMap, i32> {
            Ok(TensorInfoMap::new())
        }
    }

    #[test]
    fn test_custom_then_dl() {
        let manager = Arc::new(MockAcceleratorManager::new().unwrap());
        manager.load(MockModelConfig::dummy("dummy", 3));
        let mut f = fixture(
            manager,
            input(vec![1, 3], 3),
            SchedulerSettings::default(),
            None,
            false,
        );
        let custom = f.pipeline.add_node(Node::new(
            "double",
            NodeKind::Custom(CustomNode::new(
                "doubler",
                Arc::new(Doubler),
                BTreeMap::new(),
                output_aliases(&[("doubled", "y")]),
            )),
        ));
        let dl = dummy_node(&mut f.pipeline);
        f.pipeline.connect(f.entry, custom, aliases(&[("in", "x")])).unwrap();
        f.pipeline.connect(custom, dl, aliases(&[("doubled", "b")])).unwrap();
        f.pipeline
            .connect(dl, f.exit, aliases(&[("a", "out")]))
            .unwrap();
        f.pipeline
            .connect(custom, f.exit, aliases(&[("doubled", "doubled")]))
            .unwrap();

        let response = f.pipeline.execute().unwrap();
        assert_eq!(
            response.output("doubled").unwrap().to_f32_vec().unwrap(),
            vec![0.0, 2.0, 4.0]
        );
        assert_eq!(
            response.output("out").unwrap().to_f32_vec().unwrap(),
            vec![1.0, 3.0, 5.0]
        );
    }

    #[test]
    fn test_connect_to_exit_as_dependency_fails() {
        let manager = Arc::new(MockAcceleratorManager::new().unwrap());
        let mut f = fixture(
            manager,
            InferenceRequest::new(),
            SchedulerSettings::default(),
            None,
            false,
        );
        assert!(matches!(
            f.pipeline.connect(f.exit, f.entry, aliases(&[("x", "y")])),
            Err(PipelineError::Unsupported(_))
        ));
    }
}
