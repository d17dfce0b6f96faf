//! DlNode: runs one model on a pooled accelerator stream.
//!
//! A DL session resolves its model lazily on first dispatch, checks the
//! bound inputs against the model's tensor specs (reloading the model when
//! its batching or shape mode allows it), then borrows a stream and starts
//! asynchronous inference. The completion callback clears the session's
//! inputs and pushes the session onto the request's event queue.

use super::NodeContext;
use crate::accelerator::{
    guarded, CompletionCallback, ModelInstance, ModelInstanceUnloadGuard, ModelManager,
};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::node_session::{NodeSession, SessionResources};
use crate::pipeline::stream_guard::StreamIdGuard;
use crate::types::{shape_to_string, BatchingMode, Shape, ShapeMode, TensorMap};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Check `inputs` against the model's input specs and reload the model if
/// a mismatch can be fixed that way.
///
/// Precedence per input: precision mismatch fails; a batch-only mismatch
/// requests a batch size (batching auto) or a reshape (shape auto); any
/// other mismatch requests a reshape (shape auto). One reshape covering all
/// requested inputs wins over a batch-size-only reload.
pub fn prepare_inputs_and_model_for_inference(
    model: &dyn ModelInstance,
    inputs: &TensorMap,
) -> PipelineResult<()> {
    let mut requested_batch_size: Option<usize> = None;
    let mut requested_reshapes: BTreeMap<String, Shape> = BTreeMap::new();

    for (name, info) in model.inputs_info() {
        let tensor = inputs.get(&name).ok_or_else(|| {
            PipelineError::InvalidMissingInput(format!(
                "model {} input {} was not delivered",
                model.name(),
                name
            ))
        })?;

        if tensor.precision() != info.precision {
            return Err(PipelineError::InvalidPrecision(format!(
                "{}: expected {}, got {}",
                name,
                info.precision,
                tensor.precision()
            )));
        }

        let shape = tensor.shape();
        if info.shape_matches(shape) {
            continue;
        }

        let batch_index = info
            .batch_index
            .filter(|&i| i < shape.len() && i < info.shape.len())
            .ok_or_else(|| {
                PipelineError::InvalidBatchDimension(format!(
                    "{}: model layout has no batch dimension for shape {}",
                    name,
                    shape_to_string(shape)
                ))
            })?;

        let shape_auto = model.shape_mode(&name) == ShapeMode::Auto;
        if info.shape_matches_except(shape, batch_index) {
            if model.batching_mode() == BatchingMode::Auto {
                requested_batch_size = Some(shape[batch_index]);
            } else if shape_auto {
                requested_reshapes.insert(name, shape.to_vec());
            } else {
                return Err(PipelineError::InvalidBatchSize(format!(
                    "{}: expected {}, got {}",
                    name, info.shape[batch_index], shape[batch_index]
                )));
            }
        } else if shape_auto {
            requested_reshapes.insert(name, shape.to_vec());
        } else {
            return Err(PipelineError::InvalidShape(format!(
                "{}: expected {}, got {}",
                name,
                info.shape_string(),
                shape_to_string(shape)
            )));
        }
    }

    if !requested_reshapes.is_empty() {
        tracing::debug!(
            "Reshaping model {} version {} to {:?}",
            model.name(),
            model.version(),
            requested_reshapes
        );
        model
            .reload_model(None, &requested_reshapes)
            .map_err(|e| PipelineError::ModelReloadFailed(e.to_string()))?;
    } else if let Some(batch_size) = requested_batch_size {
        tracing::debug!(
            "Changing batch size of model {} version {} to {}",
            model.name(),
            model.version(),
            batch_size
        );
        model
            .reload_model(Some(batch_size), &BTreeMap::new())
            .map_err(|e| PipelineError::ModelReloadFailed(e.to_string()))?;
    }
    Ok(())
}

/// Resources of one DL node session.
#[derive(Default)]
pub struct DlNodeSession {
    model: Option<Arc<dyn ModelInstance>>,
    unload_guard: Option<ModelInstanceUnloadGuard>,
    stream: Option<StreamIdGuard>,
    inference_started: bool,
}

impl DlNodeSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the model, fit it to `inputs`, and prepare a stream guard.
    pub fn request_execute_required_resources(
        &mut self,
        manager: &dyn ModelManager,
        model_name: &str,
        model_version: Option<u64>,
        inputs: &TensorMap,
    ) -> PipelineResult<()> {
        let (model, unload_guard) = manager.find_model_instance(model_name, model_version)?;
        prepare_inputs_and_model_for_inference(model.as_ref(), inputs)?;
        self.stream = Some(StreamIdGuard::new(model.infer_requests_queue()));
        self.model = Some(model);
        self.unload_guard = Some(unload_guard);
        Ok(())
    }

    pub fn has_resources(&self) -> bool {
        self.stream.is_some()
    }

    pub fn inference_started(&self) -> bool {
        self.inference_started
    }

    /// Cancel the stream reservation unless inference is running.
    pub fn try_disarm(&mut self) -> bool {
        if self.inference_started {
            return false;
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.disarm();
        }
        true
    }

    /// Drop the stream guard and the model reference. Idempotent.
    pub fn release(&mut self) {
        self.stream = None;
        self.unload_guard = None;
        self.model = None;
    }
}

impl fmt::Debug for DlNodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DlNodeSession")
            .field("model", &self.model.as_ref().map(|m| m.name().to_string()))
            .field("stream", &self.stream)
            .field("inference_started", &self.inference_started)
            .finish()
    }
}

/// Node running inference on one model version.
pub struct DlNode {
    model_name: String,
    model_version: Option<u64>,
    /// Output alias -> model output name
    output_aliases: BTreeMap<String, String>,
}

impl DlNode {
    pub fn new(
        model_name: impl Into<String>,
        model_version: Option<u64>,
        output_aliases: BTreeMap<String, String>,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            model_version,
            output_aliases,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn model_version(&self) -> Option<u64> {
        self.model_version
    }

    /// Start inference for `session`.
    ///
    /// Returns [`PipelineError::StreamIdNotReadyYet`] without side effects
    /// when no stream frees up within the context's wait timeout.
    pub fn execute(&self, session: &mut NodeSession, ctx: &NodeContext) -> PipelineResult<()> {
        let handler = Arc::clone(session.input_handler());
        let key = session.key().clone();
        let SessionResources::Dl(dl) = session.resources_mut() else {
            return Err(PipelineError::Internal(format!(
                "DL node {} dispatched without DL session resources",
                ctx.node_name
            )));
        };

        if !dl.has_resources() {
            let inputs = handler.get_inputs();
            dl.request_execute_required_resources(
                ctx.manager,
                &self.model_name,
                self.model_version,
                &inputs,
            )?;
        }

        let stream = dl
            .stream
            .as_mut()
            .ok_or_else(|| PipelineError::Internal("stream guard missing".to_string()))?;
        let Some(stream_id) = stream.try_get_id(ctx.stream_wait_timeout) else {
            tracing::trace!(node = %ctx.node_name, session = %key, "No stream available yet");
            return Err(PipelineError::StreamIdNotReadyYet);
        };
        let queue = Arc::clone(stream.queue());

        let inputs = handler.get_inputs();
        let mut request = queue.infer_request(stream_id);
        for (name, tensor) in &inputs {
            guarded("set_tensor", || request.set_tensor(name, tensor))
                .map_err(|e| PipelineError::AcceleratorDeserialization(e.to_string()))?;
        }

        let events = ctx.events.clone();
        let node_id = ctx.node_id;
        let callback_key = key.clone();
        let callback: CompletionCallback = Box::new(move || {
            handler.clear_inputs();
            events.push(node_id, callback_key);
        });
        guarded("start_async", || request.start_async(callback))
            .map_err(|e| PipelineError::AcceleratorInference(e.to_string()))?;
        dl.inference_started = true;

        tracing::debug!(
            node = %ctx.node_name,
            session = %key,
            "Started inference on model {} stream {}",
            self.model_name,
            stream_id
        );
        Ok(())
    }

    /// Wait for the inference and copy out the outputs dependants consume,
    /// keyed by alias.
    pub fn fetch_results(
        &self,
        session: &mut NodeSession,
        required_outputs: &BTreeSet<String>,
    ) -> PipelineResult<TensorMap> {
        let SessionResources::Dl(dl) = session.resources_mut() else {
            return Err(PipelineError::Internal(
                "DL results fetched without DL session resources".to_string(),
            ));
        };
        let (queue, stream_id) = dl
            .stream
            .as_ref()
            .and_then(|s| s.id().map(|id| (Arc::clone(s.queue()), id)))
            .ok_or_else(|| {
                PipelineError::Internal("fetching results of a session that never ran".to_string())
            })?;

        let mut request = queue.infer_request(stream_id);
        guarded("wait", || request.wait())
            .map_err(|e| PipelineError::AcceleratorInference(e.to_string()))?;

        let mut outputs = TensorMap::new();
        for alias in required_outputs {
            let real_name = self.output_aliases.get(alias).ok_or_else(|| {
                PipelineError::InvalidMissingOutput(format!(
                    "model {} has no output aliased {}",
                    self.model_name, alias
                ))
            })?;
            let tensor = guarded("get_tensor", || request.get_tensor(real_name))
                .map_err(|e| PipelineError::AcceleratorSerialization(e.to_string()))?;
            outputs.insert(alias.clone(), tensor.deep_copy());
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::{
        AcceleratorError, InferRequest, InferRequestsQueue, MockInferRequest, MockModelManager,
    };
    use crate::pipeline::event_queue::PipelineEventQueue;
    use crate::pipeline::id::{EdgeId, NodeId};
    use crate::pipeline::input_handler::{InputHandler, NodeInputHandler};
    use crate::pipeline::session_metadata::NodeSessionMetadata;
    use crate::types::{Precision, Tensor, TensorInfo, TensorInfoMap};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Model with fixed specs over an arbitrary request pool.
    struct FixedModel {
        inputs: TensorInfoMap,
        queue: Arc<InferRequestsQueue>,
    }

    impl ModelInstance for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }
        fn version(&self) -> u64 {
            1
        }
        fn inputs_info(&self) -> TensorInfoMap {
            self.inputs.clone()
        }
        fn outputs_info(&self) -> TensorInfoMap {
            TensorInfoMap::new()
        }
        fn batching_mode(&self) -> BatchingMode {
            BatchingMode::Fixed
        }
        fn shape_mode(&self, _input: &str) -> ShapeMode {
            ShapeMode::Fixed
        }
        fn reload_model(
            &self,
            _batch_size: Option<usize>,
            _reshapes: &BTreeMap<String, Shape>,
        ) -> Result<(), AcceleratorError> {
            Ok(())
        }
        fn infer_requests_queue(&self) -> Arc<InferRequestsQueue> {
            Arc::clone(&self.queue)
        }
    }

    /// Binds fine, then panics when inference starts.
    struct PanickingRequest;

    impl InferRequest for PanickingRequest {
        fn set_tensor(&mut self, _name: &str, _tensor: &Tensor) -> Result<(), AcceleratorError> {
            Ok(())
        }
        fn start_async(&mut self, _callback: CompletionCallback) -> Result<(), AcceleratorError> {
            panic!("driver crashed")
        }
        fn wait(&mut self) -> Result<(), AcceleratorError> {
            Ok(())
        }
        fn get_tensor(&self, name: &str) -> Result<Tensor, AcceleratorError> {
            Err(AcceleratorError::TensorNotFound(name.to_string()))
        }
    }

    fn fixture(request: impl InferRequest + 'static) -> (MockModelManager, Arc<InferRequestsQueue>) {
        let queue = Arc::new(InferRequestsQueue::new(vec![
            Box::new(request) as Box<dyn InferRequest>
        ]));
        let model = Arc::new(FixedModel {
            inputs: [(
                "in".to_string(),
                TensorInfo::new("in", Precision::FP32, &[1, 2]),
            )]
            .into_iter()
            .collect(),
            queue: Arc::clone(&queue),
        });
        let mut manager = MockModelManager::new();
        manager.expect_find_model_instance().returning(move |_, _| {
            let instance: Arc<dyn ModelInstance> = model.clone();
            Ok((
                instance,
                ModelInstanceUnloadGuard::new(Arc::new(AtomicUsize::new(0))),
            ))
        });
        (manager, queue)
    }

    fn ready_session() -> NodeSession {
        let handler = Arc::new(NodeInputHandler::new(1));
        handler
            .set_input("in", Tensor::from_f32(vec![1, 2], &[1.0, 2.0]).unwrap(), 0)
            .unwrap();
        handler.notify_finished_dependency(EdgeId(0)).unwrap();
        NodeSession::new(
            "dl",
            NodeSessionMetadata::new(),
            handler,
            SessionResources::Dl(DlNodeSession::new()),
        )
    }

    fn node() -> DlNode {
        DlNode::new(
            "fixed",
            None,
            [("out".to_string(), "out".to_string())].into_iter().collect(),
        )
    }

    #[test]
    fn test_set_tensor_fault_becomes_deserialization_error() {
        let mut request = MockInferRequest::new();
        request
            .expect_set_tensor()
            .returning(|_, _| Err(AcceleratorError::native("set_tensor", "bad blob")));
        let (manager, queue) = fixture(request);
        let events = PipelineEventQueue::new();
        let sender = events.sender();
        let ctx = NodeContext {
            node_id: NodeId(1),
            node_name: "dl",
            events: &sender,
            manager: &manager,
            stream_wait_timeout: Duration::from_micros(1),
        };

        let mut session = ready_session();
        let err = node().execute(&mut session, &ctx).unwrap_err();
        assert!(matches!(err, PipelineError::AcceleratorDeserialization(_)));
        session.release();

        assert_eq!(queue.idle_count(), 1);
        let stats = queue.stats();
        assert_eq!(stats.acquires, stats.releases);
        assert!(events.is_empty());
    }

    #[test]
    fn test_start_async_panic_becomes_inference_error() {
        let (manager, queue) = fixture(PanickingRequest);
        let events = PipelineEventQueue::new();
        let sender = events.sender();
        let ctx = NodeContext {
            node_id: NodeId(1),
            node_name: "dl",
            events: &sender,
            manager: &manager,
            stream_wait_timeout: Duration::from_micros(1),
        };

        let mut session = ready_session();
        let err = node().execute(&mut session, &ctx).unwrap_err();
        assert!(matches!(err, PipelineError::AcceleratorInference(msg) if msg.contains("driver crashed")));
        assert!(session.try_disarm());
        session.release();
        assert_eq!(queue.idle_count(), 1);
    }

    #[test]
    fn test_busy_pool_is_not_ready_yet() {
        let (manager, queue) = fixture(MockInferRequest::new());
        let held = queue.try_get_id(Duration::from_micros(1)).unwrap();
        let events = PipelineEventQueue::new();
        let sender = events.sender();
        let ctx = NodeContext {
            node_id: NodeId(1),
            node_name: "dl",
            events: &sender,
            manager: &manager,
            stream_wait_timeout: Duration::from_micros(1),
        };

        let mut session = ready_session();
        assert_eq!(
            node().execute(&mut session, &ctx),
            Err(PipelineError::StreamIdNotReadyYet)
        );
        assert!(events.is_empty());
        assert!(session.try_disarm());
        queue.return_stream(held);
        session.release();
        assert_eq!(queue.idle_count(), 1);
    }

    #[test]
    fn test_wait_and_get_tensor_faults() {
        let mut request = MockInferRequest::new();
        request.expect_set_tensor().returning(|_, _| Ok(()));
        request.expect_start_async().returning(|callback| {
            callback();
            Ok(())
        });
        request.expect_wait().returning(|| Ok(()));
        request
            .expect_get_tensor()
            .returning(|name| Err(AcceleratorError::TensorNotFound(name.to_string())));
        let (manager, _queue) = fixture(request);
        let events = PipelineEventQueue::new();
        let sender = events.sender();
        let ctx = NodeContext {
            node_id: NodeId(7),
            node_name: "dl",
            events: &sender,
            manager: &manager,
            stream_wait_timeout: Duration::from_micros(1),
        };

        let mut session = ready_session();
        node().execute(&mut session, &ctx).unwrap();
        assert_eq!(
            events.try_pull(Duration::from_millis(10)),
            Some((NodeId(7), String::new()))
        );
        assert!(session.input_handler().get_inputs().is_empty());
        assert!(!session.try_disarm());

        let required: BTreeSet<String> = ["out".to_string()].into_iter().collect();
        assert!(matches!(
            node().fetch_results(&mut session, &required),
            Err(PipelineError::AcceleratorSerialization(_))
        ));
        let unknown: BTreeSet<String> = ["nope".to_string()].into_iter().collect();
        assert!(matches!(
            node().fetch_results(&mut session, &unknown),
            Err(PipelineError::InvalidMissingOutput(_))
        ));
    }

    #[cfg(feature = "mock-accelerator")]
    mod reshape {
        use super::*;
        use crate::accelerator::mock::{MockAcceleratorManager, MockModel, MockModelConfig, MockReload};

        fn model(config: MockModelConfig) -> (MockAcceleratorManager, Arc<MockModel>) {
            let manager = MockAcceleratorManager::new().unwrap();
            let model = manager.load(config);
            (manager, model)
        }

        fn inputs(shape: &[usize]) -> TensorMap {
            let count: usize = shape.iter().product();
            [(
                "b".to_string(),
                Tensor::from_f32(shape.to_vec(), &vec![0.0; count]).unwrap(),
            )]
            .into_iter()
            .collect()
        }

        #[test]
        fn test_matching_inputs_do_not_reload() {
            let (_m, model) = model(MockModelConfig::dummy("m", 10));
            prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[1, 10])).unwrap();
            assert!(model.reloads().is_empty());
        }

        #[test]
        fn test_batch_mismatch_with_auto_batching_reloads_batch() {
            let (_m, model) = model(
                MockModelConfig::dummy("m", 10)
                    .with_batching_mode(BatchingMode::Auto)
                    .with_shape_mode("b", ShapeMode::Auto),
            );
            prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[3, 10])).unwrap();
            assert_eq!(
                model.reloads(),
                vec![MockReload {
                    batch_size: Some(3),
                    reshapes: BTreeMap::new()
                }]
            );
        }

        #[test]
        fn test_batch_mismatch_with_auto_shape_reshapes() {
            let (_m, model) = model(MockModelConfig::dummy("m", 10).with_shape_mode("b", ShapeMode::Auto));
            prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[3, 10])).unwrap();
            let reloads = model.reloads();
            assert_eq!(reloads.len(), 1);
            assert_eq!(reloads[0].batch_size, None);
            assert_eq!(reloads[0].reshapes["b"], vec![3, 10]);
        }

        #[test]
        fn test_shape_mismatch_with_auto_shape_reshapes() {
            let (_m, model) = model(
                MockModelConfig::dummy("m", 10)
                    .with_batching_mode(BatchingMode::Auto)
                    .with_shape_mode("b", ShapeMode::Auto),
            );
            prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[1, 12])).unwrap();
            let reloads = model.reloads();
            assert_eq!(reloads.len(), 1);
            assert_eq!(reloads[0].batch_size, None);
            assert_eq!(reloads[0].reshapes["b"], vec![1, 12]);
            assert!(model.inputs_info()["b"].shape_matches(&[1, 12]));
        }

        #[test]
        fn test_mismatches_without_auto_fail_without_reload() {
            let (_m, model) = model(MockModelConfig::dummy("m", 10));
            assert!(matches!(
                prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[3, 10])),
                Err(PipelineError::InvalidBatchSize(_))
            ));
            assert!(matches!(
                prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[1, 12])),
                Err(PipelineError::InvalidShape(_))
            ));
            let (_m, batching) =
                self::model(MockModelConfig::dummy("m", 10).with_batching_mode(BatchingMode::Auto));
            assert!(matches!(
                prepare_inputs_and_model_for_inference(batching.as_ref(), &inputs(&[1, 12])),
                Err(PipelineError::InvalidShape(_))
            ));
            assert!(model.reloads().is_empty());
            assert!(batching.reloads().is_empty());
        }

        #[test]
        fn test_precision_and_missing_input() {
            let (_m, model) = model(MockModelConfig::dummy("m", 2).with_shape_mode("b", ShapeMode::Auto));
            let wrong: TensorMap = [(
                "b".to_string(),
                Tensor::from_i32(vec![1, 2], &[1, 2]).unwrap(),
            )]
            .into_iter()
            .collect();
            assert!(matches!(
                prepare_inputs_and_model_for_inference(model.as_ref(), &wrong),
                Err(PipelineError::InvalidPrecision(_))
            ));
            assert!(matches!(
                prepare_inputs_and_model_for_inference(model.as_ref(), &TensorMap::new()),
                Err(PipelineError::InvalidMissingInput(_))
            ));
        }

        #[test]
        fn test_missing_batch_dimension() {
            let config = MockModelConfig::new(
                "m",
                vec![TensorInfo::new("b", Precision::FP32, &[1, 10]).with_batch_index(None)],
                vec![TensorInfo::new("a", Precision::FP32, &[1, 10])],
            );
            let (_m, model) = model(config);
            assert!(matches!(
                prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[2, 10])),
                Err(PipelineError::InvalidBatchDimension(_))
            ));
        }

        #[test]
        fn test_failed_reload_propagates() {
            let (_m, model) = model(
                MockModelConfig::dummy("m", 10)
                    .with_shape_mode("b", ShapeMode::Auto)
                    .with_failing_reload(),
            );
            assert!(matches!(
                prepare_inputs_and_model_for_inference(model.as_ref(), &inputs(&[1, 12])),
                Err(PipelineError::ModelReloadFailed(_))
            ));
        }
    }
}
