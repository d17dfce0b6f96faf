//! Mock Accelerator Implementation for Testing
//!
//! This module provides an in-process accelerator so pipelines can run
//! without hardware. Inference runs on a small tokio runtime through
//! `spawn_blocking`, so completion callbacks fire from a thread other than
//! the scheduler's, the same way a real accelerator runtime reports them.
//!
//! # Kernels
//!
//! - [`MockKernel::PlusOne`] - adds 1 to every FP32 element of the single
//!   input and emits it under every output name (the "dummy" model)
//! - [`MockKernel::Custom`] - arbitrary function over the bound inputs
//!
//! # Example
//!
//! ```ignore
//! use dagserve::accelerator::mock::{MockAcceleratorManager, MockModelConfig};
//!
//! let manager = MockAcceleratorManager::new()?;
//! manager.load(MockModelConfig::dummy("dummy", 10).with_nireq(2));
//! ```

use super::{
    AcceleratorError, CompletionCallback, InferRequest, InferRequestsQueue, ModelInstance,
    ModelInstanceUnloadGuard, ModelManager,
};
use crate::pipeline::{PipelineError, PipelineResult};
use crate::types::{
    BatchingMode, Dimension, Precision, Shape, ShapeMode, Tensor, TensorInfo, TensorInfoMap,
    TensorMap,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};

type KernelFn = dyn Fn(&TensorMap) -> Result<TensorMap, String> + Send + Sync;

/// Computation performed by a mock model
#[derive(Clone)]
pub enum MockKernel {
    /// Input + 1, broadcast to every output
    PlusOne,
    /// Custom function of the inputs
    Custom(Arc<KernelFn>),
}

impl MockKernel {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&TensorMap) -> Result<TensorMap, String> + Send + Sync + 'static,
    {
        MockKernel::Custom(Arc::new(f))
    }

    fn run(&self, inputs: &TensorMap, outputs: &[String]) -> Result<TensorMap, String> {
        match self {
            MockKernel::PlusOne => {
                let (_, input) = inputs
                    .iter()
                    .next()
                    .ok_or_else(|| "no input bound".to_string())?;
                let values = input
                    .to_f32_vec()
                    .ok_or_else(|| format!("unsupported precision {}", input.precision()))?;
                let plus_one: Vec<f32> = values.iter().map(|v| v + 1.0).collect();
                let tensor = Tensor::from_f32(input.shape().to_vec(), &plus_one)
                    .map_err(|e| e.to_string())?;
                Ok(outputs
                    .iter()
                    .map(|name| (name.clone(), tensor.clone()))
                    .collect())
            }
            MockKernel::Custom(f) => f(inputs),
        }
    }
}

impl std::fmt::Debug for MockKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockKernel::PlusOne => write!(f, "PlusOne"),
            MockKernel::Custom(_) => write!(f, "Custom"),
        }
    }
}

/// Configuration of one mock model version
#[derive(Debug, Clone)]
pub struct MockModelConfig {
    pub name: String,
    pub version: u64,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
    pub batching_mode: BatchingMode,
    pub shape_modes: HashMap<String, ShapeMode>,
    pub kernel: MockKernel,
    /// Number of pooled inference requests
    pub nireq: usize,
    /// Simulated inference duration
    pub latency: Duration,
    /// Make every reload fail
    pub fail_reload: bool,
}

impl MockModelConfig {
    pub fn new(name: impl Into<String>, inputs: Vec<TensorInfo>, outputs: Vec<TensorInfo>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            inputs,
            outputs,
            batching_mode: BatchingMode::Fixed,
            shape_modes: HashMap::new(),
            kernel: MockKernel::PlusOne,
            nireq: 1,
            latency: Duration::ZERO,
            fail_reload: false,
        }
    }

    /// FP32 `b` [1, size] -> `a` [1, size], computing input + 1
    pub fn dummy(name: impl Into<String>, size: usize) -> Self {
        Self::new(
            name,
            vec![TensorInfo::new("b", Precision::FP32, &[1, size])],
            vec![TensorInfo::new("a", Precision::FP32, &[1, size])],
        )
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_nireq(mut self, nireq: usize) -> Self {
        self.nireq = nireq;
        self
    }

    pub fn with_batching_mode(mut self, mode: BatchingMode) -> Self {
        self.batching_mode = mode;
        self
    }

    pub fn with_shape_mode(mut self, input: impl Into<String>, mode: ShapeMode) -> Self {
        self.shape_modes.insert(input.into(), mode);
        self
    }

    pub fn with_kernel(mut self, kernel: MockKernel) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_failing_reload(mut self) -> Self {
        self.fail_reload = true;
        self
    }
}

/// Lifecycle state of a mock model version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockModelState {
    Loading,
    Available,
    Retired,
}

/// Recorded call to [`ModelInstance::reload_model`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockReload {
    pub batch_size: Option<usize>,
    pub reshapes: BTreeMap<String, Shape>,
}

/// A loaded mock model version
pub struct MockModel {
    name: String,
    version: u64,
    inputs: RwLock<TensorInfoMap>,
    outputs: RwLock<TensorInfoMap>,
    batching_mode: BatchingMode,
    shape_modes: HashMap<String, ShapeMode>,
    fail_reload: bool,
    reloads: Mutex<Vec<MockReload>>,
    users: Arc<AtomicUsize>,
    queue: Arc<InferRequestsQueue>,
}

impl MockModel {
    fn new(config: MockModelConfig, handle: Handle) -> Self {
        let output_names: Vec<String> = config.outputs.iter().map(|o| o.name.clone()).collect();
        let requests = (0..config.nireq)
            .map(|_| {
                Box::new(MockModelRequest::new(
                    config.kernel.clone(),
                    output_names.clone(),
                    config.latency,
                    handle.clone(),
                )) as Box<dyn InferRequest>
            })
            .collect();
        Self {
            name: config.name,
            version: config.version,
            inputs: RwLock::new(config.inputs.into_iter().map(|i| (i.name.clone(), i)).collect()),
            outputs: RwLock::new(config.outputs.into_iter().map(|o| (o.name.clone(), o)).collect()),
            batching_mode: config.batching_mode,
            shape_modes: config.shape_modes,
            fail_reload: config.fail_reload,
            reloads: Mutex::new(Vec::new()),
            users: Arc::new(AtomicUsize::new(0)),
            queue: Arc::new(InferRequestsQueue::new(requests)),
        }
    }

    /// Reloads performed so far, oldest first
    pub fn reloads(&self) -> Vec<MockReload> {
        self.reloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of live unload guards
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }
}

impl ModelInstance for MockModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn inputs_info(&self) -> TensorInfoMap {
        self.inputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn outputs_info(&self) -> TensorInfoMap {
        self.outputs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn batching_mode(&self) -> BatchingMode {
        self.batching_mode
    }

    fn shape_mode(&self, input: &str) -> ShapeMode {
        self.shape_modes.get(input).copied().unwrap_or_default()
    }

    fn reload_model(
        &self,
        batch_size: Option<usize>,
        reshapes: &BTreeMap<String, Shape>,
    ) -> Result<(), AcceleratorError> {
        self.reloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(MockReload {
                batch_size,
                reshapes: reshapes.clone(),
            });
        if self.fail_reload {
            return Err(AcceleratorError::native("reload_model", "reload rejected"));
        }
        tracing::debug!(
            "Reloading mock model {} version {} batch size {:?} reshapes {:?}",
            self.name,
            self.version,
            batch_size,
            reshapes
        );

        let mut inputs = self.inputs.write().unwrap_or_else(PoisonError::into_inner);
        let mut outputs = self.outputs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(batch) = batch_size {
            for info in inputs.values_mut().chain(outputs.values_mut()) {
                if let Some(dim) = info.batch_index.and_then(|i| info.shape.get_mut(i)) {
                    *dim = Dimension::Fixed(batch);
                }
            }
        }
        for (name, shape) in reshapes {
            if let Some(info) = inputs.get_mut(name) {
                info.shape = shape.iter().map(|&d| Dimension::Fixed(d)).collect();
            }
        }
        Ok(())
    }

    fn infer_requests_queue(&self) -> Arc<InferRequestsQueue> {
        Arc::clone(&self.queue)
    }
}

#[derive(Default)]
struct RequestState {
    running: bool,
    outputs: Option<Result<TensorMap, String>>,
}

/// Inference request of a [`MockModel`]
pub struct MockModelRequest {
    kernel: MockKernel,
    output_names: Vec<String>,
    latency: Duration,
    handle: Handle,
    inputs: TensorMap,
    state: Arc<(Mutex<RequestState>, Condvar)>,
}

impl MockModelRequest {
    fn new(kernel: MockKernel, output_names: Vec<String>, latency: Duration, handle: Handle) -> Self {
        Self {
            kernel,
            output_names,
            latency,
            handle,
            inputs: TensorMap::new(),
            state: Arc::new((Mutex::new(RequestState::default()), Condvar::new())),
        }
    }
}

impl InferRequest for MockModelRequest {
    fn set_tensor(&mut self, name: &str, tensor: &Tensor) -> Result<(), AcceleratorError> {
        self.inputs.insert(name.to_string(), tensor.clone());
        Ok(())
    }

    fn start_async(&mut self, callback: CompletionCallback) -> Result<(), AcceleratorError> {
        {
            let mut state = self.state.0.lock().unwrap_or_else(PoisonError::into_inner);
            if state.running {
                return Err(AcceleratorError::native("start_async", "request busy"));
            }
            state.running = true;
            state.outputs = None;
        }
        let inputs = std::mem::take(&mut self.inputs);
        let kernel = self.kernel.clone();
        let output_names = self.output_names.clone();
        let latency = self.latency;
        let state = Arc::clone(&self.state);
        self.handle.spawn_blocking(move || {
            if !latency.is_zero() {
                std::thread::sleep(latency);
            }
            let result = kernel.run(&inputs, &output_names);
            {
                let (lock, cvar) = &*state;
                let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
                state.outputs = Some(result);
                state.running = false;
                cvar.notify_all();
            }
            callback();
        });
        Ok(())
    }

    fn wait(&mut self) -> Result<(), AcceleratorError> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while state.running {
            state = cvar.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        match &state.outputs {
            None => Err(AcceleratorError::NotStarted),
            Some(Err(message)) => Err(AcceleratorError::native("infer", message.clone())),
            Some(Ok(_)) => Ok(()),
        }
    }

    fn get_tensor(&self, name: &str) -> Result<Tensor, AcceleratorError> {
        let state = self.state.0.lock().unwrap_or_else(PoisonError::into_inner);
        match &state.outputs {
            Some(Ok(outputs)) => outputs
                .get(name)
                .cloned()
                .ok_or_else(|| AcceleratorError::TensorNotFound(name.to_string())),
            _ => Err(AcceleratorError::NotStarted),
        }
    }
}

struct MockVersion {
    model: Arc<MockModel>,
    state: MockModelState,
}

/// In-process [`ModelManager`] serving [`MockModel`]s
pub struct MockAcceleratorManager {
    runtime: Runtime,
    models: RwLock<HashMap<String, BTreeMap<u64, MockVersion>>>,
}

impl MockAcceleratorManager {
    pub fn new() -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mock-accelerator")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime,
            models: RwLock::new(HashMap::new()),
        })
    }

    /// Load a model version and mark it available.
    pub fn load(&self, config: MockModelConfig) -> Arc<MockModel> {
        let name = config.name.clone();
        let version = config.version;
        let model = Arc::new(MockModel::new(config, self.runtime.handle().clone()));
        tracing::info!("Loaded mock model {} version {}", name, version);
        self.models
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_default()
            .insert(
                version,
                MockVersion {
                    model: Arc::clone(&model),
                    state: MockModelState::Available,
                },
            );
        model
    }

    /// Change the lifecycle state of a loaded version. Returns false if
    /// the version is unknown.
    pub fn set_state(&self, name: &str, version: u64, state: MockModelState) -> bool {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        match models.get_mut(name).and_then(|v| v.get_mut(&version)) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Loaded version, regardless of state
    pub fn model(&self, name: &str, version: u64) -> Option<Arc<MockModel>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .and_then(|v| v.get(&version))
            .map(|entry| Arc::clone(&entry.model))
    }
}

impl ModelManager for MockAcceleratorManager {
    fn find_model_instance(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> PipelineResult<(Arc<dyn ModelInstance>, ModelInstanceUnloadGuard)> {
        let models = self.models.read().unwrap_or_else(PoisonError::into_inner);
        let versions = models
            .get(name)
            .ok_or_else(|| PipelineError::ModelMissing(name.to_string()))?;
        let entry = match version {
            Some(v) => versions.get(&v).ok_or_else(|| PipelineError::ModelMissing(format!(
                "{} version {}",
                name, v
            )))?,
            None => versions
                .values()
                .rev()
                .find(|e| e.state == MockModelState::Available)
                .or_else(|| versions.values().next_back())
                .ok_or_else(|| PipelineError::ModelMissing(name.to_string()))?,
        };
        match entry.state {
            MockModelState::Available => {
                let guard = ModelInstanceUnloadGuard::new(Arc::clone(&entry.model.users));
                let instance: Arc<dyn ModelInstance> = entry.model.clone();
                Ok((instance, guard))
            }
            MockModelState::Loading => Err(PipelineError::ModelVersionNotLoadedYet {
                name: name.to_string(),
                version: entry.model.version,
            }),
            MockModelState::Retired => Err(PipelineError::ModelVersionNotLoadedAnymore {
                name: name.to_string(),
                version: entry.model.version,
            }),
        }
    }
}
