//! Pipeline definitions and their lifecycle.
//!
//! A [`PipelineDefinition`] is the process-wide, validated topology of one
//! named pipeline. Every request waits for it to be available, takes a
//! [`DefinitionUnloadGuard`] and builds its own [`Pipeline`] from it.
//! Reload and retire wait for those guards to drain before touching the
//! topology.

use crate::accelerator::ModelManager;
use crate::config::SchedulerSettings;
use crate::pipeline::definition_status::{
    DefinitionEvent, DefinitionState, ModelVersionState, ModelVersionStatusErrorCode,
    PipelineDefinitionStatus,
};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::executor::Pipeline;
use crate::pipeline::id::NodeId;
use crate::pipeline::node::{DemultiplyCount, Node};
use crate::pipeline::nodes::custom::NodeParams;
use crate::pipeline::nodes::{
    CustomNode, DlNode, EntryNode, ExitNode, NodeKind, NodeLibraryRegistry,
};
use crate::pipeline::validation;
use crate::types::{InferenceRequest, InferenceResponse};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Conventional name of the entry node
pub const ENTRY_NODE_NAME: &str = "request";

/// Conventional name of the exit node
pub const EXIT_NODE_NAME: &str = "response";

/// What a node of a definition is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKindInfo {
    /// Pipeline inputs the request must carry
    Entry { inputs: Vec<String> },
    Dl {
        model_name: String,
        model_version: Option<u64>,
    },
    Custom {
        library_name: String,
        params: NodeParams,
    },
    Exit,
}

/// Static description of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub kind: NodeKindInfo,
    /// Output alias -> model or library output name
    pub output_aliases: BTreeMap<String, String>,
    /// Negative means dynamic
    pub demultiply_count: Option<i64>,
    pub gather_from: BTreeSet<String>,
}

impl NodeInfo {
    fn with_kind(name: impl Into<String>, kind: NodeKindInfo) -> Self {
        Self {
            name: name.into(),
            kind,
            output_aliases: BTreeMap::new(),
            demultiply_count: None,
            gather_from: BTreeSet::new(),
        }
    }

    pub fn entry(name: impl Into<String>, inputs: &[&str]) -> Self {
        Self::with_kind(
            name,
            NodeKindInfo::Entry {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    pub fn dl(name: impl Into<String>, model_name: impl Into<String>, version: Option<u64>) -> Self {
        Self::with_kind(
            name,
            NodeKindInfo::Dl {
                model_name: model_name.into(),
                model_version: version,
            },
        )
    }

    pub fn custom(
        name: impl Into<String>,
        library_name: impl Into<String>,
        params: NodeParams,
    ) -> Self {
        Self::with_kind(
            name,
            NodeKindInfo::Custom {
                library_name: library_name.into(),
                params,
            },
        )
    }

    pub fn exit(name: impl Into<String>) -> Self {
        Self::with_kind(name, NodeKindInfo::Exit)
    }

    pub fn with_output_alias(mut self, alias: impl Into<String>, output: impl Into<String>) -> Self {
        self.output_aliases.insert(alias.into(), output.into());
        self
    }

    pub fn with_demultiply(mut self, count: i64) -> Self {
        self.demultiply_count = Some(count);
        self
    }

    pub fn with_gather_from(mut self, demultiplexer: impl Into<String>) -> Self {
        self.gather_from.insert(demultiplexer.into());
        self
    }

    pub fn is_entry(&self) -> bool {
        matches!(self.kind, NodeKindInfo::Entry { .. })
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.kind, NodeKindInfo::Exit)
    }
}

/// dependant -> dependency -> (dependency output alias, dependant input)
pub type Connections = BTreeMap<String, BTreeMap<String, Vec<(String, String)>>>;

/// Add one aliased connection to `connections`.
pub fn connect(
    connections: &mut Connections,
    dependency: &str,
    dependant: &str,
    aliases: &[(&str, &str)],
) {
    connections
        .entry(dependant.to_string())
        .or_default()
        .entry(dependency.to_string())
        .or_default()
        .extend(aliases.iter().map(|(o, i)| (o.to_string(), i.to_string())));
}

#[derive(Debug, Default)]
struct Topology {
    nodes: Vec<NodeInfo>,
    connections: Connections,
    /// Levels the exit node gathers, known after validation
    exit_gather_from: BTreeSet<String>,
}

/// Keeps a definition from being reloaded or retired while a request
/// built from it is running.
#[derive(Debug)]
pub struct DefinitionUnloadGuard {
    handles: Arc<AtomicUsize>,
}

impl DefinitionUnloadGuard {
    fn new(handles: Arc<AtomicUsize>) -> Self {
        handles.fetch_add(1, Ordering::AcqRel);
        Self { handles }
    }
}

impl Drop for DefinitionUnloadGuard {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct PipelineDefinition {
    name: String,
    topology: RwLock<Topology>,
    status: Mutex<PipelineDefinitionStatus>,
    status_changed: Condvar,
    requests_handles: Arc<AtomicUsize>,
    settings: SchedulerSettings,
}

impl PipelineDefinition {
    pub fn new(
        name: impl Into<String>,
        nodes: Vec<NodeInfo>,
        connections: Connections,
        settings: SchedulerSettings,
    ) -> Self {
        let name = name.into();
        Self {
            status: Mutex::new(PipelineDefinitionStatus::new(name.clone())),
            name,
            topology: RwLock::new(Topology {
                nodes,
                connections,
                exit_gather_from: BTreeSet::new(),
            }),
            status_changed: Condvar::new(),
            requests_handles: Arc::new(AtomicUsize::new(0)),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DefinitionState {
        self.lock_status().state()
    }

    pub fn is_available(&self) -> bool {
        self.lock_status().is_available()
    }

    pub fn is_revalidation_required(&self) -> bool {
        self.lock_status().is_revalidation_required()
    }

    pub fn convert_to_model_status(&self) -> (ModelVersionState, ModelVersionStatusErrorCode) {
        self.lock_status().convert_to_model_status()
    }

    /// Requests currently holding an unload guard
    pub fn in_flight_requests(&self) -> usize {
        self.requests_handles.load(Ordering::Acquire)
    }

    pub fn node_infos(&self) -> Vec<NodeInfo> {
        self.read_topology().nodes.clone()
    }

    /// True when a DL node of this definition runs `model_name`.
    pub fn uses_model(&self, model_name: &str) -> bool {
        self.read_topology().nodes.iter().any(|n| {
            matches!(&n.kind, NodeKindInfo::Dl { model_name: m, .. } if m == model_name)
        })
    }

    fn lock_status(&self) -> MutexGuard<'_, PipelineDefinitionStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_topology(&self) -> std::sync::RwLockReadGuard<'_, Topology> {
        self.topology.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, event: DefinitionEvent) -> DefinitionState {
        let state = self.lock_status().handle(event);
        self.status_changed.notify_all();
        state
    }

    // ── Lifecycle ──

    /// Check the topology against the loaded models and libraries.
    pub fn validate(
        &self,
        manager: &dyn ModelManager,
        libraries: &NodeLibraryRegistry,
    ) -> PipelineResult<()> {
        let result = {
            let topology = self.read_topology();
            validation::validate(&topology.nodes, &topology.connections, manager, libraries)
        };
        match result {
            Ok(exit_gather_from) => {
                self.topology
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .exit_gather_from = exit_gather_from;
                self.handle(DefinitionEvent::ValidationPassed);
                tracing::info!(pipeline = %self.name, "Pipeline definition validated");
                Ok(())
            }
            Err(e) => {
                tracing::error!(pipeline = %self.name, "Validation of pipeline definition failed: {}", e);
                self.handle(DefinitionEvent::ValidationFailed);
                Err(e)
            }
        }
    }

    /// Replace the topology once running requests drained, then revalidate.
    pub fn reload(
        &self,
        nodes: Vec<NodeInfo>,
        connections: Connections,
        manager: &dyn ModelManager,
        libraries: &NodeLibraryRegistry,
    ) -> PipelineResult<()> {
        self.handle(DefinitionEvent::Reload);
        tracing::info!(pipeline = %self.name, "Reloading pipeline definition");
        self.wait_for_requests_to_drain();
        {
            let mut topology = self.topology.write().unwrap_or_else(PoisonError::into_inner);
            topology.nodes = nodes;
            topology.connections = connections;
            topology.exit_gather_from.clear();
        }
        self.validate(manager, libraries)
    }

    /// Stop serving. Returns once every running request finished.
    pub fn retire(&self) {
        self.handle(DefinitionEvent::Retire);
        tracing::info!(pipeline = %self.name, "Retiring pipeline definition");
        self.wait_for_requests_to_drain();
        let mut topology = self.topology.write().unwrap_or_else(PoisonError::into_inner);
        *topology = Topology::default();
    }

    /// A model this definition may use changed. Returns true when the
    /// definition now requires revalidation.
    pub fn notify_used_model_changed(&self, model_name: &str) -> bool {
        if !self.uses_model(model_name) {
            return false;
        }
        match self.state() {
            DefinitionState::Begin | DefinitionState::Reloading | DefinitionState::Retired => {
                tracing::debug!(
                    pipeline = %self.name,
                    "Ignoring change of model {} while not subscribed",
                    model_name
                );
                false
            }
            _ => {
                tracing::info!(
                    pipeline = %self.name,
                    "Model {} changed, revalidation required",
                    model_name
                );
                self.handle(DefinitionEvent::UsedModelChanged);
                true
            }
        }
    }

    fn wait_for_requests_to_drain(&self) {
        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(1);
        while self.requests_handles.load(Ordering::Acquire) > 0 {
            if waited.as_millis() % 1000 == 0 {
                tracing::debug!(
                    pipeline = %self.name,
                    "Waiting for {} requests to finish",
                    self.requests_handles.load(Ordering::Acquire)
                );
            }
            std::thread::sleep(step);
            waited += step;
        }
    }

    /// Wait up to `timeout` for the definition to become available.
    pub fn wait_for_loaded(&self, timeout: Duration) -> PipelineResult<DefinitionUnloadGuard> {
        let guard = DefinitionUnloadGuard::new(Arc::clone(&self.requests_handles));
        let deadline = Instant::now() + timeout;
        let mut status = self.lock_status();
        loop {
            if status.is_available() {
                return Ok(guard);
            }
            if !status.can_end_loaded() {
                return Err(if status.state() == DefinitionState::Retired {
                    PipelineError::DefinitionNotLoadedAnymore(self.name.clone())
                } else {
                    PipelineError::DefinitionNotLoadedYet(self.name.clone())
                });
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    pipeline = %self.name,
                    "Definition still {} after {:?}",
                    status.state(),
                    timeout
                );
                return Err(PipelineError::DefinitionNotLoadedYet(self.name.clone()));
            }
            status = self
                .status_changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Build the per-request pipeline for `request`.
    pub fn create(
        &self,
        request: InferenceRequest,
        manager: Arc<dyn ModelManager>,
        libraries: &NodeLibraryRegistry,
    ) -> PipelineResult<Pipeline> {
        let guard = self.wait_for_loaded(self.settings.wait_for_loaded_timeout())?;
        let topology = self.read_topology();
        let request = Arc::new(request);
        let response = Arc::new(Mutex::new(InferenceResponse::default()));
        let mut pipeline = Pipeline::new(
            &self.name,
            manager,
            self.settings.clone(),
            Arc::clone(&response),
        );

        let mut ids: HashMap<&str, NodeId> = HashMap::new();
        for info in &topology.nodes {
            let kind = match &info.kind {
                NodeKindInfo::Entry { inputs } => {
                    NodeKind::Entry(EntryNode::new(Arc::clone(&request), inputs.clone()))
                }
                NodeKindInfo::Dl {
                    model_name,
                    model_version,
                } => NodeKind::Dl(DlNode::new(
                    model_name.clone(),
                    *model_version,
                    info.output_aliases.clone(),
                )),
                NodeKindInfo::Custom {
                    library_name,
                    params,
                } => NodeKind::Custom(CustomNode::new(
                    library_name.clone(),
                    libraries.get(library_name)?,
                    params.clone(),
                    info.output_aliases.clone(),
                )),
                NodeKindInfo::Exit => NodeKind::Exit(ExitNode::new(Arc::clone(&response))),
            };
            let mut node = Node::new(&info.name, kind);
            if let Some(count) = info.demultiply_count {
                node = node.with_demultiply(
                    DemultiplyCount::from_config(count),
                    self.settings.demultiply_limit,
                );
            }
            let gather_from = if info.is_exit() {
                &topology.exit_gather_from
            } else {
                &info.gather_from
            };
            if !gather_from.is_empty() {
                node = node.with_gather_from(gather_from.clone());
            }
            ids.insert(&info.name, pipeline.add_node(node));
        }

        let id_of = |name: &str| {
            ids.get(name).copied().ok_or_else(|| {
                PipelineError::Internal(format!("connection to unknown node {}", name))
            })
        };
        for (dependant, dependencies) in &topology.connections {
            for (dependency, aliases) in dependencies {
                pipeline.connect(id_of(dependency)?, id_of(dependant)?, aliases.clone())?;
            }
        }
        tracing::debug!(pipeline = %self.name, "Created pipeline with {} nodes", pipeline.node_count());
        Ok(pipeline.with_definition_guard(guard))
    }
}

impl std::fmt::Debug for PipelineDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDefinition")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("in_flight_requests", &self.in_flight_requests())
            .finish()
    }
}
