//! Graph vertex of a per-request pipeline.
//!
//! A [`Node`] wraps one [`NodeKind`] plus the wiring the scheduler needs:
//! incoming dependencies (one [`EdgeId`] per dependency node), dependants,
//! demultiplex/gather settings, and the arena of live sessions keyed by
//! session key. Sessions are created lazily on the first delivery and
//! removed once their results have been fetched.

use crate::accelerator::ModelManager;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::event_queue::EventSender;
use crate::pipeline::id::{EdgeId, NodeId};
use crate::pipeline::input_handler::{
    GatherNodeInputHandler, GatherTarget, InputHandler, NodeInputHandler,
};
use crate::pipeline::node_session::{NodeSession, SessionResources, SessionState};
use crate::pipeline::nodes::{DlNodeSession, NodeContext, NodeKind};
use crate::pipeline::session_metadata::{NodeSessionMetadata, SessionKey};
use crate::types::{shape_to_string, TensorMap};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Largest dim 0 a demultiplexer accepts unless configured otherwise.
pub const DEFAULT_DEMULTIPLY_LIMIT: usize = 10_000;

/// One incoming connection of a node.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub node: NodeId,
    pub edge: EdgeId,
    /// (dependency output alias, own input name)
    pub aliases: Vec<(String, String)>,
}

/// How many shards a demultiplexer produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemultiplyCount {
    /// Whatever dim 0 of the outputs is
    Dynamic,
    Fixed(usize),
}

impl DemultiplyCount {
    /// Config value to count: negative means dynamic.
    pub fn from_config(count: i64) -> Self {
        usize::try_from(count)
            .map(DemultiplyCount::Fixed)
            .unwrap_or(DemultiplyCount::Dynamic)
    }
}

/// Output sets of one finished session, one per produced (sub)session.
pub type SessionResults = Vec<(NodeSessionMetadata, TensorMap)>;

pub struct Node {
    id: NodeId,
    name: String,
    kind: NodeKind,
    demultiply: Option<DemultiplyCount>,
    demultiply_limit: usize,
    gather_from: BTreeSet<String>,
    dependencies: Vec<Dependency>,
    dependants: Vec<NodeId>,
    /// Output aliases consumed by dependants
    required_outputs: BTreeSet<String>,
    sessions: HashMap<SessionKey, NodeSession>,
}

impl Node {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::INVALID,
            name: name.into(),
            kind,
            demultiply: None,
            demultiply_limit: DEFAULT_DEMULTIPLY_LIMIT,
            gather_from: BTreeSet::new(),
            dependencies: Vec::new(),
            dependants: Vec::new(),
            required_outputs: BTreeSet::new(),
            sessions: HashMap::new(),
        }
    }

    pub fn with_demultiply(mut self, count: DemultiplyCount, limit: usize) -> Self {
        self.demultiply = Some(count);
        self.demultiply_limit = limit;
        self
    }

    pub fn with_gather_from(mut self, gather_from: BTreeSet<String>) -> Self {
        self.gather_from = gather_from;
        self
    }

    pub(crate) fn set_id(&mut self, id: NodeId) {
        self.id = id;
    }

    // ── Accessors ──

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn demultiply(&self) -> Option<DemultiplyCount> {
        self.demultiply
    }

    pub fn gather_from(&self) -> &BTreeSet<String> {
        &self.gather_from
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn dependants(&self) -> &[NodeId] {
        &self.dependants
    }

    pub fn required_outputs(&self) -> &BTreeSet<String> {
        &self.required_outputs
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_state(&self, key: &str) -> Option<SessionState> {
        self.sessions.get(key).map(NodeSession::state)
    }

    // ── Wiring ──

    pub fn add_dependency(&mut self, dependency: Dependency) {
        self.dependencies.push(dependency);
    }

    /// Register `dependant` and the outputs it consumes.
    pub fn add_dependant<'a>(
        &mut self,
        dependant: NodeId,
        consumed_outputs: impl IntoIterator<Item = &'a str>,
    ) -> PipelineResult<()> {
        if self.kind.is_exit() {
            return Err(PipelineError::Unsupported(format!(
                "exit node {} cannot have dependants",
                self.name
            )));
        }
        if !self.dependants.contains(&dependant) {
            self.dependants.push(dependant);
        }
        self.required_outputs
            .extend(consumed_outputs.into_iter().map(str::to_string));
        Ok(())
    }

    // ── Sessions ──

    /// Session with no dependencies, for the entry node.
    pub fn create_root_session(&mut self) -> SessionKey {
        let metadata = NodeSessionMetadata::new();
        let key = metadata.session_key();
        let handler: Arc<dyn InputHandler> = Arc::new(NodeInputHandler::new(0));
        let session = NodeSession::new(&self.name, metadata, handler, self.new_resources());
        self.sessions.insert(key.clone(), session);
        key
    }

    fn new_resources(&self) -> SessionResources {
        match self.kind {
            NodeKind::Dl(_) => SessionResources::Dl(DlNodeSession::new()),
            _ => SessionResources::None,
        }
    }

    /// Find or create the session `metadata` delivers into. Returns its key
    /// and the shard slot of the delivery.
    fn ensure_session(
        &mut self,
        metadata: &NodeSessionMetadata,
    ) -> PipelineResult<(SessionKey, u32)> {
        let dependencies = self.dependencies.len() as u32;
        if self.gather_from.is_empty() {
            let key = metadata.session_key();
            if !self.sessions.contains_key(&key) {
                let handler: Arc<dyn InputHandler> = Arc::new(NodeInputHandler::new(dependencies));
                let session =
                    NodeSession::new(&self.name, metadata.clone(), handler, self.new_resources());
                self.sessions.insert(key.clone(), session);
            }
            return Ok((key, 0));
        }

        let shard_id = metadata.shard_id(&self.gather_from).ok_or_else(|| {
            PipelineError::Internal(format!(
                "node {} gathers more shards than fit a shard index",
                self.name
            ))
        })?;
        let (collapsed, details) = metadata.collapsed_metadata(&self.gather_from);
        let key = collapsed.session_key();
        if !self.sessions.contains_key(&key) {
            let target = match &self.kind {
                NodeKind::Exit(exit) => GatherTarget::Response(Arc::clone(exit.response())),
                _ => GatherTarget::Stored,
            };
            tracing::debug!(
                node = %self.name,
                session = %key,
                "Creating gathering session over {} shards",
                details.total_shards()
            );
            let handler: Arc<dyn InputHandler> =
                Arc::new(GatherNodeInputHandler::new(dependencies, details, target));
            let session = NodeSession::new(&self.name, collapsed, handler, self.new_resources());
            self.sessions.insert(key.clone(), session);
        }
        Ok((key, shard_id))
    }

    /// Deliver the results of dependency `from` into this node's sessions.
    /// Returns the keys of sessions that became ready.
    pub fn set_inputs(
        &mut self,
        from: NodeId,
        results: &SessionResults,
    ) -> PipelineResult<Vec<SessionKey>> {
        let dependency = self
            .dependencies
            .iter()
            .find(|d| d.node == from)
            .cloned()
            .ok_or_else(|| {
                PipelineError::Internal(format!("node {} does not depend on {}", self.name, from))
            })?;

        let mut ready = Vec::new();
        for (metadata, outputs) in results {
            let (key, shard_id) = self.ensure_session(metadata)?;
            let session = self
                .sessions
                .get_mut(&key)
                .ok_or_else(|| PipelineError::Internal(format!("session {} vanished", key)))?;
            for (output, input) in &dependency.aliases {
                let tensor = outputs.get(output).ok_or_else(|| {
                    PipelineError::InvalidMissingOutput(format!(
                        "dependency of {} did not produce {}",
                        self.name, output
                    ))
                })?;
                session
                    .input_handler()
                    .set_input(input, tensor.clone(), shard_id)?;
            }
            if session
                .input_handler()
                .notify_finished_dependency(dependency.edge)?
            {
                session.set_state(SessionState::Ready);
                ready.push(key);
            }
        }
        Ok(ready)
    }

    /// Dispatch the session `key`.
    pub fn execute(
        &mut self,
        key: &str,
        events: &EventSender,
        manager: &dyn ModelManager,
        stream_wait_timeout: Duration,
    ) -> PipelineResult<()> {
        let ctx = NodeContext {
            node_id: self.id,
            node_name: &self.name,
            events,
            manager,
            stream_wait_timeout,
        };
        let session = self.sessions.get_mut(key).ok_or_else(|| {
            PipelineError::Internal(format!("no session {} on node {}", key, self.name))
        })?;
        session.set_state(SessionState::Executing);

        let result = match &self.kind {
            NodeKind::Entry(node) => node.execute(session, &ctx),
            NodeKind::Dl(node) => node.execute(session, &ctx),
            NodeKind::Custom(node) => node.execute(session, &ctx),
            NodeKind::Exit(node) => node.execute(session, &ctx),
        };
        match &result {
            Ok(()) => {}
            Err(PipelineError::StreamIdNotReadyYet) => session.set_state(SessionState::Ready),
            Err(e) => {
                tracing::warn!(node = %self.name, session = %key, "Execution failed: {}", e);
                session.set_state(SessionState::Failed);
            }
        }
        result
    }

    /// Collect the outputs of the finished session `key`, releasing it.
    /// Demultiplexers split the outputs into one set per shard.
    pub fn fetch_results(&mut self, key: &str) -> PipelineResult<SessionResults> {
        let mut session = self.sessions.remove(key).ok_or_else(|| {
            PipelineError::Internal(format!("no session {} on node {}", key, self.name))
        })?;
        let outputs = match &self.kind {
            NodeKind::Entry(node) => node.fetch_results(),
            NodeKind::Dl(node) => node.fetch_results(&mut session, &self.required_outputs),
            NodeKind::Custom(node) => node.fetch_results(&mut session, &self.required_outputs),
            NodeKind::Exit(_) => Ok(TensorMap::new()),
        };
        session.release();
        let outputs = match outputs {
            Ok(outputs) => outputs,
            Err(e) => {
                session.set_state(SessionState::Failed);
                return Err(e);
            }
        };
        session.set_state(SessionState::Done);

        let metadata = session.metadata().clone();
        match self.demultiply {
            Some(count) => self.demultiply_outputs(&metadata, count, outputs),
            None => Ok(vec![(metadata, outputs)]),
        }
    }

    fn demultiply_outputs(
        &self,
        metadata: &NodeSessionMetadata,
        count: DemultiplyCount,
        outputs: TensorMap,
    ) -> PipelineResult<SessionResults> {
        let mut shards: Option<usize> = None;
        for (name, tensor) in &outputs {
            let shape = tensor.shape();
            if shape.len() < 3 {
                tracing::debug!(
                    node = %self.name,
                    "Cannot demultiply {} with shape {}",
                    name,
                    shape_to_string(shape)
                );
                return Err(PipelineError::WrongNumberOfDimensionsToDemultiply(shape.len()));
            }
            let size = shape[0];
            if size > self.demultiply_limit {
                return Err(PipelineError::TooLargeDimensionSizeToDemultiply {
                    size,
                    limit: self.demultiply_limit,
                });
            }
            if let DemultiplyCount::Fixed(expected) = count {
                if size != expected {
                    return Err(PipelineError::WrongDimensionSizeToDemultiply {
                        expected,
                        actual: size,
                    });
                }
            }
            match shards {
                None => shards = Some(size),
                Some(expected) if expected != size => {
                    return Err(PipelineError::WrongDimensionSizeToDemultiply {
                        expected,
                        actual: size,
                    })
                }
                Some(_) => {}
            }
        }
        let shards = match shards {
            Some(n) if n > 0 => n,
            _ => return Err(PipelineError::DemultiplexerNoResults),
        };

        let metas = metadata.generate_subsessions(&self.name, shards as u32);
        let mut results = Vec::with_capacity(shards);
        for (i, meta) in metas.into_iter().enumerate() {
            let mut shard_outputs = TensorMap::new();
            for (name, tensor) in &outputs {
                let step = tensor.byte_size() / shards;
                let shard = tensor.share_slice(i * step, step, tensor.shape()[1..].to_vec())?;
                shard_outputs.insert(name.clone(), shard);
            }
            results.push((meta, shard_outputs));
        }
        tracing::debug!(node = %self.name, "Demultiplied into {} shards", shards);
        Ok(results)
    }

    /// Cancel a pending stream reservation of `key`. False while its
    /// inference is in flight.
    pub fn try_disarm(&mut self, key: &str) -> bool {
        self.sessions
            .get_mut(key)
            .map(NodeSession::try_disarm)
            .unwrap_or(true)
    }

    /// Drop the session `key` and everything it holds.
    pub fn release(&mut self, key: &str) {
        if let Some(mut session) = self.sessions.remove(key) {
            session.release();
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.kind_name())
            .field("demultiply", &self.demultiply)
            .field("gather_from", &self.gather_from)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
