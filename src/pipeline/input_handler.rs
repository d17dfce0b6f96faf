//! Input accumulation for node sessions.
//!
//! A handler collects the tensors delivered to one node session and counts
//! the dependency edges that have not finished yet. The decrement to zero is
//! the single trigger that makes a session ready, so
//! [`InputHandler::notify_finished_dependency`] reports `true` exactly once.
//!
//! [`GatherNodeInputHandler`] additionally collects one shard per collapsed
//! subsession. An edge only counts as finished once all of its shards have
//! arrived; the shards are then concatenated in shard order under a new
//! leading dimension. For the exit node the gathered tensors can be written
//! straight into the response instead of the handler's inputs.

use super::error::{PipelineError, PipelineResult};
use super::id::EdgeId;
use super::session_metadata::{CollapseDetails, SessionId};
use crate::types::{shape_to_string, InferenceResponse, Precision, Shape, Tensor, TensorMap};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Accumulates the inputs of one node session.
pub trait InputHandler: Send + Sync {
    /// Store `tensor` as input `name`. Plain handlers ignore `shard_id`.
    fn set_input(&self, name: &str, tensor: Tensor, shard_id: SessionId) -> PipelineResult<()>;

    /// Record one delivery on `edge`. Returns true exactly once, when the
    /// last outstanding dependency finishes.
    fn notify_finished_dependency(&self, edge: EdgeId) -> PipelineResult<bool>;

    fn is_ready(&self) -> bool;

    fn remaining_dependencies(&self) -> u32;

    /// Inputs for execution. Marks the handler as used.
    fn get_inputs(&self) -> TensorMap;

    fn is_used(&self) -> bool;

    /// Drop the stored tensors once execution no longer needs them.
    fn clear_inputs(&self);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Input handler of a node session that does not gather.
#[derive(Debug)]
pub struct NodeInputHandler {
    inputs: Mutex<TensorMap>,
    remaining_dependencies: AtomicU32,
    used: AtomicBool,
}

impl NodeInputHandler {
    pub fn new(dependencies: u32) -> Self {
        Self {
            inputs: Mutex::new(TensorMap::new()),
            remaining_dependencies: AtomicU32::new(dependencies),
            used: AtomicBool::new(false),
        }
    }

    fn decrement(&self) -> PipelineResult<bool> {
        let previous = self
            .remaining_dependencies
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| {
                PipelineError::Internal("dependency finished on a ready session".to_string())
            })?;
        Ok(previous == 1)
    }

    fn insert(&self, name: &str, tensor: Tensor) {
        lock(&self.inputs).insert(name.to_string(), tensor);
    }
}

impl InputHandler for NodeInputHandler {
    fn set_input(&self, name: &str, tensor: Tensor, _shard_id: SessionId) -> PipelineResult<()> {
        self.insert(name, tensor);
        Ok(())
    }

    fn notify_finished_dependency(&self, _edge: EdgeId) -> PipelineResult<bool> {
        self.decrement()
    }

    fn is_ready(&self) -> bool {
        self.remaining_dependencies.load(Ordering::Acquire) == 0
    }

    fn remaining_dependencies(&self) -> u32 {
        self.remaining_dependencies.load(Ordering::Acquire)
    }

    fn get_inputs(&self) -> TensorMap {
        self.used.store(true, Ordering::Release);
        lock(&self.inputs).clone()
    }

    fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    fn clear_inputs(&self) {
        lock(&self.inputs).clear();
    }
}

/// Where a gathering handler puts its concatenated tensors.
#[derive(Clone)]
pub enum GatherTarget {
    /// Into the handler's own inputs
    Stored,
    /// Straight into the request's response (exit node)
    Response(Arc<Mutex<InferenceResponse>>),
}

/// Preallocated output buffer filled shard by shard.
struct DirectBuffer {
    precision: Precision,
    shard_shape: Shape,
    shard_bytes: usize,
    data: Vec<u8>,
    filled: Vec<bool>,
}

#[derive(Default)]
struct GatherState {
    shards: BTreeMap<String, BTreeMap<SessionId, Tensor>>,
    direct: BTreeMap<String, DirectBuffer>,
    arrivals: HashMap<EdgeId, usize>,
}

/// Input handler of a node session that gathers demultiplexed shards.
pub struct GatherNodeInputHandler {
    base: NodeInputHandler,
    details: CollapseDetails,
    total_shards: usize,
    target: GatherTarget,
    state: Mutex<GatherState>,
}

impl GatherNodeInputHandler {
    pub fn new(dependencies: u32, details: CollapseDetails, target: GatherTarget) -> Self {
        let total_shards = details.total_shards();
        Self {
            base: NodeInputHandler::new(dependencies),
            details,
            total_shards,
            target,
            state: Mutex::new(GatherState::default()),
        }
    }

    pub fn collapse_details(&self) -> &CollapseDetails {
        &self.details
    }

    fn gathered_shape(&self, shard_shape: &[usize]) -> Shape {
        self.details
            .collapsed_session_sizes
            .iter()
            .map(|&s| s as usize)
            .chain(shard_shape.iter().copied())
            .collect()
    }

    fn write_direct(
        &self,
        state: &mut GatherState,
        name: &str,
        tensor: &Tensor,
        shard_id: SessionId,
    ) -> PipelineResult<()> {
        let total = self.total_shards;
        let buffer = state
            .direct
            .entry(name.to_string())
            .or_insert_with(|| DirectBuffer {
                precision: tensor.precision(),
                shard_shape: tensor.shape().to_vec(),
                shard_bytes: tensor.byte_size(),
                data: vec![0u8; tensor.byte_size() * total],
                filled: vec![false; total],
            });
        if buffer.precision != tensor.precision() || buffer.shard_shape != tensor.shape() {
            return Err(PipelineError::InconsistentShardDimensions(format!(
                "{}: shard {} is {} {}, expected {} {}",
                name,
                shard_id,
                tensor.precision(),
                shape_to_string(tensor.shape()),
                buffer.precision,
                shape_to_string(&buffer.shard_shape)
            )));
        }
        let slot = shard_id as usize;
        if buffer.filled[slot] {
            return Err(PipelineError::Internal(format!(
                "shard {} of {} delivered twice",
                shard_id, name
            )));
        }
        let offset = slot * buffer.shard_bytes;
        buffer.data[offset..offset + buffer.shard_bytes].copy_from_slice(tensor.as_bytes());
        buffer.filled[slot] = true;
        Ok(())
    }

    fn gather(&self, state: &mut GatherState) -> PipelineResult<()> {
        for (name, shards) in std::mem::take(&mut state.shards) {
            if shards.len() != self.total_shards {
                return Err(PipelineError::Internal(format!(
                    "gathering {} with {} of {} shards",
                    name,
                    shards.len(),
                    self.total_shards
                )));
            }
            let Some(first) = shards.values().next() else {
                continue;
            };
            let (precision, shard_shape) = (first.precision(), first.shape().to_vec());
            let mut data = Vec::with_capacity(first.byte_size() * self.total_shards);
            for (shard_id, shard) in &shards {
                if shard.precision() != precision || shard.shape() != shard_shape.as_slice() {
                    return Err(PipelineError::InconsistentShardDimensions(format!(
                        "{}: shard {} is {} {}, shard 0 is {} {}",
                        name,
                        shard_id,
                        shard.precision(),
                        shape_to_string(shard.shape()),
                        precision,
                        shape_to_string(&shard_shape)
                    )));
                }
                data.extend_from_slice(shard.as_bytes());
            }
            let gathered = Tensor::new(precision, self.gathered_shape(&shard_shape), data)?;
            tracing::debug!(
                "Gathered {} shards of {} into {}",
                self.total_shards,
                name,
                shape_to_string(gathered.shape())
            );
            self.base.insert(&name, gathered);
        }

        if let GatherTarget::Response(response) = &self.target {
            let mut response = lock(response);
            for (name, buffer) in std::mem::take(&mut state.direct) {
                if buffer.filled.iter().any(|f| !f) {
                    return Err(PipelineError::Internal(format!(
                        "gathering {} with missing shards",
                        name
                    )));
                }
                let shape = self.gathered_shape(&buffer.shard_shape);
                let tensor = Tensor::new(buffer.precision, shape, buffer.data)?;
                response.outputs.insert(name, tensor);
            }
        }
        Ok(())
    }
}

impl InputHandler for GatherNodeInputHandler {
    fn set_input(&self, name: &str, tensor: Tensor, shard_id: SessionId) -> PipelineResult<()> {
        if shard_id as usize >= self.total_shards {
            return Err(PipelineError::Internal(format!(
                "shard {} out of range, gathering {} shards",
                shard_id, self.total_shards
            )));
        }
        let mut state = lock(&self.state);
        match self.target {
            GatherTarget::Stored => {
                state
                    .shards
                    .entry(name.to_string())
                    .or_default()
                    .insert(shard_id, tensor);
                Ok(())
            }
            GatherTarget::Response(_) => self.write_direct(&mut state, name, &tensor, shard_id),
        }
    }

    fn notify_finished_dependency(&self, edge: EdgeId) -> PipelineResult<bool> {
        let mut state = lock(&self.state);
        let arrived = state.arrivals.entry(edge).or_insert(0);
        *arrived += 1;
        if *arrived < self.total_shards {
            return Ok(false);
        }
        if *arrived > self.total_shards {
            return Err(PipelineError::Internal(format!(
                "edge {:?} delivered more than {} shards",
                edge, self.total_shards
            )));
        }
        if !self.base.decrement()? {
            return Ok(false);
        }
        self.gather(&mut state)?;
        Ok(true)
    }

    fn is_ready(&self) -> bool {
        self.base.is_ready()
    }

    fn remaining_dependencies(&self) -> u32 {
        self.base.remaining_dependencies()
    }

    fn get_inputs(&self) -> TensorMap {
        self.base.get_inputs()
    }

    fn is_used(&self) -> bool {
        self.base.is_used()
    }

    fn clear_inputs(&self) {
        self.base.clear_inputs();
        let mut state = lock(&self.state);
        state.shards.clear();
        state.direct.clear();
    }
}
