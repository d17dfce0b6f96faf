//! Accelerator collaborator seam
//!
//! The engine never talks to hardware directly. It resolves models through a
//! [`ModelManager`], reads their tensor specs through [`ModelInstance`], and
//! runs inference on pooled [`InferRequest`]s borrowed from an
//! [`InferRequestsQueue`].
//!
//! Every call into an [`InferRequest`] goes through [`guarded`], which turns
//! both returned errors and panics raised inside a native binding into an
//! [`AcceleratorError`]. Nothing from the accelerator unwinds into the
//! scheduler.
//!
//! # Enabling the mock
//!
//! An in-process accelerator lives in [`mock`] behind the `mock-accelerator`
//! feature, which is on by default.

mod infer_queue;
#[cfg(feature = "mock-accelerator")]
pub mod mock;

pub use infer_queue::{InferRequestsQueue, StreamId, StreamPoolStats};

use crate::pipeline::PipelineResult;
use crate::types::{BatchingMode, Shape, ShapeMode, Tensor, TensorInfoMap};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// One-shot completion notification handed to [`InferRequest::start_async`].
pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Fault reported by the accelerator binding
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcceleratorError {
    /// The binding returned an error
    #[error("{operation} failed: {message}")]
    Native { operation: String, message: String },

    /// The binding panicked
    #[error("{operation} panicked: {message}")]
    Panicked { operation: String, message: String },

    /// No tensor with this name is bound to the request
    #[error("tensor {0} not found")]
    TensorNotFound(String),

    /// Inference has not been started on the request
    #[error("inference not started")]
    NotStarted,
}

impl AcceleratorError {
    pub fn native(operation: impl Into<String>, message: impl Into<String>) -> Self {
        AcceleratorError::Native {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run one accelerator call, converting a panic into [`AcceleratorError::Panicked`].
pub fn guarded<T, F>(operation: &str, f: F) -> Result<T, AcceleratorError>
where
    F: FnOnce() -> Result<T, AcceleratorError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Accelerator {} panicked: {}", operation, message);
            Err(AcceleratorError::Panicked {
                operation: operation.to_string(),
                message,
            })
        }
    }
}

/// One pooled inference execution context.
///
/// A request is used by one session at a time; the pool hands it out under
/// a [`StreamId`].
#[cfg_attr(test, mockall::automock)]
pub trait InferRequest: Send {
    /// Bind an input tensor
    fn set_tensor(&mut self, name: &str, tensor: &Tensor) -> Result<(), AcceleratorError>;

    /// Start inference. `callback` fires exactly once when results are ready.
    fn start_async(&mut self, callback: CompletionCallback) -> Result<(), AcceleratorError>;

    /// Block until the inference started last has finished
    fn wait(&mut self) -> Result<(), AcceleratorError>;

    /// Read an output tensor of the finished inference
    fn get_tensor(&self, name: &str) -> Result<Tensor, AcceleratorError>;
}

/// A loaded model version.
pub trait ModelInstance: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> u64;

    /// Current input specs; they change when the model is reloaded.
    fn inputs_info(&self) -> TensorInfoMap;

    fn outputs_info(&self) -> TensorInfoMap;

    fn batching_mode(&self) -> BatchingMode;

    /// Shape mode configured for one input
    fn shape_mode(&self, input: &str) -> ShapeMode;

    /// Reload with a new batch size and/or new input shapes.
    fn reload_model(
        &self,
        batch_size: Option<usize>,
        reshapes: &BTreeMap<String, Shape>,
    ) -> Result<(), AcceleratorError>;

    /// Stream pool of this instance
    fn infer_requests_queue(&self) -> Arc<InferRequestsQueue>;
}

/// Resolves model names to live instances.
#[cfg_attr(test, mockall::automock)]
pub trait ModelManager: Send + Sync {
    /// Resolve `name` at `version` (latest available if `None`).
    ///
    /// The returned guard keeps the instance loaded until dropped.
    fn find_model_instance(
        &self,
        name: &str,
        version: Option<u64>,
    ) -> PipelineResult<(Arc<dyn ModelInstance>, ModelInstanceUnloadGuard)>;
}

/// Keeps a model instance from being unloaded while held.
#[derive(Debug)]
pub struct ModelInstanceUnloadGuard {
    users: Arc<AtomicUsize>,
}

impl ModelInstanceUnloadGuard {
    pub fn new(users: Arc<AtomicUsize>) -> Self {
        users.fetch_add(1, Ordering::AcqRel);
        Self { users }
    }
}

impl Drop for ModelInstanceUnloadGuard {
    fn drop(&mut self) {
        self.users.fetch_sub(1, Ordering::AcqRel);
    }
}
