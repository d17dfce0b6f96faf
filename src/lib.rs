//! # dagserve: DAG pipeline execution for model serving
//!
//! An inference request runs through a directed acyclic graph of nodes:
//! an entry node that seeds the request tensors, DL model nodes that run
//! on pooled accelerator streams, custom library nodes, and an exit node
//! that assembles the response. Nodes may fan their outputs out into
//! shards and later nodes gather them back.
//!
//! ## Architecture
//!
//! - **Definitions**: validated once per (re)load, gated by a lifecycle state machine
//! - **Pipelines**: one per request, scheduled by a completion event queue
//! - **Accelerator**: a collaborator seam (`ModelManager`, `InferRequest`) with an in-process mock
//! - **Configuration**: TOML engine settings plus JSON pipeline definitions
//!
//! ## Configuration
//!
//! Engine settings are read from `dagserve.toml` in the platform config
//! directory under `dev.dagserve`, or from the path in `DAGSERVE_CONFIG`.
//!
//! ## Example
//!
//! ```ignore
//! use dagserve::{
//!     accelerator::mock::{MockAcceleratorManager, MockModelConfig},
//!     config::{EngineConfig, PipelineConfigFile},
//!     pipeline::NodeLibraryRegistry,
//!     types::{InferenceRequest, Tensor},
//! };
//! use std::sync::Arc;
//!
//! let config = EngineConfig::load_or_default(EngineConfig::default_path());
//! let manager = Arc::new(MockAcceleratorManager::new()?);
//! manager.load(MockModelConfig::dummy("dummy", 10));
//! let libraries = NodeLibraryRegistry::new();
//!
//! let file = PipelineConfigFile::load("pipelines.json")?;
//! for definition in file.definitions(&config.scheduler)? {
//!     definition.validate(manager.as_ref(), &libraries)?;
//!     let request = InferenceRequest::new()
//!         .with_input("in", Tensor::from_f32(vec![1, 10], &[0.0; 10])?);
//!     let response = definition.create(request, manager.clone(), &libraries)?.execute()?;
//! }
//! ```

pub mod accelerator;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod types;

// Re-export commonly used types
pub use accelerator::{InferRequest, InferRequestsQueue, ModelInstance, ModelManager};
pub use config::{EngineConfig, PipelineConfigFile, SchedulerSettings};
pub use error::{EngineError, Result, ResultExt};
pub use pipeline::{
    CustomNodeLibrary, NodeLibraryRegistry, Pipeline, PipelineDefinition, PipelineError,
    PipelineResult,
};
pub use types::{InferenceRequest, InferenceResponse, Precision, Tensor, TensorInfo};
