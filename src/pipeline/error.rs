//! Pipeline-specific error types.
//!
//! Every variant corresponds to one status code reported back to the
//! request that owns the failing node session. Logic faults (illegal
//! definition-state transitions, re-demultiplexing under a used name,
//! collapsing sessions out of order) are not represented here: they panic.

use thiserror::Error;

/// Errors that can occur within the pipeline system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    // ── Input contract ──
    #[error("Missing input: {0}")]
    InvalidMissingInput(String),

    #[error("Missing output: {0}")]
    InvalidMissingOutput(String),

    #[error("Invalid precision: {0}")]
    InvalidPrecision(String),

    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(String),

    #[error("Invalid batch dimension: {0}")]
    InvalidBatchDimension(String),

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Invalid content size: expected {expected} bytes, got {actual}")]
    InvalidContentSize { expected: usize, actual: usize },

    // ── Model resolution ──
    #[error("Model {0} is missing")]
    ModelMissing(String),

    #[error("Model {name} version {version} is not loaded yet")]
    ModelVersionNotLoadedYet { name: String, version: u64 },

    #[error("Model {name} version {version} is not loaded anymore")]
    ModelVersionNotLoadedAnymore { name: String, version: u64 },

    #[error("Model reload failed: {0}")]
    ModelReloadFailed(String),

    // ── Scheduling ──
    #[error("Stream id not ready yet")]
    StreamIdNotReadyYet,

    #[error("Stream could not be acquired for node {node} within {waited_ms} ms")]
    StreamAcquireTimeout { node: String, waited_ms: u64 },

    // ── Demultiplexing / gathering ──
    #[error("Demultiplexer produced no results")]
    DemultiplexerNoResults,

    #[error("Wrong number of dimensions to demultiply: {0}, must be at least 3")]
    WrongNumberOfDimensionsToDemultiply(usize),

    #[error("Wrong dim[0] size to demultiply: expected {expected}, got {actual}")]
    WrongDimensionSizeToDemultiply { expected: usize, actual: usize },

    #[error("Too large dim[0] size to demultiply: {size}, maximum allowed is {limit}")]
    TooLargeDimensionSizeToDemultiply { size: usize, limit: usize },

    #[error("Gathered shards have inconsistent dimensions: {0}")]
    InconsistentShardDimensions(String),

    // ── Accelerator faults ──
    #[error("Accelerator error while binding inputs: {0}")]
    AcceleratorDeserialization(String),

    #[error("Accelerator error during inference: {0}")]
    AcceleratorInference(String),

    #[error("Accelerator error while reading outputs: {0}")]
    AcceleratorSerialization(String),

    // ── Custom node libraries ──
    #[error("Node library execution failed with code {0}")]
    NodeLibraryExecutionFailed(i32),

    #[error("Node library returned no outputs")]
    NodeLibraryOutputsCorruptedCount,

    #[error("Node library output is missing a name")]
    NodeLibraryOutputMissingName,

    #[error("Node library output {0} has an invalid shape")]
    NodeLibraryInvalidShape(String),

    #[error("Node library output {name} has invalid content size: expected {expected}, got {actual}")]
    NodeLibraryInvalidContentSize {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Node library did not produce output {0}")]
    NodeLibraryMissingOutput(String),

    #[error("Invalid node library: {0}")]
    InvalidNodeLibrary(String),

    // ── Definition lifecycle ──
    #[error("Pipeline definition {0} is not loaded yet")]
    DefinitionNotLoadedYet(String),

    #[error("Pipeline definition {0} is not loaded anymore")]
    DefinitionNotLoadedAnymore(String),

    // ── Definition validation ──
    #[error("Pipeline is missing an entry or exit node")]
    MissingEntryOrExit,

    #[error("Pipeline has multiple entry nodes")]
    MultipleEntryNodes,

    #[error("Pipeline has multiple exit nodes")]
    MultipleExitNodes,

    #[error("Duplicate node name: {0}")]
    NodeNameDuplicate(String),

    #[error("Node {node} refers to missing node {missing}")]
    NodeReferringToMissingNode { node: String, missing: String },

    #[error("Node {node} refers to missing model {model}")]
    NodeReferringToMissingModel { node: String, model: String },

    #[error("Node {node} refers to missing output {output} of node {dependency}")]
    NodeReferringToMissingModelOutput {
        node: String,
        dependency: String,
        output: String,
    },

    #[error("Exit node {0} is used as a dependency")]
    ExitUsedAsNodeDependency(String),

    #[error("Node {node} gathers from non-existing node {gather_from}")]
    NodeGatherFromNotExistingNode { node: String, gather_from: String },

    #[error("Node {node} gathers from node {gather_from} which is not a demultiplexer")]
    NodeGatherFromNotDemultiplexer { node: String, gather_from: String },

    #[error("Wrong demultiplexer and gather nodes order: {0}")]
    WrongDemultiplexerGatherNodesOrder(String),

    #[error("Not all inputs of node {node} are connected, missing {input}")]
    NotAllInputsConnected { node: String, input: String },

    #[error("Connection to missing input {input} of node {node}")]
    ConnectionToMissingModelInput { node: String, input: String },

    #[error("Input {input} of node {node} is connected to multiple data sources")]
    ModelInputConnectedToMultipleDataSources { node: String, input: String },

    #[error("Cycle found in pipeline graph")]
    CycleFound,

    #[error("Pipeline contains nodes not connected to the exit node")]
    ContainsUnconnectedNodes,

    // ── Misc ──
    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable status code string, used in logs and by transport layers.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::InvalidMissingInput(_) => "INVALID_MISSING_INPUT",
            PipelineError::InvalidMissingOutput(_) => "INVALID_MISSING_OUTPUT",
            PipelineError::InvalidPrecision(_) => "INVALID_PRECISION",
            PipelineError::InvalidBatchSize(_) => "INVALID_BATCH_SIZE",
            PipelineError::InvalidBatchDimension(_) => "INVALID_BATCH_DIMENSION",
            PipelineError::InvalidShape(_) => "INVALID_SHAPE",
            PipelineError::InvalidContentSize { .. } => "INVALID_CONTENT_SIZE",
            PipelineError::ModelMissing(_) => "MODEL_MISSING",
            PipelineError::ModelVersionNotLoadedYet { .. } => "MODEL_VERSION_NOT_LOADED_YET",
            PipelineError::ModelVersionNotLoadedAnymore { .. } => {
                "MODEL_VERSION_NOT_LOADED_ANYMORE"
            }
            PipelineError::ModelReloadFailed(_) => "RESHAPE_ERROR",
            PipelineError::StreamIdNotReadyYet => "PIPELINE_STREAM_ID_NOT_READY_YET",
            PipelineError::StreamAcquireTimeout { .. } => "PIPELINE_STREAM_ACQUIRE_TIMEOUT",
            PipelineError::DemultiplexerNoResults => "PIPELINE_DEMULTIPLEXER_NO_RESULTS",
            PipelineError::WrongNumberOfDimensionsToDemultiply(_) => {
                "PIPELINE_WRONG_NUMBER_OF_DIMENSIONS_TO_DEMULTIPLY"
            }
            PipelineError::WrongDimensionSizeToDemultiply { .. } => {
                "PIPELINE_WRONG_DIMENSION_SIZE_TO_DEMULTIPLY"
            }
            PipelineError::TooLargeDimensionSizeToDemultiply { .. } => {
                "PIPELINE_TOO_LARGE_DIMENSION_SIZE_TO_DEMULTIPLY"
            }
            PipelineError::InconsistentShardDimensions(_) => {
                "PIPELINE_INCONSISTENT_SHARD_DIMENSIONS"
            }
            PipelineError::AcceleratorDeserialization(_) => "OV_INTERNAL_DESERIALIZATION_ERROR",
            PipelineError::AcceleratorInference(_) => "OV_INTERNAL_INFERENCE_ERROR",
            PipelineError::AcceleratorSerialization(_) => "OV_INTERNAL_SERIALIZATION_ERROR",
            PipelineError::NodeLibraryExecutionFailed(_) => "NODE_LIBRARY_EXECUTION_FAILED",
            PipelineError::NodeLibraryOutputsCorruptedCount => {
                "NODE_LIBRARY_OUTPUTS_CORRUPTED_COUNT"
            }
            PipelineError::NodeLibraryOutputMissingName => "NODE_LIBRARY_OUTPUT_MISSING_NAME",
            PipelineError::NodeLibraryInvalidShape(_) => "NODE_LIBRARY_INVALID_SHAPE",
            PipelineError::NodeLibraryInvalidContentSize { .. } => {
                "NODE_LIBRARY_INVALID_CONTENT_SIZE"
            }
            PipelineError::NodeLibraryMissingOutput(_) => "NODE_LIBRARY_MISSING_OUTPUT",
            PipelineError::InvalidNodeLibrary(_) => "PIPELINE_DEFINITION_INVALID_NODE_LIBRARY",
            PipelineError::DefinitionNotLoadedYet(_) => "PIPELINE_DEFINITION_NOT_LOADED_YET",
            PipelineError::DefinitionNotLoadedAnymore(_) => {
                "PIPELINE_DEFINITION_NOT_LOADED_ANYMORE"
            }
            PipelineError::MissingEntryOrExit => "PIPELINE_MISSING_ENTRY_OR_EXIT",
            PipelineError::MultipleEntryNodes => "PIPELINE_MULTIPLE_ENTRY_NODES",
            PipelineError::MultipleExitNodes => "PIPELINE_MULTIPLE_EXIT_NODES",
            PipelineError::NodeNameDuplicate(_) => "PIPELINE_NODE_NAME_DUPLICATE",
            PipelineError::NodeReferringToMissingNode { .. } => {
                "PIPELINE_NODE_REFERING_TO_MISSING_NODE"
            }
            PipelineError::NodeReferringToMissingModel { .. } => {
                "PIPELINE_NODE_REFERING_TO_MISSING_MODEL"
            }
            PipelineError::NodeReferringToMissingModelOutput { .. } => {
                "PIPELINE_NODE_REFERING_TO_MISSING_MODEL_OUTPUT"
            }
            PipelineError::ExitUsedAsNodeDependency(_) => "PIPELINE_EXIT_USED_AS_NODE_DEPENDENCY",
            PipelineError::NodeGatherFromNotExistingNode { .. } => {
                "PIPELINE_NODE_GATHER_FROM_NOT_EXISTING_NODE"
            }
            PipelineError::NodeGatherFromNotDemultiplexer { .. } => {
                "PIPELINE_NODE_GATHER_FROM_NOT_DEMULTIPLEXER"
            }
            PipelineError::WrongDemultiplexerGatherNodesOrder(_) => {
                "PIPELINE_WRONG_DEMULTIPLEXER_GATHER_NODES_ORDER"
            }
            PipelineError::NotAllInputsConnected { .. } => "PIPELINE_NOT_ALL_INPUTS_CONNECTED",
            PipelineError::ConnectionToMissingModelInput { .. } => {
                "PIPELINE_CONNECTION_TO_MISSING_MODEL_INPUT"
            }
            PipelineError::ModelInputConnectedToMultipleDataSources { .. } => {
                "PIPELINE_MODEL_INPUT_CONNECTED_TO_MULTIPLE_DATA_SOURCES"
            }
            PipelineError::CycleFound => "PIPELINE_CYCLE_FOUND",
            PipelineError::ContainsUnconnectedNodes => "PIPELINE_CONTAINS_UNCONNECTED_NODES",
            PipelineError::Unsupported(_) => "NOT_IMPLEMENTED",
            PipelineError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Resource signals the caller may retry instead of failing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::StreamIdNotReadyYet | PipelineError::DefinitionNotLoadedYet(_)
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
