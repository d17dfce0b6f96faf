//! DAG pipeline execution engine.
//!
//! A request enters through the entry node, flows through DL model and
//! custom library nodes, and is assembled into a response by the exit
//! node. Any node may fan its outputs out into shards (demultiplexing);
//! a later node gathers them back.
//!
//! # Architecture
//!
//! ```text
//!                    PipelineDefinition (validated once)
//!                                │ create()
//!                                ▼
//! [request] ──► [DL model] ──► [custom] ──► [DL model] ──► [response]
//!     │              │  demultiply            gather_from      ▲
//!     │              └──► shards 0..N ──► ... ────────────────┘
//!     │
//!     └─ Pipeline::execute(): PipelineEventQueue ◄── inference callbacks
//! ```
//!
//! # Design
//!
//! - **Enum dispatch** - `NodeKind` covers the four node kinds, no trait objects when scheduling.
//! - **Sessions keyed by metadata** - one `NodeSession` per shard, keyed by the canonical session key.
//! - **Completion queue** - nodes push `(NodeId, SessionKey)` when done; the loop is the only consumer.
//! - **Zero-copy shards** - demultiplexed tensors are views over the parent buffer.
//! - **Deferral, not blocking** - a DL session without a free stream is retried after the next event.
//! - **Definition lifecycle** - `PipelineDefinitionStatus` gates requests on validation and reloads.

pub mod definition;
pub mod definition_status;
pub mod error;
pub mod event_queue;
pub mod executor;
pub mod id;
pub mod input_handler;
pub mod node;
pub mod node_session;
pub mod nodes;
pub mod output_handler;
pub mod session_metadata;
pub mod stream_guard;
pub mod validation;

pub use definition::{
    connect, Connections, DefinitionUnloadGuard, NodeInfo, NodeKindInfo, PipelineDefinition,
    ENTRY_NODE_NAME, EXIT_NODE_NAME,
};
pub use definition_status::{
    DefinitionEvent, DefinitionState, ModelVersionState, ModelVersionStatusErrorCode,
    PipelineDefinitionStatus,
};
pub use error::{PipelineError, PipelineResult};
pub use event_queue::{EventSender, PipelineEvent, PipelineEventQueue};
pub use executor::Pipeline;
pub use id::{EdgeId, NodeId};
pub use input_handler::{GatherNodeInputHandler, GatherTarget, InputHandler, NodeInputHandler};
pub use node::{DemultiplyCount, Dependency, Node, SessionResults};
pub use node_session::{NodeSession, SessionState};
pub use nodes::{
    CustomNode, CustomNodeLibrary, CustomNodeTensor, NodeContext, NodeKind, NodeLibraryRegistry,
};
pub use output_handler::NodeOutputHandler;
pub use session_metadata::{CollapseDetails, NodeSessionMetadata, SessionId, SessionKey};
pub use stream_guard::StreamIdGuard;
