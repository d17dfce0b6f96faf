//! Node kinds of a pipeline.
//!
//! Every node of a request's graph is one of four closed kinds, dispatched
//! through [`NodeKind`] without trait objects on the scheduling path.

pub mod custom;
pub mod dl;
pub mod entry;
pub mod exit;

pub use custom::{CustomNode, CustomNodeLibrary, CustomNodeTensor, NodeLibraryRegistry};
pub use dl::{DlNode, DlNodeSession};
pub use entry::EntryNode;
pub use exit::ExitNode;

use crate::accelerator::ModelManager;
use crate::pipeline::event_queue::EventSender;
use crate::pipeline::id::NodeId;
use std::time::Duration;

/// Context passed to a node when one of its sessions is dispatched.
pub struct NodeContext<'a> {
    pub node_id: NodeId,
    pub node_name: &'a str,
    /// Completion queue of the owning request
    pub events: &'a EventSender,
    pub manager: &'a dyn ModelManager,
    /// How long a DL session may wait for a free stream
    pub stream_wait_timeout: Duration,
}

/// Enum dispatch over node kinds.
pub enum NodeKind {
    Entry(EntryNode),
    Dl(DlNode),
    Custom(CustomNode),
    Exit(ExitNode),
}

impl NodeKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodeKind::Entry(_) => "entry",
            NodeKind::Dl(_) => "DL model",
            NodeKind::Custom(_) => "custom",
            NodeKind::Exit(_) => "exit",
        }
    }

    pub fn is_exit(&self) -> bool {
        matches!(self, NodeKind::Exit(_))
    }
}
