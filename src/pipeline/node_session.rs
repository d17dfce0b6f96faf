//! One execution instance of a node for one session key.

use super::input_handler::InputHandler;
use super::nodes::dl::DlNodeSession;
use super::output_handler::NodeOutputHandler;
use super::session_metadata::{NodeSessionMetadata, SessionKey};
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a node session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for dependencies
    Created,
    /// All dependencies delivered
    Ready,
    /// Dispatched, possibly running on the accelerator
    Executing,
    /// Outputs fetched and resources released
    Done,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "CREATED",
            SessionState::Ready => "READY",
            SessionState::Executing => "EXECUTING",
            SessionState::Done => "DONE",
            SessionState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Per-kind resources a session holds while executing
#[derive(Debug, Default)]
pub enum SessionResources {
    #[default]
    None,
    Dl(DlNodeSession),
}

pub struct NodeSession {
    node_name: String,
    metadata: NodeSessionMetadata,
    key: SessionKey,
    input_handler: Arc<dyn InputHandler>,
    output_handler: NodeOutputHandler,
    state: SessionState,
    resources: SessionResources,
}

impl NodeSession {
    pub fn new(
        node_name: impl Into<String>,
        metadata: NodeSessionMetadata,
        input_handler: Arc<dyn InputHandler>,
        resources: SessionResources,
    ) -> Self {
        let key = metadata.session_key();
        Self {
            node_name: node_name.into(),
            metadata,
            key,
            input_handler,
            output_handler: NodeOutputHandler::new(),
            state: SessionState::Created,
            resources,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn metadata(&self) -> &NodeSessionMetadata {
        &self.metadata
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn input_handler(&self) -> &Arc<dyn InputHandler> {
        &self.input_handler
    }

    pub fn outputs_mut(&mut self) -> &mut NodeOutputHandler {
        &mut self.output_handler
    }

    pub fn resources_mut(&mut self) -> &mut SessionResources {
        &mut self.resources
    }

    pub fn is_ready(&self) -> bool {
        self.input_handler.is_ready()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::trace!(
                node = %self.node_name,
                session = %self.key,
                "Session state {} -> {}",
                self.state,
                state
            );
            self.state = state;
        }
    }

    /// Cancel a pending stream reservation. Returns false while inference
    /// is in flight; the completion must be awaited instead.
    pub fn try_disarm(&mut self) -> bool {
        match &mut self.resources {
            SessionResources::Dl(dl) => dl.try_disarm(),
            SessionResources::None => true,
        }
    }

    /// Drop every held resource and input. Safe to call more than once.
    pub fn release(&mut self) {
        tracing::debug!(node = %self.node_name, session = %self.key, "Releasing session");
        if let SessionResources::Dl(dl) = &mut self.resources {
            dl.release();
        }
        self.input_handler.clear_inputs();
    }
}

impl fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSession")
            .field("node", &self.node_name)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("remaining", &self.input_handler.remaining_dependencies())
            .finish()
    }
}
