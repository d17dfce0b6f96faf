//! ExitNode: writes the gathered pipeline outputs into the response.

use super::NodeContext;
use crate::pipeline::error::PipelineResult;
use crate::pipeline::node_session::NodeSession;
use crate::types::InferenceResponse;
use std::sync::{Arc, Mutex, PoisonError};

pub struct ExitNode {
    response: Arc<Mutex<InferenceResponse>>,
}

impl ExitNode {
    pub fn new(response: Arc<Mutex<InferenceResponse>>) -> Self {
        Self { response }
    }

    pub fn response(&self) -> &Arc<Mutex<InferenceResponse>> {
        &self.response
    }

    /// Move the session's inputs into the response. Inputs gathered
    /// straight into the response are already there.
    pub fn execute(&self, session: &mut NodeSession, ctx: &NodeContext) -> PipelineResult<()> {
        let inputs = session.input_handler().get_inputs();
        {
            let mut response = self.response.lock().unwrap_or_else(PoisonError::into_inner);
            response.outputs.extend(inputs);
        }
        session.input_handler().clear_inputs();
        ctx.events.push(ctx.node_id, session.key().clone());
        Ok(())
    }
}
