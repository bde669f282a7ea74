use accdd_store::{CycleId, CycleInputs};
use async_trait::async_trait;
use serde::Serialize;

use crate::domain::Feedback;
use crate::execution::CallError;
use crate::process::invoke_json;

use super::{AgentSession, AgentTask, SessionResult};

#[derive(Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
enum AgentRequest<'a> {
    Start {
        cycle_id: &'a CycleId,
        instruction: &'a str,
        inputs: &'a CycleInputs,
    },
    Resume {
        session_id: &'a str,
        feedback: &'a Feedback,
        instruction: String,
    },
}

/// Agent backed by an external command.
///
/// Each call runs the command once with a JSON request on stdin
/// (`mode` = `start` | `resume`) and reads a `SessionResult` from stdout.
/// Session state lives on the other side; only the id crosses over.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: Vec<String>,
}

impl CommandAgent {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AgentSession for CommandAgent {
    async fn start(&self, task: &AgentTask) -> Result<SessionResult, CallError> {
        let request = AgentRequest::Start {
            cycle_id: &task.cycle_id,
            instruction: &task.instruction,
            inputs: &task.inputs,
        };
        invoke_json(&self.command, &[], &request).await
    }

    async fn resume(
        &self,
        session_id: &str,
        feedback: &Feedback,
    ) -> Result<SessionResult, CallError> {
        let request = AgentRequest::Resume {
            session_id,
            feedback,
            instruction: feedback.render(),
        };
        invoke_json(&self.command, &[], &request).await
    }
}
