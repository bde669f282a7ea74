//! The implementing agent: a long-lived external session that writes code
//! and is resumed with feedback until the work is accepted.
//!
//! - [`AgentSession`]: the boundary trait (`start` / `resume`)
//! - [`AgentDriver`]: owns the session id of one cycle, applies call
//!   controls and maps session outcomes to [`AgentError`]
//! - [`CommandAgent`]: JSON-over-stdio implementation

pub mod command;

use std::sync::Arc;

use accdd_store::{Changeset, CycleId, CycleInputs};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::Feedback;
use crate::execution::{call_with_controls, CallError, CallPolicy, CancelSignal};

pub use command::CommandAgent;

/// Initial task handed to a new session.
#[derive(Debug, Clone, Serialize)]
pub struct AgentTask {
    pub cycle_id: CycleId,
    pub instruction: String,
    pub inputs: CycleInputs,
}

impl AgentTask {
    pub fn for_cycle(cycle_id: &CycleId, inputs: &CycleInputs) -> Self {
        Self {
            cycle_id: cycle_id.clone(),
            instruction: format!(
                "Implement cycle {cycle_id} according to the specification. \
                 The acceptance scenarios must pass."
            ),
            inputs: inputs.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed,
    TimedOut,
}

/// What a session reports after a `start` or `resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub session_id: String,
    pub status: SessionStatus,
    /// `None` when the session did not touch any file this round.
    #[serde(default)]
    pub changeset: Option<Changeset>,
    #[serde(default)]
    pub detail: Option<String>,
}

#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn start(&self, task: &AgentTask) -> Result<SessionResult, CallError>;

    async fn resume(&self, session_id: &str, feedback: &Feedback)
        -> Result<SessionResult, CallError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    #[error("agent produced no result within {limit_ms}ms")]
    TimedOut { limit_ms: u64 },

    #[error("agent failed: {0}")]
    Failed(String),

    #[error("agent call cancelled")]
    Cancelled,

    #[error("no agent session to resume")]
    NoSession,

    #[error("agent session {0} already started")]
    AlreadyStarted(String),
}

impl From<CallError> for AgentError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Timeout { limit_ms } => AgentError::TimedOut { limit_ms },
            CallError::Cancelled => AgentError::Cancelled,
            other => AgentError::Failed(other.to_string()),
        }
    }
}

/// Successful agent round.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub session_id: String,
    pub changeset: Option<Changeset>,
}

/// Drives the one agent session of a cycle.
///
/// At most one session is ever started per driver. Once an id is known
/// (from `attach` or from any `start` reply, even a failed one) all further
/// work goes through `resume` on that id.
pub struct AgentDriver {
    agent: Arc<dyn AgentSession>,
    policy: CallPolicy,
    session_id: Option<String>,
}

impl AgentDriver {
    pub fn new(agent: Arc<dyn AgentSession>, policy: CallPolicy) -> Self {
        Self {
            agent,
            policy,
            session_id: None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Adopt an existing session (hot resume).
    pub fn attach(&mut self, session_id: impl Into<String>) {
        self.session_id = Some(session_id.into());
    }

    #[instrument(skip_all, fields(cycle_id = %task.cycle_id))]
    pub async fn start(
        &mut self,
        task: &AgentTask,
        cancel: &CancelSignal,
    ) -> Result<AgentOutput, AgentError> {
        if let Some(id) = &self.session_id {
            return Err(AgentError::AlreadyStarted(id.clone()));
        }
        let agent = &self.agent;
        let result = call_with_controls("agent.start", &self.policy, cancel, || agent.start(task))
            .await?;
        self.accept(result)
    }

    #[instrument(skip_all, fields(feedback = feedback.kind()))]
    pub async fn resume(
        &mut self,
        feedback: &Feedback,
        cancel: &CancelSignal,
    ) -> Result<AgentOutput, AgentError> {
        let session_id = self.session_id.clone().ok_or(AgentError::NoSession)?;
        let agent = &self.agent;
        let sid = session_id.as_str();
        let result = call_with_controls("agent.resume", &self.policy, cancel, || {
            agent.resume(sid, feedback)
        })
        .await?;
        self.accept(result)
    }

    fn accept(&mut self, result: SessionResult) -> Result<AgentOutput, AgentError> {
        debug!(session_id = %result.session_id, status = ?result.status, "agent round finished");
        if self.session_id.is_none() {
            self.session_id = Some(result.session_id.clone());
        }
        match result.status {
            SessionStatus::Completed => Ok(AgentOutput {
                session_id: result.session_id,
                changeset: result.changeset,
            }),
            SessionStatus::TimedOut => Err(AgentError::TimedOut {
                limit_ms: self.policy.timeout_ms,
            }),
            SessionStatus::Failed => Err(AgentError::Failed(
                result.detail.unwrap_or_else(|| "session reported failure".into()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{AgentReply, ScriptedAgent};

    fn inputs() -> CycleInputs {
        CycleInputs {
            specification: "spec".into(),
            schema: None,
            acceptance_scenarios: "uat".into(),
        }
    }

    fn task() -> AgentTask {
        AgentTask::for_cycle(&CycleId::new("01").unwrap(), &inputs())
    }

    #[tokio::test]
    async fn start_records_session_id() {
        let agent = Arc::new(ScriptedAgent::new("s-1"));
        let mut driver = AgentDriver::new(agent.clone(), CallPolicy::default());
        let out = driver.start(&task(), &CancelSignal::never()).await.unwrap();
        assert_eq!(out.session_id, "s-1");
        assert_eq!(driver.session_id(), Some("s-1"));
    }

    #[tokio::test]
    async fn second_start_is_refused() {
        let agent = Arc::new(ScriptedAgent::new("s-1"));
        let mut driver = AgentDriver::new(agent.clone(), CallPolicy::default());
        driver.start(&task(), &CancelSignal::never()).await.unwrap();
        let err = driver.start(&task(), &CancelSignal::never()).await.unwrap_err();
        assert_eq!(err, AgentError::AlreadyStarted("s-1".into()));
        assert_eq!(agent.start_count(), 1);
    }

    #[tokio::test]
    async fn failed_start_still_yields_session_id() {
        let agent = Arc::new(ScriptedAgent::new("s-1").on_start(AgentReply::Failed("quota".into())));
        let mut driver = AgentDriver::new(agent.clone(), CallPolicy::default());
        let err = driver.start(&task(), &CancelSignal::never()).await.unwrap_err();
        assert_eq!(err, AgentError::Failed("quota".into()));
        assert_eq!(driver.session_id(), Some("s-1"));
    }

    #[tokio::test]
    async fn resume_without_session_is_refused() {
        let agent = Arc::new(ScriptedAgent::new("s-1"));
        let mut driver = AgentDriver::new(agent, CallPolicy::default());
        let err = driver
            .resume(&Feedback::Continue, &CancelSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::NoSession);
    }

    #[tokio::test]
    async fn attached_session_is_resumed() {
        let agent = Arc::new(ScriptedAgent::new("s-9"));
        let mut driver = AgentDriver::new(agent.clone(), CallPolicy::default());
        driver.attach("s-9");
        driver
            .resume(&Feedback::Continue, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(agent.start_count(), 0);
        assert_eq!(agent.resumed_sessions(), vec!["s-9".to_string()]);
    }

    #[tokio::test]
    async fn reported_timeout_maps_to_timed_out() {
        let agent = Arc::new(ScriptedAgent::new("s-1").on_start(AgentReply::TimedOut));
        let policy = CallPolicy::default();
        let mut driver = AgentDriver::new(agent, policy);
        let err = driver.start(&task(), &CancelSignal::never()).await.unwrap_err();
        assert_eq!(
            err,
            AgentError::TimedOut {
                limit_ms: policy.timeout_ms
            }
        );
    }
}
