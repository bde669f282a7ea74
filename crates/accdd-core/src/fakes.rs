//! Scripted fakes for every external collaborator (testing only)
//!
//! Each fake plays back a queue of scripted replies and falls back to a
//! well-behaved default once the queue is empty, so a test only scripts the
//! calls it cares about. Every fake records what it was asked to do.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use accdd_store::{Changeset, ContentDigest, CycleId, Fileset, UatVerdict};
use async_trait::async_trait;

use crate::agent::{AgentSession, AgentTask, SessionResult, SessionStatus};
use crate::domain::Feedback;
use crate::execution::CallError;
use crate::integrate::{IntegrationError, Integrator, MergeRequest};
use crate::review::{CommitteeAuditor, QaAnalyst, ReviewContext, ReviewDecision};
use crate::sandbox::{ExecOutput, SandboxId, SandboxProvider};

/// Path every default agent reply writes to.
pub const SCRIPTED_FILE: &str = "src/lib.rs";

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AgentReply {
    /// Completed with these files changed.
    Diff(Fileset),
    /// Completed without touching any file.
    NoChange,
    /// Session reported failure.
    Failed(String),
    /// Session reported that it ran out of time.
    TimedOut,
    /// Transport error that may succeed on retry.
    Transient(String),
    /// Never answers.
    Hang,
}

/// Agent session fake.
///
/// Default replies: `start` writes `src/lib.rs = "v0"`, the n-th `resume`
/// writes `src/lib.rs = "v{n}"`.
pub struct ScriptedAgent {
    session_id: String,
    start_replies: Mutex<VecDeque<AgentReply>>,
    resume_replies: Mutex<VecDeque<AgentReply>>,
    starts: AtomicU32,
    resumes: Mutex<Vec<(String, Feedback)>>,
}

impl ScriptedAgent {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            start_replies: Mutex::new(VecDeque::new()),
            resume_replies: Mutex::new(VecDeque::new()),
            starts: AtomicU32::new(0),
            resumes: Mutex::new(Vec::new()),
        }
    }

    pub fn on_start(self, reply: AgentReply) -> Self {
        self.start_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn then_resume(self, reply: AgentReply) -> Self {
        self.resume_replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn resume_count(&self) -> usize {
        self.resumes.lock().unwrap().len()
    }

    /// Session ids passed to `resume`, in call order.
    pub fn resumed_sessions(&self) -> Vec<String> {
        self.resumes
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Feedback passed to `resume`, in call order.
    pub fn feedback(&self) -> Vec<Feedback> {
        self.resumes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, f)| f.clone())
            .collect()
    }

    async fn play(&self, reply: AgentReply) -> Result<SessionResult, CallError> {
        let result = |status, changeset, detail| SessionResult {
            session_id: self.session_id.clone(),
            status,
            changeset,
            detail,
        };
        match reply {
            AgentReply::Diff(files) => Ok(result(
                SessionStatus::Completed,
                Some(Changeset::new("scripted change", files)),
                None,
            )),
            AgentReply::NoChange => Ok(result(SessionStatus::Completed, None, None)),
            AgentReply::Failed(detail) => Ok(result(SessionStatus::Failed, None, Some(detail))),
            AgentReply::TimedOut => Ok(result(SessionStatus::TimedOut, None, None)),
            AgentReply::Transient(msg) => Err(CallError::Transient(msg)),
            AgentReply::Hang => std::future::pending().await,
        }
    }
}

fn version(n: usize) -> Fileset {
    [(SCRIPTED_FILE, format!("v{n}"))].into_iter().collect()
}

#[async_trait]
impl AgentSession for ScriptedAgent {
    async fn start(&self, _task: &AgentTask) -> Result<SessionResult, CallError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .start_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| AgentReply::Diff(version(0)));
        self.play(reply).await
    }

    async fn resume(&self, session_id: &str, feedback: &Feedback) -> Result<SessionResult, CallError> {
        let n = {
            let mut resumes = self.resumes.lock().unwrap();
            resumes.push((session_id.to_string(), feedback.clone()));
            resumes.len()
        };
        let reply = self
            .resume_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| AgentReply::Diff(version(n)));
        self.play(reply).await
    }
}

// ---------------------------------------------------------------------------
// Committee auditor
// ---------------------------------------------------------------------------

/// What an auditor saw on one review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenReview {
    pub iteration: u32,
    pub position: usize,
    pub attempt_number: u32,
    pub diff_digest: ContentDigest,
}

pub struct ScriptedAuditor {
    name: String,
    replies: Mutex<VecDeque<Result<ReviewDecision, CallError>>>,
    fallback: ReviewDecision,
    seen: Mutex<Vec<SeenReview>>,
}

impl ScriptedAuditor {
    fn with_fallback(name: impl Into<String>, fallback: ReviewDecision) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(VecDeque::new()),
            fallback,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn approving(name: impl Into<String>) -> Self {
        Self::with_fallback(name, ReviewDecision::approve())
    }

    /// Rejects every review.
    pub fn always_rejecting(name: impl Into<String>) -> Self {
        Self::with_fallback(name, ReviewDecision::reject(["never satisfied"]))
    }

    /// Rejects the first `times` reviews, then approves.
    pub fn rejecting(name: impl Into<String>, times: usize) -> Self {
        let auditor = Self::approving(name);
        for i in 0..times {
            auditor.push(Ok(ReviewDecision::reject([format!("issue {}", i + 1)])));
        }
        auditor
    }

    pub fn then(self, reply: Result<ReviewDecision, CallError>) -> Self {
        self.push(reply);
        self
    }

    fn push(&self, reply: Result<ReviewDecision, CallError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn review_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn seen(&self) -> Vec<SeenReview> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommitteeAuditor for ScriptedAuditor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn review(&self, ctx: &ReviewContext<'_>) -> Result<ReviewDecision, CallError> {
        self.seen.lock().unwrap().push(SeenReview {
            iteration: ctx.iteration,
            position: ctx.position,
            attempt_number: ctx.attempt_number,
            diff_digest: ctx.diff_digest.clone(),
        });
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

// ---------------------------------------------------------------------------
// QA analyst
// ---------------------------------------------------------------------------

/// Passes every evaluation unless scripted otherwise.
#[derive(Default)]
pub struct ScriptedQa {
    replies: Mutex<VecDeque<Result<UatVerdict, CallError>>>,
    calls: AtomicU32,
}

impl ScriptedQa {
    pub fn passing() -> Self {
        Self::default()
    }

    pub fn then(self, reply: Result<UatVerdict, CallError>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QaAnalyst for ScriptedQa {
    async fn evaluate(&self, _test_log: &str, _acceptance: &str) -> Result<UatVerdict, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| Ok(UatVerdict::pass("all scenarios pass")))
    }
}

// ---------------------------------------------------------------------------
// Sandbox provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ExecReply {
    /// Command ran and exited with this code.
    Exit(i32),
    /// Provider failed to run the command.
    Error(CallError),
    /// Provider panics mid-call.
    Panic,
    /// Never answers.
    Hang,
}

#[derive(Default)]
struct SandboxState {
    provisions: u32,
    uploads: Vec<String>,
    execs: u32,
    destroys: u32,
    live: HashSet<SandboxId>,
    files: BTreeMap<String, String>,
    events: Vec<String>,
    exec_replies: VecDeque<ExecReply>,
    provision_failures: VecDeque<CallError>,
}

/// Sandbox provider that records every call and keeps uploaded files in
/// memory. `exec` exits 0 unless scripted otherwise.
#[derive(Default)]
pub struct RecordingSandbox {
    state: Mutex<SandboxState>,
}

impl RecordingSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_exec(self, reply: ExecReply) -> Self {
        self.state.lock().unwrap().exec_replies.push_back(reply);
        self
    }

    pub fn failing_provision(self, error: CallError) -> Self {
        self.state.lock().unwrap().provision_failures.push_back(error);
        self
    }

    pub fn provision_count(&self) -> u32 {
        self.state.lock().unwrap().provisions
    }

    pub fn upload_count(&self) -> usize {
        self.state.lock().unwrap().uploads.len()
    }

    /// Uploaded paths in upload order.
    pub fn uploaded_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn exec_count(&self) -> u32 {
        self.state.lock().unwrap().execs
    }

    pub fn destroy_count(&self) -> u32 {
        self.state.lock().unwrap().destroys
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// `provision`, `upload:<path>`, `exec`, `destroy`, in call order.
    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl SandboxProvider for RecordingSandbox {
    async fn provision(&self, _template: &str) -> Result<SandboxId, CallError> {
        let mut state = self.state.lock().unwrap();
        state.events.push("provision".into());
        if let Some(err) = state.provision_failures.pop_front() {
            return Err(err);
        }
        state.provisions += 1;
        let id = SandboxId::new(format!("fake-{}", state.provisions));
        state.live.insert(id.clone());
        Ok(id)
    }

    async fn upload(&self, _id: &SandboxId, path: &str, content: &str) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.events.push(format!("upload:{path}"));
        state.uploads.push(path.to_string());
        state.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn exec(
        &self,
        _id: &SandboxId,
        command: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput, CallError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.events.push("exec".into());
            state.execs += 1;
            state.exec_replies.pop_front().unwrap_or(ExecReply::Exit(0))
        };
        match reply {
            ExecReply::Exit(code) => Ok(ExecOutput {
                exit_code: code,
                stdout: format!("ran {}\n", command.join(" ")),
                stderr: if code == 0 {
                    String::new()
                } else {
                    format!("exit status {code}\n")
                },
            }),
            ExecReply::Error(err) => Err(err),
            ExecReply::Panic => panic!("sandbox exec exploded"),
            ExecReply::Hang => std::future::pending().await,
        }
    }

    async fn destroy(&self, id: &SandboxId) -> Result<(), CallError> {
        let mut state = self.state.lock().unwrap();
        state.events.push("destroy".into());
        state.destroys += 1;
        state.live.remove(id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Integrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum MergeReply {
    Merge,
    Conflict(Vec<String>),
    Fail(String),
}

/// One merge the integrator accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedChange {
    pub cycle_id: CycleId,
    pub branch: String,
    pub base_ref: String,
    pub diff_digest: ContentDigest,
}

/// Integrator that records merges and tracks how many ran at once.
#[derive(Default)]
pub struct RecordingIntegrator {
    replies: Mutex<VecDeque<MergeReply>>,
    merged: Mutex<Vec<MergedChange>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingIntegrator {
    pub const BASE_REF: &'static str = "base-0";

    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every merge for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn then(self, reply: MergeReply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn merged(&self) -> Vec<MergedChange> {
        self.merged.lock().unwrap().clone()
    }

    /// Highest number of merges observed running concurrently.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Integrator for RecordingIntegrator {
    async fn base_ref(&self, _branch: &str) -> Result<String, IntegrationError> {
        Ok(Self::BASE_REF.to_string())
    }

    async fn integrate(&self, request: &MergeRequest<'_>) -> Result<String, IntegrationError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(MergeReply::Merge);
        match reply {
            MergeReply::Merge => {
                let mut merged = self.merged.lock().unwrap();
                merged.push(MergedChange {
                    cycle_id: request.cycle_id.clone(),
                    branch: request.branch.to_string(),
                    base_ref: request.base_ref.to_string(),
                    diff_digest: request.changeset.digest(),
                });
                Ok(format!("merged-{}", merged.len()))
            }
            MergeReply::Conflict(paths) => Err(IntegrationError::Conflict { paths }),
            MergeReply::Fail(detail) => Err(IntegrationError::Failed(detail)),
        }
    }
}
