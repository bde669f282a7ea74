//! Cycle controller: drives one cycle from `Init` to `Done` or `Failed`.
//!
//! ```text
//! Init → SandboxReady → Implementing → Testing ─┬─ pass → Auditing ─┬─ approve (more seats) → Auditing
//!                                      ▲        │                   ├─ approve (last seat)  → UatEval ─┬─ pass → Merging → Done
//!                                      │        └─ fail ──┐         └─ reject               ──┐        └─ fail ─┐
//!                                      └──────── Fixing ◄─┴───────────────────────────────────┴─────────────────┘
//! ```
//!
//! All per-cycle state lives in a private `CycleRun` owned by
//! [`CycleController::run_cycle`]; nothing is shared between cycles except
//! the injected collaborators and the per-branch merge locks. The sandbox is
//! torn down exactly once on every exit path, including panics inside a
//! phase, and the terminal record is archived before the outcome returns.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use accdd_store::{
    ArtifactStore, AuditVerdict, Changeset, ContentDigest, CycleId, CycleInputs, CycleRecord,
    CycleStatus, FailureReason, Phase, SessionManifest, StorageError, TestRunResult, UatRecord,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentDriver, AgentError, AgentSession, AgentTask};
use crate::config::{CallPolicies, Settings};
use crate::domain::{excerpt_tail, Committee, CycleSession, Feedback, RejectionOutcome};
use crate::execution::{call_with_controls, CallError, CancelSignal};
use crate::integrate::{BranchLocks, IntegrationError, Integrator, MergeRequest};
use crate::metrics::METRICS;
use crate::obs;
use crate::review::{CommitteeAuditor, QaAnalyst, ReviewContext};
use crate::sandbox::{SandboxError, SandboxHandle, SandboxPolicies, SandboxProvider};

/// Collaborators shared by every cycle a controller runs.
#[derive(Clone)]
pub struct CycleDeps {
    pub store: Arc<dyn ArtifactStore>,
    pub sandbox: Arc<dyn SandboxProvider>,
    pub agent: Arc<dyn AgentSession>,
    pub qa: Arc<dyn QaAnalyst>,
    pub integrator: Arc<dyn Integrator>,
    pub merge_locks: BranchLocks,
}

/// Per-cycle knobs.
#[derive(Clone)]
pub struct CycleConfig {
    pub max_iterations: u32,
    pub reviews_per_auditor: u32,
    /// Review order is vector order.
    pub auditors: Vec<Arc<dyn CommitteeAuditor>>,
    pub restart_committee_on_fix: bool,
}

impl CycleConfig {
    pub fn from_settings(settings: &Settings, auditors: Vec<Arc<dyn CommitteeAuditor>>) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            reviews_per_auditor: settings.reviews_per_auditor,
            auditors,
            restart_committee_on_fix: settings.restart_committee_on_fix,
        }
    }
}

impl std::fmt::Debug for CycleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleConfig")
            .field("max_iterations", &self.max_iterations)
            .field("reviews_per_auditor", &self.reviews_per_auditor)
            .field(
                "auditors",
                &self.auditors.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .field("restart_committee_on_fix", &self.restart_committee_on_fix)
            .finish()
    }
}

/// Settings the controller applies to every cycle.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub test_command: Vec<String>,
    pub sandbox_template: String,
    pub policies: CallPolicies,
    pub log_excerpt_limit_bytes: usize,
}

impl ControllerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            test_command: settings.test_command.clone(),
            sandbox_template: settings.sandbox.template.clone(),
            policies: settings.call_policies(),
            log_excerpt_limit_bytes: settings.log_excerpt_limit_bytes,
        }
    }
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            test_command: vec!["cargo".into(), "test".into()],
            sandbox_template: "empty".into(),
            policies: CallPolicies::default(),
            log_excerpt_limit_bytes: 50_000,
        }
    }
}

/// Terminal result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    pub cycle_id: CycleId,
    pub status: CycleStatus,
    pub reason: Option<FailureReason>,
    pub iteration_count: u32,
    pub merged_commit: Option<String>,
}

impl CycleOutcome {
    pub fn is_done(&self) -> bool {
        self.status == CycleStatus::Done
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason == Some(FailureReason::Cancelled)
    }
}

impl From<CycleRecord> for CycleOutcome {
    fn from(record: CycleRecord) -> Self {
        Self {
            cycle_id: record.cycle_id,
            status: record.status,
            reason: record.failure_reason,
            iteration_count: record.iteration_count,
            merged_commit: record.merged_commit,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-cycle state
// ---------------------------------------------------------------------------

struct CycleRun {
    session: CycleSession,
    committee: Committee,
    phase: Phase,
    transitions: Vec<Phase>,
    inputs: Option<CycleInputs>,
    base_ref: Option<String>,
    changeset: Changeset,
    diff_digest: ContentDigest,
    produced_diff: bool,
    pending_feedback: Option<Feedback>,
    tests: Vec<TestRunResult>,
    audits: Vec<AuditVerdict>,
    uat: Vec<UatRecord>,
    uat_passed_for: Option<ContentDigest>,
    session_started_at: Option<DateTime<Utc>>,
    merged_commit: Option<String>,
    started_at: DateTime<Utc>,
}

impl CycleRun {
    fn new(cycle_id: CycleId, integration_branch: &str, committee: Committee) -> Self {
        let changeset = Changeset::default();
        let diff_digest = changeset.digest();
        Self {
            session: CycleSession::new(cycle_id, integration_branch),
            committee,
            phase: Phase::Init,
            transitions: vec![Phase::Init],
            inputs: None,
            base_ref: None,
            changeset,
            diff_digest,
            produced_diff: false,
            pending_feedback: None,
            tests: Vec::new(),
            audits: Vec::new(),
            uat: Vec::new(),
            uat_passed_for: None,
            session_started_at: None,
            merged_commit: None,
            started_at: Utc::now(),
        }
    }

    fn cycle_id(&self) -> &CycleId {
        self.session.cycle_id()
    }

    fn enter(&mut self, next: Phase) {
        obs::emit_transition(
            self.cycle_id(),
            self.phase,
            next,
            self.session.iteration_count(),
        );
        self.phase = next;
        self.transitions.push(next);
    }

    fn inputs(&self) -> Result<&CycleInputs, FailureReason> {
        self.inputs.as_ref().ok_or_else(|| FailureReason::Internal {
            detail: "inputs not loaded".into(),
        })
    }

    fn last_test_log(&self) -> &str {
        self.tests
            .last()
            .map(|t| t.log_excerpt.as_str())
            .unwrap_or_default()
    }

    fn to_record(&self, failed_in: Option<Phase>, session_id: Option<String>) -> CycleRecord {
        CycleRecord {
            cycle_id: self.cycle_id().clone(),
            integration_branch: self.session.integration_branch().to_string(),
            status: self.session.status(),
            failure_reason: self.session.failure_reason().cloned(),
            failed_in,
            iteration_count: self.session.iteration_count(),
            committee_position: self.committee.position(),
            committee_size: self.committee.len(),
            attempts: self.committee.attempts_map(),
            transitions: self.transitions.clone(),
            tests: self.tests.clone(),
            audits: self.audits.clone(),
            uat: self.uat.clone(),
            session_id,
            final_diff_digest: self.produced_diff.then(|| self.diff_digest.clone()),
            merged_commit: self.merged_commit.clone(),
            started_at: self.started_at,
            finished_at: Some(Utc::now()),
        }
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn storage_failure(e: StorageError) -> FailureReason {
    FailureReason::StorageError {
        detail: e.to_string(),
    }
}

fn sandbox_failure(e: SandboxError, reason: fn(String) -> FailureReason) -> FailureReason {
    if e.is_cancelled() {
        FailureReason::Cancelled
    } else {
        reason(e.to_string())
    }
}

fn agent_failure(e: AgentError) -> FailureReason {
    match e {
        AgentError::TimedOut { limit_ms } => FailureReason::AgentTimeout { limit_ms },
        AgentError::Cancelled => FailureReason::Cancelled,
        other => FailureReason::AgentFailure {
            detail: other.to_string(),
        },
    }
}

fn integration_failure(e: IntegrationError) -> FailureReason {
    match e {
        IntegrationError::Conflict { paths } => FailureReason::MergeConflict {
            detail: paths.join(", "),
        },
        IntegrationError::Call(CallError::Cancelled) => FailureReason::Cancelled,
        other => FailureReason::IntegrationFailure {
            detail: other.to_string(),
        },
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".into())
}

// ---------------------------------------------------------------------------
// CycleController
// ---------------------------------------------------------------------------

pub struct CycleController {
    deps: CycleDeps,
    options: ControllerOptions,
}

impl CycleController {
    pub fn new(deps: CycleDeps, options: ControllerOptions) -> Self {
        Self { deps, options }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.deps.store
    }

    /// Run one cycle to a terminal state.
    ///
    /// Never returns an error: every failure, including a panic inside a
    /// phase, ends up as `CycleStatus::Failed` with a `FailureReason`.
    ///
    /// A cycle whose archived record is already `Done` is not run again:
    /// the archived outcome is returned and nothing is provisioned, merged
    /// or written.
    #[instrument(skip_all, fields(cycle_id = %cycle_id, branch = %integration_branch))]
    pub async fn run_cycle(
        &self,
        cycle_id: CycleId,
        integration_branch: &str,
        config: CycleConfig,
        cancel: CancelSignal,
    ) -> CycleOutcome {
        if let Some(outcome) = self.archived_outcome(&cycle_id).await {
            return outcome;
        }

        let started = Instant::now();
        METRICS.inc_cycles_started();
        obs::emit_cycle_started(
            &cycle_id,
            integration_branch,
            config.auditors.len(),
            config.max_iterations,
        );

        let mut run = CycleRun::new(
            cycle_id,
            integration_branch,
            Committee::new(config.auditors.clone()),
        );
        let p = &self.options.policies;
        let mut sandbox = SandboxHandle::new(
            self.deps.sandbox.clone(),
            SandboxPolicies {
                provision: p.provision,
                sync: p.sync,
                teardown: p.teardown,
            },
        );
        let mut agent = AgentDriver::new(self.deps.agent.clone(), p.agent);

        let driven = AssertUnwindSafe(self.drive(&mut run, &mut sandbox, &mut agent, &config, &cancel))
            .catch_unwind()
            .await;
        let result = match driven {
            Ok(result) => result,
            Err(payload) => Err(FailureReason::Internal {
                detail: format!("panic in {}: {}", run.phase, panic_message(&*payload)),
            }),
        };

        sandbox.teardown().await;
        self.finish(run, result, agent.session_id().map(str::to_string), started)
            .await
    }

    /// Outcome to return instead of running the cycle, if any.
    ///
    /// An unreadable archive is reported as a storage failure rather than
    /// risking a second merge of a finished cycle.
    async fn archived_outcome(&self, cycle_id: &CycleId) -> Option<CycleOutcome> {
        match self.deps.store.get_record(cycle_id).await {
            Ok(Some(record)) if record.status == CycleStatus::Done => {
                info!(
                    merged_commit = ?record.merged_commit,
                    "cycle already done, returning archived outcome"
                );
                Some(CycleOutcome::from(record))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "archived record unreadable, cycle not started");
                Some(CycleOutcome {
                    cycle_id: cycle_id.clone(),
                    status: CycleStatus::Failed,
                    reason: Some(storage_failure(e)),
                    iteration_count: 0,
                    merged_commit: None,
                })
            }
        }
    }

    async fn drive(
        &self,
        run: &mut CycleRun,
        sandbox: &mut SandboxHandle,
        agent: &mut AgentDriver,
        config: &CycleConfig,
        cancel: &CancelSignal,
    ) -> Result<(), FailureReason> {
        if run.committee.is_empty() {
            return Err(FailureReason::InvalidConfiguration {
                detail: "committee has no auditors".into(),
            });
        }

        loop {
            if run.phase == Phase::Done {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(FailureReason::Cancelled);
            }
            let next = match run.phase {
                Phase::Init => self.init(run, sandbox, cancel).await?,
                Phase::SandboxReady => Phase::Implementing,
                Phase::Implementing => self.implement(run, agent, cancel).await?,
                Phase::Testing => self.test(run, sandbox, config, cancel).await?,
                Phase::Auditing => self.audit(run, config, cancel).await?,
                Phase::Fixing => self.fix(run, agent, config, cancel).await?,
                Phase::UatEval => self.evaluate_uat(run, config, cancel).await?,
                Phase::Merging => self.merge(run, config, cancel).await?,
                Phase::Done | Phase::Failed => {
                    return Err(FailureReason::Internal {
                        detail: format!("drive loop entered terminal phase {}", run.phase),
                    })
                }
            };
            run.enter(next);
        }
    }

    async fn init(
        &self,
        run: &mut CycleRun,
        sandbox: &mut SandboxHandle,
        cancel: &CancelSignal,
    ) -> Result<Phase, FailureReason> {
        let inputs = self
            .deps
            .store
            .load_inputs(run.cycle_id())
            .await
            .map_err(storage_failure)?;

        sandbox
            .provision(&self.options.sandbox_template, cancel)
            .await
            .map_err(|e| {
                sandbox_failure(e, |detail| FailureReason::SandboxProvisionError { detail })
            })?;
        sandbox
            .sync(&inputs.to_fileset(), cancel)
            .await
            .map_err(|e| sandbox_failure(e, |detail| FailureReason::SyncError { detail }))?;

        let integrator = &self.deps.integrator;
        let branch = run.session.integration_branch();
        let base_ref = call_with_controls(
            "integrate.base_ref",
            &self.options.policies.merge,
            cancel,
            || integrator.base_ref(branch),
        )
        .await
        .map_err(integration_failure)?;
        debug!(base_ref = %base_ref, "integration base recorded");

        run.inputs = Some(inputs);
        run.base_ref = Some(base_ref);
        Ok(Phase::SandboxReady)
    }

    /// Start the agent session, or resume the one a previous run left
    /// behind.
    async fn implement(
        &self,
        run: &mut CycleRun,
        agent: &mut AgentDriver,
        cancel: &CancelSignal,
    ) -> Result<Phase, FailureReason> {
        let existing = self
            .deps
            .store
            .load_session(run.cycle_id())
            .await
            .map_err(storage_failure)?;

        let result = match existing {
            Some(manifest) => {
                info!(session_id = %manifest.session_id, "resuming existing agent session");
                self.restore_diff(run).await?;
                run.session_started_at = Some(manifest.started_at);
                agent.attach(manifest.session_id);
                agent.resume(&Feedback::Continue, cancel).await
            }
            None => {
                let task = AgentTask::for_cycle(run.cycle_id(), run.inputs()?);
                agent.start(&task, cancel).await
            }
        };
        // Persist the session id before looking at the outcome so a rerun
        // resumes instead of starting a second session.
        self.save_session(run, agent).await?;
        let output = result.map_err(agent_failure)?;
        self.adopt(run, output.changeset, 0).await?;
        if run.changeset.files.is_empty() {
            return Err(FailureReason::AgentFailure {
                detail: "agent produced no changes".into(),
            });
        }
        Ok(Phase::Testing)
    }

    /// Seed the cycle's diff with the latest one a previous run stored, so
    /// a resumed session that reports no new changes keeps its earlier work.
    async fn restore_diff(&self, run: &mut CycleRun) -> Result<(), FailureReason> {
        let latest = self
            .deps
            .store
            .latest_diff(run.cycle_id())
            .await
            .map_err(storage_failure)?;
        if let Some((iteration, changeset)) = latest {
            debug!(
                iteration,
                files = changeset.files.len(),
                "restored diff of previous run"
            );
            run.diff_digest = changeset.digest();
            run.changeset = changeset;
            run.produced_diff = true;
        }
        Ok(())
    }

    async fn test(
        &self,
        run: &mut CycleRun,
        sandbox: &mut SandboxHandle,
        config: &CycleConfig,
        cancel: &CancelSignal,
    ) -> Result<Phase, FailureReason> {
        sandbox
            .sync(&run.changeset.files, cancel)
            .await
            .map_err(|e| sandbox_failure(e, |detail| FailureReason::SyncError { detail }))?;

        let output = sandbox
            .exec(&self.options.test_command, &self.options.policies.exec, cancel)
            .await
            .map_err(|e| {
                sandbox_failure(e, |detail| FailureReason::TestExecutionError { detail })
            })?;

        let iteration = run.session.iteration_count();
        let result = TestRunResult {
            iteration,
            exit_code: output.exit_code,
            log_excerpt: excerpt_tail(&output.combined_log(), self.options.log_excerpt_limit_bytes),
            passed: output.exit_code == 0,
            diff_digest: run.diff_digest.clone(),
            recorded_at: Utc::now(),
        };
        self.deps
            .store
            .put_test_run(run.cycle_id(), &result)
            .await
            .map_err(storage_failure)?;
        obs::emit_test_run(run.cycle_id(), iteration, result.exit_code, result.passed);
        run.tests.push(result.clone());

        if result.passed {
            Ok(Phase::Auditing)
        } else {
            Self::route_to_fix(
                run,
                config,
                Feedback::TestFailure {
                    iteration,
                    exit_code: result.exit_code,
                    log_excerpt: result.log_excerpt,
                },
            )
        }
    }

    async fn audit(
        &self,
        run: &mut CycleRun,
        config: &CycleConfig,
        cancel: &CancelSignal,
    ) -> Result<Phase, FailureReason> {
        let position = run.committee.position();
        let auditor = run
            .committee
            .current()
            .cloned()
            .ok_or_else(|| FailureReason::Internal {
                detail: format!("no auditor at committee position {position}"),
            })?;
        let attempt_number = run.committee.attempts(position) + 1;
        let iteration = run.session.iteration_count();

        let decision = {
            let ctx = ReviewContext {
                cycle_id: run.cycle_id(),
                iteration,
                position,
                attempt_number,
                diff_digest: &run.diff_digest,
                changeset: &run.changeset,
                inputs: run.inputs()?,
                test_log: run.last_test_log(),
            };
            call_with_controls("audit.review", &self.options.policies.review, cancel, || {
                auditor.review(&ctx)
            })
            .await
        }
        .map_err(|e| match e {
            CallError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::AuditorFailure {
                position,
                detail: other.to_string(),
            },
        })?;
        METRICS.inc_audit_reviews();

        let verdict = AuditVerdict {
            position,
            auditor: auditor.name().to_string(),
            approved: decision.approved,
            critical_issues: decision.critical_issues.clone(),
            attempt_number,
            iteration,
            diff_digest: run.diff_digest.clone(),
            recorded_at: Utc::now(),
        };
        self.deps
            .store
            .append_audit(run.cycle_id(), &verdict)
            .await
            .map_err(storage_failure)?;
        obs::emit_audit_verdict(
            run.cycle_id(),
            position,
            auditor.name(),
            attempt_number,
            verdict.approved,
            verdict.critical_issues.len(),
        );
        run.audits.push(verdict);

        if decision.approved {
            let digest = run.diff_digest.clone();
            return Ok(if run.committee.approve(&digest) {
                Phase::UatEval
            } else {
                Phase::Auditing
            });
        }

        let limit = config.reviews_per_auditor;
        match run.committee.reject(limit) {
            RejectionOutcome::Exhausted { attempts } => {
                Err(FailureReason::AuditAttemptsExceeded {
                    position,
                    attempts,
                    limit,
                })
            }
            RejectionOutcome::Retry { .. } => Self::route_to_fix(
                run,
                config,
                Feedback::AuditRejection {
                    position,
                    auditor: auditor.name().to_string(),
                    critical_issues: decision.critical_issues,
                },
            ),
        }
    }

    /// Enter `Fixing` if the iteration budget allows another fix.
    fn route_to_fix(
        run: &mut CycleRun,
        config: &CycleConfig,
        feedback: Feedback,
    ) -> Result<Phase, FailureReason> {
        if !run.session.can_fix(config.max_iterations) {
            return Err(FailureReason::IterationBudgetExceeded {
                max_iterations: config.max_iterations,
            });
        }
        run.pending_feedback = Some(feedback);
        Ok(Phase::Fixing)
    }

    async fn fix(
        &self,
        run: &mut CycleRun,
        agent: &mut AgentDriver,
        config: &CycleConfig,
        cancel: &CancelSignal,
    ) -> Result<Phase, FailureReason> {
        let feedback = run
            .pending_feedback
            .take()
            .ok_or_else(|| FailureReason::Internal {
                detail: "fixing without feedback".into(),
            })?;
        let iteration = run.session.begin_fix(config.max_iterations)?;
        METRICS.inc_fix_iterations();
        debug!(iteration, feedback = feedback.kind(), "requesting fix");

        let result = agent.resume(&feedback, cancel).await;
        self.save_session(run, agent).await?;
        let output = result.map_err(agent_failure)?;
        self.adopt(run, output.changeset, iteration).await?;
        run.committee.on_new_diff(config.restart_committee_on_fix);
        Ok(Phase::Testing)
    }

    async fn evaluate_uat(
        &self,
        run: &mut CycleRun,
        config: &CycleConfig,
        cancel: &CancelSignal,
    ) -> Result<Phase, FailureReason> {
        let test_log = run.last_test_log().to_string();
        let scenarios = run.inputs()?.acceptance_scenarios.clone();
        let qa = &self.deps.qa;
        let verdict = call_with_controls("qa.evaluate", &self.options.policies.qa, cancel, || {
            qa.evaluate(&test_log, &scenarios)
        })
        .await
        .map_err(|e| match e {
            CallError::Cancelled => FailureReason::Cancelled,
            other => FailureReason::QaFailure {
                detail: other.to_string(),
            },
        })?;

        let iteration = run.session.iteration_count();
        let record = UatRecord {
            iteration,
            diff_digest: run.diff_digest.clone(),
            verdict: verdict.clone(),
            recorded_at: Utc::now(),
        };
        self.deps
            .store
            .put_uat(run.cycle_id(), &record)
            .await
            .map_err(storage_failure)?;
        obs::emit_uat_verdict(run.cycle_id(), iteration, verdict.passed());
        run.uat.push(record);

        if verdict.passed() {
            run.uat_passed_for = Some(run.diff_digest.clone());
            Ok(Phase::Merging)
        } else {
            Self::route_to_fix(
                run,
                config,
                Feedback::UatFailure {
                    summary: verdict.summary,
                },
            )
        }
    }

    async fn merge(
        &self,
        run: &mut CycleRun,
        config: &CycleConfig,
        cancel: &CancelSignal,
    ) -> Result<Phase, FailureReason> {
        let digest = run.diff_digest.clone();
        if run.changeset.files.is_empty() {
            return Err(FailureReason::Internal {
                detail: "merge gate: diff is empty".into(),
            });
        }
        if !run
            .committee
            .approves_for_merge(&digest, config.restart_committee_on_fix)
        {
            return Err(FailureReason::Internal {
                detail: format!("merge gate: committee approval does not cover diff {}", digest.short()),
            });
        }
        if run.uat_passed_for.as_ref() != Some(&digest) {
            return Err(FailureReason::Internal {
                detail: format!("merge gate: no passing UAT verdict for diff {}", digest.short()),
            });
        }
        let base_ref = run.base_ref.clone().ok_or_else(|| FailureReason::Internal {
            detail: "no integration base recorded".into(),
        })?;
        let branch = run.session.integration_branch().to_string();

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FailureReason::Cancelled),
            guard = self.deps.merge_locks.lock(&branch) => guard,
        };

        let request = MergeRequest {
            cycle_id: run.cycle_id(),
            branch: &branch,
            base_ref: &base_ref,
            changeset: &run.changeset,
            message: format!("ac-cdd: cycle {}\n\n{}", run.cycle_id(), run.changeset.summary),
        };
        // Once started, a merge runs to completion.
        let never = CancelSignal::never();
        let integrator = &self.deps.integrator;
        let commit = call_with_controls("integrate", &self.options.policies.merge, &never, || {
            integrator.integrate(&request)
        })
        .await
        .map_err(integration_failure)?;

        info!(commit = %commit, "cycle merged");
        run.merged_commit = Some(commit);
        Ok(Phase::Done)
    }

    /// Fold the files of a new changeset into the cycle's diff and store the
    /// result as the diff of `iteration`. Files the agent did not touch this
    /// round keep their previous content.
    async fn adopt(
        &self,
        run: &mut CycleRun,
        changeset: Option<Changeset>,
        iteration: u32,
    ) -> Result<(), FailureReason> {
        if let Some(changeset) = changeset {
            for (path, content) in changeset.files.iter() {
                run.changeset.files.insert(path, content);
            }
            if !changeset.summary.is_empty() {
                run.changeset.summary = changeset.summary;
            }
        }
        let digest = self
            .deps
            .store
            .put_diff(run.cycle_id(), iteration, &run.changeset)
            .await
            .map_err(storage_failure)?;
        run.diff_digest = digest;
        run.produced_diff = true;
        Ok(())
    }

    async fn save_session(
        &self,
        run: &mut CycleRun,
        agent: &AgentDriver,
    ) -> Result<(), FailureReason> {
        let Some(session_id) = agent.session_id() else {
            return Ok(());
        };
        let now = Utc::now();
        let started_at = *run.session_started_at.get_or_insert(now);
        let manifest = SessionManifest {
            cycle_id: run.cycle_id().clone(),
            session_id: session_id.to_string(),
            started_at,
            updated_at: now,
        };
        self.deps
            .store
            .save_session(&manifest)
            .await
            .map_err(storage_failure)
    }

    async fn finish(
        &self,
        mut run: CycleRun,
        result: Result<(), FailureReason>,
        session_id: Option<String>,
        started: Instant,
    ) -> CycleOutcome {
        let failed_in = match result {
            Ok(()) => {
                run.session.mark_done();
                None
            }
            Err(reason) => {
                let phase = run.phase;
                run.enter(Phase::Failed);
                run.session.mark_failed(reason);
                Some(phase)
            }
        };

        let record = run.to_record(failed_in, session_id);
        if let Err(e) = self.deps.store.put_record(&record).await {
            obs::emit_finalize_error(run.cycle_id(), &e);
        }

        match record.status {
            CycleStatus::Done => METRICS.inc_cycles_done(),
            _ => METRICS.inc_cycles_failed(),
        }
        obs::emit_cycle_finished(
            run.cycle_id(),
            started.elapsed().as_millis() as u64,
            record.iteration_count,
            record.failure_reason.as_ref(),
        );

        CycleOutcome::from(record)
    }
}
