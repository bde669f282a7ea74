use accdd_store::{CycleId, CycleStatus, FailureReason};

/// Iteration budget and status of one cycle.
///
/// `iteration_count` counts fix iterations and never exceeds the budget it
/// is checked against: a fix that would go past it is refused instead.
/// Once terminal, the status never changes again.
#[derive(Debug, Clone)]
pub struct CycleSession {
    cycle_id: CycleId,
    integration_branch: String,
    iteration_count: u32,
    status: CycleStatus,
    failure_reason: Option<FailureReason>,
}

impl CycleSession {
    pub fn new(cycle_id: CycleId, integration_branch: impl Into<String>) -> Self {
        Self {
            cycle_id,
            integration_branch: integration_branch.into(),
            iteration_count: 0,
            status: CycleStatus::Running,
            failure_reason: None,
        }
    }

    pub fn cycle_id(&self) -> &CycleId {
        &self.cycle_id
    }

    pub fn integration_branch(&self) -> &str {
        &self.integration_branch
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn status(&self) -> CycleStatus {
        self.status
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        self.failure_reason.as_ref()
    }

    /// Whether one more fix iteration fits in `max_iterations`.
    pub fn can_fix(&self, max_iterations: u32) -> bool {
        self.iteration_count < max_iterations
    }

    /// Start a fix iteration, returning its 1-based index.
    pub(crate) fn begin_fix(&mut self, max_iterations: u32) -> Result<u32, FailureReason> {
        if !self.can_fix(max_iterations) {
            return Err(FailureReason::IterationBudgetExceeded { max_iterations });
        }
        self.iteration_count += 1;
        Ok(self.iteration_count)
    }

    pub(crate) fn mark_done(&mut self) {
        if !self.status.is_terminal() {
            self.status = CycleStatus::Done;
        }
    }

    pub(crate) fn mark_failed(&mut self, reason: FailureReason) {
        if !self.status.is_terminal() {
            self.status = CycleStatus::Failed;
            self.failure_reason = Some(reason);
        }
    }
}
