//! Runs several cycles concurrently with a bounded worker count.
//!
//! Each cycle gets its own sandbox, agent session and iteration budget from
//! the shared [`CycleController`]. The only state cycles share is the
//! controller's branch lock table, which serializes their merges.

use std::sync::Arc;

use accdd_store::{CycleId, CycleStatus, FailureReason};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::controller::{CycleConfig, CycleController, CycleOutcome};
use crate::execution::CancelSignal;

/// One queued cycle.
#[derive(Debug, Clone)]
pub struct CycleJob {
    pub cycle_id: CycleId,
    pub integration_branch: String,
    pub config: CycleConfig,
}

pub struct CycleQueue {
    controller: Arc<CycleController>,
    max_concurrent: usize,
}

impl CycleQueue {
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(controller: Arc<CycleController>, max_concurrent: usize) -> Self {
        Self {
            controller,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Run every job to a terminal state. Outcomes are returned in job
    /// order, one per job.
    pub async fn run_all(&self, jobs: Vec<CycleJob>, cancel: CancelSignal) -> Vec<CycleOutcome> {
        info!(jobs = jobs.len(), max_concurrent = self.max_concurrent, "starting cycle queue");
        let sem = Arc::new(Semaphore::new(self.max_concurrent));

        let mut tasks = Vec::with_capacity(jobs.len());
        for job in jobs {
            let controller = Arc::clone(&self.controller);
            let sem = Arc::clone(&sem);
            let cancel = cancel.clone();
            let cycle_id = job.cycle_id.clone();

            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                controller
                    .run_cycle(job.cycle_id, &job.integration_branch, job.config, cancel)
                    .await
            });
            tasks.push((cycle_id, task));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (cycle_id, task) in tasks {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(cycle_id = %cycle_id, error = %e, "cycle task did not complete");
                    CycleOutcome {
                        cycle_id,
                        status: CycleStatus::Failed,
                        reason: Some(FailureReason::Internal {
                            detail: format!("cycle task aborted: {e}"),
                        }),
                        iteration_count: 0,
                        merged_commit: None,
                    }
                }
            };
            outcomes.push(outcome);
        }

        let done = outcomes.iter().filter(|o| o.is_done()).count();
        info!(done, failed = outcomes.len() - done, "cycle queue finished");
        outcomes
    }
}
