//! Several cycles through one controller.

use std::sync::Arc;
use std::time::Duration;

use accdd_core::fakes::{RecordingIntegrator, RecordingSandbox, ScriptedAgent, ScriptedAuditor, ScriptedQa};
use accdd_core::{
    BranchLocks, CancelSignal, CommitteeAuditor, ControllerOptions, CycleConfig, CycleController,
    CycleDeps, CycleJob, CycleQueue,
};
use accdd_store::fakes::MemoryArtifactStore;
use accdd_store::{ArtifactStore, CycleId, CycleInputs, CycleStatus};

fn inputs(n: usize) -> CycleInputs {
    CycleInputs {
        specification: format!("# Cycle {n}"),
        schema: None,
        acceptance_scenarios: "Scenario: it works".into(),
    }
}

fn config() -> CycleConfig {
    CycleConfig {
        max_iterations: 2,
        reviews_per_auditor: 1,
        auditors: vec![Arc::new(ScriptedAuditor::approving("a0")) as Arc<dyn CommitteeAuditor>],
        restart_committee_on_fix: false,
    }
}

struct Fixture {
    store: Arc<MemoryArtifactStore>,
    sandbox: Arc<RecordingSandbox>,
    integrator: Arc<RecordingIntegrator>,
    controller: Arc<CycleController>,
}

async fn fixture(cycles: &[CycleId]) -> Fixture {
    let store = Arc::new(MemoryArtifactStore::new());
    for (n, id) in cycles.iter().enumerate() {
        store.put_inputs(id, &inputs(n)).await.unwrap();
    }
    let sandbox = Arc::new(RecordingSandbox::new());
    let integrator = Arc::new(RecordingIntegrator::new().with_delay(Duration::from_millis(30)));
    let controller = Arc::new(CycleController::new(
        CycleDeps {
            store: store.clone(),
            sandbox: sandbox.clone(),
            agent: Arc::new(ScriptedAgent::new("s-1")),
            qa: Arc::new(ScriptedQa::passing()),
            integrator: integrator.clone(),
            merge_locks: BranchLocks::new(),
        },
        ControllerOptions {
            test_command: vec!["run-tests".into()],
            ..ControllerOptions::default()
        },
    ));
    Fixture {
        store,
        sandbox,
        integrator,
        controller,
    }
}

fn ids(n: usize) -> Vec<CycleId> {
    (0..n)
        .map(|i| CycleId::new(format!("cycle-{i:02}")).unwrap())
        .collect()
}

fn jobs(ids: &[CycleId], branch: impl Fn(usize) -> &'static str) -> Vec<CycleJob> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| CycleJob {
            cycle_id: id.clone(),
            integration_branch: branch(i).into(),
            config: config(),
        })
        .collect()
}

#[tokio::test]
async fn merges_into_one_branch_are_serialized() {
    let ids = ids(4);
    let f = fixture(&ids).await;
    let queue = CycleQueue::new(f.controller.clone(), 4);

    let outcomes = queue
        .run_all(jobs(&ids, |_| "main"), CancelSignal::never())
        .await;

    assert_eq!(outcomes.len(), 4);
    assert!(outcomes.iter().all(|o| o.is_done()), "{outcomes:?}");
    assert_eq!(f.integrator.merged().len(), 4);
    assert_eq!(f.integrator.max_in_flight(), 1);
    // One sandbox per cycle, every one torn down.
    assert_eq!(f.sandbox.provision_count(), 4);
    assert_eq!(f.sandbox.destroy_count(), 4);
    assert_eq!(f.sandbox.live_count(), 0);
}

#[tokio::test]
async fn outcomes_follow_job_order() {
    let ids = ids(3);
    let f = fixture(&ids).await;
    let queue = CycleQueue::new(f.controller.clone(), 2);

    let outcomes = queue
        .run_all(jobs(&ids, |_| "main"), CancelSignal::never())
        .await;

    let got: Vec<&CycleId> = outcomes.iter().map(|o| &o.cycle_id).collect();
    assert_eq!(got, ids.iter().collect::<Vec<_>>());
    for id in &ids {
        let record = f.store.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, CycleStatus::Done);
    }
}

#[tokio::test]
async fn each_branch_receives_its_merge() {
    let ids = ids(2);
    let f = fixture(&ids).await;
    let queue = CycleQueue::new(f.controller.clone(), 2);

    let outcomes = queue
        .run_all(
            jobs(&ids, |i| if i == 0 { "main" } else { "release" }),
            CancelSignal::never(),
        )
        .await;

    assert!(outcomes.iter().all(|o| o.is_done()), "{outcomes:?}");
    let branches: Vec<String> = f.integrator.merged().into_iter().map(|m| m.branch).collect();
    assert!(branches.contains(&"main".to_string()));
    assert!(branches.contains(&"release".to_string()));
}

#[tokio::test]
async fn cancelled_queue_fails_every_cycle_cleanly() {
    let ids = ids(3);
    let f = fixture(&ids).await;
    let queue = CycleQueue::new(f.controller.clone(), 1);
    let (handle, signal) = CancelSignal::channel();
    handle.cancel();

    let outcomes = queue.run_all(jobs(&ids, |_| "main"), signal).await;

    assert!(outcomes.iter().all(|o| o.is_cancelled()), "{outcomes:?}");
    assert!(f.integrator.merged().is_empty());
    assert_eq!(f.sandbox.live_count(), 0);
}
