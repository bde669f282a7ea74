//! In-memory fake for the storage trait (testing only)
//!
//! `MemoryArtifactStore` satisfies the `ArtifactStore` contract without
//! touching the filesystem.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::*;

#[derive(Debug, Default)]
struct CycleArtifacts {
    inputs: Option<CycleInputs>,
    diffs: BTreeMap<u32, Changeset>,
    test_runs: BTreeMap<u32, TestRunResult>,
    audits: Vec<AuditVerdict>,
    uat: BTreeMap<u32, UatRecord>,
    session: Option<SessionManifest>,
    record: Option<CycleRecord>,
}

/// In-memory artifact store backed by a `HashMap<cycle_id, artifacts>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    cycles: Mutex<HashMap<String, CycleArtifacts>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with inputs for one cycle.
    pub fn with_inputs(cycle_id: &CycleId, inputs: CycleInputs) -> Self {
        let store = Self::new();
        store
            .cycles
            .lock()
            .unwrap()
            .entry(cycle_id.as_str().to_string())
            .or_default()
            .inputs = Some(inputs);
        store
    }

    /// Test runs recorded for a cycle, in iteration order.
    pub fn test_runs(&self, cycle_id: &CycleId) -> Vec<TestRunResult> {
        let cycles = self.cycles.lock().unwrap();
        cycles
            .get(cycle_id.as_str())
            .map(|c| c.test_runs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// UAT records for a cycle, in iteration order.
    pub fn uat_records(&self, cycle_id: &CycleId) -> Vec<UatRecord> {
        let cycles = self.cycles.lock().unwrap();
        cycles
            .get(cycle_id.as_str())
            .map(|c| c.uat.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn load_inputs(&self, cycle_id: &CycleId) -> StorageResult<CycleInputs> {
        let cycles = self.cycles.lock().unwrap();
        cycles
            .get(cycle_id.as_str())
            .and_then(|c| c.inputs.clone())
            .ok_or_else(|| StorageError::NotFound {
                what: format!("inputs for cycle {cycle_id}"),
            })
    }

    async fn put_inputs(&self, cycle_id: &CycleId, inputs: &CycleInputs) -> StorageResult<()> {
        let mut cycles = self.cycles.lock().unwrap();
        cycles
            .entry(cycle_id.as_str().to_string())
            .or_default()
            .inputs = Some(inputs.clone());
        Ok(())
    }

    async fn put_diff(
        &self,
        cycle_id: &CycleId,
        iteration: u32,
        changeset: &Changeset,
    ) -> StorageResult<ContentDigest> {
        let mut cycles = self.cycles.lock().unwrap();
        cycles
            .entry(cycle_id.as_str().to_string())
            .or_default()
            .diffs
            .insert(iteration, changeset.clone());
        Ok(changeset.digest())
    }

    async fn get_diff(&self, cycle_id: &CycleId, iteration: u32) -> StorageResult<Changeset> {
        let cycles = self.cycles.lock().unwrap();
        cycles
            .get(cycle_id.as_str())
            .and_then(|c| c.diffs.get(&iteration).cloned())
            .ok_or_else(|| StorageError::NotFound {
                what: format!("diff for cycle {cycle_id} iteration {iteration}"),
            })
    }

    async fn latest_diff(&self, cycle_id: &CycleId) -> StorageResult<Option<(u32, Changeset)>> {
        let cycles = self.cycles.lock().unwrap();
        Ok(cycles.get(cycle_id.as_str()).and_then(|c| {
            c.diffs
                .last_key_value()
                .map(|(iteration, changeset)| (*iteration, changeset.clone()))
        }))
    }

    async fn put_test_run(&self, cycle_id: &CycleId, run: &TestRunResult) -> StorageResult<()> {
        let mut cycles = self.cycles.lock().unwrap();
        cycles
            .entry(cycle_id.as_str().to_string())
            .or_default()
            .test_runs
            .insert(run.iteration, run.clone());
        Ok(())
    }

    async fn append_audit(&self, cycle_id: &CycleId, verdict: &AuditVerdict) -> StorageResult<()> {
        let mut cycles = self.cycles.lock().unwrap();
        cycles
            .entry(cycle_id.as_str().to_string())
            .or_default()
            .audits
            .push(verdict.clone());
        Ok(())
    }

    async fn audit_history(&self, cycle_id: &CycleId) -> StorageResult<Vec<AuditVerdict>> {
        let cycles = self.cycles.lock().unwrap();
        Ok(cycles
            .get(cycle_id.as_str())
            .map(|c| c.audits.clone())
            .unwrap_or_default())
    }

    async fn put_uat(&self, cycle_id: &CycleId, record: &UatRecord) -> StorageResult<()> {
        let mut cycles = self.cycles.lock().unwrap();
        cycles
            .entry(cycle_id.as_str().to_string())
            .or_default()
            .uat
            .insert(record.iteration, record.clone());
        Ok(())
    }

    async fn load_session(&self, cycle_id: &CycleId) -> StorageResult<Option<SessionManifest>> {
        let cycles = self.cycles.lock().unwrap();
        Ok(cycles
            .get(cycle_id.as_str())
            .and_then(|c| c.session.clone()))
    }

    async fn save_session(&self, manifest: &SessionManifest) -> StorageResult<()> {
        let mut cycles = self.cycles.lock().unwrap();
        cycles
            .entry(manifest.cycle_id.as_str().to_string())
            .or_default()
            .session = Some(manifest.clone());
        Ok(())
    }

    async fn put_record(&self, record: &CycleRecord) -> StorageResult<()> {
        let mut cycles = self.cycles.lock().unwrap();
        cycles
            .entry(record.cycle_id.as_str().to_string())
            .or_default()
            .record = Some(record.clone());
        Ok(())
    }

    async fn get_record(&self, cycle_id: &CycleId) -> StorageResult<Option<CycleRecord>> {
        let cycles = self.cycles.lock().unwrap();
        Ok(cycles
            .get(cycle_id.as_str())
            .and_then(|c| c.record.clone()))
    }
}
