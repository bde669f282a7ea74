use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::StorageError;
use crate::records::*;
use crate::storage_traits::*;

/// Filesystem-backed artifact store.
///
/// Layout, one directory per cycle:
///
/// ```text
/// <root>/<cycle_id>/inputs/SPEC.md
/// <root>/<cycle_id>/inputs/SCHEMA.md          (optional)
/// <root>/<cycle_id>/inputs/UAT.md
/// <root>/<cycle_id>/iterations/<n>/diff.json
/// <root>/<cycle_id>/iterations/<n>/test_run.json
/// <root>/<cycle_id>/iterations/<n>/uat.json
/// <root>/<cycle_id>/audit_history.jsonl
/// <root>/<cycle_id>/session.json
/// <root>/<cycle_id>/cycle.json + cycle.digest
/// ```
///
/// Every JSON file is written atomically (temp file + rename in the same
/// directory). The audit history is append-only.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cycle_dir(&self, cycle_id: &CycleId) -> PathBuf {
        self.root.join(cycle_id.as_str())
    }

    fn inputs_dir(&self, cycle_id: &CycleId) -> PathBuf {
        self.cycle_dir(cycle_id).join("inputs")
    }

    fn iteration_dir(&self, cycle_id: &CycleId, iteration: u32) -> PathBuf {
        self.cycle_dir(cycle_id)
            .join("iterations")
            .join(iteration.to_string())
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let dir = path.parent().ok_or_else(|| StorageError::NotFound {
        what: format!("parent directory of {}", path.display()),
    })?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> StorageResult<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

fn read_optional(path: &Path) -> StorageResult<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

fn read_text(path: &Path) -> StorageResult<Option<String>> {
    Ok(read_optional(path)?.map(|b| String::from_utf8_lossy(&b).into_owned()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<Option<T>> {
    match read_optional(path)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn load_inputs(&self, cycle_id: &CycleId) -> StorageResult<CycleInputs> {
        let dir = self.inputs_dir(cycle_id);
        let specification = read_text(&dir.join("SPEC.md"))?.ok_or_else(|| {
            StorageError::NotFound {
                what: format!("{}", dir.join("SPEC.md").display()),
            }
        })?;
        let acceptance_scenarios =
            read_text(&dir.join("UAT.md"))?.ok_or_else(|| StorageError::NotFound {
                what: format!("{}", dir.join("UAT.md").display()),
            })?;
        let schema = read_text(&dir.join("SCHEMA.md"))?;

        Ok(CycleInputs {
            specification,
            schema,
            acceptance_scenarios,
        })
    }

    async fn put_inputs(&self, cycle_id: &CycleId, inputs: &CycleInputs) -> StorageResult<()> {
        let dir = self.inputs_dir(cycle_id);
        write_atomic(&dir.join("SPEC.md"), inputs.specification.as_bytes())?;
        write_atomic(&dir.join("UAT.md"), inputs.acceptance_scenarios.as_bytes())?;
        match &inputs.schema {
            Some(schema) => write_atomic(&dir.join("SCHEMA.md"), schema.as_bytes())?,
            None => {
                if let Err(e) = fs::remove_file(dir.join("SCHEMA.md")) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(())
    }

    async fn put_diff(
        &self,
        cycle_id: &CycleId,
        iteration: u32,
        changeset: &Changeset,
    ) -> StorageResult<ContentDigest> {
        let path = self.iteration_dir(cycle_id, iteration).join("diff.json");
        write_json(&path, changeset)?;
        let digest = changeset.digest();
        debug!(cycle_id = %cycle_id, iteration, digest = %digest.short(), "diff stored");
        Ok(digest)
    }

    async fn get_diff(&self, cycle_id: &CycleId, iteration: u32) -> StorageResult<Changeset> {
        let path = self.iteration_dir(cycle_id, iteration).join("diff.json");
        read_json(&path)?.ok_or_else(|| StorageError::NotFound {
            what: format!("{}", path.display()),
        })
    }

    async fn latest_diff(&self, cycle_id: &CycleId) -> StorageResult<Option<(u32, Changeset)>> {
        let dir = self.cycle_dir(cycle_id).join("iterations");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut iterations = Vec::new();
        for entry in entries {
            let entry = entry?;
            if let Some(n) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
                iterations.push(n);
            }
        }
        iterations.sort_unstable_by(|a, b| b.cmp(a));
        // An iteration directory may hold only a test run or UAT record.
        for iteration in iterations {
            let path = self.iteration_dir(cycle_id, iteration).join("diff.json");
            if let Some(changeset) = read_json(&path)? {
                return Ok(Some((iteration, changeset)));
            }
        }
        Ok(None)
    }

    async fn put_test_run(&self, cycle_id: &CycleId, run: &TestRunResult) -> StorageResult<()> {
        let path = self
            .iteration_dir(cycle_id, run.iteration)
            .join("test_run.json");
        write_json(&path, run)
    }

    async fn append_audit(&self, cycle_id: &CycleId, verdict: &AuditVerdict) -> StorageResult<()> {
        let dir = self.cycle_dir(cycle_id);
        fs::create_dir_all(&dir)?;
        let mut line = serde_json::to_vec(verdict)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("audit_history.jsonl"))?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(())
    }

    async fn audit_history(&self, cycle_id: &CycleId) -> StorageResult<Vec<AuditVerdict>> {
        let path = self.cycle_dir(cycle_id).join("audit_history.jsonl");
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut verdicts = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            verdicts.push(serde_json::from_str(&line)?);
        }
        Ok(verdicts)
    }

    async fn put_uat(&self, cycle_id: &CycleId, record: &UatRecord) -> StorageResult<()> {
        let path = self
            .iteration_dir(cycle_id, record.iteration)
            .join("uat.json");
        write_json(&path, record)
    }

    async fn load_session(&self, cycle_id: &CycleId) -> StorageResult<Option<SessionManifest>> {
        read_json(&self.cycle_dir(cycle_id).join("session.json"))
    }

    async fn save_session(&self, manifest: &SessionManifest) -> StorageResult<()> {
        let path = self.cycle_dir(&manifest.cycle_id).join("session.json");
        write_json(&path, manifest)
    }

    async fn put_record(&self, record: &CycleRecord) -> StorageResult<()> {
        let dir = self.cycle_dir(&record.cycle_id);
        let json = serde_json::to_vec_pretty(record)?;
        let digest = ContentDigest::from_bytes(&json);
        write_atomic(&dir.join("cycle.json"), &json)?;
        write_atomic(&dir.join("cycle.digest"), digest.as_str().as_bytes())?;
        Ok(())
    }

    async fn get_record(&self, cycle_id: &CycleId) -> StorageResult<Option<CycleRecord>> {
        let dir = self.cycle_dir(cycle_id);
        let Some(json) = read_optional(&dir.join("cycle.json"))? else {
            return Ok(None);
        };
        let expected = read_text(&dir.join("cycle.digest"))?.ok_or_else(|| {
            StorageError::NotFound {
                what: format!("{}", dir.join("cycle.digest").display()),
            }
        })?;
        let actual = ContentDigest::from_bytes(&json);
        if expected.trim() != actual.as_str() {
            return Err(StorageError::DigestMismatch {
                what: format!("cycle record {cycle_id}"),
                expected: expected.trim().to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Some(serde_json::from_slice(&json)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsArtifactStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn missing_spec_is_not_found() {
        let (_dir, store) = make_store();
        let id = CycleId::new("01").unwrap();
        let err = store.load_inputs(&id).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn inputs_are_plain_files_on_disk() {
        let (dir, store) = make_store();
        let id = CycleId::new("01").unwrap();
        let inputs = CycleInputs {
            specification: "# Spec".into(),
            schema: Some("schema".into()),
            acceptance_scenarios: "# UAT".into(),
        };
        store.put_inputs(&id, &inputs).await.unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("01/inputs/SPEC.md")).unwrap();
        assert_eq!(on_disk, "# Spec");
        assert_eq!(store.load_inputs(&id).await.unwrap(), inputs);
    }

    #[tokio::test]
    async fn record_tamper_is_detected() {
        let (dir, store) = make_store();
        let id = CycleId::new("02").unwrap();
        let record = CycleRecord {
            cycle_id: id.clone(),
            integration_branch: "main".into(),
            status: CycleStatus::Failed,
            failure_reason: Some(FailureReason::Cancelled),
            failed_in: Some(Phase::Testing),
            iteration_count: 0,
            committee_position: 0,
            committee_size: 1,
            attempts: Default::default(),
            transitions: vec![Phase::Init, Phase::Failed],
            tests: vec![],
            audits: vec![],
            uat: vec![],
            session_id: None,
            final_diff_digest: None,
            merged_commit: None,
            started_at: chrono::Utc::now(),
            finished_at: None,
        };
        store.put_record(&record).await.unwrap();
        assert_eq!(store.get_record(&id).await.unwrap(), Some(record));

        std::fs::write(dir.path().join("02/cycle.json"), b"{}").unwrap();
        let err = store.get_record(&id).await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));
    }
}
