use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use accdd_store::{ContentDigest, Fileset};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::execution::{call_with_controls, CallPolicy, CancelSignal};
use crate::metrics::METRICS;
use crate::obs;

use super::error::{SandboxError, SandboxResult};
use super::provider::{validate_relative_path, ExecOutput, SandboxId, SandboxProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Unprovisioned,
    Ready,
    TornDown,
}

/// Call budgets for the provider operations a handle performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxPolicies {
    pub provision: CallPolicy,
    pub sync: CallPolicy,
    pub teardown: CallPolicy,
}

impl Default for SandboxPolicies {
    fn default() -> Self {
        Self {
            provision: CallPolicy::default(),
            sync: CallPolicy::default(),
            teardown: CallPolicy::once(Duration::from_secs(30)),
        }
    }
}

/// What a `sync` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Digest of the fileset as synced.
    pub synced_hash: ContentDigest,
    pub transferred: usize,
    pub skipped: usize,
}

/// One sandbox, owned by one cycle.
///
/// `Unprovisioned → Ready → TornDown`. Syncs transfer only files whose
/// content changed since they were last uploaded, and a fileset whose
/// digest equals the last synced digest transfers nothing. `teardown` is
/// idempotent; if the handle is dropped while still `Ready`, destruction is
/// spawned onto the current runtime.
pub struct SandboxHandle {
    provider: Arc<dyn SandboxProvider>,
    policies: SandboxPolicies,
    state: LifecycleState,
    id: Option<SandboxId>,
    synced: BTreeMap<String, ContentDigest>,
    last_synced_hash: Option<ContentDigest>,
}

impl SandboxHandle {
    pub fn new(provider: Arc<dyn SandboxProvider>, policies: SandboxPolicies) -> Self {
        Self {
            provider,
            policies,
            state: LifecycleState::Unprovisioned,
            id: None,
            synced: BTreeMap::new(),
            last_synced_hash: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn id(&self) -> Option<&SandboxId> {
        self.id.as_ref()
    }

    pub fn last_synced_hash(&self) -> Option<&ContentDigest> {
        self.last_synced_hash.as_ref()
    }

    fn require(&self, expected: LifecycleState) -> SandboxResult<&SandboxId> {
        match (&self.id, self.state == expected) {
            (Some(id), true) => Ok(id),
            _ => Err(SandboxError::InvalidState {
                state: self.state,
                expected,
            }),
        }
    }

    pub async fn provision(&mut self, template: &str, cancel: &CancelSignal) -> SandboxResult<()> {
        if self.state != LifecycleState::Unprovisioned {
            return Err(SandboxError::InvalidState {
                state: self.state,
                expected: LifecycleState::Unprovisioned,
            });
        }
        let provider = &self.provider;
        let id = call_with_controls("sandbox.provision", &self.policies.provision, cancel, || {
            provider.provision(template)
        })
        .await
        .map_err(SandboxError::Provision)?;

        debug!(sandbox_id = %id, template, "sandbox provisioned");
        self.id = Some(id);
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Make the sandbox contain `files`, uploading only what changed.
    pub async fn sync(&mut self, files: &Fileset, cancel: &CancelSignal) -> SandboxResult<SyncReport> {
        let id = self.require(LifecycleState::Ready)?.clone();
        let fileset_hash = files.digest();

        if self.last_synced_hash.as_ref() == Some(&fileset_hash) {
            METRICS.inc_syncs_skipped();
            obs::emit_sandbox_sync(id.as_str(), 0, files.len(), &fileset_hash);
            return Ok(SyncReport {
                synced_hash: fileset_hash,
                transferred: 0,
                skipped: files.len(),
            });
        }

        let mut transferred = 0;
        let mut skipped = 0;
        for (path, content) in files.iter() {
            validate_relative_path(path)?;
            let digest = Fileset::file_digest(content);
            if self.synced.get(path) == Some(&digest) {
                skipped += 1;
                continue;
            }
            let provider = &self.provider;
            let id_ref = &id;
            call_with_controls("sandbox.upload", &self.policies.sync, cancel, || {
                provider.upload(id_ref, path, content)
            })
            .await
            .map_err(|source| SandboxError::Sync {
                path: path.to_string(),
                source,
            })?;
            self.synced.insert(path.to_string(), digest);
            transferred += 1;
        }

        METRICS.record_files_transferred(transferred as u64);
        obs::emit_sandbox_sync(id.as_str(), transferred, skipped, &fileset_hash);
        self.last_synced_hash = Some(fileset_hash.clone());
        Ok(SyncReport {
            synced_hash: fileset_hash,
            transferred,
            skipped,
        })
    }

    /// Run `command` under `policy`. Never retried: test commands are not
    /// assumed idempotent.
    pub async fn exec(
        &self,
        command: &[String],
        policy: &CallPolicy,
        cancel: &CancelSignal,
    ) -> SandboxResult<ExecOutput> {
        let id = self.require(LifecycleState::Ready)?;
        let policy = CallPolicy {
            max_retries: 0,
            ..*policy
        };
        let provider = &self.provider;
        call_with_controls("sandbox.exec", &policy, cancel, || {
            provider.exec(id, command, policy.timeout())
        })
        .await
        .map_err(SandboxError::Exec)
    }

    /// Release the sandbox. Safe to call in any state and any number of
    /// times; provider errors are logged, never raised.
    pub async fn teardown(&mut self) {
        if self.state == LifecycleState::TornDown {
            return;
        }
        self.state = LifecycleState::TornDown;
        let Some(id) = self.id.take() else {
            return;
        };
        // Teardown runs even after cancellation.
        let never = CancelSignal::never();
        let provider = &self.provider;
        let result = call_with_controls("sandbox.destroy", &self.policies.teardown, &never, || {
            provider.destroy(&id)
        })
        .await;
        match result {
            Ok(()) => debug!(sandbox_id = %id, "sandbox destroyed"),
            Err(e) => warn!(sandbox_id = %id, error = %e, "sandbox teardown failed"),
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.state != LifecycleState::Ready {
            return;
        }
        let Some(id) = self.id.take() else {
            return;
        };
        self.state = LifecycleState::TornDown;
        let provider = self.provider.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!(sandbox_id = %id, "sandbox handle dropped while ready, destroying in background");
                rt.spawn(async move {
                    if let Err(e) = provider.destroy(&id).await {
                        warn!(sandbox_id = %id, error = %e, "background sandbox teardown failed");
                    }
                });
            }
            Err(_) => warn!(sandbox_id = %id, "sandbox leaked: no runtime to destroy it on"),
        }
    }
}
