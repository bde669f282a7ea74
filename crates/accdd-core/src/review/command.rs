use accdd_store::UatVerdict;
use async_trait::async_trait;
use serde::Serialize;

use crate::execution::CallError;
use crate::process::invoke_json;

use super::{CommitteeAuditor, QaAnalyst, ReviewContext, ReviewDecision};

/// Auditor backed by an external command.
///
/// The command gets the `ReviewContext` as JSON on stdin and answers with a
/// `ReviewDecision`. `ACCDD_AUDITOR` and `ACCDD_AUDIT_STRICTNESS` are set in
/// its environment.
#[derive(Debug, Clone)]
pub struct CommandAuditor {
    name: String,
    command: Vec<String>,
    strictness: String,
}

impl CommandAuditor {
    pub fn new(name: impl Into<String>, command: Vec<String>, strictness: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command,
            strictness: strictness.into(),
        }
    }
}

#[async_trait]
impl CommitteeAuditor for CommandAuditor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn review(&self, ctx: &ReviewContext<'_>) -> Result<ReviewDecision, CallError> {
        invoke_json(
            &self.command,
            &[
                ("ACCDD_AUDITOR", self.name.as_str()),
                ("ACCDD_AUDIT_STRICTNESS", self.strictness.as_str()),
            ],
            ctx,
        )
        .await
    }
}

#[derive(Serialize)]
struct UatRequest<'a> {
    test_log: &'a str,
    acceptance_scenarios: &'a str,
}

/// QA analyst backed by an external command answering with a `UatVerdict`.
#[derive(Debug, Clone)]
pub struct CommandQaAnalyst {
    command: Vec<String>,
}

impl CommandQaAnalyst {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl QaAnalyst for CommandQaAnalyst {
    async fn evaluate(
        &self,
        test_log: &str,
        acceptance_scenarios: &str,
    ) -> Result<UatVerdict, CallError> {
        let request = UatRequest {
            test_log,
            acceptance_scenarios,
        };
        invoke_json(&self.command, &[], &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accdd_store::{Changeset, ContentDigest, CycleId, CycleInputs};

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_command_auditor_reads_decision() {
        let auditor = CommandAuditor::new(
            "security",
            sh(r#"cat >/dev/null; echo "{\"approved\": false, \"critical_issues\": [\"$ACCDD_AUDIT_STRICTNESS\"]}""#),
            "paranoid",
        );
        let id = CycleId::new("01").unwrap();
        let changeset = Changeset::default();
        let digest = ContentDigest::from_bytes(b"");
        let inputs = CycleInputs {
            specification: "spec".into(),
            schema: None,
            acceptance_scenarios: "uat".into(),
        };
        let ctx = ReviewContext {
            cycle_id: &id,
            iteration: 0,
            position: 0,
            attempt_number: 1,
            diff_digest: &digest,
            changeset: &changeset,
            inputs: &inputs,
            test_log: "",
        };
        let decision = auditor.review(&ctx).await.unwrap();
        assert!(!decision.approved);
        assert_eq!(decision.critical_issues, vec!["paranoid".to_string()]);
        assert_eq!(auditor.name(), "security");
    }

    #[tokio::test]
    async fn test_command_qa_reads_verdict() {
        let qa = CommandQaAnalyst::new(sh(
            r#"cat >/dev/null; echo '{"verdict": "pass", "summary": "all scenarios met"}'"#,
        ));
        let verdict = qa.evaluate("ok", "Scenario: x").await.unwrap();
        assert!(verdict.passed());
    }
}
