//! JSON-over-stdio invocation of external collaborator commands.
//!
//! The request is written to the child's stdin as one JSON document and
//! the response is read from stdout. Exit code 75 (`EX_TEMPFAIL`) marks a
//! transient failure; any other non-zero exit is fatal.

use std::process::Stdio;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::execution::CallError;

pub const EX_TEMPFAIL: i32 = 75;

/// Stderr kept in error messages.
const STDERR_LIMIT: usize = 2_000;

pub async fn invoke_json<Req, Resp>(
    command: &[String],
    env: &[(&str, &str)],
    request: &Req,
) -> Result<Resp, CallError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let Some((exe, args)) = command.split_first() else {
        return Err(CallError::Fatal("empty command".into()));
    };
    let payload =
        serde_json::to_vec(request).map_err(|e| CallError::Fatal(format!("encode request: {e}")))?;

    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| CallError::Fatal(format!("spawn {exe}: {e}")))?;

    // Feed stdin while draining stdout so neither pipe can fill up and
    // stall the child. Dropping stdin after the write closes it.
    let stdin = child.stdin.take();
    let write = async move {
        match stdin {
            Some(mut stdin) => stdin.write_all(&payload).await,
            None => Ok(()),
        }
    };
    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output = output.map_err(|e| CallError::Fatal(format!("wait for {exe}: {e}")))?;
    if let Err(e) = written {
        // The child may exit without reading its input.
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            return Err(CallError::Fatal(format!("write request to {exe}: {e}")));
        }
    }
    let code = output.status.code().unwrap_or(-1);
    debug!(exe = %exe, code, stdout_bytes = output.stdout.len(), "collaborator command exited");

    if code != 0 {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = crate::domain::excerpt_tail(stderr.trim(), STDERR_LIMIT);
        let msg = format!("{exe} exited with {code}: {stderr}");
        return Err(if code == EX_TEMPFAIL {
            CallError::Transient(msg)
        } else {
            CallError::Fatal(msg)
        });
    }

    serde_json::from_slice(&output.stdout)
        .map_err(|e| CallError::Fatal(format!("invalid response from {exe}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_round_trip_through_cat() {
        let req = serde_json::json!({"approved": true});
        let resp: serde_json::Value = invoke_json(&["cat".to_string()], &[], &req).await.unwrap();
        assert_eq!(resp, req);
    }

    #[tokio::test]
    async fn test_large_request_and_response_do_not_stall() {
        let req = serde_json::json!({ "log": "x".repeat(1 << 20) });
        let resp: serde_json::Value = tokio::time::timeout(
            std::time::Duration::from_secs(20),
            invoke_json(&["cat".to_string()], &[], &req),
        )
        .await
        .expect("pipes stalled")
        .unwrap();
        assert_eq!(resp, req);
    }

    #[tokio::test]
    async fn test_tempfail_is_transient() {
        let err = invoke_json::<_, serde_json::Value>(&sh("echo busy >&2; exit 75"), &[], &())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transient(ref m) if m.contains("busy")));
    }

    #[tokio::test]
    async fn test_other_exit_is_fatal() {
        let err = invoke_json::<_, serde_json::Value>(&sh("exit 2"), &[], &())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_garbage_response_is_fatal() {
        let err = invoke_json::<_, serde_json::Value>(&sh("echo not-json"), &[], &())
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Fatal(ref m) if m.contains("invalid response")));
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let resp: String = invoke_json(
            &sh("printf '\"%s\"' \"$ACCDD_TEST_VAR\""),
            &[("ACCDD_TEST_VAR", "strict")],
            &(),
        )
        .await
        .unwrap();
        assert_eq!(resp, "strict");
    }
}
