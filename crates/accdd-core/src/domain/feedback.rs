use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// What the agent is told when its session is resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Feedback {
    /// The test command exited non-zero.
    TestFailure {
        iteration: u32,
        exit_code: i32,
        log_excerpt: String,
    },
    /// An auditor rejected the diff.
    AuditRejection {
        position: usize,
        auditor: String,
        critical_issues: Vec<String>,
    },
    /// The QA analyst failed the acceptance scenarios.
    UatFailure { summary: String },
    /// Pick up an interrupted session where it left off.
    Continue,
}

impl Feedback {
    pub fn kind(&self) -> &'static str {
        match self {
            Feedback::TestFailure { .. } => "test_failure",
            Feedback::AuditRejection { .. } => "audit_rejection",
            Feedback::UatFailure { .. } => "uat_failure",
            Feedback::Continue => "continue",
        }
    }

    /// Plain-text instruction sent to the agent.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self {
            Feedback::TestFailure {
                iteration,
                exit_code,
                log_excerpt,
            } => {
                let _ = writeln!(
                    out,
                    "The test command failed on iteration {iteration} (exit code {exit_code})."
                );
                let _ = writeln!(out, "Fix the code so that it passes. Test output:\n");
                out.push_str(log_excerpt);
            }
            Feedback::AuditRejection {
                position,
                auditor,
                critical_issues,
            } => {
                let _ = writeln!(
                    out,
                    "Auditor #{} ({auditor}) rejected your changes. Resolve every issue below:",
                    position + 1
                );
                for issue in critical_issues {
                    let _ = writeln!(out, "- {issue}");
                }
            }
            Feedback::UatFailure { summary } => {
                let _ = writeln!(
                    out,
                    "User acceptance testing failed. QA analysis:\n\n{summary}"
                );
            }
            Feedback::Continue => {
                out.push_str("Continue the task from where you left off.");
            }
        }
        out
    }
}

/// Keep the end of `log` in at most `limit` bytes, cut on a char boundary.
///
/// A truncated excerpt starts with a `[... N bytes truncated ...]` line
/// that counts toward `limit`; it is left out when `limit` cannot hold it.
pub fn excerpt_tail(log: &str, limit: usize) -> String {
    if log.len() <= limit {
        return log.to_string();
    }
    let mut start = log.len() - limit;
    loop {
        while !log.is_char_boundary(start) {
            start += 1;
        }
        let header = format!("[... {start} bytes truncated ...]\n");
        if header.len() >= limit {
            return log[start..].to_string();
        }
        if header.len() + (log.len() - start) <= limit {
            return header + &log[start..];
        }
        start = log.len() - (limit - header.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_log_is_untouched() {
        assert_eq!(excerpt_tail("ok", 10), "ok");
    }

    #[test]
    fn long_log_keeps_tail() {
        let log = format!("{}FAILED: test_parse", "x".repeat(1000));
        let out = excerpt_tail(&log, 64);
        assert!(out.ends_with("FAILED: test_parse"));
        assert!(out.starts_with("[... "));
        assert_eq!(out.len(), 64);
    }

    #[test]
    fn excerpt_never_exceeds_limit() {
        let log = "é".repeat(700) + "tail";
        for limit in [0, 1, 5, 31, 32, 33, 40, 100, 999, 1000, 1403] {
            let out = excerpt_tail(&log, limit);
            assert!(out.len() <= limit, "limit {limit}: got {} bytes", out.len());
        }
        assert!(excerpt_tail(&log, 100).ends_with("tail"));
    }

    #[test]
    fn tiny_limit_drops_header() {
        let out = excerpt_tail(&"x".repeat(50), 10);
        assert_eq!(out, "x".repeat(10));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let log = "ééééé";
        let out = excerpt_tail(log, 3);
        // 3 bytes from the end lands inside a two-byte char.
        assert!(out.ends_with('é'));
    }

    #[test]
    fn audit_rejection_lists_every_issue() {
        let fb = Feedback::AuditRejection {
            position: 1,
            auditor: "security".into(),
            critical_issues: vec!["sql injection".into(), "missing auth".into()],
        };
        let text = fb.render();
        assert!(text.contains("Auditor #2 (security)"));
        assert!(text.contains("- sql injection"));
        assert!(text.contains("- missing auth"));
        assert_eq!(fb.kind(), "audit_rejection");
    }

    #[test]
    fn test_failure_includes_log() {
        let fb = Feedback::TestFailure {
            iteration: 2,
            exit_code: 101,
            log_excerpt: "assertion failed".into(),
        };
        let text = fb.render();
        assert!(text.contains("iteration 2"));
        assert!(text.contains("exit code 101"));
        assert!(text.contains("assertion failed"));
    }

    #[test]
    fn feedback_serializes_with_kind_tag() {
        let json = serde_json::to_value(Feedback::Continue).unwrap();
        assert_eq!(json["kind"], "continue");
    }
}
