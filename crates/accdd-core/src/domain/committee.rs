//! The audit committee: N auditors reviewed strictly in order.
//!
//! Position `p` is only reached after positions `0..p` approved. Each
//! position has its own rejection counter; a counter going past the
//! per-auditor limit ends the cycle. Approvals are bound to the diff digest
//! they were given for, so the merge gate can check that the diff being
//! merged is the one that was approved.

use std::collections::BTreeMap;
use std::sync::Arc;

use accdd_store::ContentDigest;

use crate::review::CommitteeAuditor;

/// Result of recording a rejection at the current position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionOutcome {
    /// Still within the per-auditor limit; the agent gets to fix.
    Retry { attempts: u32 },
    /// The per-auditor limit was exceeded.
    Exhausted { attempts: u32 },
}

pub struct Committee {
    auditors: Vec<Arc<dyn CommitteeAuditor>>,
    position: usize,
    attempts: Vec<u32>,
    approvals: Vec<Option<ContentDigest>>,
}

impl Committee {
    pub fn new(auditors: Vec<Arc<dyn CommitteeAuditor>>) -> Self {
        let n = auditors.len();
        Self {
            auditors,
            position: 0,
            attempts: vec![0; n],
            approvals: vec![None; n],
        }
    }

    pub fn len(&self) -> usize {
        self.auditors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.auditors.is_empty()
    }

    /// Index of the auditor reviewing next. Equals `len()` once every
    /// position has approved.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_complete(&self) -> bool {
        self.position >= self.auditors.len()
    }

    pub fn current(&self) -> Option<&Arc<dyn CommitteeAuditor>> {
        self.auditors.get(self.position)
    }

    /// Rejections recorded at `position` so far.
    pub fn attempts(&self, position: usize) -> u32 {
        self.attempts.get(position).copied().unwrap_or(0)
    }

    pub fn attempts_map(&self) -> BTreeMap<usize, u32> {
        self.attempts.iter().copied().enumerate().collect()
    }

    /// Record an approval of `digest` at the current position and advance.
    /// Returns `true` when the whole committee has now approved.
    pub fn approve(&mut self, digest: &ContentDigest) -> bool {
        if let Some(slot) = self.approvals.get_mut(self.position) {
            *slot = Some(digest.clone());
            self.position += 1;
        }
        self.is_complete()
    }

    /// Record a rejection at the current position.
    pub fn reject(&mut self, limit: u32) -> RejectionOutcome {
        let Some(count) = self.attempts.get_mut(self.position) else {
            return RejectionOutcome::Exhausted { attempts: 0 };
        };
        *count += 1;
        if *count > limit {
            RejectionOutcome::Exhausted { attempts: *count }
        } else {
            RejectionOutcome::Retry { attempts: *count }
        }
    }

    /// A new diff was produced. With `restart`, the whole committee reviews
    /// again from position 0. Otherwise review resumes at the current
    /// position (the last one, if the committee had already completed).
    /// Approvals from the resume position onward are cleared either way.
    pub fn on_new_diff(&mut self, restart: bool) {
        if self.auditors.is_empty() {
            return;
        }
        self.position = if restart {
            0
        } else {
            self.position.min(self.auditors.len() - 1)
        };
        for slot in &mut self.approvals[self.position..] {
            *slot = None;
        }
    }

    /// Whether `digest` may be merged: every position approved, the last
    /// approval was given for `digest`, and with `strict` every approval was.
    pub fn approves_for_merge(&self, digest: &ContentDigest, strict: bool) -> bool {
        if !self.is_complete() || self.approvals.iter().any(Option::is_none) {
            return false;
        }
        let last_ok = self.approvals.last().and_then(Option::as_ref) == Some(digest);
        let all_ok = self
            .approvals
            .iter()
            .all(|a| a.as_ref() == Some(digest));
        last_ok && (!strict || all_ok)
    }
}

impl std::fmt::Debug for Committee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Committee")
            .field(
                "auditors",
                &self.auditors.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .field("position", &self.position)
            .field("attempts", &self.attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedAuditor;

    fn committee(n: usize) -> Committee {
        Committee::new(
            (0..n)
                .map(|i| Arc::new(ScriptedAuditor::approving(format!("a{i}"))) as Arc<dyn CommitteeAuditor>)
                .collect(),
        )
    }

    fn digest(s: &str) -> ContentDigest {
        ContentDigest::from_bytes(s.as_bytes())
    }

    #[test]
    fn approvals_advance_in_order() {
        let mut c = committee(3);
        assert_eq!(c.position(), 0);
        assert!(!c.approve(&digest("d")));
        assert_eq!(c.position(), 1);
        assert!(!c.approve(&digest("d")));
        assert!(c.approve(&digest("d")));
        assert!(c.is_complete());
        assert!(c.current().is_none());
    }

    #[test]
    fn rejection_limit_is_per_position() {
        let mut c = committee(2);
        assert_eq!(c.reject(2), RejectionOutcome::Retry { attempts: 1 });
        assert_eq!(c.reject(2), RejectionOutcome::Retry { attempts: 2 });
        c.approve(&digest("d"));
        // Position 1 starts from zero.
        assert_eq!(c.reject(2), RejectionOutcome::Retry { attempts: 1 });
        assert_eq!(c.attempts(0), 2);
        assert_eq!(c.attempts(1), 1);
    }

    #[test]
    fn rejection_past_limit_is_exhausted() {
        let mut c = committee(1);
        c.reject(1);
        assert_eq!(c.reject(1), RejectionOutcome::Exhausted { attempts: 2 });
    }

    #[test]
    fn zero_limit_exhausts_on_first_rejection() {
        let mut c = committee(1);
        assert_eq!(c.reject(0), RejectionOutcome::Exhausted { attempts: 1 });
    }

    #[test]
    fn new_diff_resumes_at_current_position() {
        let mut c = committee(3);
        c.approve(&digest("d1"));
        c.reject(2);
        c.on_new_diff(false);
        assert_eq!(c.position(), 1);
    }

    #[test]
    fn new_diff_after_completion_resumes_at_last_position() {
        let mut c = committee(3);
        for _ in 0..3 {
            c.approve(&digest("d1"));
        }
        c.on_new_diff(false);
        assert_eq!(c.position(), 2);
        assert!(!c.approves_for_merge(&digest("d1"), false));
    }

    #[test]
    fn restart_resets_to_first_position() {
        let mut c = committee(3);
        c.approve(&digest("d1"));
        c.approve(&digest("d1"));
        c.on_new_diff(true);
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn merge_gate_binds_last_approval_to_digest() {
        let mut c = committee(2);
        c.approve(&digest("d1"));
        c.on_new_diff(false);
        c.approve(&digest("d2"));
        assert!(c.approves_for_merge(&digest("d2"), false));
        assert!(!c.approves_for_merge(&digest("d1"), false));
        // Strict mode wants every position on the final digest.
        assert!(!c.approves_for_merge(&digest("d2"), true));
    }

    #[test]
    fn incomplete_committee_never_approves_merge() {
        let mut c = committee(2);
        c.approve(&digest("d"));
        assert!(!c.approves_for_merge(&digest("d"), false));
    }
}
