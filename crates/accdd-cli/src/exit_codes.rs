//! Stable exit codes for `ac-cdd` commands.

use accdd_core::CycleOutcome;

/// Every cycle reached `Done`, or the command succeeded.
pub const OK: u8 = 0;
/// At least one cycle ended `Failed`, or the command could not complete.
pub const FAILED: u8 = 1;
/// Configuration or usage was invalid; no cycle was started.
pub const INVALID: u8 = 2;
/// Cycles were cancelled by an interrupt.
pub const CANCELLED: u8 = 130;

/// Exit code summarising a batch of outcomes.
pub fn for_outcomes(outcomes: &[CycleOutcome]) -> u8 {
    if outcomes.iter().all(CycleOutcome::is_done) {
        OK
    } else if outcomes.iter().any(CycleOutcome::is_cancelled) {
        CANCELLED
    } else {
        FAILED
    }
}
