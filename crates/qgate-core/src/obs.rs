//! Structured lifecycle logging for orchestration runs.
//!
//! [`OrchestrationSpan`] scopes log lines to one run; the `emit_*` helpers
//! log the key transitions with a stable `event` field so they can be
//! filtered in JSON output.

use tracing::{info, warn};

use crate::domain::{GateStatus, GateType, RepositoryTier};
use crate::resolver::ResolutionAction;

/// RAII guard that enters a run-scoped span until dropped.
///
/// ```ignore
/// let _span = OrchestrationSpan::enter("orch-1", "org/api", "abc123");
/// ```
pub struct OrchestrationSpan {
    _span: tracing::span::EnteredSpan,
}

impl OrchestrationSpan {
    pub fn enter(orchestration_id: &str, repository: &str, commit: &str) -> Self {
        let span = tracing::info_span!(
            "qgate.orchestration",
            orchestration_id = %orchestration_id,
            repository = %repository,
            commit = %commit,
        );
        Self {
            _span: span.entered(),
        }
    }
}

pub fn emit_run_started(orchestration_id: &str, tier: RepositoryTier, gates: usize, phases: usize) {
    info!(
        event = "orchestration.started",
        orchestration_id = %orchestration_id,
        tier = %tier,
        gates = gates,
        phases = phases,
    );
}

pub fn emit_gate_updated(orchestration_id: &str, gate: GateType, status: GateStatus, progress: u8) {
    info!(
        event = "gate.updated",
        orchestration_id = %orchestration_id,
        gate = %gate,
        status = %status,
        progress = progress,
    );
}

pub fn emit_failure_resolved(
    orchestration_id: &str,
    gate: GateType,
    action: ResolutionAction,
    reason: &str,
) {
    info!(
        event = "gate.failure_resolved",
        orchestration_id = %orchestration_id,
        gate = %gate,
        action = %action,
        reason = %reason,
    );
}

/// Late, stale or misaddressed update that was dropped.
pub fn emit_update_discarded(orchestration_id: &str, gate: GateType, reason: &dyn std::fmt::Display) {
    warn!(
        event = "gate.update_discarded",
        orchestration_id = %orchestration_id,
        gate = %gate,
        reason = %reason,
    );
}

pub fn emit_collaborator_error(
    orchestration_id: &str,
    operation: &str,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "collaborator.error",
        orchestration_id = %orchestration_id,
        operation = %operation,
        error = %error,
    );
}

pub fn emit_run_finished(orchestration_id: &str, status: &str, duration_ms: u64, progress: u8) {
    info!(
        event = "orchestration.finished",
        orchestration_id = %orchestration_id,
        status = %status,
        duration_ms = duration_ms,
        progress = progress,
    );
}
