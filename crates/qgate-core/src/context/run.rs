//! The mutable record of one orchestration run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::decision::DecisionAuditRecord;
use crate::domain::{
    GateOutcome, GateStatus, GateType, RepositoryTier, Severity, StateError, ValidatedRequest,
};
use crate::plan::{PhaseKind, ValidationPlan};
use crate::policy::TierPolicy;
use crate::resolver::{FailureResolution, Urgency};
use crate::status::{ComplianceSummary, GateStanding, StatusProjector};

/// Lifecycle of a run.
///
/// `initializing -> running -> {completed, failed}`, with
/// `blocked_pending_escalation` reachable from `running` until a reviewer
/// decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Initializing,
    Running,
    BlockedPendingEscalation,
    Completed,
    Failed,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether gate updates are applied in this state.
    pub fn accepts_updates(self) -> bool {
        matches!(self, Self::Running | Self::BlockedPendingEscalation)
    }
}

impl fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::BlockedPendingEscalation => "blocked_pending_escalation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Per-gate bookkeeping inside a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateState {
    pub status: GateStatus,
    #[serde(default)]
    pub outcome: Option<GateOutcome>,
    /// Timestamp of the newest report applied, kept across retries.
    #[serde(default)]
    pub last_reported: Option<DateTime<Utc>>,
    pub retries: u32,
    /// Failure accepted by a bypass approval or an escalation override.
    pub accepted: bool,
}

impl GateState {
    fn pending() -> Self {
        Self {
            status: GateStatus::Pending,
            outcome: None,
            last_reported: None,
            retries: 0,
            accepted: false,
        }
    }
}

/// A bypass waiting for an authorized approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBypass {
    pub gate: GateType,
    pub resolution: FailureResolution,
    pub requested_at: DateTime<Utc>,
}

/// An escalation waiting for a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEscalation {
    pub gate: GateType,
    pub severity: Severity,
    pub urgency: Urgency,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

/// What applying one outcome did to its gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateTransition {
    /// Pending or running; nothing settled.
    Progressed,
    /// The gate entered the completed set.
    Completed,
    /// The gate failed and needs a resolution. It is not settled yet.
    Failed,
}

/// The mutable record of one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationContext {
    pub id: String,
    pub repository: String,
    pub commit: String,
    pub branch: String,
    pub request: ValidatedRequest,
    pub plan: ValidationPlan,
    pub policy: TierPolicy,
    pub status: OrchestrationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_phase: Option<PhaseKind>,
    pub started_phases: BTreeSet<PhaseKind>,
    pub gates: BTreeMap<GateType, GateState>,
    completed: BTreeSet<GateType>,
    failed: BTreeSet<GateType>,
    cancelled: BTreeSet<GateType>,
    pub pending_bypasses: BTreeMap<GateType, PendingBypass>,
    pub pending_escalations: BTreeMap<GateType, PendingEscalation>,
    pub progress: u8,
    pub workflow_run_id: Option<String>,
    pub logs: Vec<LogEntry>,
    pub audit: Vec<DecisionAuditRecord>,
    pub verdict: Option<ComplianceSummary>,
    /// Sequence number of the latest batch of side effects recorded.
    #[serde(default)]
    effect_seq: u64,
}

impl OrchestrationContext {
    pub fn new(
        id: impl Into<String>,
        request: ValidatedRequest,
        plan: ValidationPlan,
        policy: TierPolicy,
        branch: impl Into<String>,
    ) -> Self {
        let gates = plan
            .required_gates
            .iter()
            .map(|g| (*g, GateState::pending()))
            .collect();
        let mut ctx = Self {
            id: id.into(),
            repository: request.repository.clone(),
            commit: request.commit.clone(),
            branch: branch.into(),
            request,
            plan,
            policy,
            status: OrchestrationStatus::Initializing,
            started_at: Utc::now(),
            finished_at: None,
            current_phase: None,
            started_phases: BTreeSet::new(),
            gates,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            cancelled: BTreeSet::new(),
            pending_bypasses: BTreeMap::new(),
            pending_escalations: BTreeMap::new(),
            progress: 0,
            workflow_run_id: None,
            logs: Vec::new(),
            audit: Vec::new(),
            verdict: None,
            effect_seq: 0,
        };
        ctx.recompute_progress();
        ctx
    }

    /// Stamp the next batch of side effects. Strictly increasing per run.
    pub fn next_effect_seq(&mut self) -> u64 {
        self.effect_seq += 1;
        self.effect_seq
    }

    pub fn tier(&self) -> RepositoryTier {
        self.plan.tier
    }

    pub fn completed(&self) -> &BTreeSet<GateType> {
        &self.completed
    }

    pub fn failed(&self) -> &BTreeSet<GateType> {
        &self.failed
    }

    pub fn cancelled(&self) -> &BTreeSet<GateType> {
        &self.cancelled
    }

    /// Completed, failed or cancelled. Settled gates never change again.
    pub fn is_settled(&self, gate: GateType) -> bool {
        self.completed.contains(&gate)
            || self.failed.contains(&gate)
            || self.cancelled.contains(&gate)
    }

    fn check_settle(&self, gate: GateType) -> Result<(), StateError> {
        if !self.gates.contains_key(&gate) {
            return Err(StateError::UnknownGate {
                id: self.id.clone(),
                gate,
            });
        }
        if self.is_settled(gate) {
            return Err(StateError::GateSettled {
                id: self.id.clone(),
                gate,
            });
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, gate: GateType) -> Result<(), StateError> {
        self.check_settle(gate)?;
        self.completed.insert(gate);
        Ok(())
    }

    pub fn mark_failed(&mut self, gate: GateType) -> Result<(), StateError> {
        self.check_settle(gate)?;
        self.failed.insert(gate);
        Ok(())
    }

    fn mark_cancelled(&mut self, gate: GateType) -> Result<(), StateError> {
        self.check_settle(gate)?;
        self.cancelled.insert(gate);
        if let Some(state) = self.gates.get_mut(&gate) {
            state.status = GateStatus::Cancelled;
        }
        Ok(())
    }

    /// Apply one reported outcome, last timestamp wins.
    pub fn record_outcome(&mut self, outcome: &GateOutcome) -> Result<GateTransition, StateError> {
        if !self.status.accepts_updates() {
            return Err(StateError::Terminal {
                id: self.id.clone(),
                status: self.status.to_string(),
            });
        }
        self.check_settle(outcome.gate)?;
        let id = self.id.clone();
        let state = self
            .gates
            .get_mut(&outcome.gate)
            .ok_or_else(|| StateError::UnknownGate {
                id: id.clone(),
                gate: outcome.gate,
            })?;
        if state.last_reported.is_some_and(|last| outcome.timestamp < last) {
            return Err(StateError::StaleUpdate {
                id,
                gate: outcome.gate,
            });
        }

        state.status = outcome.status;
        state.last_reported = Some(outcome.timestamp);
        state.outcome = Some(outcome.clone());

        let transition = match outcome.status {
            GateStatus::Success => {
                self.mark_completed(outcome.gate)?;
                GateTransition::Completed
            }
            // A validator run cancelled outside the orchestrator is a failure.
            GateStatus::Failure | GateStatus::Error | GateStatus::Cancelled => {
                GateTransition::Failed
            }
            GateStatus::Pending | GateStatus::Running => GateTransition::Progressed,
        };
        self.recompute_progress();
        Ok(transition)
    }

    /// Put a failed gate back to pending for another attempt. Returns the attempt number.
    pub fn schedule_retry(&mut self, gate: GateType) -> Result<u32, StateError> {
        self.check_settle(gate)?;
        let state = self.gates.get_mut(&gate).ok_or_else(|| StateError::UnknownGate {
            id: self.id.clone(),
            gate,
        })?;
        state.retries += 1;
        state.status = GateStatus::Pending;
        Ok(state.retries)
    }

    pub fn retries(&self, gate: GateType) -> u32 {
        self.gates.get(&gate).map(|s| s.retries).unwrap_or(0)
    }

    pub fn accept(&mut self, gate: GateType) {
        if let Some(state) = self.gates.get_mut(&gate) {
            state.accepted = true;
        }
    }

    pub fn is_accepted(&self, gate: GateType) -> bool {
        self.gates.get(&gate).is_some_and(|s| s.accepted)
    }

    /// Cancel every unsettled gate. Returns the gates cancelled.
    pub fn cancel_pending(&mut self) -> Vec<GateType> {
        let pending = self.pending_gates();
        for gate in &pending {
            let _ = self.mark_cancelled(*gate);
        }
        pending
    }

    /// Required gates not yet settled.
    pub fn pending_gates(&self) -> Vec<GateType> {
        self.plan
            .required_gates
            .iter()
            .copied()
            .filter(|g| !self.is_settled(*g))
            .collect()
    }

    /// Every required gate succeeded or had its failure accepted.
    pub fn all_resolved(&self) -> bool {
        self.plan
            .required_gates
            .iter()
            .all(|g| self.completed.contains(g) || self.is_accepted(*g))
    }

    pub fn recompute_progress(&mut self) {
        let total = self.plan.required_gates.len();
        self.progress = if total == 0 {
            100
        } else {
            ((self.completed.len() * 100) as f64 / total as f64).round() as u8
        };
    }

    pub fn set_status(&mut self, status: OrchestrationStatus) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn standings(&self) -> Vec<GateStanding> {
        self.plan
            .required_gates
            .iter()
            .map(|gate| {
                let state = self.gates.get(gate);
                GateStanding {
                    gate: *gate,
                    status: state.map(|s| s.status).unwrap_or(GateStatus::Pending),
                    score: state.and_then(|s| s.outcome.as_ref()).and_then(|o| o.score),
                    accepted: state.is_some_and(|s| s.accepted),
                }
            })
            .collect()
    }

    pub fn compliance(&self) -> ComplianceSummary {
        StatusProjector::compliance(self.standings())
    }

    pub fn estimated_completion(&self) -> DateTime<Utc> {
        self.started_at + Duration::minutes(i64::from(self.policy.estimated_minutes))
    }

    /// Append to the run log and mirror it to tracing.
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => {
                tracing::info!(orchestration_id = %self.id, "{message}")
            }
            LogLevel::Warn => {
                tracing::warn!(orchestration_id = %self.id, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(orchestration_id = %self.id, "{message}")
            }
        }
        self.logs.push(LogEntry {
            at: Utc::now(),
            level,
            message,
        });
    }

    pub fn report(&self) -> OrchestrationReport {
        OrchestrationReport {
            orchestration_id: self.id.clone(),
            repository: self.repository.clone(),
            commit: self.commit.clone(),
            branch: self.branch.clone(),
            tier: self.tier(),
            status: self.status,
            phases: self.plan.phases.iter().map(|p| p.kind).collect(),
            current_phase: self.current_phase,
            progress: self.progress,
            completed_gates: self.completed.iter().copied().collect(),
            failed_gates: self.failed.iter().copied().collect(),
            cancelled_gates: self.cancelled.iter().copied().collect(),
            compliance: self.verdict.clone().unwrap_or_else(|| self.compliance()),
            workflow_run_id: self.workflow_run_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            estimated_completion: self.estimated_completion(),
            pending_bypasses: self.pending_bypasses.keys().copied().collect(),
            pending_escalations: self.pending_escalations.keys().copied().collect(),
            logs: self.logs.clone(),
            audit: self.audit.clone(),
        }
    }
}

/// Read-only view of a run handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationReport {
    pub orchestration_id: String,
    pub repository: String,
    pub commit: String,
    pub branch: String,
    pub tier: RepositoryTier,
    pub status: OrchestrationStatus,
    pub phases: Vec<PhaseKind>,
    pub current_phase: Option<PhaseKind>,
    pub progress: u8,
    pub completed_gates: Vec<GateType>,
    pub failed_gates: Vec<GateType>,
    pub cancelled_gates: Vec<GateType>,
    pub compliance: ComplianceSummary,
    pub workflow_run_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub estimated_completion: DateTime<Utc>,
    pub pending_bypasses: Vec<GateType>,
    pub pending_escalations: Vec<GateType>,
    pub logs: Vec<LogEntry>,
    pub audit: Vec<DecisionAuditRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ValidationRequest;
    use crate::plan::PlanBuilder;

    fn running(tier: RepositoryTier) -> OrchestrationContext {
        let request = ValidationRequest::new("org/api", "abc", tier)
            .validate()
            .unwrap();
        let builder = PlanBuilder::default();
        let plan = builder.build(&request).unwrap();
        let policy = builder.policies().policy_for(tier);
        let mut ctx = OrchestrationContext::new("orch-1", request, plan, policy, "main");
        ctx.set_status(OrchestrationStatus::Running);
        ctx
    }

    #[test]
    fn test_success_is_idempotent() {
        let mut ctx = running(RepositoryTier::Experimental);
        let ok = GateOutcome::success(GateType::UnitTests);
        assert_eq!(ctx.record_outcome(&ok).unwrap(), GateTransition::Completed);
        for _ in 0..3 {
            assert!(matches!(
                ctx.record_outcome(&ok),
                Err(StateError::GateSettled { .. })
            ));
        }
        assert_eq!(ctx.completed().len(), 1);
        assert_eq!(ctx.progress, 50);
    }

    #[test]
    fn test_completed_and_failed_stay_disjoint() {
        let mut ctx = running(RepositoryTier::Experimental);
        ctx.mark_failed(GateType::CodeQuality).unwrap();
        assert!(ctx.mark_completed(GateType::CodeQuality).is_err());
        let ok = GateOutcome::success(GateType::CodeQuality);
        assert!(ctx.record_outcome(&ok).is_err());
        assert!(ctx.completed().is_disjoint(ctx.failed()));
    }

    #[test]
    fn test_stale_update_is_rejected() {
        let mut ctx = running(RepositoryTier::Experimental);
        let now = Utc::now();
        let newer = GateOutcome::new(GateType::UnitTests, GateStatus::Running).at(now);
        let older = GateOutcome::success(GateType::UnitTests).at(now - Duration::seconds(5));
        ctx.record_outcome(&newer).unwrap();
        assert!(matches!(
            ctx.record_outcome(&older),
            Err(StateError::StaleUpdate { .. })
        ));
        assert!(ctx.completed().is_empty());
    }

    #[test]
    fn test_failure_is_not_settled_until_resolved() {
        let mut ctx = running(RepositoryTier::Standard);
        let failed = GateOutcome::failure(GateType::UnitTests, "2 failed");
        assert_eq!(ctx.record_outcome(&failed).unwrap(), GateTransition::Failed);
        assert!(!ctx.is_settled(GateType::UnitTests));
        assert_eq!(ctx.schedule_retry(GateType::UnitTests).unwrap(), 1);
        assert_eq!(ctx.gates[&GateType::UnitTests].status, GateStatus::Pending);
    }

    #[test]
    fn test_terminal_run_rejects_updates() {
        let mut ctx = running(RepositoryTier::Experimental);
        ctx.set_status(OrchestrationStatus::Completed);
        let ok = GateOutcome::success(GateType::UnitTests);
        assert!(matches!(
            ctx.record_outcome(&ok),
            Err(StateError::Terminal { .. })
        ));
        ctx.set_status(OrchestrationStatus::Running);
        assert_eq!(ctx.status, OrchestrationStatus::Completed);
    }

    #[test]
    fn test_unknown_gate_is_rejected() {
        let mut ctx = running(RepositoryTier::Experimental);
        let outcome = GateOutcome::success(GateType::SecurityReview);
        assert!(matches!(
            ctx.record_outcome(&outcome),
            Err(StateError::UnknownGate { .. })
        ));
    }

    #[test]
    fn test_cancel_marks_only_pending_gates() {
        let mut ctx = running(RepositoryTier::Standard);
        ctx.record_outcome(&GateOutcome::success(GateType::CodeQuality))
            .unwrap();
        let cancelled = ctx.cancel_pending();
        assert_eq!(cancelled.len(), 2);
        assert!(!ctx.cancelled().contains(&GateType::CodeQuality));
        assert!(ctx.failed().is_empty());
    }

    #[test]
    fn test_accepted_gate_counts_as_resolved() {
        let mut ctx = running(RepositoryTier::Experimental);
        ctx.record_outcome(&GateOutcome::success(GateType::CodeQuality))
            .unwrap();
        ctx.record_outcome(&GateOutcome::failure(GateType::UnitTests, "x"))
            .unwrap();
        ctx.mark_failed(GateType::UnitTests).unwrap();
        assert!(!ctx.all_resolved());
        ctx.accept(GateType::UnitTests);
        assert!(ctx.all_resolved());
        assert_eq!(
            ctx.compliance().verdict,
            crate::status::ComplianceVerdict::Success
        );
    }

    #[test]
    fn test_effect_seq_increases() {
        let mut ctx = running(RepositoryTier::Experimental);
        let first = ctx.next_effect_seq();
        assert!(ctx.next_effect_seq() > first);
    }

    #[test]
    fn test_estimated_completion_uses_tier_minutes() {
        let ctx = running(RepositoryTier::MissionCritical);
        assert_eq!(
            ctx.estimated_completion() - ctx.started_at,
            Duration::minutes(45)
        );
    }
}
