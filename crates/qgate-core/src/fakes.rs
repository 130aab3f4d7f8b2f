//! In-memory collaborators for tests and simulations.
//!
//! Each fake records every call it receives so callers can assert on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::collaborators::{
    BranchProtector, CollaboratorResult, ProtectionRequest, StatusReporter, WorkflowDispatch,
    WorkflowRun, WorkflowRunStatus, WorkflowTrigger,
};
use crate::domain::{CollaboratorError, GateType};
use crate::status::{CheckUpdate, ComplianceSummary, StatusProjector};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// RecordingWorkflowTrigger
// ---------------------------------------------------------------------------

/// Workflow trigger that hands out sequential run ids.
#[derive(Debug, Default)]
pub struct RecordingWorkflowTrigger {
    dispatches: Mutex<Vec<WorkflowDispatch>>,
    cancelled: Mutex<Vec<String>>,
    fail_with: Mutex<Option<CollaboratorError>>,
    next_run: AtomicU64,
}

impl RecordingWorkflowTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger that rejects every dispatch with `error`.
    pub fn failing(error: CollaboratorError) -> Self {
        let trigger = Self::default();
        *lock(&trigger.fail_with) = Some(error);
        trigger
    }

    pub fn dispatches(&self) -> Vec<WorkflowDispatch> {
        lock(&self.dispatches).clone()
    }

    /// How many times `gate` was dispatched, first run included.
    pub fn dispatch_count(&self, gate: GateType) -> usize {
        lock(&self.dispatches)
            .iter()
            .flat_map(|d| d.gates.iter())
            .filter(|g| g.gate == gate)
            .count()
    }

    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }
}

#[async_trait]
impl WorkflowTrigger for RecordingWorkflowTrigger {
    async fn trigger(&self, dispatch: &WorkflowDispatch) -> CollaboratorResult<WorkflowRun> {
        if let Some(err) = lock(&self.fail_with).clone() {
            return Err(err);
        }
        lock(&self.dispatches).push(dispatch.clone());
        let n = self.next_run.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(WorkflowRun {
            run_id: format!("run-{n}"),
            status: WorkflowRunStatus::Queued,
        })
    }

    async fn cancel(&self, _repository: &str, run_id: &str) -> CollaboratorResult<()> {
        lock(&self.cancelled).push(run_id.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingStatusReporter
// ---------------------------------------------------------------------------

/// Status reporter that keeps every check write in memory. Initialization
/// records a queued check per gate.
#[derive(Debug, Default)]
pub struct RecordingStatusReporter {
    initialized: Mutex<Vec<(String, String, Vec<GateType>)>>,
    updates: Mutex<Vec<CheckUpdate>>,
    batches: Mutex<usize>,
    compliance: Mutex<Vec<ComplianceSummary>>,
}

impl RecordingStatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialized(&self) -> Vec<(String, String, Vec<GateType>)> {
        lock(&self.initialized).clone()
    }

    pub fn updates(&self) -> Vec<CheckUpdate> {
        lock(&self.updates).clone()
    }

    /// Most recent check write for `gate`.
    pub fn latest(&self, gate: GateType) -> Option<CheckUpdate> {
        lock(&self.updates)
            .iter()
            .rev()
            .find(|u| u.gate == gate)
            .cloned()
    }

    pub fn batch_calls(&self) -> usize {
        *lock(&self.batches)
    }

    pub fn compliance_history(&self) -> Vec<ComplianceSummary> {
        lock(&self.compliance).clone()
    }

    pub fn latest_compliance(&self) -> Option<ComplianceSummary> {
        lock(&self.compliance).last().cloned()
    }
}

#[async_trait]
impl StatusReporter for RecordingStatusReporter {
    async fn initialize(
        &self,
        repository: &str,
        commit: &str,
        gates: &[GateType],
    ) -> CollaboratorResult<()> {
        lock(&self.initialized).push((repository.to_string(), commit.to_string(), gates.to_vec()));
        lock(&self.updates).extend(
            gates
                .iter()
                .map(|gate| StatusProjector::queued(repository, commit, *gate)),
        );
        Ok(())
    }

    async fn update(&self, update: &CheckUpdate) -> CollaboratorResult<()> {
        lock(&self.updates).push(update.clone());
        Ok(())
    }

    async fn batch_update(&self, updates: &[CheckUpdate]) -> CollaboratorResult<()> {
        *lock(&self.batches) += 1;
        lock(&self.updates).extend(updates.iter().cloned());
        Ok(())
    }

    async fn update_compliance(
        &self,
        _repository: &str,
        _commit: &str,
        summary: &ComplianceSummary,
    ) -> CollaboratorResult<()> {
        lock(&self.compliance).push(summary.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingBranchProtector
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingBranchProtector {
    requests: Mutex<Vec<ProtectionRequest>>,
}

impl RecordingBranchProtector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ProtectionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl BranchProtector for RecordingBranchProtector {
    async fn configure(&self, request: &ProtectionRequest) -> CollaboratorResult<()> {
        lock(&self.requests).push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DispatchPriority, RepositoryTier};

    fn dispatch() -> WorkflowDispatch {
        WorkflowDispatch {
            orchestration_id: "orch-1".into(),
            repository: "org/api".into(),
            commit: "abc".into(),
            git_ref: "main".into(),
            workflow_file: "qms-quality-validation.yml".into(),
            tier: RepositoryTier::Experimental,
            environment: "development".into(),
            priority: DispatchPriority::Normal,
            pull_request: None,
            gates: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_trigger_hands_out_sequential_run_ids() {
        let trigger = RecordingWorkflowTrigger::new();
        let first = trigger.trigger(&dispatch()).await.unwrap();
        let second = trigger.trigger(&dispatch()).await.unwrap();
        assert_eq!(first.run_id, "run-1");
        assert_eq!(second.run_id, "run-2");
        assert_eq!(trigger.dispatches().len(), 2);
    }

    #[tokio::test]
    async fn test_initialize_queues_a_check_per_gate() {
        let reporter = RecordingStatusReporter::new();
        reporter
            .initialize("org/api", "abc", &[GateType::CodeQuality, GateType::UnitTests])
            .await
            .unwrap();
        let queued = reporter.latest(GateType::UnitTests).unwrap();
        assert_eq!(queued.context, "qms/unit_tests");
        assert_eq!(queued.state, crate::domain::CheckState::Pending);
        assert_eq!(reporter.updates().len(), 2);
    }

    #[tokio::test]
    async fn test_failing_trigger_records_nothing() {
        let trigger = RecordingWorkflowTrigger::failing(CollaboratorError::Unavailable(
            "503".into(),
        ));
        assert!(trigger.trigger(&dispatch()).await.is_err());
        assert!(trigger.dispatches().is_empty());
    }
}
