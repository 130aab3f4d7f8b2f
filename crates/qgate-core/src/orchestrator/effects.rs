//! Side effects recorded under a run's lock and executed after it is released.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;

use super::Orchestrator;
use crate::collaborators::{ProtectionRequest, WorkflowDispatch};
use crate::context::{LogLevel, OrchestrationContext};
use crate::domain::{CollaboratorError, GateType};
use crate::events::OrchestrationEvent;
use crate::obs;
use crate::plan::PhaseKind;
use crate::status::{CheckUpdate, ComplianceSummary};

#[derive(Debug)]
pub(super) enum Effect {
    Publish(OrchestrationEvent),
    Check(CheckUpdate),
    Compliance(ComplianceSummary),
    /// Dispatch gates to the external workflow in the background.
    Dispatch(WorkflowDispatch),
    /// Start a phase timer for `gates`, each paired with its retry count when armed.
    ArmTimeout {
        phase: PhaseKind,
        gates: Vec<(GateType, u32)>,
    },
    Protect(ProtectionRequest),
    CancelWorkflow {
        repository: String,
        run_id: String,
    },
    /// The run is terminal; drop its timers.
    StopTimers,
}

/// Effects recorded by one mutation, stamped under the run's lock.
#[derive(Debug)]
pub(super) struct EffectBatch {
    pub(super) seq: u64,
    pub(super) effects: Vec<Effect>,
}

impl EffectBatch {
    pub(super) fn stamp(ctx: &mut OrchestrationContext) -> Self {
        Self {
            seq: ctx.next_effect_seq(),
            effects: Vec::new(),
        }
    }
}

/// Newest batch whose status writes reached the reporter, per run.
#[derive(Debug, Default)]
pub(super) struct WriteLedger {
    compliance: u64,
    checks: HashMap<GateType, u64>,
}

impl WriteLedger {
    /// Admit a check write unless a newer batch already wrote this gate.
    fn admit_check(&mut self, gate: GateType, seq: u64) -> bool {
        let last = self.checks.entry(gate).or_insert(0);
        if seq < *last {
            return false;
        }
        *last = seq;
        true
    }

    fn admit_compliance(&mut self, seq: u64) -> bool {
        if seq <= self.compliance {
            return false;
        }
        self.compliance = seq;
        true
    }
}

/// Phase timers per run. Stopped runs never get new timers.
#[derive(Debug, Default)]
pub(super) struct TimerTable {
    armed: HashMap<String, Vec<AbortHandle>>,
    stopped: HashSet<String>,
}

/// How collected check writes are flushed to the status reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CheckDelivery {
    Individual,
    Batched,
}

impl Orchestrator {
    /// Execute `batches` for run `id`. Status writes are awaited inline and
    /// serialized per run; a write older than one already made is skipped.
    /// Dispatch, protection and cancellation run in the background. Timers
    /// are dropped last since this may run on a timer task.
    pub(super) async fn run_effects(
        &self,
        id: &str,
        batches: Vec<EffectBatch>,
        delivery: CheckDelivery,
    ) {
        let mut stop_timers = false;
        let mut checks = Vec::new();
        let mut compliance: Option<(u64, ComplianceSummary)> = None;
        for batch in batches {
            for effect in batch.effects {
                match effect {
                    Effect::Publish(event) => self.inner.events.publish(event),
                    Effect::Check(update) => checks.push((batch.seq, update)),
                    // Only the newest summary matters.
                    Effect::Compliance(summary) => {
                        if compliance.as_ref().map_or(true, |(seq, _)| batch.seq >= *seq) {
                            compliance = Some((batch.seq, summary));
                        }
                    }
                    Effect::Dispatch(dispatch) => self.spawn_dispatch(dispatch),
                    Effect::ArmTimeout { phase, gates } => self.arm_timeout(id, phase, gates),
                    Effect::Protect(request) => self.spawn_protect(id, request),
                    Effect::CancelWorkflow { repository, run_id } => {
                        self.spawn_cancel(id, repository, run_id)
                    }
                    Effect::StopTimers => stop_timers = true,
                }
            }
        }
        self.write_status(id, checks, compliance, delivery).await;
        if stop_timers {
            self.stop_timers(id);
        }
    }

    async fn write_status(
        &self,
        id: &str,
        checks: Vec<(u64, CheckUpdate)>,
        compliance: Option<(u64, ComplianceSummary)>,
        delivery: CheckDelivery,
    ) {
        if checks.is_empty() && compliance.is_none() {
            return;
        }
        let ledger = self.ledger(id);
        let mut ledger = ledger.lock().await;

        let total = checks.len();
        let checks: Vec<CheckUpdate> = checks
            .into_iter()
            .filter(|(seq, check)| ledger.admit_check(check.gate, *seq))
            .map(|(_, check)| check)
            .collect();
        if checks.len() < total {
            tracing::debug!(
                orchestration_id = %id,
                skipped = total - checks.len(),
                "superseded status writes skipped"
            );
        }
        self.flush_checks(id, checks, delivery).await;

        if let Some((seq, summary)) = compliance {
            if ledger.admit_compliance(seq) {
                self.publish_compliance(id, &summary).await;
            } else {
                tracing::debug!(orchestration_id = %id, seq, "superseded compliance write skipped");
            }
        }
    }

    fn ledger(&self, id: &str) -> Arc<tokio::sync::Mutex<WriteLedger>> {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the write ledger and timer bookkeeping of evicted runs.
    pub(super) fn forget(&self, ids: &[String]) {
        let mut writes = self.inner.writes.lock().unwrap_or_else(|e| e.into_inner());
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            writes.remove(id);
            timers.armed.remove(id);
            timers.stopped.remove(id);
        }
    }

    async fn flush_checks(&self, id: &str, checks: Vec<CheckUpdate>, delivery: CheckDelivery) {
        if checks.is_empty() {
            return;
        }
        let reporter = self.inner.reporter.clone();
        if delivery == CheckDelivery::Batched {
            let result = self
                .bounded("status batch update", reporter.batch_update(&checks))
                .await;
            if let Err(err) = result {
                self.collaborator_failed(id, "status batch update", &err).await;
            }
            return;
        }
        for check in &checks {
            if let Err(err) = self.bounded("status update", reporter.update(check)).await {
                self.collaborator_failed(id, "status update", &err).await;
            }
        }
    }

    async fn publish_compliance(&self, id: &str, summary: &ComplianceSummary) {
        let Some((repository, commit)) = self.locate(id).await else {
            return;
        };
        let reporter = self.inner.reporter.clone();
        let result = self
            .bounded(
                "compliance update",
                reporter.update_compliance(&repository, &commit, summary),
            )
            .await;
        if let Err(err) = result {
            self.collaborator_failed(id, "compliance update", &err).await;
        }
    }

    async fn locate(&self, id: &str) -> Option<(String, String)> {
        let shared = self.inner.store.get(id).await?;
        let ctx = shared.lock().await;
        Some((ctx.repository.clone(), ctx.commit.clone()))
    }

    /// Bound a collaborator call by the configured timeout.
    pub(super) async fn bounded<T, F>(&self, operation: &str, call: F) -> Result<T, CollaboratorError>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        let limit = self.inner.config.collaborator_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout {
                operation: operation.to_string(),
                timeout_secs: limit.as_secs(),
            }),
        }
    }

    /// Record a collaborator failure in the run log. Never aborts the run.
    pub(super) async fn collaborator_failed(
        &self,
        id: &str,
        operation: &str,
        error: &CollaboratorError,
    ) {
        obs::emit_collaborator_error(id, operation, error);
        let _ = self
            .inner
            .store
            .mutate(id, |ctx| {
                ctx.log(LogLevel::Error, format!("{operation} failed: {error}"));
            })
            .await;
        self.inner
            .events
            .publish(OrchestrationEvent::CollaboratorFailed {
                orchestration_id: id.to_string(),
                operation: operation.to_string(),
                error: error.to_string(),
            });
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .spawn(task);
    }

    fn spawn_dispatch(&self, dispatch: WorkflowDispatch) {
        let this = self.clone();
        self.spawn_background(async move {
            let trigger = this.inner.trigger.clone();
            let id = dispatch.orchestration_id.clone();
            match this.bounded("workflow dispatch", trigger.trigger(&dispatch)).await {
                Ok(run) => {
                    let gates: Vec<String> =
                        dispatch.gates.iter().map(|g| g.gate.to_string()).collect();
                    tracing::debug!(
                        orchestration_id = %id,
                        run_id = %run.run_id,
                        gates = %gates.join(","),
                        "gates dispatched"
                    );
                }
                Err(err) => this.collaborator_failed(&id, "workflow dispatch", &err).await,
            }
        });
    }

    fn spawn_protect(&self, id: &str, request: ProtectionRequest) {
        let this = self.clone();
        let id = id.to_string();
        self.spawn_background(async move {
            let protector = this.inner.protector.clone();
            match this
                .bounded("branch protection", protector.configure(&request))
                .await
            {
                Ok(()) => {
                    let _ = this
                        .inner
                        .store
                        .mutate(&id, |ctx| {
                            ctx.log(
                                LogLevel::Info,
                                format!(
                                    "branch protection configured for {} ({} approvals)",
                                    request.branch, request.reviews.required_approvals
                                ),
                            )
                        })
                        .await;
                }
                Err(err) => this.collaborator_failed(&id, "branch protection", &err).await,
            }
        });
    }

    fn spawn_cancel(&self, id: &str, repository: String, run_id: String) {
        let this = self.clone();
        let id = id.to_string();
        self.spawn_background(async move {
            let trigger = this.inner.trigger.clone();
            if let Err(err) = this
                .bounded("workflow cancel", trigger.cancel(&repository, &run_id))
                .await
            {
                this.collaborator_failed(&id, "workflow cancel", &err).await;
            }
        });
    }

    fn arm_timeout(&self, id: &str, phase: PhaseKind, gates: Vec<(GateType, u32)>) {
        if gates.is_empty() {
            return;
        }
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        if timers.stopped.contains(id) {
            return;
        }
        let this = self.clone();
        let task_id = id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(phase.timeout_secs())).await;
            this.expire_phase(&task_id, phase, &gates).await;
        });
        timers
            .armed
            .entry(id.to_string())
            .or_default()
            .push(handle.abort_handle());
    }

    fn stop_timers(&self, id: &str) {
        let handles = {
            let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
            timers.stopped.insert(id.to_string());
            timers.armed.remove(id).unwrap_or_default()
        };
        for handle in handles {
            handle.abort();
        }
    }

    /// Whether run `id` still has phase timers armed.
    pub fn has_armed_timers(&self, id: &str) -> bool {
        self.inner
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .armed
            .contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::domain::{RepositoryTier, ValidationRequest};
    use crate::fakes::{RecordingBranchProtector, RecordingStatusReporter, RecordingWorkflowTrigger};
    use crate::orchestrator::Collaborators;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            OrchestratorConfig::default(),
            Collaborators {
                trigger: Arc::new(RecordingWorkflowTrigger::new()),
                reporter: Arc::new(RecordingStatusReporter::new()),
                protector: Arc::new(RecordingBranchProtector::new()),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_ledger_skips_superseded_writes() {
        let mut ledger = WriteLedger::default();
        assert!(ledger.admit_check(GateType::UnitTests, 3));
        assert!(ledger.admit_check(GateType::UnitTests, 3));
        assert!(!ledger.admit_check(GateType::UnitTests, 2));
        assert!(ledger.admit_check(GateType::CodeQuality, 1));

        assert!(ledger.admit_compliance(4));
        assert!(!ledger.admit_compliance(2));
        assert!(!ledger.admit_compliance(4));
        assert!(ledger.admit_compliance(5));
    }

    #[tokio::test]
    async fn test_late_arm_after_stop_is_ignored() {
        let orchestrator = orchestrator();
        let report = orchestrator
            .start(ValidationRequest::new("org/sandbox", "t1", RepositoryTier::Experimental))
            .await
            .unwrap();
        let id = report.orchestration_id;
        assert!(orchestrator.has_armed_timers(&id));

        orchestrator.cancel(&id, "superseded").await.unwrap();
        assert!(!orchestrator.has_armed_timers(&id));

        orchestrator.arm_timeout(&id, PhaseKind::PreCommit, vec![(GateType::UnitTests, 0)]);
        assert!(!orchestrator.has_armed_timers(&id));

        orchestrator.forget(std::slice::from_ref(&id));
        assert!(!orchestrator.inner.timers.lock().unwrap().stopped.contains(&id));
    }
}
