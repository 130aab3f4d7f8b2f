//! The orchestrator: builds plans, drives the external workflow, ingests gate
//! updates, resolves failures and finalizes compliance.
//!
//! Each run is mutated only under its own lock. Mutations record
//! [`effects::Effect`]s that are executed after the lock is released, so
//! slow collaborator calls never block updates for any run.

mod effects;
mod transitions;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::collaborators::{BranchProtector, StatusReporter, WorkflowTrigger};
use crate::config::{ConfigResult, OrchestratorConfig};
use crate::context::{
    ContextStore, LogLevel, OrchestrationContext, OrchestrationReport, OrchestrationStatus,
};
use crate::decision::{
    BypassApproval, BypassRejection, DecisionAuditRecord, DecisionKind, EscalationDecision,
    EscalationOutcome,
};
use crate::domain::{
    CheckState, DecisionError, GateStatus, GateStatusUpdate, GateType, OrchestrationError, Result,
    StateError, ValidationRequest,
};
use crate::events::{EventBus, EventEnvelope, OrchestrationEvent};
use crate::metrics::METRICS;
use crate::obs;
use crate::plan::{PhaseKind, PlanBuilder, ValidationPlan};
use crate::resolver::FailureResolver;
use crate::status::StatusProjector;

use effects::{CheckDelivery, Effect, EffectBatch, TimerTable, WriteLedger};

/// The external collaborators an orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub trigger: Arc<dyn WorkflowTrigger>,
    pub reporter: Arc<dyn StatusReporter>,
    pub protector: Arc<dyn BranchProtector>,
}

/// What happened to one submitted gate update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateDisposition {
    Applied {
        orchestration_id: String,
        gate: GateType,
        status: GateStatus,
        progress: u8,
        run_status: OrchestrationStatus,
    },
    /// Logged and dropped without touching the run.
    Discarded { reason: StateError },
}

impl UpdateDisposition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

struct Inner {
    config: OrchestratorConfig,
    planner: PlanBuilder,
    resolver: FailureResolver,
    store: ContextStore,
    events: EventBus,
    trigger: Arc<dyn WorkflowTrigger>,
    reporter: Arc<dyn StatusReporter>,
    protector: Arc<dyn BranchProtector>,
    background: Mutex<JoinSet<()>>,
    timers: Mutex<TimerTable>,
    writes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<WriteLedger>>>>,
}

/// Tier-aware quality gate orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> ConfigResult<Self> {
        config.validate()?;
        let planner = PlanBuilder::new(config.policy_table()?);
        let resolver = FailureResolver::new(config.bypass_approvers.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                planner,
                resolver,
                store: ContextStore::new(),
                events: EventBus::new(),
                trigger: collaborators.trigger,
                reporter: collaborators.reporter,
                protector: collaborators.protector,
                background: Mutex::new(JoinSet::new()),
                timers: Mutex::new(TimerTable::default()),
                writes: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Build the plan a request would get, without starting anything.
    pub fn plan(&self, request: &ValidationRequest) -> Result<ValidationPlan> {
        let validated = request.validate()?;
        Ok(self.inner.planner.build(&validated)?)
    }

    /// Validate `request`, register status checks, trigger the external
    /// workflow and return the running orchestration.
    ///
    /// Request validation and workflow-trigger failures are returned; the
    /// latter also leave the run in `failed`.
    pub async fn start(&self, request: ValidationRequest) -> Result<OrchestrationReport> {
        let validated = request.validate()?;
        let plan = self.inner.planner.build(&validated)?;
        let policy = self.inner.planner.policies().policy_for(validated.tier);
        let branch = validated
            .branch
            .clone()
            .unwrap_or_else(|| self.inner.config.default_ref.clone());

        let id = format!("qgate-{}", Uuid::new_v4());
        let mut ctx = OrchestrationContext::new(id.clone(), validated, plan, policy, branch);
        ctx.log(
            LogLevel::Info,
            format!(
                "orchestration created for {}@{} ({} tier, {} gates, {} phases)",
                ctx.repository,
                ctx.commit,
                ctx.tier(),
                ctx.plan.required_gates.len(),
                ctx.plan.phases.len()
            ),
        );
        let span = tracing::info_span!(
            "qgate.orchestration",
            orchestration_id = %id,
            repository = %ctx.repository,
            commit = %ctx.commit,
        );
        self.inner.store.create(ctx).await?;
        METRICS.inc_runs_started();

        self.initialize(&id).instrument(span).await
    }

    async fn initialize(&self, id: &str) -> Result<OrchestrationReport> {
        let snapshot = self
            .inner
            .store
            .snapshot(id)
            .await
            .ok_or_else(|| StateError::UnknownOrchestration(id.to_string()))?;
        obs::emit_run_started(
            id,
            snapshot.tier(),
            snapshot.plan.required_gates.len(),
            snapshot.plan.phases.len(),
        );

        let gates: Vec<GateType> = snapshot.plan.required_gates.iter().copied().collect();
        let reporter = self.inner.reporter.clone();
        if let Err(err) = self
            .bounded(
                "status initialize",
                reporter.initialize(&snapshot.repository, &snapshot.commit, &gates),
            )
            .await
        {
            self.collaborator_failed(id, "status initialize", &err).await;
        }

        let initial: Vec<PhaseKind> = snapshot.plan.ready_phases(&BTreeSet::new(), |_| false);
        let configs = initial
            .iter()
            .flat_map(|phase| self.inner.gate_configs(&snapshot, *phase))
            .collect();
        let dispatch = self.inner.dispatch_for(&snapshot, configs);

        let trigger = self.inner.trigger.clone();
        let run = match self.bounded("workflow trigger", trigger.trigger(&dispatch)).await {
            Ok(run) => run,
            Err(err) => {
                self.collaborator_failed(id, "workflow trigger", &err).await;
                let batch = self
                    .inner
                    .store
                    .mutate(id, |ctx| {
                        let mut batch = EffectBatch::stamp(ctx);
                        self.inner.fail_run(
                            ctx,
                            format!("workflow trigger failed: {err}"),
                            &mut batch.effects,
                        );
                        batch
                    })
                    .await?;
                self.run_effects(id, vec![batch], CheckDelivery::Individual)
                    .await;
                return Err(err.into());
            }
        };

        let (report, batch) = self
            .inner
            .store
            .mutate(id, |ctx| {
                let mut batch = EffectBatch::stamp(ctx);
                let effects = &mut batch.effects;
                ctx.workflow_run_id = Some(run.run_id.clone());
                ctx.set_status(OrchestrationStatus::Running);
                ctx.log(
                    LogLevel::Info,
                    format!("workflow run {} accepted ({:?})", run.run_id, run.status),
                );
                effects.push(Effect::Publish(OrchestrationEvent::Started {
                    orchestration_id: ctx.id.clone(),
                    repository: ctx.repository.clone(),
                    commit: ctx.commit.clone(),
                    workflow_run_id: run.run_id.clone(),
                }));
                for phase in &initial {
                    self.inner.start_phase(ctx, *phase, effects);
                }
                // An empty plan has nothing to wait for.
                self.inner.advance(ctx, effects);
                (ctx.report(), batch)
            })
            .await?;
        self.run_effects(id, vec![batch], CheckDelivery::Individual)
            .await;
        Ok(report)
    }

    /// Apply one gate update. Never fails: updates for unknown or finished
    /// runs, unknown gates, settled gates or stale timestamps are logged and
    /// discarded.
    pub async fn handle_update(&self, update: GateStatusUpdate) -> UpdateDisposition {
        let (disposition, batch) = self.apply_update(&update).await;
        if let (
            UpdateDisposition::Applied {
                orchestration_id, ..
            },
            Some(batch),
        ) = (&disposition, batch)
        {
            self.run_effects(orchestration_id, vec![batch], CheckDelivery::Individual)
                .await;
        }
        disposition
    }

    /// Apply several updates with the same per-gate semantics as
    /// [`Orchestrator::handle_update`]. Results are reported per item, and the
    /// resulting check writes go out as one batch per run.
    pub async fn handle_batch(&self, updates: Vec<GateStatusUpdate>) -> Vec<UpdateDisposition> {
        let mut results = Vec::with_capacity(updates.len());
        let mut pending: Vec<(String, Vec<EffectBatch>)> = Vec::new();
        for update in &updates {
            let (disposition, batch) = self.apply_update(update).await;
            if let (
                UpdateDisposition::Applied {
                    orchestration_id, ..
                },
                Some(batch),
            ) = (&disposition, batch)
            {
                match pending.iter_mut().find(|(id, _)| id == orchestration_id) {
                    Some((_, acc)) => acc.push(batch),
                    None => pending.push((orchestration_id.clone(), vec![batch])),
                }
            }
            results.push(disposition);
        }
        for (id, batches) in pending {
            self.run_effects(&id, batches, CheckDelivery::Batched).await;
        }
        results
    }

    async fn apply_update(
        &self,
        update: &GateStatusUpdate,
    ) -> (UpdateDisposition, Option<EffectBatch>) {
        let shared = match &update.orchestration_id {
            Some(id) => self.inner.store.get(id).await,
            None => {
                self.inner
                    .store
                    .find_by_commit(&update.repository, &update.commit)
                    .await
            }
        };
        let Some(shared) = shared else {
            let reason = match &update.orchestration_id {
                Some(id) => StateError::UnknownOrchestration(id.clone()),
                None => StateError::UnknownCommit {
                    repository: update.repository.clone(),
                    commit: update.commit.clone(),
                },
            };
            METRICS.inc_updates_discarded();
            obs::emit_update_discarded("-", update.outcome.gate, &reason);
            return (UpdateDisposition::Discarded { reason }, None);
        };

        let mut ctx = shared.lock().await;
        let mut batch = EffectBatch::stamp(&mut ctx);
        let disposition =
            self.inner
                .apply_outcome(&mut ctx, &update.outcome, None, &mut batch.effects);
        ctx.recompute_progress();
        (disposition, Some(batch))
    }

    async fn expire_phase(&self, id: &str, phase: PhaseKind, gates: &[(GateType, u32)]) {
        let result = self
            .inner
            .store
            .mutate(id, |ctx| {
                let mut batch = EffectBatch::stamp(ctx);
                let expired = self.inner.expire(ctx, phase, gates, &mut batch.effects);
                (expired, batch)
            })
            .await;
        if let Ok((expired, batch)) = result {
            if expired > 0 {
                tracing::warn!(
                    orchestration_id = %id,
                    phase = %phase,
                    expired,
                    "phase timed out with unresolved gates"
                );
            }
            self.run_effects(id, vec![batch], CheckDelivery::Individual)
                .await;
        }
    }

    /// Approve a pending bypass. The gate then counts as accepted.
    pub async fn approve_bypass(
        &self,
        id: &str,
        approval: BypassApproval,
    ) -> Result<OrchestrationReport> {
        approval.check(&self.inner.config.bypass_approvers)?;
        self.decide(id, approval.gate, |inner, ctx, effects| {
            ctx.pending_bypasses
                .remove(&approval.gate)
                .ok_or(DecisionError::NoPendingBypass(approval.gate))?;
            let record = DecisionAuditRecord::seal(
                ctx.id.clone(),
                ctx.repository.clone(),
                ctx.commit.clone(),
                approval.gate,
                DecisionKind::BypassApproved,
                approval.approver.clone(),
                approval.justification.clone(),
                Some(approval.ticket.clone()),
                Utc::now(),
            );
            ctx.log(
                LogLevel::Warn,
                format!(
                    "bypass of {} approved by {} ({}): {}",
                    approval.gate, approval.approver, approval.ticket, approval.justification
                ),
            );
            effects.push(Effect::Check(StatusProjector::annotate(
                &ctx.repository,
                &ctx.commit,
                approval.gate,
                CheckState::Success,
                format!("{} bypassed by {}", approval.gate, approval.approver),
            )));
            inner.record_decision(ctx, record, effects);
            inner.advance(ctx, effects);
            Ok(())
        })
        .await
    }

    /// Refuse a pending bypass. The gate is blocked and the run fails.
    pub async fn reject_bypass(
        &self,
        id: &str,
        rejection: BypassRejection,
    ) -> Result<OrchestrationReport> {
        rejection.check(&self.inner.config.bypass_approvers)?;
        self.decide(id, rejection.gate, |inner, ctx, effects| {
            ctx.pending_bypasses
                .remove(&rejection.gate)
                .ok_or(DecisionError::NoPendingBypass(rejection.gate))?;
            let record = DecisionAuditRecord::seal(
                ctx.id.clone(),
                ctx.repository.clone(),
                ctx.commit.clone(),
                rejection.gate,
                DecisionKind::BypassRejected,
                rejection.actor.clone(),
                rejection.reason.clone(),
                None,
                Utc::now(),
            );
            inner.record_decision(ctx, record, effects);
            inner.fail_run(
                ctx,
                format!(
                    "bypass of {} rejected by {}: {}",
                    rejection.gate, rejection.actor, rejection.reason
                ),
                effects,
            );
            Ok(())
        })
        .await
    }

    /// Record a reviewer's ruling on an escalated gate.
    ///
    /// `override` accepts the gate and returns the run to `running` once no
    /// escalation is pending; `block` fails the run.
    pub async fn record_escalation_decision(
        &self,
        id: &str,
        decision: EscalationDecision,
    ) -> Result<OrchestrationReport> {
        decision.check(&self.inner.config.escalation_reviewers)?;
        self.decide(id, decision.gate, |inner, ctx, effects| {
            ctx.pending_escalations
                .remove(&decision.gate)
                .ok_or(DecisionError::NoPendingEscalation(decision.gate))?;
            let kind = match decision.outcome {
                EscalationOutcome::Override => DecisionKind::EscalationOverridden,
                EscalationOutcome::Block => DecisionKind::EscalationBlocked,
            };
            let record = DecisionAuditRecord::seal(
                ctx.id.clone(),
                ctx.repository.clone(),
                ctx.commit.clone(),
                decision.gate,
                kind,
                decision.reviewer.clone(),
                decision.reason.clone(),
                None,
                Utc::now(),
            );
            inner.record_decision(ctx, record, effects);

            match decision.outcome {
                EscalationOutcome::Override => {
                    effects.push(Effect::Check(StatusProjector::annotate(
                        &ctx.repository,
                        &ctx.commit,
                        decision.gate,
                        CheckState::Success,
                        format!("{} overridden by {}", decision.gate, decision.reviewer),
                    )));
                    if ctx.pending_escalations.is_empty()
                        && ctx.status == OrchestrationStatus::BlockedPendingEscalation
                    {
                        ctx.set_status(OrchestrationStatus::Running);
                    }
                    inner.advance(ctx, effects);
                }
                EscalationOutcome::Block => {
                    inner.fail_run(
                        ctx,
                        format!(
                            "{} blocked by {}: {}",
                            decision.gate, decision.reviewer, decision.reason
                        ),
                        effects,
                    );
                }
            }
            Ok(())
        })
        .await
    }

    /// Shared plumbing for human decisions: locate the run, refuse finished
    /// runs, apply `f` under the lock, then execute its effects.
    async fn decide<F>(&self, id: &str, gate: GateType, f: F) -> Result<OrchestrationReport>
    where
        F: FnOnce(&Inner, &mut OrchestrationContext, &mut Vec<Effect>) -> Result<()>,
    {
        let (outcome, batch) = self
            .inner
            .store
            .mutate(id, |ctx| {
                let mut batch = EffectBatch::stamp(ctx);
                let outcome = Inner::ensure_open(ctx)
                    .map_err(OrchestrationError::from)
                    .and_then(|()| f(&*self.inner, ctx, &mut batch.effects))
                    .map(|()| ctx.report());
                (outcome, batch)
            })
            .await?;
        match outcome {
            Ok(report) => {
                self.run_effects(id, vec![batch], CheckDelivery::Individual)
                    .await;
                Ok(self.report(id).await.unwrap_or(report))
            }
            Err(err) => {
                tracing::warn!(orchestration_id = %id, gate = %gate, error = %err, "decision refused");
                Err(err)
            }
        }
    }

    /// Cancel a run: it fails immediately, pending gates are marked cancelled
    /// and the external workflow is asked to stop without waiting for it.
    pub async fn cancel(&self, id: &str, reason: &str) -> Result<OrchestrationReport> {
        let (outcome, batch) = self
            .inner
            .store
            .mutate(id, |ctx| {
                let mut batch = EffectBatch::stamp(ctx);
                if let Err(err) = Inner::ensure_open(ctx) {
                    return (Err(err), batch);
                }
                let effects = &mut batch.effects;
                let cancelled = ctx.cancel_pending();
                for gate in &cancelled {
                    effects.push(Effect::Check(StatusProjector::annotate(
                        &ctx.repository,
                        &ctx.commit,
                        *gate,
                        CheckState::Error,
                        format!("{gate} validation cancelled"),
                    )));
                }
                let summary = ctx.compliance();
                ctx.verdict = Some(summary.clone());
                ctx.set_status(OrchestrationStatus::Failed);
                ctx.log(
                    LogLevel::Warn,
                    format!("cancelled ({} gates pending): {reason}", cancelled.len()),
                );
                METRICS.inc_runs_cancelled();
                effects.push(Effect::Compliance(summary));
                effects.push(Effect::Publish(OrchestrationEvent::Cancelled {
                    orchestration_id: ctx.id.clone(),
                    reason: reason.to_string(),
                }));
                if let Some(run_id) = ctx.workflow_run_id.clone() {
                    effects.push(Effect::CancelWorkflow {
                        repository: ctx.repository.clone(),
                        run_id,
                    });
                }
                self.inner.finish(ctx, effects);
                (Ok(ctx.report()), batch)
            })
            .await?;
        let report = outcome?;
        self.run_effects(id, vec![batch], CheckDelivery::Individual)
            .await;
        Ok(report)
    }

    pub async fn report(&self, id: &str) -> Option<OrchestrationReport> {
        self.inner.store.snapshot(id).await.map(|ctx| ctx.report())
    }

    pub async fn find_by_commit(
        &self,
        repository: &str,
        commit: &str,
    ) -> Option<OrchestrationReport> {
        let shared = self.inner.store.find_by_commit(repository, commit).await?;
        let ctx = shared.lock().await;
        Some(ctx.report())
    }

    /// A new event subscription. Past events are not replayed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EventEnvelope> {
        self.inner.events.subscribe()
    }

    /// Evict terminal runs older than the configured retention.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let retention = chrono::Duration::seconds(
            i64::try_from(self.inner.config.retention_secs).unwrap_or(i64::MAX / 1000),
        );
        let evicted = self.inner.store.sweep(retention, Utc::now()).await;
        self.forget(&evicted);
        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), "expired orchestrations evicted");
        }
        evicted
    }

    pub async fn active_count(&self) -> usize {
        let mut active = 0;
        for id in self.inner.store.ids().await {
            if let Some(shared) = self.inner.store.get(&id).await {
                if !shared.lock().await.status.is_terminal() {
                    active += 1;
                }
            }
        }
        active
    }

    /// Wait for every background collaborator call (dispatch, protection,
    /// cancellation) spawned so far. Phase timers are not awaited.
    pub async fn flush_background(&self) {
        loop {
            let mut set = std::mem::take(
                &mut *self
                    .inner
                    .background
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()),
            );
            if set.is_empty() {
                break;
            }
            while let Some(joined) = set.join_next().await {
                if let Err(err) = joined {
                    tracing::warn!(error = %err, "background task failed");
                }
            }
        }
    }
}

impl Inner {
    fn record_decision(
        &self,
        ctx: &mut OrchestrationContext,
        record: DecisionAuditRecord,
        effects: &mut Vec<Effect>,
    ) {
        effects.push(Effect::Publish(OrchestrationEvent::DecisionRecorded {
            orchestration_id: ctx.id.clone(),
            gate: record.gate,
            kind: record.kind,
            actor: record.actor.clone(),
        }));
        if record.kind.accepts_gate() {
            ctx.accept(record.gate);
        }
        ctx.log(
            LogLevel::Info,
            format!(
                "decision {:?} on {} by {} recorded ({})",
                record.kind, record.gate, record.actor, record.content_digest
            ),
        );
        ctx.audit.push(record);
    }
}
