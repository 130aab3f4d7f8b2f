//! Run state transitions. Everything here runs under the run's lock and only
//! records effects; nothing in this file awaits.

use chrono::Utc;

use super::effects::Effect;
use super::{Inner, UpdateDisposition};
use crate::collaborators::{GateConfig, ProtectionRequest, WorkflowDispatch};
use crate::context::{
    GateTransition, LogLevel, OrchestrationContext, OrchestrationStatus, PendingBypass,
    PendingEscalation,
};
use crate::domain::{CheckState, FailureCause, FailureRecord, GateOutcome, GateType, StateError};
use crate::events::OrchestrationEvent;
use crate::metrics::METRICS;
use crate::obs;
use crate::plan::PhaseKind;
use crate::resolver::{FailureResolution, ResolutionAction, Urgency};
use crate::status::{ComplianceVerdict, StatusProjector};

impl Inner {
    /// Apply one outcome to `ctx`. `cause` overrides the failure cause derived
    /// from the outcome (used for synthesized timeouts).
    pub(super) fn apply_outcome(
        &self,
        ctx: &mut OrchestrationContext,
        outcome: &GateOutcome,
        cause: Option<FailureCause>,
        effects: &mut Vec<Effect>,
    ) -> UpdateDisposition {
        let _span = obs::OrchestrationSpan::enter(&ctx.id, &ctx.repository, &ctx.commit);
        let transition = match ctx.record_outcome(outcome) {
            Ok(transition) => transition,
            Err(reason) => {
                METRICS.inc_updates_discarded();
                obs::emit_update_discarded(&ctx.id, outcome.gate, &reason);
                return UpdateDisposition::Discarded { reason };
            }
        };

        METRICS.inc_gate_updates();
        obs::emit_gate_updated(&ctx.id, outcome.gate, outcome.status, ctx.progress);
        effects.push(Effect::Check(StatusProjector::project(
            &ctx.repository,
            &ctx.commit,
            outcome,
        )));
        effects.push(Effect::Publish(OrchestrationEvent::GateUpdated {
            orchestration_id: ctx.id.clone(),
            gate: outcome.gate,
            status: outcome.status,
            progress: ctx.progress,
        }));

        match transition {
            GateTransition::Progressed => {}
            GateTransition::Completed => {
                ctx.log(LogLevel::Info, format!("{} passed", outcome.gate));
                self.advance(ctx, effects);
            }
            GateTransition::Failed => {
                let cause = cause.unwrap_or_else(|| FailureCause::from_outcome(outcome));
                let record = FailureRecord::new(
                    outcome.gate,
                    ctx.repository.clone(),
                    ctx.commit.clone(),
                    ctx.tier(),
                    cause,
                );
                let resolution =
                    self.resolver
                        .resolve(&record, &ctx.policy, ctx.retries(outcome.gate));
                self.apply_resolution(ctx, &record, resolution, effects);
                self.advance(ctx, effects);
            }
        }

        UpdateDisposition::Applied {
            orchestration_id: ctx.id.clone(),
            gate: outcome.gate,
            status: outcome.status,
            progress: ctx.progress,
            run_status: ctx.status,
        }
    }

    fn apply_resolution(
        &self,
        ctx: &mut OrchestrationContext,
        record: &FailureRecord,
        resolution: FailureResolution,
        effects: &mut Vec<Effect>,
    ) {
        let gate = record.gate;
        obs::emit_failure_resolved(&ctx.id, gate, resolution.action, &resolution.reason);
        ctx.log(LogLevel::Warn, resolution.reason.clone());

        match resolution.action {
            ResolutionAction::Retry => {
                let attempt = match ctx.schedule_retry(gate) {
                    Ok(attempt) => attempt,
                    Err(err) => {
                        ctx.log(LogLevel::Error, format!("cannot retry {gate}: {err}"));
                        return;
                    }
                };
                METRICS.inc_retries();
                effects.push(Effect::Publish(OrchestrationEvent::GateRetried {
                    orchestration_id: ctx.id.clone(),
                    gate,
                    attempt,
                }));
                effects.push(Effect::Check(StatusProjector::annotate(
                    &ctx.repository,
                    &ctx.commit,
                    gate,
                    CheckState::Pending,
                    format!(
                        "{gate} retry {attempt} of {} queued",
                        ctx.policy.max_retries
                    ),
                )));
                if let Some(phase) = ctx.plan.phase_of(gate).map(|p| p.kind) {
                    let config = GateConfig {
                        gate,
                        phase,
                        timeout_secs: phase.timeout_secs(),
                        attempt,
                    };
                    effects.push(Effect::Dispatch(self.dispatch_for(ctx, vec![config])));
                    effects.push(Effect::ArmTimeout {
                        phase,
                        gates: vec![(gate, attempt)],
                    });
                }
            }
            ResolutionAction::Bypass => {
                self.settle_failed(ctx, gate);
                METRICS.inc_bypasses();
                ctx.pending_bypasses.insert(
                    gate,
                    PendingBypass {
                        gate,
                        resolution: resolution.clone(),
                        requested_at: Utc::now(),
                    },
                );
                effects.push(Effect::Publish(OrchestrationEvent::BypassRequested {
                    orchestration_id: ctx.id.clone(),
                    gate,
                    reason: resolution.reason,
                }));
                effects.push(Effect::Check(StatusProjector::annotate(
                    &ctx.repository,
                    &ctx.commit,
                    gate,
                    CheckState::Failure,
                    format!("{gate} failed; bypass awaiting approval"),
                )));
            }
            ResolutionAction::Escalate => {
                self.settle_failed(ctx, gate);
                METRICS.inc_escalations();
                let urgency = resolution.urgency.unwrap_or(Urgency::Normal);
                ctx.pending_escalations.insert(
                    gate,
                    PendingEscalation {
                        gate,
                        severity: record.severity,
                        urgency,
                        reason: resolution.reason,
                        raised_at: Utc::now(),
                    },
                );
                ctx.set_status(OrchestrationStatus::BlockedPendingEscalation);
                effects.push(Effect::Publish(OrchestrationEvent::Escalated {
                    orchestration_id: ctx.id.clone(),
                    gate,
                    severity: record.severity,
                    urgency,
                }));
                effects.push(Effect::Check(StatusProjector::annotate(
                    &ctx.repository,
                    &ctx.commit,
                    gate,
                    CheckState::Failure,
                    format!("{gate} failed; escalated for review ({})", record.severity),
                )));
            }
            ResolutionAction::Block => {
                self.settle_failed(ctx, gate);
                effects.push(Effect::Publish(OrchestrationEvent::FailureResolved {
                    orchestration_id: ctx.id.clone(),
                    gate,
                    action: ResolutionAction::Block,
                }));
                self.fail_run(ctx, format!("{gate} blocked: {}", record.cause), effects);
            }
        }
    }

    fn settle_failed(&self, ctx: &mut OrchestrationContext, gate: GateType) {
        if let Err(err) = ctx.mark_failed(gate) {
            ctx.log(LogLevel::Error, format!("cannot settle {gate}: {err}"));
        }
    }

    /// Start newly unblocked phases and complete the run once every gate is resolved.
    pub(super) fn advance(&self, ctx: &mut OrchestrationContext, effects: &mut Vec<Effect>) {
        if ctx.status.is_terminal() {
            return;
        }

        let ready = ctx
            .plan
            .ready_phases(&ctx.started_phases, |gate| ctx.is_settled(gate));
        for phase in ready {
            self.start_phase(ctx, phase, effects);
            let configs = self.gate_configs(ctx, phase);
            if !configs.is_empty() {
                effects.push(Effect::Dispatch(self.dispatch_for(ctx, configs)));
            }
        }

        if ctx.all_resolved() && ctx.pending_escalations.is_empty() {
            self.complete_run(ctx, effects);
        } else {
            effects.push(Effect::Compliance(ctx.compliance()));
        }
    }

    /// Mark `phase` started and arm its timeout. Dispatch is up to the caller.
    pub(super) fn start_phase(
        &self,
        ctx: &mut OrchestrationContext,
        phase: PhaseKind,
        effects: &mut Vec<Effect>,
    ) {
        if !ctx.started_phases.insert(phase) {
            return;
        }
        ctx.current_phase = Some(phase);
        ctx.log(LogLevel::Info, format!("phase '{phase}' started"));
        effects.push(Effect::Publish(OrchestrationEvent::PhaseStarted {
            orchestration_id: ctx.id.clone(),
            phase,
        }));
        let gates = ctx
            .plan
            .phase(phase)
            .map(|p| {
                p.gates
                    .iter()
                    .filter(|g| !ctx.is_settled(**g))
                    .map(|g| (*g, ctx.retries(*g)))
                    .collect()
            })
            .unwrap_or_default();
        effects.push(Effect::ArmTimeout { phase, gates });
    }

    /// Dispatch configs for the unsettled gates of `phase`.
    pub(super) fn gate_configs(&self, ctx: &OrchestrationContext, phase: PhaseKind) -> Vec<GateConfig> {
        ctx.plan
            .phase(phase)
            .map(|p| {
                p.gates
                    .iter()
                    .filter(|g| !ctx.is_settled(**g))
                    .map(|g| GateConfig {
                        gate: *g,
                        phase,
                        timeout_secs: p.timeout_secs,
                        attempt: ctx.retries(*g),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(super) fn dispatch_for(
        &self,
        ctx: &OrchestrationContext,
        gates: Vec<GateConfig>,
    ) -> WorkflowDispatch {
        WorkflowDispatch {
            orchestration_id: ctx.id.clone(),
            repository: ctx.repository.clone(),
            commit: ctx.commit.clone(),
            git_ref: ctx.branch.clone(),
            workflow_file: self.config.workflow_file.clone(),
            tier: ctx.tier(),
            environment: ctx
                .request
                .environment
                .clone()
                .unwrap_or_else(|| self.config.default_environment.clone()),
            priority: ctx.request.priority.dispatch_priority(),
            pull_request: ctx.request.pull_request,
            gates,
        }
    }

    fn complete_run(&self, ctx: &mut OrchestrationContext, effects: &mut Vec<Effect>) {
        let summary = ctx.compliance();
        ctx.verdict = Some(summary.clone());
        ctx.set_status(OrchestrationStatus::Completed);
        ctx.log(LogLevel::Info, format!("completed: {}", summary.description));
        METRICS.inc_runs_completed();

        effects.push(Effect::Compliance(summary.clone()));
        effects.push(Effect::Publish(OrchestrationEvent::Completed {
            orchestration_id: ctx.id.clone(),
            verdict: summary.verdict,
        }));
        if summary.verdict == ComplianceVerdict::Success
            || self.config.protect_on_failure
        {
            effects.push(Effect::Protect(ProtectionRequest::from_policy(
                ctx.repository.clone(),
                ctx.branch.clone(),
                &ctx.policy,
            )));
        }
        self.finish(ctx, effects);
    }

    pub(super) fn fail_run(
        &self,
        ctx: &mut OrchestrationContext,
        reason: String,
        effects: &mut Vec<Effect>,
    ) {
        if ctx.status.is_terminal() {
            return;
        }
        let summary = ctx.compliance();
        ctx.verdict = Some(summary.clone());
        ctx.set_status(OrchestrationStatus::Failed);
        ctx.log(LogLevel::Error, format!("failed: {reason}"));
        METRICS.inc_runs_failed();

        effects.push(Effect::Compliance(summary));
        effects.push(Effect::Publish(OrchestrationEvent::Failed {
            orchestration_id: ctx.id.clone(),
            reason,
        }));
        if self.config.protect_on_failure {
            effects.push(Effect::Protect(ProtectionRequest::from_policy(
                ctx.repository.clone(),
                ctx.branch.clone(),
                &ctx.policy,
            )));
        }
        self.finish(ctx, effects);
    }

    pub(super) fn finish(&self, ctx: &OrchestrationContext, effects: &mut Vec<Effect>) {
        let duration_ms = (Utc::now() - ctx.started_at).num_milliseconds().max(0) as u64;
        obs::emit_run_finished(&ctx.id, &ctx.status.to_string(), duration_ms, ctx.progress);
        effects.push(Effect::StopTimers);
    }

    /// Route every still-unsettled gate of `gates` through the timeout path,
    /// skipping gates that settled or were retried since the timer was armed.
    pub(super) fn expire(
        &self,
        ctx: &mut OrchestrationContext,
        phase: PhaseKind,
        gates: &[(GateType, u32)],
        effects: &mut Vec<Effect>,
    ) -> usize {
        let mut expired = 0;
        for (gate, armed_at) in gates {
            if !ctx.status.accepts_updates()
                || ctx.is_settled(*gate)
                || ctx.retries(*gate) != *armed_at
            {
                continue;
            }
            let cause = FailureCause::Timeout {
                phase: phase.name().to_string(),
                timeout_secs: phase.timeout_secs(),
            };
            let outcome = GateOutcome::failure(*gate, cause.to_string());
            ctx.log(LogLevel::Warn, format!("{gate}: {cause}"));
            if self
                .apply_outcome(ctx, &outcome, Some(cause), effects)
                .is_applied()
            {
                expired += 1;
            }
        }
        expired
    }

    /// Reject an operation on a run that already finished.
    pub(super) fn ensure_open(ctx: &OrchestrationContext) -> Result<(), StateError> {
        if ctx.status.is_terminal() {
            Err(StateError::Terminal {
                id: ctx.id.clone(),
                status: ctx.status.to_string(),
            })
        } else {
            Ok(())
        }
    }
}
