//! Validation plans: tier-aware, phase-ordered gate schedules.
//!
//! Gates are partitioned into four canonical phases:
//!
//! | Phase                   | Gates                                    | Depends on              | Timeout |
//! |-------------------------|------------------------------------------|-------------------------|---------|
//! | Pre-commit Validation   | code_quality, security_scan, unit_tests  | -                       | 300s    |
//! | Integration Testing     | integration_tests, performance_tests     | Pre-commit Validation   | 600s    |
//! | Compliance Verification | dod_validation, compliance_audit         | Integration Testing     | 180s    |
//! | Deployment Readiness    | security_review, documentation_check     | Compliance Verification | 240s    |
//!
//! Phases with no required gate are dropped; a kept phase whose canonical
//! dependency was dropped depends on the nearest kept ancestor instead.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{GateType, RepositoryTier, ValidatedRequest, ValidationError};
use crate::policy::{PolicyTable, TierPolicy};

/// One of the four canonical validation phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    PreCommit,
    Integration,
    Compliance,
    DeploymentReadiness,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 4] = [
        PhaseKind::PreCommit,
        PhaseKind::Integration,
        PhaseKind::Compliance,
        PhaseKind::DeploymentReadiness,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::PreCommit => "Pre-commit Validation",
            Self::Integration => "Integration Testing",
            Self::Compliance => "Compliance Verification",
            Self::DeploymentReadiness => "Deployment Readiness",
        }
    }

    pub fn gates(self) -> &'static [GateType] {
        match self {
            Self::PreCommit => &[
                GateType::CodeQuality,
                GateType::SecurityScan,
                GateType::UnitTests,
            ],
            Self::Integration => &[GateType::IntegrationTests, GateType::PerformanceTests],
            Self::Compliance => &[GateType::DodValidation, GateType::ComplianceAudit],
            Self::DeploymentReadiness => {
                &[GateType::SecurityReview, GateType::DocumentationCheck]
            }
        }
    }

    /// The phase this one waits for in the full four-phase pipeline.
    pub fn upstream(self) -> Option<PhaseKind> {
        match self {
            Self::PreCommit => None,
            Self::Integration => Some(Self::PreCommit),
            Self::Compliance => Some(Self::Integration),
            Self::DeploymentReadiness => Some(Self::Compliance),
        }
    }

    pub fn timeout_secs(self) -> u64 {
        match self {
            Self::PreCommit => 300,
            Self::Integration => 600,
            Self::Compliance => 180,
            Self::DeploymentReadiness => 240,
        }
    }

    /// Canonical phase that runs `gate`, after folding legacy aliases.
    pub fn of_gate(gate: GateType) -> Option<PhaseKind> {
        let gate = gate.canonical()?;
        Self::ALL.into_iter().find(|p| p.gates().contains(&gate))
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A group of gates sharing dependencies and a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPhase {
    pub kind: PhaseKind,
    pub name: String,
    pub gates: Vec<GateType>,
    pub depends_on: Vec<PhaseKind>,
    pub timeout_secs: u64,
}

/// What went wrong that a fallback strategy reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackTrigger {
    Failure,
    Error,
    Timeout,
}

/// What a fallback strategy does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    Retry,
    Bypass,
    Escalate,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStrategy {
    pub trigger: FallbackTrigger,
    pub action: FallbackAction,
    pub max_retries: Option<u32>,
    pub reason: String,
}

/// Plan invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("dependency cycle detected involving phases: {phases:?}")]
    DependencyCycle { phases: Vec<PhaseKind> },

    #[error("phase '{phase}' depends on '{dependency}', which is not in the plan")]
    UnknownDependency {
        phase: PhaseKind,
        dependency: PhaseKind,
    },

    #[error("gate {0} appears in more than one phase")]
    OverlappingGate(GateType),

    #[error("required gate {0} is not scheduled in any phase")]
    UnscheduledGate(GateType),
}

/// The schedule for one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationPlan {
    pub tier: RepositoryTier,
    pub phases: Vec<ValidationPhase>,
    pub required_gates: BTreeSet<GateType>,
    pub fallback_strategies: Vec<FallbackStrategy>,
    pub estimated_minutes: u32,
}

impl ValidationPlan {
    pub fn phase(&self, kind: PhaseKind) -> Option<&ValidationPhase> {
        self.phases.iter().find(|p| p.kind == kind)
    }

    /// The phase scheduling `gate`, if any.
    pub fn phase_of(&self, gate: GateType) -> Option<&ValidationPhase> {
        self.phases.iter().find(|p| p.gates.contains(&gate))
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Phases in dependency order (dependencies first).
    pub fn execution_order(&self) -> Result<Vec<PhaseKind>, PlanError> {
        let kinds: BTreeSet<PhaseKind> = self.phases.iter().map(|p| p.kind).collect();
        let mut in_degree: HashMap<PhaseKind, usize> = kinds.iter().map(|&k| (k, 0)).collect();
        let mut out_edges: HashMap<PhaseKind, Vec<PhaseKind>> =
            kinds.iter().map(|&k| (k, Vec::new())).collect();

        for phase in &self.phases {
            for dep in &phase.depends_on {
                let Some(edges) = out_edges.get_mut(dep) else {
                    return Err(PlanError::UnknownDependency {
                        phase: phase.kind,
                        dependency: *dep,
                    });
                };
                edges.push(phase.kind);
                *in_degree.entry(phase.kind).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<PhaseKind> = self
            .phases
            .iter()
            .map(|p| p.kind)
            .filter(|k| in_degree.get(k) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.phases.len());

        while let Some(kind) = queue.pop_front() {
            order.push(kind);
            for next in out_edges.get(&kind).map(Vec::as_slice).unwrap_or_default() {
                if let Some(deg) = in_degree.get_mut(next) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }

        if order.len() != self.phases.len() {
            let phases = kinds.into_iter().filter(|k| !order.contains(k)).collect();
            return Err(PlanError::DependencyCycle { phases });
        }
        Ok(order)
    }

    /// Check the plan invariants: acyclic, gate-disjoint, every required gate scheduled once.
    pub fn validate(&self) -> Result<(), PlanError> {
        self.execution_order()?;

        let mut seen = BTreeSet::new();
        for gate in self.phases.iter().flat_map(|p| p.gates.iter()) {
            if !seen.insert(*gate) {
                return Err(PlanError::OverlappingGate(*gate));
            }
        }
        if let Some(missing) = self.required_gates.iter().find(|g| !seen.contains(g)) {
            return Err(PlanError::UnscheduledGate(*missing));
        }
        Ok(())
    }

    /// Phases not yet in `started` whose dependencies have all reached a
    /// terminal state, according to `is_settled` for each of their gates.
    pub fn ready_phases<F>(&self, started: &BTreeSet<PhaseKind>, is_settled: F) -> Vec<PhaseKind>
    where
        F: Fn(GateType) -> bool,
    {
        self.phases
            .iter()
            .filter(|p| !started.contains(&p.kind))
            .filter(|p| {
                p.depends_on.iter().all(|dep| {
                    started.contains(dep)
                        && self
                            .phase(*dep)
                            .is_some_and(|d| d.gates.iter().all(|g| is_settled(*g)))
                })
            })
            .map(|p| p.kind)
            .collect()
    }
}

/// Builds [`ValidationPlan`]s from requests and the tier policy table.
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    policies: PolicyTable,
}

impl PlanBuilder {
    pub fn new(policies: PolicyTable) -> Self {
        Self { policies }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Resolve the required gate set of a request and build its plan.
    ///
    /// An explicit gate subset narrows the tier's set and may not name gates
    /// outside it; skipped gates are then removed. Tiers that require
    /// override approval never run with fewer than all of their gates. An
    /// empty result is rejected.
    pub fn build(&self, request: &ValidatedRequest) -> Result<ValidationPlan, ValidationError> {
        let policy = self.policies.policy_for(request.tier);
        let mut gates: BTreeSet<GateType> = match &request.explicit_gates {
            Some(explicit) => {
                if let Some(gate) = explicit
                    .iter()
                    .find(|g| !policy.required_gates.contains(g))
                {
                    return Err(ValidationError::GateNotInTier {
                        gate: *gate,
                        tier: policy.tier,
                    });
                }
                explicit.clone()
            }
            None => policy.required_gates.clone(),
        };
        gates.retain(|g| !request.skip_gates.contains(g));

        if policy.requires_override_approval {
            if let Some(gate) = policy.required_gates.iter().find(|g| !gates.contains(g)) {
                return Err(ValidationError::MandatoryGate {
                    gate: *gate,
                    tier: policy.tier,
                });
            }
        }
        if gates.is_empty() {
            return Err(ValidationError::EmptyGateSet);
        }
        if let Some(gate) = gates.iter().find(|g| PhaseKind::of_gate(**g).is_none()) {
            return Err(ValidationError::UnplannableGate(*gate));
        }
        Ok(Self::plan_for_gates(&policy, gates))
    }

    /// Build the plan for an already resolved gate set.
    ///
    /// An empty gate set yields a plan with zero phases.
    pub fn plan_for_gates(policy: &TierPolicy, gates: BTreeSet<GateType>) -> ValidationPlan {
        let kept: Vec<PhaseKind> = PhaseKind::ALL
            .into_iter()
            .filter(|kind| kind.gates().iter().any(|g| gates.contains(g)))
            .collect();

        let phases = kept
            .iter()
            .map(|&kind| {
                let mut upstream = kind.upstream();
                while let Some(candidate) = upstream {
                    if kept.contains(&candidate) {
                        break;
                    }
                    upstream = candidate.upstream();
                }
                ValidationPhase {
                    kind,
                    name: kind.name().to_string(),
                    gates: kind
                        .gates()
                        .iter()
                        .copied()
                        .filter(|g| gates.contains(g))
                        .collect(),
                    depends_on: upstream.into_iter().collect(),
                    timeout_secs: kind.timeout_secs(),
                }
            })
            .collect();

        let plan = ValidationPlan {
            tier: policy.tier,
            phases,
            required_gates: gates,
            fallback_strategies: fallback_strategies(policy),
            estimated_minutes: policy.estimated_minutes,
        };
        debug_assert!(plan.validate().is_ok());
        plan
    }
}

/// Fallback strategies applicable to a tier, in the order they apply.
pub fn fallback_strategies(policy: &TierPolicy) -> Vec<FallbackStrategy> {
    let retry = |trigger| FallbackStrategy {
        trigger,
        action: FallbackAction::Retry,
        max_retries: Some(policy.max_retries),
        reason: format!("retry up to {} time(s)", policy.max_retries),
    };
    let mut strategies = vec![
        retry(FallbackTrigger::Failure),
        retry(FallbackTrigger::Error),
        retry(FallbackTrigger::Timeout),
    ];

    let (action, reason) = if policy.bypass_allowed {
        (
            FallbackAction::Bypass,
            format!("{} tier allows an approved bypass", policy.tier),
        )
    } else if policy.requires_override_approval {
        (
            FallbackAction::Escalate,
            format!("{} tier requires a reviewer decision", policy.tier),
        )
    } else {
        (
            FallbackAction::Block,
            format!("{} tier has no override path", policy.tier),
        )
    };
    strategies.push(FallbackStrategy {
        trigger: FallbackTrigger::Failure,
        action,
        max_retries: None,
        reason,
    });
    strategies
}
