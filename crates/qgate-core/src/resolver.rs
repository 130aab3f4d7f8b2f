//! Failure resolution: retry, bypass, escalate or block.
//!
//! Decision order for a failed gate:
//!
//! 1. retries used below the tier budget: retry that gate alone
//! 2. tier allows bypass: bypass, pending approval by an authorized actor
//! 3. tier requires override approval: escalate to a human reviewer
//! 4. otherwise: block
//!
//! Once the budget is spent a gate never re-enters the retry branch, however
//! many more failures arrive. Severity only affects escalation urgency.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{FailureRecord, Severity};
use crate::policy::TierPolicy;

/// Audit fields every bypass approval must carry.
pub const BYPASS_AUDIT_FIELDS: [&str; 3] = ["approver", "justification", "ticket"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    Retry,
    Bypass,
    Escalate,
    Block,
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::Bypass => "bypass",
            Self::Escalate => "escalate",
            Self::Block => "block",
        };
        f.write_str(s)
    }
}

/// How quickly an escalated failure needs a reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Normal,
    High,
    Immediate,
}

impl From<Severity> for Urgency {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Low | Severity::Medium => Self::Normal,
            Severity::High => Self::High,
            Severity::Critical => Self::Immediate,
        }
    }
}

/// Preconditions a bypass approval has to satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BypassConditions {
    /// Actors allowed to approve. Empty means any identified actor.
    pub approvers: Vec<String>,
    pub mandatory_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureResolution {
    pub action: ResolutionAction,
    pub reason: String,
    pub requires_approval: bool,
    pub retries_remaining: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_conditions: Option<BypassConditions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
}

/// Maps a gate failure and the tier policy to a [`FailureResolution`].
#[derive(Debug, Clone, Default)]
pub struct FailureResolver {
    bypass_approvers: Vec<String>,
}

impl FailureResolver {
    pub fn new(bypass_approvers: Vec<String>) -> Self {
        Self { bypass_approvers }
    }

    /// Decide what to do about `failure`, given how many retries this gate
    /// has already used in the current run.
    pub fn resolve(
        &self,
        failure: &FailureRecord,
        policy: &TierPolicy,
        retries_used: u32,
    ) -> FailureResolution {
        let gate = failure.gate;

        if retries_used < policy.max_retries {
            let remaining = policy.max_retries - retries_used;
            return FailureResolution {
                action: ResolutionAction::Retry,
                reason: format!(
                    "{gate} failed ({}); retry {} of {}",
                    failure.cause,
                    retries_used + 1,
                    policy.max_retries
                ),
                requires_approval: false,
                retries_remaining: remaining - 1,
                bypass_conditions: None,
                urgency: None,
            };
        }

        if policy.bypass_allowed {
            return FailureResolution {
                action: ResolutionAction::Bypass,
                reason: format!(
                    "{gate} exhausted {} retries; {} tier allows bypass with approval",
                    policy.max_retries, policy.tier
                ),
                requires_approval: true,
                retries_remaining: 0,
                bypass_conditions: Some(BypassConditions {
                    approvers: self.bypass_approvers.clone(),
                    mandatory_fields: BYPASS_AUDIT_FIELDS.iter().map(|f| f.to_string()).collect(),
                }),
                urgency: None,
            };
        }

        if policy.requires_override_approval {
            return FailureResolution {
                action: ResolutionAction::Escalate,
                reason: format!(
                    "{gate} exhausted {} retries on {} repository; {} failure needs reviewer decision",
                    policy.max_retries, policy.tier, failure.severity
                ),
                requires_approval: true,
                retries_remaining: 0,
                bypass_conditions: None,
                urgency: Some(Urgency::from(failure.severity)),
            };
        }

        FailureResolution {
            action: ResolutionAction::Block,
            reason: format!(
                "{gate} exhausted {} retries and {} tier has no override path",
                policy.max_retries, policy.tier
            ),
            requires_approval: false,
            retries_remaining: 0,
            bypass_conditions: None,
            urgency: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{FailureCause, GateType, RepositoryTier};
    use crate::policy::PolicyTable;

    fn failure(gate: GateType, tier: RepositoryTier) -> FailureRecord {
        FailureRecord::new(
            gate,
            "org/api",
            "abc",
            tier,
            FailureCause::Failed {
                detail: "boom".into(),
            },
        )
    }

    fn actions(tier: RepositoryTier, failures: u32) -> Vec<ResolutionAction> {
        let policy = TierPolicy::for_tier(tier);
        let resolver = FailureResolver::default();
        let record = failure(GateType::UnitTests, tier);
        let mut retries = 0;
        (0..failures)
            .map(|_| {
                let resolution = resolver.resolve(&record, &policy, retries);
                if resolution.action == ResolutionAction::Retry {
                    retries += 1;
                }
                resolution.action
            })
            .collect()
    }

    #[test]
    fn test_retries_until_budget_then_bypass_for_standard() {
        let seen = actions(RepositoryTier::Standard, 3);
        assert_eq!(
            seen,
            vec![
                ResolutionAction::Retry,
                ResolutionAction::Retry,
                ResolutionAction::Bypass
            ]
        );
    }

    #[test]
    fn test_business_critical_never_bypasses() {
        let seen = actions(RepositoryTier::BusinessCritical, 6);
        assert!(!seen.contains(&ResolutionAction::Bypass));
        assert_eq!(seen.last(), Some(&ResolutionAction::Escalate));
    }

    #[test]
    fn test_exhaustion_is_idempotent() {
        let policy = TierPolicy::for_tier(RepositoryTier::MissionCritical);
        let resolver = FailureResolver::default();
        let record = failure(GateType::SecurityScan, RepositoryTier::MissionCritical);
        for _ in 0..5 {
            let resolution = resolver.resolve(&record, &policy, policy.max_retries);
            assert_eq!(resolution.action, ResolutionAction::Escalate);
            assert_eq!(resolution.urgency, Some(Urgency::Immediate));
        }
    }

    #[test]
    fn test_block_when_no_override_path() {
        let table = PolicyTable::standard().with_bypass(RepositoryTier::Experimental, false);
        let policy = table.policy_for(RepositoryTier::Experimental);
        let resolution = FailureResolver::default().resolve(
            &failure(GateType::CodeQuality, RepositoryTier::Experimental),
            &policy,
            policy.max_retries,
        );
        assert_eq!(resolution.action, ResolutionAction::Block);
        assert!(!resolution.requires_approval);
    }

    #[test]
    fn test_bypass_carries_preconditions() {
        let policy = TierPolicy::for_tier(RepositoryTier::Standard);
        let resolver = FailureResolver::new(vec!["release-manager".into()]);
        let resolution = resolver.resolve(
            &failure(GateType::DodValidation, RepositoryTier::Standard),
            &policy,
            2,
        );
        let conditions = resolution.bypass_conditions.unwrap();
        assert_eq!(conditions.approvers, vec!["release-manager".to_string()]);
        assert!(conditions.mandatory_fields.contains(&"justification".to_string()));
    }

    #[test]
    fn test_retry_reports_remaining_budget() {
        let policy = TierPolicy::for_tier(RepositoryTier::MissionCritical);
        let resolution = FailureResolver::default().resolve(
            &failure(GateType::UnitTests, RepositoryTier::MissionCritical),
            &policy,
            0,
        );
        assert_eq!(resolution.action, ResolutionAction::Retry);
        assert_eq!(resolution.retries_remaining, 2);
    }
}
