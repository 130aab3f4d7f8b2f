//! Tier policy table: what each repository tier requires.
//!
//! | Tier              | Required gates | Approvals | Bypass | Retries | Est. minutes |
//! |-------------------|----------------|-----------|--------|---------|--------------|
//! | mission_critical  | all nine       | 2         | no     | 3       | 45           |
//! | business_critical | six            | 2         | no     | 2       | 30           |
//! | standard          | three          | 1         | yes    | 2       | 20           |
//! | experimental      | two            | 0         | yes    | 2       | 10           |

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::{GateType, RepositoryTier};

/// Pull-request review rules applied through branch protection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewRequirements {
    pub required_approvals: u32,
    pub dismiss_stale_reviews: bool,
    pub require_code_owner_reviews: bool,
}

/// Everything the orchestrator needs to know about one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub tier: RepositoryTier,
    pub required_gates: BTreeSet<GateType>,
    pub reviews: ReviewRequirements,
    pub bypass_allowed: bool,
    pub max_retries: u32,
    pub estimated_minutes: u32,
    /// Overriding a failed gate needs a human reviewer.
    pub requires_override_approval: bool,
    pub enforce_admins: bool,
    /// Teams allowed to push to the protected branch. Empty means unrestricted.
    pub push_teams: Vec<String>,
}

impl TierPolicy {
    /// Authoritative defaults for `tier`.
    pub fn for_tier(tier: RepositoryTier) -> Self {
        use GateType::*;

        let (gates, approvals, bypass_allowed, max_retries, estimated_minutes) = match tier {
            RepositoryTier::MissionCritical => (GateType::CANONICAL.to_vec(), 2, false, 3, 45),
            RepositoryTier::BusinessCritical => (
                vec![
                    CodeQuality,
                    SecurityScan,
                    UnitTests,
                    IntegrationTests,
                    DodValidation,
                    ComplianceAudit,
                ],
                2,
                false,
                2,
                30,
            ),
            RepositoryTier::Standard => (vec![CodeQuality, UnitTests, DodValidation], 1, true, 2, 20),
            RepositoryTier::Experimental => (vec![CodeQuality, UnitTests], 0, true, 2, 10),
        };

        let critical = tier.requires_override_approval();
        Self {
            tier,
            required_gates: gates.into_iter().collect(),
            reviews: ReviewRequirements {
                required_approvals: approvals,
                dismiss_stale_reviews: critical,
                require_code_owner_reviews: tier == RepositoryTier::MissionCritical,
            },
            bypass_allowed,
            max_retries,
            estimated_minutes,
            requires_override_approval: critical,
            enforce_admins: critical,
            push_teams: if tier == RepositoryTier::MissionCritical {
                vec!["platform-team".to_string()]
            } else {
                Vec::new()
            },
        }
    }

    /// Status-check contexts branch protection must require for this tier.
    pub fn required_checks(&self) -> Vec<String> {
        self.required_gates
            .iter()
            .map(|g| g.check_name())
            .chain(std::iter::once(crate::domain::COMPLIANCE_CHECK.to_string()))
            .collect()
    }
}

/// The four tier policies, with optional deployment overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    policies: BTreeMap<RepositoryTier, TierPolicy>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl PolicyTable {
    /// Table holding the authoritative defaults for every tier.
    pub fn standard() -> Self {
        Self {
            policies: RepositoryTier::ALL
                .into_iter()
                .map(|tier| (tier, TierPolicy::for_tier(tier)))
                .collect(),
        }
    }

    /// Policy for `tier`. Total over all tiers.
    pub fn policy_for(&self, tier: RepositoryTier) -> TierPolicy {
        self.policies
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierPolicy::for_tier(tier))
    }

    /// Override the retry budget of one tier (builder pattern).
    pub fn with_max_retries(mut self, tier: RepositoryTier, max_retries: u32) -> Self {
        self.policies
            .entry(tier)
            .or_insert_with(|| TierPolicy::for_tier(tier))
            .max_retries = max_retries;
        self
    }

    /// Override bypass eligibility of one tier (builder pattern).
    pub fn with_bypass(mut self, tier: RepositoryTier, allowed: bool) -> Self {
        self.policies
            .entry(tier)
            .or_insert_with(|| TierPolicy::for_tier(tier))
            .bypass_allowed = allowed;
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &TierPolicy> {
        self.policies.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_gates_non_empty_and_canonical() {
        for tier in RepositoryTier::ALL {
            let policy = TierPolicy::for_tier(tier);
            assert!(!policy.required_gates.is_empty(), "{tier} has no gates");
            assert!(policy
                .required_gates
                .iter()
                .all(|g| GateType::CANONICAL.contains(g)));
        }
    }

    #[test]
    fn test_default_table_values() {
        let mc = TierPolicy::for_tier(RepositoryTier::MissionCritical);
        assert_eq!(mc.required_gates.len(), 9);
        assert_eq!(mc.reviews.required_approvals, 2);
        assert!(!mc.bypass_allowed);
        assert_eq!(mc.max_retries, 3);
        assert_eq!(mc.estimated_minutes, 45);

        let bc = TierPolicy::for_tier(RepositoryTier::BusinessCritical);
        assert_eq!(bc.required_gates.len(), 6);
        assert!(!bc.required_gates.contains(&GateType::PerformanceTests));
        assert_eq!(bc.max_retries, 2);
        assert_eq!(bc.estimated_minutes, 30);

        let standard = TierPolicy::for_tier(RepositoryTier::Standard);
        assert_eq!(
            standard.required_gates,
            [
                GateType::CodeQuality,
                GateType::UnitTests,
                GateType::DodValidation
            ]
            .into_iter()
            .collect::<BTreeSet<_>>()
        );
        assert_eq!(standard.reviews.required_approvals, 1);
        assert!(standard.bypass_allowed);

        let exp = TierPolicy::for_tier(RepositoryTier::Experimental);
        assert_eq!(exp.required_gates.len(), 2);
        assert_eq!(exp.reviews.required_approvals, 0);
        assert_eq!(exp.estimated_minutes, 10);
    }

    #[test]
    fn test_review_extras_follow_tier() {
        let mc = TierPolicy::for_tier(RepositoryTier::MissionCritical);
        assert!(mc.reviews.require_code_owner_reviews);
        assert!(mc.enforce_admins);
        assert_eq!(mc.push_teams, vec!["platform-team".to_string()]);

        let standard = TierPolicy::for_tier(RepositoryTier::Standard);
        assert!(!standard.reviews.dismiss_stale_reviews);
        assert!(!standard.enforce_admins);
        assert!(standard.push_teams.is_empty());
    }

    #[test]
    fn test_required_checks_include_compliance() {
        let checks = TierPolicy::for_tier(RepositoryTier::Experimental).required_checks();
        assert_eq!(
            checks,
            vec![
                "qms/code_quality".to_string(),
                "qms/unit_tests".to_string(),
                "qms/compliance-status".to_string()
            ]
        );
    }

    #[test]
    fn test_table_overrides() {
        let table = PolicyTable::standard()
            .with_max_retries(RepositoryTier::Standard, 5)
            .with_bypass(RepositoryTier::Standard, false);
        let policy = table.policy_for(RepositoryTier::Standard);
        assert_eq!(policy.max_retries, 5);
        assert!(!policy.bypass_allowed);
        assert_eq!(
            table.policy_for(RepositoryTier::Experimental).max_retries,
            2
        );
    }
}
