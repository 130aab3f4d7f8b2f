//! Repository risk tiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::ValidationError;

/// Risk/criticality classification of a repository.
///
/// The tier decides which gates are mandatory, how many reviews are needed
/// and how gate failures are resolved. Ordered from most to least critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryTier {
    /// Production systems whose failure is an incident.
    MissionCritical,
    /// Revenue or customer-facing systems.
    BusinessCritical,
    /// Regular services and libraries.
    Standard,
    /// Prototypes and sandboxes.
    Experimental,
}

impl RepositoryTier {
    /// All tiers, most critical first.
    pub const ALL: [RepositoryTier; 4] = [
        RepositoryTier::MissionCritical,
        RepositoryTier::BusinessCritical,
        RepositoryTier::Standard,
        RepositoryTier::Experimental,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissionCritical => "mission_critical",
            Self::BusinessCritical => "business_critical",
            Self::Standard => "standard",
            Self::Experimental => "experimental",
        }
    }

    /// Whether overriding a failed gate on this tier needs a human decision.
    pub fn requires_override_approval(self) -> bool {
        matches!(self, Self::MissionCritical | Self::BusinessCritical)
    }
}

impl fmt::Display for RepositoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryTier {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownTier(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(RepositoryTier::MissionCritical < RepositoryTier::BusinessCritical);
        assert!(RepositoryTier::Standard < RepositoryTier::Experimental);
    }

    #[test]
    fn test_tier_parse_accepts_dashes_and_case() {
        assert_eq!(
            "Mission-Critical".parse::<RepositoryTier>().unwrap(),
            RepositoryTier::MissionCritical
        );
        assert_eq!(
            "experimental".parse::<RepositoryTier>().unwrap(),
            RepositoryTier::Experimental
        );
    }

    #[test]
    fn test_tier_parse_rejects_unknown() {
        let err = "critical-ish".parse::<RepositoryTier>().unwrap_err();
        assert!(matches!(err, ValidationError::UnknownTier(_)));
    }

    #[test]
    fn test_override_approval_tiers() {
        assert!(RepositoryTier::MissionCritical.requires_override_approval());
        assert!(RepositoryTier::BusinessCritical.requires_override_approval());
        assert!(!RepositoryTier::Standard.requires_override_approval());
        assert!(!RepositoryTier::Experimental.requires_override_approval());
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&RepositoryTier::BusinessCritical).unwrap();
        assert_eq!(json, "\"business_critical\"");
        let back: RepositoryTier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RepositoryTier::BusinessCritical);
    }
}
