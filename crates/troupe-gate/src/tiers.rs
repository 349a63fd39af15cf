use serde::{Deserialize, Serialize};
use std::fmt;
use troupe_core::{TierLimits, TierLimitsConfig};

/// Access tier of a caller. Orders from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    /// Unauthenticated caller, keyed by network origin.
    Anonymous,
    /// Authenticated, free plan.
    Free,
    /// Paid plan.
    Pro,
    /// Top paid plan.
    Enterprise,
    /// Operators. Never rate limited.
    Admin,
}

impl AccessTier {
    /// Limits for this tier, or `None` for admin (unlimited).
    pub fn limits(self, config: &TierLimitsConfig) -> Option<TierLimits> {
        match self {
            Self::Anonymous => Some(config.anonymous),
            Self::Free => Some(config.free),
            Self::Pro => Some(config.pro),
            Self::Enterprise => Some(config.enterprise),
            Self::Admin => None,
        }
    }

    /// Case-insensitive parse of a tier name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anonymous" => Some(Self::Anonymous),
            "free" => Some(Self::Free),
            "pro" => Some(Self::Pro),
            "enterprise" => Some(Self::Enterprise),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Anonymous => "anonymous",
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
            Self::Admin => "admin",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_limits_lookup() {
        let config = TierLimitsConfig::default();
        let free = AccessTier::Free.limits(&config).unwrap();
        assert_eq!(free.hourly_limit, 100);
        assert_eq!(free.burst_limit, 10);
        assert!(AccessTier::Admin.limits(&config).is_none());
    }

    #[test]
    fn test_parse_roundtrip() {
        for tier in [
            AccessTier::Anonymous,
            AccessTier::Free,
            AccessTier::Pro,
            AccessTier::Enterprise,
            AccessTier::Admin,
        ] {
            assert_eq!(AccessTier::parse(&tier.to_string()), Some(tier));
        }
        assert_eq!(AccessTier::parse("PRO"), Some(AccessTier::Pro));
        assert_eq!(AccessTier::parse("gold"), None);
    }
}
