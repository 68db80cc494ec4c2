//! Account records and capacity tiers

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Administrative status of an account.
///
/// Distinct from circuit state: a `Disabled` account is out of rotation by
/// operator decision and stays out until explicitly re-enabled, regardless of
/// what its circuit would say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
}

impl AccountStatus {
    /// Status label for listings and logging.
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Disabled => "disabled",
        }
    }
}

/// Capacity class assigned at registration time.
///
/// Tier limits are immutable once assigned — changing an account's tier means
/// registering a new account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Tier1,
    Tier2,
    Tier3,
    Tier4,
}

/// Fixed per-minute and concurrency limits for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierLimits {
    pub requests_per_minute: u64,
    pub tokens_per_minute: u64,
    pub max_concurrent: u64,
}

impl Tier {
    /// The provider-imposed limits for this tier.
    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Tier1 => TierLimits {
                requests_per_minute: 50,
                tokens_per_minute: 40_000,
                max_concurrent: 5,
            },
            Tier::Tier2 => TierLimits {
                requests_per_minute: 1_000,
                tokens_per_minute: 80_000,
                max_concurrent: 25,
            },
            Tier::Tier3 => TierLimits {
                requests_per_minute: 2_000,
                tokens_per_minute: 160_000,
                max_concurrent: 50,
            },
            Tier::Tier4 => TierLimits {
                requests_per_minute: 4_000,
                tokens_per_minute: 400_000,
                max_concurrent: 100,
            },
        }
    }

    /// Tier label as stored and displayed.
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
            Tier::Tier3 => "tier3",
            Tier::Tier4 => "tier4",
        }
    }

    /// Parse a tier label from registration input.
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "tier1" => Ok(Tier::Tier1),
            "tier2" => Ok(Tier::Tier2),
            "tier3" => Ok(Tier::Tier3),
            "tier4" => Ok(Tier::Tier4),
            other => Err(Error::UnknownTier(other.to_string())),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tier::parse(s)
    }
}

/// A credential set bound to one tenant organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Opaque account id (UUID v4)
    pub id: String,
    /// Owning organization — selection never crosses this boundary
    pub organization_id: String,
    /// Human label for listings
    pub name: String,
    /// Opaque upstream credential. The registry file carrying it is written
    /// with 0600 permissions; listings must never include this field.
    pub credential: String,
    pub tier: Tier,
    pub status: AccountStatus,
}

impl Account {
    /// Whether the account is administratively in rotation.
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}
