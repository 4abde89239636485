//! Common types used across Gradewise

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when a stored or submitted string is not a known enum value.
///
/// Reads are strict: legacy values are rewritten by migration, never coerced here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

// =============================================================================
// Tiers and statuses
// =============================================================================

/// Subscription tier. The derived ordering is the upgrade path:
/// `FreeTrial < Basic < Premium < Enterprise`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    #[default]
    FreeTrial,
    Basic,
    Premium,
    Enterprise,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::FreeTrial,
        SubscriptionTier::Basic,
        SubscriptionTier::Premium,
        SubscriptionTier::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::FreeTrial => "FREE_TRIAL",
            SubscriptionTier::Basic => "BASIC",
            SubscriptionTier::Premium => "PREMIUM",
            SubscriptionTier::Enterprise => "ENTERPRISE",
        }
    }

    /// Whether this tier carries a payment obligation
    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionTier::FreeTrial)
    }

    /// True when `self` is `required` or above
    pub fn at_least(&self, required: SubscriptionTier) -> bool {
        *self >= required
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FREE_TRIAL" => Ok(SubscriptionTier::FreeTrial),
            "BASIC" => Ok(SubscriptionTier::Basic),
            "PREMIUM" => Ok(SubscriptionTier::Premium),
            "ENTERPRISE" => Ok(SubscriptionTier::Enterprise),
            other => Err(ParseEnumError::new("subscription tier", other)),
        }
    }
}

/// Subscription status as mirrored from the payment processor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "INCOMPLETE",
            SubscriptionStatus::Trialing => "TRIALING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Canceled => "CANCELED",
        }
    }

    /// `ACTIVE` and `TRIALING` are the only statuses that grant paid access
    pub fn is_billing_active(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INCOMPLETE" => Ok(SubscriptionStatus::Incomplete),
            "TRIALING" => Ok(SubscriptionStatus::Trialing),
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "PAST_DUE" => Ok(SubscriptionStatus::PastDue),
            "CANCELED" => Ok(SubscriptionStatus::Canceled),
            other => Err(ParseEnumError::new("subscription status", other)),
        }
    }
}

// =============================================================================
// Billing owners
// =============================================================================

/// Kind of entity a subscription and its quotas are tracked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnerType {
    User,
    Org,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::User => "USER",
            OwnerType::Org => "ORG",
        }
    }
}

impl fmt::Display for OwnerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OwnerType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(OwnerType::User),
            "ORG" => Ok(OwnerType::Org),
            other => Err(ParseEnumError::new("owner type", other)),
        }
    }
}

/// A billing owner: a user or an organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: OwnerType,
    pub owner_id: Uuid,
}

impl OwnerRef {
    pub fn user(owner_id: Uuid) -> Self {
        Self {
            owner_type: OwnerType::User,
            owner_id,
        }
    }

    pub fn org(owner_id: Uuid) -> Self {
        Self {
            owner_type: OwnerType::Org,
            owner_id,
        }
    }

    pub fn is_org(&self) -> bool {
        self.owner_type == OwnerType::Org
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner_type, self.owner_id)
    }
}

// =============================================================================
// Roles
// =============================================================================

/// Platform-wide role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserRole {
    Admin,
    Instructor,
    Learner,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "ADMIN",
            UserRole::Instructor => "INSTRUCTOR",
            UserRole::Learner => "LEARNER",
        }
    }
}

impl FromStr for UserRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADMIN" => Ok(UserRole::Admin),
            "INSTRUCTOR" => Ok(UserRole::Instructor),
            "LEARNER" => Ok(UserRole::Learner),
            other => Err(ParseEnumError::new("user role", other)),
        }
    }
}

/// Role of a user inside one organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrgRole {
    Owner,
    Admin,
    Member,
}

impl OrgRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgRole::Owner => "OWNER",
            OrgRole::Admin => "ADMIN",
            OrgRole::Member => "MEMBER",
        }
    }

    /// Only owners and admins may start checkout or open the portal for an org
    pub fn can_manage_billing(&self) -> bool {
        matches!(self, OrgRole::Owner | OrgRole::Admin)
    }
}

impl FromStr for OrgRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OWNER" => Ok(OrgRole::Owner),
            "ADMIN" => Ok(OrgRole::Admin),
            "MEMBER" => Ok(OrgRole::Member),
            other => Err(ParseEnumError::new("organization role", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(SubscriptionTier::FreeTrial < SubscriptionTier::Basic);
        assert!(SubscriptionTier::Basic < SubscriptionTier::Premium);
        assert!(SubscriptionTier::Premium < SubscriptionTier::Enterprise);
        assert!(SubscriptionTier::Enterprise.at_least(SubscriptionTier::Basic));
        assert!(!SubscriptionTier::Basic.at_least(SubscriptionTier::Premium));
    }

    #[test]
    fn test_tier_parsing_is_strict() {
        assert_eq!(
            "PREMIUM".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Premium
        );
        // Legacy lowercase values are rewritten by migration, not here
        let err = "pro".parse::<SubscriptionTier>().unwrap_err();
        assert_eq!(err.kind, "subscription tier");
        assert!("free_trial".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&SubscriptionTier::FreeTrial).unwrap();
        assert_eq!(json, "\"FREE_TRIAL\"");
        let status: SubscriptionStatus = serde_json::from_str("\"PAST_DUE\"").unwrap();
        assert_eq!(status, SubscriptionStatus::PastDue);
        let owner = serde_json::to_value(OwnerRef::org(Uuid::nil())).unwrap();
        assert_eq!(owner["owner_type"], "ORG");
    }

    #[test]
    fn test_billing_active_statuses() {
        assert!(SubscriptionStatus::Active.is_billing_active());
        assert!(SubscriptionStatus::Trialing.is_billing_active());
        assert!(!SubscriptionStatus::PastDue.is_billing_active());
        assert!(!SubscriptionStatus::Canceled.is_billing_active());
        assert!(!SubscriptionStatus::Incomplete.is_billing_active());
    }

    #[test]
    fn test_org_role_billing_management() {
        assert!(OrgRole::Owner.can_manage_billing());
        assert!(OrgRole::Admin.can_manage_billing());
        assert!(!OrgRole::Member.can_manage_billing());
    }
}
