//! Billing error taxonomy
//!
//! Every denial the engine produces carries a machine-readable `code()`, a
//! human message (`Display`) and structured `details()` so that surfaces can
//! render upgrade prompts and progress bars without parsing strings.

use gradewise_shared::{OwnerRef, OwnerType, ParseEnumError, SubscriptionStatus, SubscriptionTier};
use serde_json::json;

use crate::plans::{ModuleKey, QuotaKey};

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// No resolvable principal. Fatal to the request, never retried.
    #[error("Authentication required")]
    Unauthenticated,

    /// Paid tier whose status has lapsed
    #[error("Billing is inactive for this {owner_type} plan ({tier}, {status}). Please update your payment method.")]
    BillingInactive {
        tier: SubscriptionTier,
        status: SubscriptionStatus,
        owner_type: OwnerType,
    },

    #[error("Usage limit reached for {key}: {current} of {limit} used on the {tier} plan")]
    UsageLimitExceeded {
        key: QuotaKey,
        current: i64,
        limit: i64,
        requested: i64,
        tier: SubscriptionTier,
    },

    #[error("This feature requires the {required_tier} plan (current plan: {current_tier})")]
    UpgradeRequired {
        required_tier: SubscriptionTier,
        module: Option<ModuleKey>,
        current_tier: SubscriptionTier,
    },

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("Not allowed to manage billing for {0}")]
    Forbidden(OwnerRef),

    #[error("Invalid tier for this operation: {0}")]
    InvalidTier(SubscriptionTier),

    #[error("No payment customer on record for {0}")]
    NoBillingCustomer(OwnerRef),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },

    #[error("Invalid webhook event: {0}")]
    InvalidEvent(String),

    #[error("Payment processor error: {0}")]
    Processor(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::Unauthenticated => "UNAUTHENTICATED",
            BillingError::BillingInactive { .. } => "BILLING_INACTIVE",
            BillingError::UsageLimitExceeded { .. } => "USAGE_LIMIT_EXCEEDED",
            BillingError::UpgradeRequired { .. } => "UPGRADE_REQUIRED",
            BillingError::InvalidSignature => "INVALID_SIGNATURE",
            BillingError::UnknownModule(_) => "UNKNOWN_MODULE",
            BillingError::Forbidden(_) => "FORBIDDEN",
            BillingError::InvalidTier(_) => "INVALID_TIER",
            BillingError::NoBillingCustomer(_) => "NO_BILLING_CUSTOMER",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::InvalidRequest(_) => "INVALID_REQUEST",
            BillingError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            BillingError::InvalidEvent(_) => "INVALID_EVENT",
            BillingError::Processor(_) => "PROCESSOR_ERROR",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Config(_) => "CONFIG_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Structured details for clients. Infrastructure errors expose nothing.
    pub fn details(&self) -> serde_json::Value {
        match self {
            BillingError::BillingInactive {
                tier,
                status,
                owner_type,
            } => json!({
                "tier": tier,
                "status": status,
                "owner_type": owner_type,
            }),
            BillingError::UsageLimitExceeded {
                key,
                current,
                limit,
                requested,
                tier,
            } => json!({
                "key": key,
                "current": current,
                "limit": limit,
                "requested": requested,
                "tier": tier,
            }),
            BillingError::UpgradeRequired {
                required_tier,
                module,
                current_tier,
            } => json!({
                "required_tier": required_tier,
                "module": module,
                "current_tier": current_tier,
            }),
            BillingError::UnknownModule(module) => json!({ "module": module }),
            BillingError::Forbidden(owner) | BillingError::NoBillingCustomer(owner) => json!({
                "owner_type": owner.owner_type,
                "owner_id": owner.owner_id,
            }),
            BillingError::InvalidTier(tier) => json!({ "tier": tier }),
            BillingError::InsufficientCredits { balance, requested } => json!({
                "balance": balance,
                "requested": requested,
            }),
            _ => json!({}),
        }
    }

    /// Entitlement denials are expected outcomes, not faults
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            BillingError::Unauthenticated
                | BillingError::BillingInactive { .. }
                | BillingError::UsageLimitExceeded { .. }
                | BillingError::UpgradeRequired { .. }
                | BillingError::UnknownModule(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Processor(err.to_string())
    }
}

impl From<ParseEnumError> for BillingError {
    fn from(err: ParseEnumError) -> Self {
        BillingError::Database(format!("invalid stored value: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_limit_details() {
        let err = BillingError::UsageLimitExceeded {
            key: QuotaKey::AiGrades,
            current: 50,
            limit: 50,
            requested: 1,
            tier: SubscriptionTier::FreeTrial,
        };
        assert_eq!(err.code(), "USAGE_LIMIT_EXCEEDED");
        let details = err.details();
        assert_eq!(details["key"], "aiGrades");
        assert_eq!(details["current"], 50);
        assert_eq!(details["limit"], 50);
        assert_eq!(details["tier"], "FREE_TRIAL");
        assert!(err.is_denial());
    }

    #[test]
    fn test_billing_inactive_message_mentions_payment_method() {
        let err = BillingError::BillingInactive {
            tier: SubscriptionTier::Basic,
            status: SubscriptionStatus::PastDue,
            owner_type: OwnerType::User,
        };
        assert!(err.to_string().contains("update your payment method"));
        assert_eq!(err.details()["status"], "PAST_DUE");
    }

    #[test]
    fn test_infrastructure_errors_hide_details() {
        let err = BillingError::Database("connection refused".to_string());
        assert_eq!(err.code(), "DATABASE_ERROR");
        assert_eq!(err.details(), json!({}));
        assert!(!err.is_denial());
    }
}
