//! Billing invariants
//!
//! Runnable consistency checks over the billing store. They only read, and
//! can be run after webhook replays or by the nightly worker job.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::SharedStore;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users or organizations affected
    pub subject_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Balances or access may be wrong right now
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const CHECKS: [&str; 4] = [
    "ledger_balance_matches",
    "single_active_membership",
    "canceled_has_no_subscription",
    "paid_active_has_customer",
];

#[derive(Clone)]
pub struct InvariantChecker {
    store: SharedStore,
}

impl InvariantChecker {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        for name in CHECKS {
            violations.extend(self.run_check(name).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run: CHECKS.len(),
            checks_passed: CHECKS.len() - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name. Unknown names find nothing.
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "ledger_balance_matches" => self.check_ledger_balance().await,
            "single_active_membership" => self.check_single_active_membership().await,
            "canceled_has_no_subscription" => self.check_canceled_has_no_subscription().await,
            "paid_active_has_customer" => self.check_paid_active_has_customer().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }

    /// Cached credit balance equals the sum of the user's transactions
    async fn check_ledger_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self.store.ledger_mismatches().await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, cached, ledger_sum)| InvariantViolation {
                invariant: "ledger_balance_matches".to_string(),
                subject_ids: vec![user_id],
                description: format!(
                    "Cached credit balance {} differs from ledger sum {}",
                    cached, ledger_sum
                ),
                context: serde_json::json!({
                    "cached_balance": cached,
                    "ledger_sum": ledger_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// At most one active membership per (user, org)
    async fn check_single_active_membership(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self.store.duplicate_active_memberships().await?;

        Ok(rows
            .into_iter()
            .map(|(user_id, org_id, count)| InvariantViolation {
                invariant: "single_active_membership".to_string(),
                subject_ids: vec![user_id, org_id],
                description: format!("User has {} active memberships in one organization", count),
                context: serde_json::json!({ "active_memberships": count }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A canceled record no longer points at a processor subscription
    async fn check_canceled_has_no_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let records = self.store.list_subscriptions().await?;

        Ok(records
            .into_iter()
            .filter(|r| {
                r.status == gradewise_shared::SubscriptionStatus::Canceled
                    && r.processor_subscription_id.is_some()
            })
            .map(|r| InvariantViolation {
                invariant: "canceled_has_no_subscription".to_string(),
                subject_ids: vec![r.owner.owner_id],
                description: format!("Canceled {} still references a subscription", r.owner),
                context: serde_json::json!({
                    "owner_type": r.owner.owner_type,
                    "subscription_id": r.processor_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Active paid tiers must be billable
    async fn check_paid_active_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let records = self.store.list_subscriptions().await?;

        Ok(records
            .into_iter()
            .filter(|r| r.tier.is_paid() && r.is_billing_active() && r.processor_customer_id.is_none())
            .map(|r| InvariantViolation {
                invariant: "paid_active_has_customer".to_string(),
                subject_ids: vec![r.owner.owner_id],
                description: format!("{} is on {} with no payment customer", r.owner, r.tier),
                context: serde_json::json!({
                    "owner_type": r.owner.owner_type,
                    "tier": r.tier,
                    "status": r.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gradewise_shared::{OwnerRef, SubscriptionStatus, SubscriptionTier, UserRole};

    use super::*;
    use crate::credits::CreditLedger;
    use crate::store::{InMemoryBillingStore, SubscriptionRecord};

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[tokio::test]
    async fn test_clean_store_is_healthy() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.create_user("ok@example.com", UserRole::Instructor);
        CreditLedger::new(store.clone())
            .purchase(user.id, 100, "Welcome credits")
            .await
            .unwrap();

        let summary = InvariantChecker::new(store).run_all_checks().await.unwrap();
        assert!(summary.healthy);
        assert_eq!(summary.checks_run, 4);
        assert_eq!(summary.checks_passed, 4);
    }

    #[tokio::test]
    async fn test_detects_drift_and_unbillable_plans() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.create_user("drift@example.com", UserRole::Instructor);
        CreditLedger::new(store.clone())
            .purchase(user.id, 100, "Welcome credits")
            .await
            .unwrap();
        store.overwrite_cached_balance(user.id, 90).unwrap();

        let now = OffsetDateTime::now_utc();
        store.put_subscription(SubscriptionRecord {
            tier: SubscriptionTier::Premium,
            status: SubscriptionStatus::Active,
            ..SubscriptionRecord::new_default(OwnerRef::user(user.id), now)
        });

        let summary = InvariantChecker::new(store).run_all_checks().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.checks_failed, 2);

        let ledger = summary
            .violations
            .iter()
            .find(|v| v.invariant == "ledger_balance_matches")
            .unwrap();
        assert_eq!(ledger.severity, ViolationSeverity::Critical);
        assert_eq!(ledger.context["cached_balance"], 90);
        assert_eq!(ledger.context["ledger_sum"], 100);
        assert!(summary
            .violations
            .iter()
            .any(|v| v.invariant == "paid_active_has_customer"));
    }

    #[tokio::test]
    async fn test_unknown_check_finds_nothing() {
        let store = Arc::new(InMemoryBillingStore::new());
        let found = InvariantChecker::new(store).run_check("nope").await.unwrap();
        assert!(found.is_empty());
    }
}
