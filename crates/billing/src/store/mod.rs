//! Persistence boundary for the billing engine
//!
//! One trait per concern, all implemented by [`PgBillingStore`] for
//! production and [`InMemoryBillingStore`] for tests and local runs.
//! Services hold a [`SharedStore`] and only ever talk to these traits.

use std::sync::Arc;

use async_trait::async_trait;
use gradewise_shared::{OrgRole, OwnerRef, SubscriptionStatus, SubscriptionTier, UserRole};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{CreditTransaction, NewCreditTransaction, PeriodRollover};
use crate::error::BillingResult;
use crate::usage::{IncrementOutcome, LimitedDelta, UsageCounters};
use crate::webhooks::{WebhookEventOutcome, WebhookEventRecord};

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

// =============================================================================
// Records
// =============================================================================

/// A user as seen by billing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    pub role: UserRole,
    /// Platform super-admin
    pub is_owner: bool,
    pub credit_balance: i64,
    pub monthly_credits: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationMembership {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role: OrgRole,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Subscription state for one owner, mirrored from the payment processor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionRecord {
    pub owner: OwnerRef,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub processor_customer_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Creation time of the newest processor event applied to this record
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Record created on first contact: free trial, trialing, no processor ids
    pub fn new_default(owner: OwnerRef, now: OffsetDateTime) -> Self {
        Self {
            owner,
            tier: SubscriptionTier::FreeTrial,
            status: SubscriptionStatus::Trialing,
            processor_customer_id: None,
            processor_subscription_id: None,
            current_period_end: None,
            cancel_at_period_end: false,
            last_event_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_billing_active(&self) -> bool {
        self.status.is_billing_active()
    }
}

/// Subscription state carried by a processor event.
///
/// `customer_id: None` keeps whatever customer id is already recorded;
/// `subscription_id: None` clears it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscriptionState {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub event_at: OffsetDateTime,
}

impl ProcessorSubscriptionState {
    /// Apply to an existing record. Returns false when the event is older
    /// than the last one applied.
    pub fn apply_to(&self, record: &mut SubscriptionRecord, now: OffsetDateTime) -> bool {
        if matches!(record.last_event_at, Some(last) if last > self.event_at) {
            return false;
        }

        let customer_id = self
            .customer_id
            .clone()
            .or_else(|| record.processor_customer_id.clone());
        let changed = record.tier != self.tier
            || record.status != self.status
            || record.processor_customer_id != customer_id
            || record.processor_subscription_id != self.subscription_id
            || record.current_period_end != self.current_period_end
            || record.cancel_at_period_end != self.cancel_at_period_end;

        record.tier = self.tier;
        record.status = self.status;
        record.processor_customer_id = customer_id;
        record.processor_subscription_id = self.subscription_id.clone();
        record.current_period_end = self.current_period_end;
        record.cancel_at_period_end = self.cancel_at_period_end;
        record.last_event_at = Some(self.event_at);
        if changed {
            record.updated_at = now;
        }
        true
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Users, organizations and memberships. Read-only for billing.
#[async_trait]
pub trait PrincipalDirectory: Send + Sync {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<Principal>>;

    async fn get_organization(&self, org_id: Uuid) -> BillingResult<Option<Organization>>;

    async fn list_active_memberships(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<OrganizationMembership>>;

    async fn get_active_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> BillingResult<Option<OrganizationMembership>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_subscription(&self, owner: OwnerRef) -> BillingResult<Option<SubscriptionRecord>>;

    /// Insert the default record if absent and return the stored record.
    /// Never changes an existing record. `NOT_FOUND` if the owner does not exist.
    async fn ensure_subscription(&self, owner: OwnerRef) -> BillingResult<SubscriptionRecord>;

    /// Record `customer_id` only when none is stored yet, returning the id
    /// on record afterwards. Concurrent callers converge on one id.
    async fn set_customer_id_if_absent(
        &self,
        owner: OwnerRef,
        customer_id: &str,
    ) -> BillingResult<String>;

    async fn find_owner_by_customer(&self, customer_id: &str) -> BillingResult<Option<OwnerRef>>;

    /// Upsert processor state. `None` when skipped because a newer event
    /// was already applied.
    async fn apply_processor_state(
        &self,
        owner: OwnerRef,
        state: &ProcessorSubscriptionState,
    ) -> BillingResult<Option<SubscriptionRecord>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn get_usage(&self, owner: OwnerRef) -> BillingResult<Option<UsageCounters>>;

    /// Insert a zero counter row if absent
    async fn ensure_usage(&self, owner: OwnerRef) -> BillingResult<UsageCounters>;

    /// Apply all deltas or none. Creates the counter row if absent.
    async fn try_increment(
        &self,
        owner: OwnerRef,
        deltas: &[LimitedDelta],
    ) -> BillingResult<IncrementOutcome>;

    async fn reset_period(&self, owner: OwnerRef) -> BillingResult<()>;

    async fn list_usage_owners(&self) -> BillingResult<Vec<OwnerRef>>;
}

#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Append and adjust the cached balance atomically. Fails with
    /// `INSUFFICIENT_CREDITS` without writing when the balance would go negative.
    async fn append_transaction(
        &self,
        tx: &NewCreditTransaction,
    ) -> BillingResult<CreditTransaction>;

    async fn get_balance(&self, user_id: Uuid) -> BillingResult<i64>;

    async fn sum_transactions(&self, user_id: Uuid) -> BillingResult<i64>;

    /// Newest first
    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>>;

    async fn rollover_period(&self, user_id: Uuid) -> BillingResult<PeriodRollover>;

    async fn list_credit_users(&self) -> BillingResult<Vec<Uuid>>;
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    /// Claim exclusive processing of an event id. False when it already
    /// succeeded or another delivery is processing it.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: &WebhookEventOutcome,
    ) -> BillingResult<()>;

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>>;
}

/// Row-level facts the invariant checker needs
#[async_trait]
pub trait InvariantStore: Send + Sync {
    /// `(user_id, cached_balance, ledger_sum)` where they disagree
    async fn ledger_mismatches(&self) -> BillingResult<Vec<(Uuid, i64, i64)>>;

    /// `(user_id, org_id, active_count)` with more than one active membership
    async fn duplicate_active_memberships(&self) -> BillingResult<Vec<(Uuid, Uuid, i64)>>;

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>>;
}

/// Everything the engine needs from persistence
pub trait BillingStore:
    PrincipalDirectory
    + SubscriptionStore
    + UsageStore
    + CreditStore
    + WebhookEventStore
    + InvariantStore
{
}

impl<T> BillingStore for T where
    T: PrincipalDirectory
        + SubscriptionStore
        + UsageStore
        + CreditStore
        + WebhookEventStore
        + InvariantStore
{
}

pub type SharedStore = Arc<dyn BillingStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn state(event_at: OffsetDateTime) -> ProcessorSubscriptionState {
        ProcessorSubscriptionState {
            tier: SubscriptionTier::Basic,
            status: SubscriptionStatus::Active,
            customer_id: Some("cus_1".to_string()),
            subscription_id: Some("sub_1".to_string()),
            current_period_end: None,
            cancel_at_period_end: false,
            event_at,
        }
    }

    #[test]
    fn test_older_event_is_skipped() {
        let now = OffsetDateTime::now_utc();
        let mut record = SubscriptionRecord::new_default(OwnerRef::user(Uuid::new_v4()), now);
        assert!(state(now).apply_to(&mut record, now));

        let mut stale = state(now - Duration::minutes(5));
        stale.status = SubscriptionStatus::Canceled;
        assert!(!stale.apply_to(&mut record, now));
        assert_eq!(record.status, SubscriptionStatus::Active);
    }

    #[test]
    fn test_missing_customer_id_keeps_recorded_one() {
        let now = OffsetDateTime::now_utc();
        let mut record = SubscriptionRecord::new_default(OwnerRef::org(Uuid::new_v4()), now);
        state(now).apply_to(&mut record, now);

        let mut deleted = state(now + Duration::seconds(1));
        deleted.customer_id = None;
        deleted.subscription_id = None;
        deleted.tier = SubscriptionTier::FreeTrial;
        deleted.status = SubscriptionStatus::Canceled;
        assert!(deleted.apply_to(&mut record, now));

        assert_eq!(record.processor_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(record.processor_subscription_id, None);
    }

    #[test]
    fn test_replay_does_not_touch_updated_at() {
        let created = OffsetDateTime::now_utc() - Duration::hours(1);
        let mut record = SubscriptionRecord::new_default(OwnerRef::user(Uuid::new_v4()), created);
        let event_at = OffsetDateTime::now_utc();
        state(event_at).apply_to(&mut record, event_at);
        let after_first = record.clone();

        assert!(state(event_at).apply_to(&mut record, event_at + Duration::minutes(1)));
        assert_eq!(record, after_first);
    }
}
