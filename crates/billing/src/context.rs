//! Billing context resolution
//!
//! Decides which owner pays for a principal's request:
//!
//! 1. The first active membership whose organization subscription is
//!    `ACTIVE`/`TRIALING`, most recently updated organization first.
//! 2. The principal's own subscription when `ACTIVE`/`TRIALING`.
//! 3. A lapsed paid personal subscription (`PAST_DUE`/`INCOMPLETE`), so the
//!    gate can tell the user to fix their payment method.
//! 4. A synthesized `FREE_TRIAL`/`TRIALING` context on the user.
//!
//! Resolution never writes. [`BillingContextResolver::ensure_subscription`]
//! is the explicit create-if-absent path.

use gradewise_shared::{OwnerRef, OwnerType, SubscriptionStatus, SubscriptionTier};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::plans::Plan;
use crate::store::{Principal, SharedStore, SubscriptionRecord};
use crate::usage::UsageCounters;

/// Where a context's tier came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextSource {
    Organization,
    Personal,
    Default,
}

/// Effective billing state for one request
#[derive(Debug, Clone, Serialize)]
pub struct BillingContext {
    pub owner: OwnerRef,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub usage: UsageCounters,
    pub principal: Principal,
    pub source: ContextSource,
}

impl BillingContext {
    pub fn owner_type(&self) -> OwnerType {
        self.owner.owner_type
    }

    pub fn plan(&self) -> Plan {
        Plan::for_tier(self.tier)
    }

    /// Free trial carries no payment obligation, so it is never inactive
    pub fn is_billing_active(&self) -> bool {
        !self.tier.is_paid() || self.status.is_billing_active()
    }

    fn from_record(
        record: &SubscriptionRecord,
        usage: UsageCounters,
        principal: Principal,
        source: ContextSource,
    ) -> Self {
        Self {
            owner: record.owner,
            tier: record.tier,
            status: record.status,
            usage,
            principal,
            source,
        }
    }
}

#[derive(Clone)]
pub struct BillingContextResolver {
    store: SharedStore,
}

impl BillingContextResolver {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Resolve the context for an authenticated user id
    pub async fn resolve(&self, user_id: Option<Uuid>) -> BillingResult<BillingContext> {
        let principal = self.principal(user_id).await?;
        self.resolve_principal(principal).await
    }

    /// Look up the authenticated user. Unknown ids are `UNAUTHENTICATED`.
    pub async fn principal(&self, user_id: Option<Uuid>) -> BillingResult<Principal> {
        let user_id = user_id.ok_or(BillingError::Unauthenticated)?;
        self.store
            .get_user(user_id)
            .await?
            .ok_or(BillingError::Unauthenticated)
    }

    pub async fn resolve_principal(&self, principal: Principal) -> BillingResult<BillingContext> {
        if let Some(record) = self.active_org_subscription(principal.id).await? {
            let usage = self.usage_for(record.owner).await?;
            tracing::debug!(
                user_id = %principal.id,
                org_id = %record.owner.owner_id,
                tier = %record.tier,
                "Resolved organization billing context"
            );
            return Ok(BillingContext::from_record(
                &record,
                usage,
                principal,
                ContextSource::Organization,
            ));
        }

        let personal_owner = OwnerRef::user(principal.id);
        let usage = self.usage_for(personal_owner).await?;

        if let Some(record) = self.store.get_subscription(personal_owner).await? {
            let lapsed_paid = record.tier.is_paid()
                && matches!(
                    record.status,
                    SubscriptionStatus::PastDue | SubscriptionStatus::Incomplete
                );
            if record.is_billing_active() || lapsed_paid {
                return Ok(BillingContext::from_record(
                    &record,
                    usage,
                    principal,
                    ContextSource::Personal,
                ));
            }
        }

        Ok(BillingContext {
            owner: personal_owner,
            tier: SubscriptionTier::FreeTrial,
            status: SubscriptionStatus::Trialing,
            usage,
            principal,
            source: ContextSource::Default,
        })
    }

    /// Active org subscription for the most recently updated organization
    async fn active_org_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let memberships = self.store.list_active_memberships(user_id).await?;

        let mut candidates = Vec::with_capacity(memberships.len());
        for membership in memberships {
            if let Some(record) = self
                .store
                .get_subscription(OwnerRef::org(membership.org_id))
                .await?
            {
                if record.is_billing_active() {
                    candidates.push(record);
                }
            }
        }

        candidates.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(candidates.into_iter().next())
    }

    async fn usage_for(&self, owner: OwnerRef) -> BillingResult<UsageCounters> {
        Ok(self.store.get_usage(owner).await?.unwrap_or_default())
    }

    /// Create the default subscription record and counters for an owner if
    /// missing. Existing records are returned untouched.
    pub async fn ensure_subscription(&self, owner: OwnerRef) -> BillingResult<SubscriptionRecord> {
        let record = self.store.ensure_subscription(owner).await?;
        self.store.ensure_usage(owner).await?;

        tracing::debug!(
            owner = %owner,
            tier = %record.tier,
            status = %record.status,
            "Ensured billing records"
        );
        Ok(record)
    }

    /// The user themself, an org `OWNER`/`ADMIN`, or a super-admin
    pub async fn authorize_billing_management(
        &self,
        principal: &Principal,
        owner: OwnerRef,
    ) -> BillingResult<()> {
        if principal.is_owner {
            return Ok(());
        }

        let allowed = match owner.owner_type {
            OwnerType::User => principal.id == owner.owner_id,
            OwnerType::Org => self
                .store
                .get_active_membership(principal.id, owner.owner_id)
                .await?
                .is_some_and(|m| m.role.can_manage_billing()),
        };

        if allowed {
            Ok(())
        } else {
            tracing::warn!(
                user_id = %principal.id,
                owner = %owner,
                "Billing management denied"
            );
            Err(BillingError::Forbidden(owner))
        }
    }
}
