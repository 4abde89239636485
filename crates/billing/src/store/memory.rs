//! In-memory billing store
//!
//! Same contracts as the Postgres store. Row locks become per-owner
//! `tokio::sync::Mutex`es held in `DashMap`s; no guard of a map is ever held
//! across an `.await`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use gradewise_shared::{OrgRole, OwnerRef, OwnerType, UserRole};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CreditStore, InvariantStore, Organization, OrganizationMembership, Principal,
    PrincipalDirectory, ProcessorSubscriptionState, SubscriptionRecord, SubscriptionStore,
    UsageStore, WebhookEventStore,
};
use crate::credits::{
    rollover_amount, CreditKind, CreditTransaction, NewCreditTransaction, PeriodRollover,
};
use crate::error::{BillingError, BillingResult};
use crate::usage::{first_violation, IncrementOutcome, LimitedDelta, UsageCounters};
use crate::webhooks::{
    ProcessingResult, WebhookEventOutcome, WebhookEventRecord, PROCESSING_TIMEOUT_MINUTES,
};

type Ledger = Arc<Mutex<Vec<CreditTransaction>>>;

#[derive(Default)]
pub struct InMemoryBillingStore {
    users: DashMap<Uuid, Principal>,
    organizations: DashMap<Uuid, Organization>,
    /// Keyed by user id
    memberships: DashMap<Uuid, Vec<OrganizationMembership>>,
    subscriptions: DashMap<OwnerRef, SubscriptionRecord>,
    usage: DashMap<OwnerRef, Arc<Mutex<UsageCounters>>>,
    ledgers: DashMap<Uuid, Ledger>,
    webhook_events: DashMap<String, WebhookEventRecord>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Seeding
    // -------------------------------------------------------------------------

    pub fn create_user(&self, email: &str, role: UserRole) -> Principal {
        let principal = Principal {
            id: Uuid::new_v4(),
            email: email.to_string(),
            display_name: email.split('@').next().unwrap_or(email).to_string(),
            role,
            is_owner: false,
            credit_balance: 0,
            monthly_credits: 0,
        };
        self.users.insert(principal.id, principal.clone());
        principal
    }

    pub fn create_super_admin(&self, email: &str) -> Principal {
        let mut principal = self.create_user(email, UserRole::Admin);
        principal.is_owner = true;
        self.users.insert(principal.id, principal.clone());
        principal
    }

    pub fn create_organization(&self, name: &str) -> Organization {
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.organizations.insert(org.id, org.clone());
        org
    }

    /// Add an active membership, deactivating any previous active one for the pair
    pub fn add_membership(&self, user_id: Uuid, org_id: Uuid, role: OrgRole) {
        let mut memberships = self.memberships.entry(user_id).or_default();
        for existing in memberships.iter_mut().filter(|m| m.org_id == org_id) {
            existing.is_active = false;
        }
        memberships.push(OrganizationMembership {
            user_id,
            org_id,
            role,
            is_active: true,
            created_at: OffsetDateTime::now_utc(),
        });
    }

    pub fn deactivate_membership(&self, user_id: Uuid, org_id: Uuid) {
        if let Some(mut memberships) = self.memberships.get_mut(&user_id) {
            for membership in memberships.iter_mut().filter(|m| m.org_id == org_id) {
                membership.is_active = false;
            }
        }
    }

    /// Overwrite a subscription record as-is
    pub fn put_subscription(&self, record: SubscriptionRecord) {
        self.subscriptions.insert(record.owner, record);
    }

    pub fn set_usage(&self, owner: OwnerRef, counters: UsageCounters) {
        self.usage.insert(owner, Arc::new(Mutex::new(counters)));
    }

    pub fn set_monthly_credits(&self, user_id: Uuid, monthly_credits: i64) -> BillingResult<()> {
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        user.monthly_credits = monthly_credits;
        Ok(())
    }

    /// Set the cached balance without a ledger entry. Only useful to
    /// simulate drift.
    pub fn overwrite_cached_balance(&self, user_id: Uuid, balance: i64) -> BillingResult<()> {
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| user_not_found(user_id))?;
        user.credit_balance = balance;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn owner_exists(&self, owner: OwnerRef) -> bool {
        match owner.owner_type {
            OwnerType::User => self.users.contains_key(&owner.owner_id),
            OwnerType::Org => self.organizations.contains_key(&owner.owner_id),
        }
    }

    fn usage_cell(&self, owner: OwnerRef) -> Arc<Mutex<UsageCounters>> {
        self.usage.entry(owner).or_default().clone()
    }

    fn ledger(&self, user_id: Uuid) -> Ledger {
        self.ledgers.entry(user_id).or_default().clone()
    }
}

fn user_not_found(user_id: Uuid) -> BillingError {
    BillingError::NotFound(format!("user {}", user_id))
}

fn owner_not_found(owner: OwnerRef) -> BillingError {
    BillingError::NotFound(format!("billing owner {}", owner))
}

fn new_transaction(
    user_id: Uuid,
    amount: i64,
    kind: CreditKind,
    description: &str,
    now: OffsetDateTime,
) -> CreditTransaction {
    CreditTransaction {
        id: Uuid::new_v4(),
        user_id,
        amount,
        kind,
        description: description.to_string(),
        created_at: now,
    }
}

#[async_trait]
impl PrincipalDirectory for InMemoryBillingStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<Principal>> {
        Ok(self.users.get(&user_id).map(|u| u.clone()))
    }

    async fn get_organization(&self, org_id: Uuid) -> BillingResult<Option<Organization>> {
        Ok(self.organizations.get(&org_id).map(|o| o.clone()))
    }

    async fn list_active_memberships(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<OrganizationMembership>> {
        Ok(self
            .memberships
            .get(&user_id)
            .map(|list| list.iter().filter(|m| m.is_active).cloned().collect())
            .unwrap_or_default())
    }

    async fn get_active_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> BillingResult<Option<OrganizationMembership>> {
        Ok(self.memberships.get(&user_id).and_then(|list| {
            list.iter()
                .find(|m| m.is_active && m.org_id == org_id)
                .cloned()
        }))
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn get_subscription(&self, owner: OwnerRef) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self.subscriptions.get(&owner).map(|r| r.clone()))
    }

    async fn ensure_subscription(&self, owner: OwnerRef) -> BillingResult<SubscriptionRecord> {
        if !self.owner_exists(owner) {
            return Err(owner_not_found(owner));
        }
        let record = self
            .subscriptions
            .entry(owner)
            .or_insert_with(|| SubscriptionRecord::new_default(owner, OffsetDateTime::now_utc()))
            .clone();
        Ok(record)
    }

    async fn set_customer_id_if_absent(
        &self,
        owner: OwnerRef,
        customer_id: &str,
    ) -> BillingResult<String> {
        let mut record = self
            .subscriptions
            .get_mut(&owner)
            .ok_or_else(|| owner_not_found(owner))?;
        match &record.processor_customer_id {
            Some(existing) => Ok(existing.clone()),
            None => {
                record.processor_customer_id = Some(customer_id.to_string());
                Ok(customer_id.to_string())
            }
        }
    }

    async fn find_owner_by_customer(&self, customer_id: &str) -> BillingResult<Option<OwnerRef>> {
        Ok(self
            .subscriptions
            .iter()
            .find(|r| r.processor_customer_id.as_deref() == Some(customer_id))
            .map(|r| r.owner))
    }

    async fn apply_processor_state(
        &self,
        owner: OwnerRef,
        state: &ProcessorSubscriptionState,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        if !self.owner_exists(owner) {
            return Err(owner_not_found(owner));
        }
        let now = OffsetDateTime::now_utc();
        let mut record = self
            .subscriptions
            .entry(owner)
            .or_insert_with(|| SubscriptionRecord::new_default(owner, now));
        if state.apply_to(&mut record, now) {
            Ok(Some(record.clone()))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl UsageStore for InMemoryBillingStore {
    async fn get_usage(&self, owner: OwnerRef) -> BillingResult<Option<UsageCounters>> {
        let cell = self.usage.get(&owner).map(|c| c.clone());
        match cell {
            Some(cell) => Ok(Some(*cell.lock().await)),
            None => Ok(None),
        }
    }

    async fn ensure_usage(&self, owner: OwnerRef) -> BillingResult<UsageCounters> {
        let cell = self.usage_cell(owner);
        let counters = *cell.lock().await;
        Ok(counters)
    }

    async fn try_increment(
        &self,
        owner: OwnerRef,
        deltas: &[LimitedDelta],
    ) -> BillingResult<IncrementOutcome> {
        let cell = self.usage_cell(owner);
        let mut counters = cell.lock().await;
        if let Some(violation) = first_violation(&counters, deltas) {
            return Ok(violation);
        }
        for delta in deltas {
            counters.add(delta.key, delta.increment);
        }
        Ok(IncrementOutcome::Applied(*counters))
    }

    async fn reset_period(&self, owner: OwnerRef) -> BillingResult<()> {
        let cell = self.usage.get(&owner).map(|c| c.clone());
        if let Some(cell) = cell {
            cell.lock().await.reset_period();
        }
        Ok(())
    }

    async fn list_usage_owners(&self) -> BillingResult<Vec<OwnerRef>> {
        Ok(self.usage.iter().map(|entry| *entry.key()).collect())
    }
}

#[async_trait]
impl CreditStore for InMemoryBillingStore {
    async fn append_transaction(
        &self,
        tx: &NewCreditTransaction,
    ) -> BillingResult<CreditTransaction> {
        let ledger = self.ledger(tx.user_id);
        let mut entries = ledger.lock().await;

        let record = {
            let mut user = self
                .users
                .get_mut(&tx.user_id)
                .ok_or_else(|| user_not_found(tx.user_id))?;
            let balance = user.credit_balance.checked_add(tx.amount).ok_or_else(|| {
                BillingError::InvalidRequest(format!(
                    "credit balance would overflow adding {}",
                    tx.amount
                ))
            })?;
            if balance < 0 {
                return Err(BillingError::InsufficientCredits {
                    balance: user.credit_balance,
                    requested: -tx.amount,
                });
            }
            user.credit_balance = balance;
            new_transaction(
                tx.user_id,
                tx.amount,
                tx.kind,
                &tx.description,
                OffsetDateTime::now_utc(),
            )
        };

        entries.push(record.clone());
        Ok(record)
    }

    async fn get_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.users
            .get(&user_id)
            .map(|u| u.credit_balance)
            .ok_or_else(|| user_not_found(user_id))
    }

    async fn sum_transactions(&self, user_id: Uuid) -> BillingResult<i64> {
        let ledger = self.ledger(user_id);
        let entries = ledger.lock().await;
        Ok(entries.iter().map(|t| t.amount).sum())
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let ledger = self.ledger(user_id);
        let entries = ledger.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn rollover_period(&self, user_id: Uuid) -> BillingResult<PeriodRollover> {
        let ledger = self.ledger(user_id);
        let mut entries = ledger.lock().await;
        let now = OffsetDateTime::now_utc();

        let rollover = {
            let mut user = self
                .users
                .get_mut(&user_id)
                .ok_or_else(|| user_not_found(user_id))?;
            let balance_before = user.credit_balance;
            let allowance = user.monthly_credits.max(0);
            let expired = rollover_amount(balance_before, allowance);
            user.credit_balance = (balance_before + expired)
                .checked_add(allowance)
                .ok_or_else(|| {
                    BillingError::InvalidRequest(format!(
                        "credit balance would overflow granting {}",
                        allowance
                    ))
                })?;

            PeriodRollover {
                user_id,
                balance_before,
                balance_after: user.credit_balance,
                rollover: new_transaction(
                    user_id,
                    expired,
                    CreditKind::Rollover,
                    "Period rollover",
                    now,
                ),
                allocation: new_transaction(
                    user_id,
                    allowance,
                    CreditKind::Purchase,
                    "Monthly credit allocation",
                    now,
                ),
            }
        };

        entries.push(rollover.rollover.clone());
        entries.push(rollover.allocation.clone());
        Ok(rollover)
    }

    async fn list_credit_users(&self) -> BillingResult<Vec<Uuid>> {
        Ok(self.users.iter().map(|u| *u.key()).collect())
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryBillingStore {
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        match self.webhook_events.entry(event_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(WebhookEventRecord {
                    id: Uuid::new_v4(),
                    event_id: event_id.to_string(),
                    event_type: event_type.to_string(),
                    owner: None,
                    processing_result: ProcessingResult::Processing,
                    error_message: None,
                    details: serde_json::json!({}),
                    received_at: now,
                    processed_at: None,
                });
                Ok(true)
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                let reclaim = match record.processing_result {
                    ProcessingResult::Error => true,
                    ProcessingResult::Processing => {
                        record.received_at < now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES)
                    }
                    ProcessingResult::Success => false,
                };
                if reclaim {
                    record.processing_result = ProcessingResult::Processing;
                    record.received_at = now;
                    record.error_message = None;
                    record.processed_at = None;
                }
                Ok(reclaim)
            }
        }
    }

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: &WebhookEventOutcome,
    ) -> BillingResult<()> {
        let mut record = self
            .webhook_events
            .get_mut(event_id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook event {}", event_id)))?;
        record.processing_result = outcome.result;
        record.owner = outcome.owner;
        record.error_message = outcome.error_message.clone();
        record.details = outcome.details.clone();
        record.processed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        Ok(self.webhook_events.get(event_id).map(|r| r.clone()))
    }
}

#[async_trait]
impl InvariantStore for InMemoryBillingStore {
    async fn ledger_mismatches(&self) -> BillingResult<Vec<(Uuid, i64, i64)>> {
        let user_ids: Vec<Uuid> = self.users.iter().map(|u| *u.key()).collect();
        let mut mismatches = Vec::new();
        for user_id in user_ids {
            let ledger = self.ledger(user_id);
            let entries = ledger.lock().await;
            let sum: i64 = entries.iter().map(|t| t.amount).sum();
            let balance = self.users.get(&user_id).map(|u| u.credit_balance);
            if let Some(balance) = balance {
                if balance != sum {
                    mismatches.push((user_id, balance, sum));
                }
            }
        }
        Ok(mismatches)
    }

    async fn duplicate_active_memberships(&self) -> BillingResult<Vec<(Uuid, Uuid, i64)>> {
        let mut duplicates = Vec::new();
        for entry in self.memberships.iter() {
            let mut org_ids: Vec<Uuid> = entry
                .value()
                .iter()
                .filter(|m| m.is_active)
                .map(|m| m.org_id)
                .collect();
            org_ids.sort();
            for chunk in org_ids.chunk_by(|a, b| a == b) {
                if chunk.len() > 1 {
                    duplicates.push((*entry.key(), chunk[0], chunk.len() as i64));
                }
            }
        }
        Ok(duplicates)
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(self.subscriptions.iter().map(|r| r.clone()).collect())
    }
}
