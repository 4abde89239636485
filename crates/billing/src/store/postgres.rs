//! Postgres billing store
//!
//! Enum columns are VARCHAR and parsed strictly on read. Per-owner
//! consistency comes from conditional updates and row locks, never from a
//! global lock.

use async_trait::async_trait;
use gradewise_shared::{OwnerRef, OwnerType};
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
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
use crate::plans::QuotaKey;
use crate::usage::{first_violation, IncrementOutcome, LimitedDelta, UsageCounters};
use crate::webhooks::{WebhookEventOutcome, WebhookEventRecord, PROCESSING_TIMEOUT_MINUTES};

const SUBSCRIPTION_COLUMNS: &str = "tier, status, processor_customer_id, \
     processor_subscription_id, current_period_end, cancel_at_period_end, last_event_at, \
     created_at, updated_at";

const USAGE_COLUMNS: &str =
    "courses, assignments, ai_grades, plagiarism_scans, students, monthly_credits";

/// Attempts at the conditional usage update before giving up on a
/// counter that keeps moving under us
const MAX_INCREMENT_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn select_subscriptions(
        &self,
        owner_type: OwnerType,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let (table, key) = subscription_table(owner_type);
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {key} AS owner_id, {SUBSCRIPTION_COLUMNS} FROM {table}"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.into_record(owner_type))
            .collect()
    }
}

/// `(table, owner key column)` holding subscriptions for an owner type
fn subscription_table(owner_type: OwnerType) -> (&'static str, &'static str) {
    match owner_type {
        OwnerType::User => ("user_subscriptions", "user_id"),
        OwnerType::Org => ("org_subscriptions", "org_id"),
    }
}

fn owner_not_found(owner: OwnerRef) -> BillingError {
    BillingError::NotFound(format!("billing owner {}", owner))
}

fn map_owner_error(err: sqlx::Error, owner: OwnerRef) -> BillingError {
    match &err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => owner_not_found(owner),
        _ => err.into(),
    }
}

// =============================================================================
// Rows
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    email: String,
    display_name: String,
    role: String,
    is_owner: bool,
    credit_balance: i64,
    monthly_credits: i64,
}

impl TryFrom<UserRow> for Principal {
    type Error = BillingError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Principal {
            id: row.id,
            email: row.email,
            display_name: row.display_name,
            role: row.role.parse()?,
            is_owner: row.is_owner,
            credit_balance: row.credit_balance,
            monthly_credits: row.monthly_credits,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    user_id: Uuid,
    org_id: Uuid,
    role: String,
    is_active: bool,
    created_at: OffsetDateTime,
}

impl TryFrom<MembershipRow> for OrganizationMembership {
    type Error = BillingError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        Ok(OrganizationMembership {
            user_id: row.user_id,
            org_id: row.org_id,
            role: row.role.parse()?,
            is_active: row.is_active,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    owner_id: Uuid,
    tier: String,
    status: String,
    processor_customer_id: Option<String>,
    processor_subscription_id: Option<String>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    last_event_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_record(self, owner_type: OwnerType) -> BillingResult<SubscriptionRecord> {
        Ok(SubscriptionRecord {
            owner: OwnerRef {
                owner_type,
                owner_id: self.owner_id,
            },
            tier: self.tier.parse()?,
            status: self.status.parse()?,
            processor_customer_id: self.processor_customer_id,
            processor_subscription_id: self.processor_subscription_id,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            last_event_at: self.last_event_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CreditRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    kind: String,
    description: String,
    created_at: OffsetDateTime,
}

impl TryFrom<CreditRow> for CreditTransaction {
    type Error = BillingError;

    fn try_from(row: CreditRow) -> Result<Self, Self::Error> {
        Ok(CreditTransaction {
            id: row.id,
            user_id: row.user_id,
            amount: row.amount,
            kind: row.kind.parse()?,
            description: row.description,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    id: Uuid,
    processor_event_id: String,
    event_type: String,
    owner_type: Option<String>,
    owner_id: Option<Uuid>,
    processing_result: String,
    error_message: Option<String>,
    details: serde_json::Value,
    received_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = BillingError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        let owner = match (row.owner_type, row.owner_id) {
            (Some(owner_type), Some(owner_id)) => Some(OwnerRef {
                owner_type: owner_type.parse()?,
                owner_id,
            }),
            _ => None,
        };
        Ok(WebhookEventRecord {
            id: row.id,
            event_id: row.processor_event_id,
            event_type: row.event_type,
            owner,
            processing_result: row.processing_result.parse()?,
            error_message: row.error_message,
            details: row.details,
            received_at: row.received_at,
            processed_at: row.processed_at,
        })
    }
}

async fn insert_transaction(
    conn: &mut PgConnection,
    user_id: Uuid,
    amount: i64,
    kind: CreditKind,
    description: &str,
) -> BillingResult<CreditTransaction> {
    let row: CreditRow = sqlx::query_as(
        r#"
        INSERT INTO credit_transactions (id, user_id, amount, kind, description, created_at)
        VALUES ($1, $2, $3, $4, $5, clock_timestamp())
        RETURNING id, user_id, amount, kind, description, created_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(amount)
    .bind(kind.as_str())
    .bind(description)
    .fetch_one(&mut *conn)
    .await?;

    row.try_into()
}

// =============================================================================
// Directory
// =============================================================================

#[async_trait]
impl PrincipalDirectory for PgBillingStore {
    async fn get_user(&self, user_id: Uuid) -> BillingResult<Option<Principal>> {
        let row: Option<UserRow> = sqlx::query_as(
            r#"
            SELECT id, email, display_name, role, is_owner, credit_balance, monthly_credits
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Principal::try_from).transpose()
    }

    async fn get_organization(&self, org_id: Uuid) -> BillingResult<Option<Organization>> {
        let row: Option<(Uuid, String, OffsetDateTime)> =
            sqlx::query_as("SELECT id, name, created_at FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, name, created_at)| Organization {
            id,
            name,
            created_at,
        }))
    }

    async fn list_active_memberships(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Vec<OrganizationMembership>> {
        let rows: Vec<MembershipRow> = sqlx::query_as(
            r#"
            SELECT user_id, org_id, role, is_active, created_at
            FROM organization_memberships
            WHERE user_id = $1 AND is_active
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(OrganizationMembership::try_from)
            .collect()
    }

    async fn get_active_membership(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> BillingResult<Option<OrganizationMembership>> {
        let row: Option<MembershipRow> = sqlx::query_as(
            r#"
            SELECT user_id, org_id, role, is_active, created_at
            FROM organization_memberships
            WHERE user_id = $1 AND org_id = $2 AND is_active
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OrganizationMembership::try_from).transpose()
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn get_subscription(&self, owner: OwnerRef) -> BillingResult<Option<SubscriptionRecord>> {
        let (table, key) = subscription_table(owner.owner_type);
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {key} AS owner_id, {SUBSCRIPTION_COLUMNS} FROM {table} WHERE {key} = $1"
        ))
        .bind(owner.owner_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_record(owner.owner_type)).transpose()
    }

    async fn ensure_subscription(&self, owner: OwnerRef) -> BillingResult<SubscriptionRecord> {
        let (table, key) = subscription_table(owner.owner_type);
        sqlx::query(&format!(
            "INSERT INTO {table} ({key}) VALUES ($1) ON CONFLICT ({key}) DO NOTHING"
        ))
        .bind(owner.owner_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_owner_error(e, owner))?;

        self.get_subscription(owner)
            .await?
            .ok_or_else(|| owner_not_found(owner))
    }

    async fn set_customer_id_if_absent(
        &self,
        owner: OwnerRef,
        customer_id: &str,
    ) -> BillingResult<String> {
        let (table, key) = subscription_table(owner.owner_type);
        sqlx::query(&format!(
            "UPDATE {table} SET processor_customer_id = $2 \
             WHERE {key} = $1 AND processor_customer_id IS NULL"
        ))
        .bind(owner.owner_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;

        let stored: Option<(Option<String>,)> = sqlx::query_as(&format!(
            "SELECT processor_customer_id FROM {table} WHERE {key} = $1"
        ))
        .bind(owner.owner_id)
        .fetch_optional(&self.pool)
        .await?;

        stored
            .and_then(|(id,)| id)
            .ok_or_else(|| owner_not_found(owner))
    }

    async fn find_owner_by_customer(&self, customer_id: &str) -> BillingResult<Option<OwnerRef>> {
        for owner_type in [OwnerType::User, OwnerType::Org] {
            let (table, key) = subscription_table(owner_type);
            let found: Option<(Uuid,)> = sqlx::query_as(&format!(
                "SELECT {key} FROM {table} WHERE processor_customer_id = $1 LIMIT 1"
            ))
            .bind(customer_id)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((owner_id,)) = found {
                return Ok(Some(OwnerRef {
                    owner_type,
                    owner_id,
                }));
            }
        }
        Ok(None)
    }

    async fn apply_processor_state(
        &self,
        owner: OwnerRef,
        state: &ProcessorSubscriptionState,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let (table, key) = subscription_table(owner.owner_type);
        let sql = format!(
            r#"
            INSERT INTO {table} (
                {key}, tier, status, processor_customer_id, processor_subscription_id,
                current_period_end, cancel_at_period_end, last_event_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT ({key}) DO UPDATE SET
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                processor_customer_id = COALESCE(EXCLUDED.processor_customer_id, {table}.processor_customer_id),
                processor_subscription_id = EXCLUDED.processor_subscription_id,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = CASE
                    WHEN ROW({table}.tier, {table}.status, {table}.processor_customer_id,
                             {table}.processor_subscription_id, {table}.current_period_end,
                             {table}.cancel_at_period_end)
                         IS DISTINCT FROM
                         ROW(EXCLUDED.tier, EXCLUDED.status,
                             COALESCE(EXCLUDED.processor_customer_id, {table}.processor_customer_id),
                             EXCLUDED.processor_subscription_id, EXCLUDED.current_period_end,
                             EXCLUDED.cancel_at_period_end)
                    THEN NOW()
                    ELSE {table}.updated_at
                END
            WHERE {table}.last_event_at IS NULL OR {table}.last_event_at <= EXCLUDED.last_event_at
            RETURNING {key} AS owner_id, {SUBSCRIPTION_COLUMNS}
            "#
        );

        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(owner.owner_id)
            .bind(state.tier.as_str())
            .bind(state.status.as_str())
            .bind(state.customer_id.as_deref())
            .bind(state.subscription_id.as_deref())
            .bind(state.current_period_end)
            .bind(state.cancel_at_period_end)
            .bind(state.event_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_owner_error(e, owner))?;

        row.map(|r| r.into_record(owner.owner_type)).transpose()
    }
}

// =============================================================================
// Usage
// =============================================================================

#[async_trait]
impl UsageStore for PgBillingStore {
    async fn get_usage(&self, owner: OwnerRef) -> BillingResult<Option<UsageCounters>> {
        let counters: Option<UsageCounters> = sqlx::query_as(&format!(
            "SELECT {USAGE_COLUMNS} FROM usage_counters WHERE owner_type = $1 AND owner_id = $2"
        ))
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(counters)
    }

    async fn ensure_usage(&self, owner: OwnerRef) -> BillingResult<UsageCounters> {
        sqlx::query(
            r#"
            INSERT INTO usage_counters (owner_type, owner_id)
            VALUES ($1, $2)
            ON CONFLICT (owner_type, owner_id) DO NOTHING
            "#,
        )
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id)
        .execute(&self.pool)
        .await?;

        Ok(self.get_usage(owner).await?.unwrap_or_default())
    }

    async fn try_increment(
        &self,
        owner: OwnerRef,
        deltas: &[LimitedDelta],
    ) -> BillingResult<IncrementOutcome> {
        let current = self.ensure_usage(owner).await?;
        let Some(first) = deltas.first() else {
            return Ok(IncrementOutcome::Applied(current));
        };

        // $1/$2 identify the owner; each delta binds (increment, limit)
        let mut sets = Vec::with_capacity(deltas.len());
        let mut guards = Vec::with_capacity(deltas.len());
        for (i, delta) in deltas.iter().enumerate() {
            let (inc, lim) = (3 + i * 2, 4 + i * 2);
            let col = delta.key.column();
            sets.push(format!("{col} = {col} + ${inc}"));
            guards.push(format!("(${lim} < 0 OR {col} + ${inc} <= ${lim})"));
        }
        let sql = format!(
            "UPDATE usage_counters SET {}, updated_at = NOW() \
             WHERE owner_type = $1 AND owner_id = $2 AND {} \
             RETURNING {USAGE_COLUMNS}",
            sets.join(", "),
            guards.join(" AND "),
        );

        for _ in 0..MAX_INCREMENT_ATTEMPTS {
            let mut query = sqlx::query_as::<_, UsageCounters>(&sql)
                .bind(owner.owner_type.as_str())
                .bind(owner.owner_id);
            for delta in deltas {
                query = query.bind(delta.increment).bind(delta.limit);
            }

            if let Some(counters) = query.fetch_optional(&self.pool).await? {
                return Ok(IncrementOutcome::Applied(counters));
            }

            let current = self.get_usage(owner).await?.unwrap_or_default();
            if let Some(violation) = first_violation(&current, deltas) {
                return Ok(violation);
            }
            // A period reset landed between the update and the read; try again
        }

        let current = self.get_usage(owner).await?.unwrap_or_default();
        Ok(IncrementOutcome::LimitExceeded {
            key: first.key,
            current: current.get(first.key),
            limit: first.limit,
            requested: first.increment,
        })
    }

    async fn reset_period(&self, owner: OwnerRef) -> BillingResult<()> {
        let sets: Vec<String> = QuotaKey::ALL
            .into_iter()
            .filter(|key| key.resets_each_period())
            .map(|key| format!("{} = 0", key.column()))
            .collect();

        sqlx::query(&format!(
            "UPDATE usage_counters SET {}, updated_at = NOW() \
             WHERE owner_type = $1 AND owner_id = $2",
            sets.join(", ")
        ))
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_usage_owners(&self) -> BillingResult<Vec<OwnerRef>> {
        let rows: Vec<(String, Uuid)> =
            sqlx::query_as("SELECT owner_type, owner_id FROM usage_counters")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .map(|(owner_type, owner_id)| {
                Ok(OwnerRef {
                    owner_type: owner_type.parse()?,
                    owner_id,
                })
            })
            .collect()
    }
}

// =============================================================================
// Credits
// =============================================================================

#[async_trait]
impl CreditStore for PgBillingStore {
    async fn append_transaction(
        &self,
        new: &NewCreditTransaction,
    ) -> BillingResult<CreditTransaction> {
        let mut tx = self.pool.begin().await?;

        let updated: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET credit_balance = credit_balance + $2, updated_at = NOW()
            WHERE id = $1 AND credit_balance + $2 >= 0
            RETURNING credit_balance
            "#,
        )
        .bind(new.user_id)
        .bind(new.amount)
        .fetch_optional(&mut *tx)
        .await?;

        if updated.is_none() {
            let current: Option<(i64,)> =
                sqlx::query_as("SELECT credit_balance FROM users WHERE id = $1")
                    .bind(new.user_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Err(match current {
                Some((balance,)) => BillingError::InsufficientCredits {
                    balance,
                    requested: -new.amount,
                },
                None => BillingError::NotFound(format!("user {}", new.user_id)),
            });
        }

        let record =
            insert_transaction(&mut tx, new.user_id, new.amount, new.kind, &new.description)
                .await?;
        tx.commit().await?;

        Ok(record)
    }

    async fn get_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT credit_balance FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(balance,)| balance)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))
    }

    async fn sum_transactions(&self, user_id: Uuid) -> BillingResult<i64> {
        let (sum,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_transactions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(sum)
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let rows: Vec<CreditRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, kind, description, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn rollover_period(&self, user_id: Uuid) -> BillingResult<PeriodRollover> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT credit_balance, monthly_credits FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (balance_before, monthly_credits) =
            row.ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        let allowance = monthly_credits.max(0);
        let expired = rollover_amount(balance_before, allowance);
        let balance_after = balance_before + expired + allowance;

        let rollover = insert_transaction(
            &mut tx,
            user_id,
            expired,
            CreditKind::Rollover,
            "Period rollover",
        )
        .await?;
        let allocation = insert_transaction(
            &mut tx,
            user_id,
            allowance,
            CreditKind::Purchase,
            "Monthly credit allocation",
        )
        .await?;

        sqlx::query("UPDATE users SET credit_balance = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(balance_after)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(PeriodRollover {
            user_id,
            balance_before,
            balance_after,
            rollover,
            allocation,
        })
    }

    async fn list_credit_users(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM users ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

// =============================================================================
// Webhook event log
// =============================================================================

#[async_trait]
impl WebhookEventStore for PgBillingStore {
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        // Fresh ids, failed ids and deliveries stuck in processing can be claimed
        let claimed: Option<(Uuid,)> = sqlx::query_as(&format!(
            r#"
            INSERT INTO webhook_events (id, processor_event_id, event_type, processing_result, received_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (processor_event_id) DO UPDATE SET
                processing_result = 'processing',
                received_at = NOW(),
                error_message = NULL,
                processed_at = NULL
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.received_at < NOW() - INTERVAL '{PROCESSING_TIMEOUT_MINUTES} minutes')
            RETURNING id
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    async fn complete_event(
        &self,
        event_id: &str,
        outcome: &WebhookEventOutcome,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_events
            SET processing_result = $2,
                owner_type = $3,
                owner_id = $4,
                error_message = $5,
                details = $6,
                processed_at = NOW()
            WHERE processor_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.result.as_str())
        .bind(outcome.owner.map(|o| o.owner_type.as_str()))
        .bind(outcome.owner.map(|o| o.owner_id))
        .bind(outcome.error_message.as_deref())
        .bind(&outcome.details)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("webhook event {}", event_id)));
        }
        Ok(())
    }

    async fn get_event(&self, event_id: &str) -> BillingResult<Option<WebhookEventRecord>> {
        let row: Option<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT id, processor_event_id, event_type, owner_type, owner_id,
                   processing_result, error_message, details, received_at, processed_at
            FROM webhook_events
            WHERE processor_event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookEventRecord::try_from).transpose()
    }
}

// =============================================================================
// Invariants
// =============================================================================

#[async_trait]
impl InvariantStore for PgBillingStore {
    async fn ledger_mismatches(&self) -> BillingResult<Vec<(Uuid, i64, i64)>> {
        let rows: Vec<(Uuid, i64, i64)> = sqlx::query_as(
            r#"
            SELECT u.id, u.credit_balance, COALESCE(SUM(ct.amount), 0)::BIGINT AS ledger_sum
            FROM users u
            LEFT JOIN credit_transactions ct ON ct.user_id = u.id
            GROUP BY u.id, u.credit_balance
            HAVING u.credit_balance <> COALESCE(SUM(ct.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn duplicate_active_memberships(&self) -> BillingResult<Vec<(Uuid, Uuid, i64)>> {
        let rows: Vec<(Uuid, Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT user_id, org_id, COUNT(*) AS active_count
            FROM organization_memberships
            WHERE is_active
            GROUP BY user_id, org_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn list_subscriptions(&self) -> BillingResult<Vec<SubscriptionRecord>> {
        let mut records = self.select_subscriptions(OwnerType::User).await?;
        records.extend(self.select_subscriptions(OwnerType::Org).await?);
        Ok(records)
    }
}
