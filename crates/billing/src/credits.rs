//! Credit ledger
//!
//! Append-only log of signed credit movements per user. The cached
//! `credit_balance` on the user is adjusted in the same store transaction
//! as every append, so it always equals the sum of the log.

use std::fmt;
use std::str::FromStr;

use gradewise_shared::ParseEnumError;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditKind {
    Purchase,
    Debit,
    Rollover,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Purchase => "PURCHASE",
            CreditKind::Debit => "DEBIT",
            CreditKind::Rollover => "ROLLOVER",
        }
    }

    /// Whether `amount` has the sign this kind allows
    pub fn accepts(&self, amount: i64) -> bool {
        match self {
            CreditKind::Purchase => amount > 0,
            CreditKind::Debit => amount < 0,
            CreditKind::Rollover => amount <= 0,
        }
    }
}

impl fmt::Display for CreditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreditKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PURCHASE" => Ok(CreditKind::Purchase),
            "DEBIT" => Ok(CreditKind::Debit),
            "ROLLOVER" => Ok(CreditKind::Rollover),
            other => Err(ParseEnumError {
                kind: "credit kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub kind: CreditKind,
    pub description: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCreditTransaction {
    pub user_id: Uuid,
    pub amount: i64,
    pub kind: CreditKind,
    pub description: String,
}

/// Outcome of a period boundary for one user
#[derive(Debug, Clone, Serialize)]
pub struct PeriodRollover {
    pub user_id: Uuid,
    pub balance_before: i64,
    pub balance_after: i64,
    pub rollover: CreditTransaction,
    pub allocation: CreditTransaction,
}

impl PeriodRollover {
    /// Credits that expired at the boundary
    pub fn expired(&self) -> i64 {
        -self.rollover.amount
    }
}

/// Signed amount of the `ROLLOVER` entry: balance above the monthly
/// allowance expires, anything up to it carries over.
pub fn rollover_amount(balance: i64, monthly_credits: i64) -> i64 {
    -(balance - monthly_credits).max(0)
}

/// Credit ledger service
#[derive(Clone)]
pub struct CreditLedger {
    store: SharedStore,
}

impl CreditLedger {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Append a transaction and adjust the balance atomically
    pub async fn record_transaction(
        &self,
        user_id: Uuid,
        amount: i64,
        kind: CreditKind,
        description: impl Into<String>,
    ) -> BillingResult<CreditTransaction> {
        if !kind.accepts(amount) {
            return Err(BillingError::InvalidRequest(format!(
                "amount {} is not valid for a {} transaction",
                amount, kind
            )));
        }

        let tx = self
            .store
            .append_transaction(&NewCreditTransaction {
                user_id,
                amount,
                kind,
                description: description.into(),
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            amount = amount,
            kind = %kind,
            transaction_id = %tx.id,
            "Credit transaction recorded"
        );

        Ok(tx)
    }

    pub async fn purchase(
        &self,
        user_id: Uuid,
        credits: i64,
        description: impl Into<String>,
    ) -> BillingResult<CreditTransaction> {
        self.record_transaction(user_id, credits, CreditKind::Purchase, description)
            .await
    }

    /// Spend `credits` (a positive number)
    pub async fn debit(
        &self,
        user_id: Uuid,
        credits: i64,
        description: impl Into<String>,
    ) -> BillingResult<CreditTransaction> {
        let amount = credits.checked_neg().ok_or_else(|| {
            BillingError::InvalidRequest(format!("debit of {} credits is out of range", credits))
        })?;
        self.record_transaction(user_id, amount, CreditKind::Debit, description)
            .await
    }

    /// Cached balance
    pub async fn get_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.store.get_balance(user_id).await
    }

    /// Balance recomputed from the log
    pub async fn recompute_balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.store.sum_transactions(user_id).await
    }

    pub async fn recent_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        self.store.list_transactions(user_id, limit.clamp(1, 100)).await
    }

    /// Expire the excess over the monthly allowance, then grant the allowance
    pub async fn rollover_period(&self, user_id: Uuid) -> BillingResult<PeriodRollover> {
        let rollover = self.store.rollover_period(user_id).await?;

        tracing::info!(
            user_id = %user_id,
            balance_before = rollover.balance_before,
            expired = rollover.expired(),
            allocated = rollover.allocation.amount,
            balance_after = rollover.balance_after,
            "Credit period rolled over"
        );

        Ok(rollover)
    }
}
