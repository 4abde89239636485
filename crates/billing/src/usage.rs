//! Usage counters and metering
//!
//! Counters are per billing owner. The only write path that can push a
//! counter towards its limit is [`UsageMeter::try_increment`], which the
//! store implements as one atomic conditional update per owner.

use std::collections::BTreeMap;

use gradewise_shared::{OwnerRef, SubscriptionTier};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::plans::{within_limit, Plan, QuotaKey};
use crate::store::SharedStore;

/// Snapshot of an owner's counters
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow,
)]
#[serde(rename_all = "camelCase")]
pub struct UsageCounters {
    pub courses: i64,
    pub assignments: i64,
    pub ai_grades: i64,
    pub plagiarism_scans: i64,
    pub students: i64,
    pub monthly_credits: i64,
}

impl UsageCounters {
    pub fn get(&self, key: QuotaKey) -> i64 {
        match key {
            QuotaKey::Courses => self.courses,
            QuotaKey::Assignments => self.assignments,
            QuotaKey::AiGrades => self.ai_grades,
            QuotaKey::PlagiarismScans => self.plagiarism_scans,
            QuotaKey::Students => self.students,
            QuotaKey::MonthlyCredits => self.monthly_credits,
        }
    }

    fn slot(&mut self, key: QuotaKey) -> &mut i64 {
        match key {
            QuotaKey::Courses => &mut self.courses,
            QuotaKey::Assignments => &mut self.assignments,
            QuotaKey::AiGrades => &mut self.ai_grades,
            QuotaKey::PlagiarismScans => &mut self.plagiarism_scans,
            QuotaKey::Students => &mut self.students,
            QuotaKey::MonthlyCredits => &mut self.monthly_credits,
        }
    }

    pub fn add(&mut self, key: QuotaKey, amount: i64) {
        let slot = self.slot(key);
        *slot = slot.saturating_add(amount);
    }

    pub fn set(&mut self, key: QuotaKey, value: i64) {
        *self.slot(key) = value;
    }

    /// Zero the counters that reset at each billing period
    pub fn reset_period(&mut self) {
        for key in QuotaKey::ALL {
            if key.resets_each_period() {
                self.set(key, 0);
            }
        }
    }
}

/// Requested increment for one quota key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub key: QuotaKey,
    pub increment: i64,
}

impl UsageDelta {
    pub fn new(key: QuotaKey, increment: i64) -> Self {
        Self { key, increment }
    }
}

/// Increment paired with the limit the store must enforce while applying it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitedDelta {
    pub key: QuotaKey,
    pub increment: i64,
    pub limit: i64,
}

/// Result of a conditional increment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncrementOutcome {
    Applied(UsageCounters),
    LimitExceeded {
        key: QuotaKey,
        current: i64,
        limit: i64,
        requested: i64,
    },
}

/// First delta in `deltas` that does not fit `counters`, if any
pub fn first_violation(counters: &UsageCounters, deltas: &[LimitedDelta]) -> Option<IncrementOutcome> {
    deltas.iter().find_map(|d| {
        let current = counters.get(d.key);
        if within_limit(d.limit, current, d.increment) {
            None
        } else {
            Some(IncrementOutcome::LimitExceeded {
                key: d.key,
                current,
                limit: d.limit,
                requested: d.increment,
            })
        }
    })
}

/// Merge duplicate keys, drop zero increments and reject negative ones.
///
/// Output is ordered by key so every caller locks and checks in the same order.
pub fn normalize_deltas(deltas: &[UsageDelta]) -> BillingResult<Vec<UsageDelta>> {
    let mut merged: BTreeMap<QuotaKey, i64> = BTreeMap::new();
    for delta in deltas {
        if delta.increment < 0 {
            return Err(BillingError::InvalidRequest(format!(
                "usage increment for {} must not be negative",
                delta.key
            )));
        }
        let entry = merged.entry(delta.key).or_insert(0);
        *entry = entry.saturating_add(delta.increment);
    }
    Ok(merged
        .into_iter()
        .filter(|(_, increment)| *increment > 0)
        .map(|(key, increment)| UsageDelta::new(key, increment))
        .collect())
}

/// Attach the tier's limits to a set of deltas
pub fn with_limits(tier: SubscriptionTier, deltas: &[UsageDelta]) -> Vec<LimitedDelta> {
    let plan = Plan::for_tier(tier);
    deltas
        .iter()
        .map(|d| LimitedDelta {
            key: d.key,
            increment: d.increment,
            limit: plan.limit(d.key),
        })
        .collect()
}

/// Usage meter over the usage counter store
#[derive(Clone)]
pub struct UsageMeter {
    store: SharedStore,
}

impl UsageMeter {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Current counters, zeros when the owner has none yet
    pub async fn get(&self, owner: OwnerRef) -> BillingResult<UsageCounters> {
        Ok(self.store.get_usage(owner).await?.unwrap_or_default())
    }

    /// Non-authoritative pre-check against a snapshot. The commit in
    /// [`UsageMeter::try_increment`] re-checks atomically.
    pub fn check(
        counters: &UsageCounters,
        tier: SubscriptionTier,
        deltas: &[UsageDelta],
    ) -> BillingResult<()> {
        match first_violation(counters, &with_limits(tier, deltas)) {
            Some(outcome) => Err(limit_error(outcome, tier)),
            None => Ok(()),
        }
    }

    /// Atomically apply every delta or none of them
    pub async fn try_increment(
        &self,
        owner: OwnerRef,
        tier: SubscriptionTier,
        deltas: &[UsageDelta],
    ) -> BillingResult<UsageCounters> {
        let deltas = normalize_deltas(deltas)?;
        if deltas.is_empty() {
            return self.get(owner).await;
        }

        let limited = with_limits(tier, &deltas);
        match self.store.try_increment(owner, &limited).await? {
            IncrementOutcome::Applied(counters) => {
                tracing::debug!(
                    owner = %owner,
                    tier = %tier,
                    deltas = ?deltas,
                    "Usage increment committed"
                );
                Ok(counters)
            }
            outcome => {
                let err = limit_error(outcome, tier);
                tracing::info!(owner = %owner, error = %err, "Usage increment rejected");
                Err(err)
            }
        }
    }

    /// Zero the per-period counters for an owner
    pub async fn reset_period(&self, owner: OwnerRef) -> BillingResult<()> {
        self.store.reset_period(owner).await
    }
}

fn limit_error(outcome: IncrementOutcome, tier: SubscriptionTier) -> BillingError {
    match outcome {
        IncrementOutcome::LimitExceeded {
            key,
            current,
            limit,
            requested,
        } => BillingError::UsageLimitExceeded {
            key,
            current,
            limit,
            requested,
            tier,
        },
        IncrementOutcome::Applied(_) => {
            BillingError::Internal("applied increment reported as a limit failure".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_merges_and_sorts() {
        let deltas = normalize_deltas(&[
            UsageDelta::new(QuotaKey::PlagiarismScans, 1),
            UsageDelta::new(QuotaKey::AiGrades, 2),
            UsageDelta::new(QuotaKey::AiGrades, 3),
            UsageDelta::new(QuotaKey::Courses, 0),
        ])
        .unwrap();
        assert_eq!(
            deltas,
            vec![
                UsageDelta::new(QuotaKey::AiGrades, 5),
                UsageDelta::new(QuotaKey::PlagiarismScans, 1),
            ]
        );
    }

    #[test]
    fn test_normalize_rejects_negative() {
        let err = normalize_deltas(&[UsageDelta::new(QuotaKey::AiGrades, -1)]).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn test_check_reports_current_and_limit() {
        let counters = UsageCounters {
            ai_grades: 50,
            ..Default::default()
        };
        let err = UsageMeter::check(
            &counters,
            SubscriptionTier::FreeTrial,
            &[UsageDelta::new(QuotaKey::AiGrades, 1)],
        )
        .unwrap_err();
        match err {
            BillingError::UsageLimitExceeded {
                key,
                current,
                limit,
                ..
            } => {
                assert_eq!(key, QuotaKey::AiGrades);
                assert_eq!(current, 50);
                assert_eq!(limit, 50);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_check_ignores_unlimited() {
        let counters = UsageCounters {
            ai_grades: 1_000_000,
            ..Default::default()
        };
        assert!(UsageMeter::check(
            &counters,
            SubscriptionTier::Enterprise,
            &[UsageDelta::new(QuotaKey::AiGrades, 1)],
        )
        .is_ok());
    }

    #[test]
    fn test_reset_period_keeps_standing_totals() {
        let mut counters = UsageCounters {
            courses: 3,
            students: 40,
            ai_grades: 12,
            plagiarism_scans: 4,
            monthly_credits: 90,
            assignments: 7,
        };
        counters.reset_period();
        assert_eq!(counters.courses, 3);
        assert_eq!(counters.students, 40);
        assert_eq!(counters.assignments, 7);
        assert_eq!(counters.ai_grades, 0);
        assert_eq!(counters.plagiarism_scans, 0);
        assert_eq!(counters.monthly_credits, 0);
    }
}
