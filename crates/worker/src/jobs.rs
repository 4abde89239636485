//! Scheduled billing jobs
//!
//! Each job walks every owner it applies to and keeps going past
//! individual failures; the summary says how many succeeded.

use gradewise_billing::{
    BillingResult, CreditLedger, InvariantCheckSummary, InvariantChecker, SharedStore, UsageMeter,
};
use tracing::{error, info, warn};

/// Outcome of one pass over a set of owners
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobSummary {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct BillingJobs {
    store: SharedStore,
    credits: CreditLedger,
    usage: UsageMeter,
    invariants: InvariantChecker,
}

impl BillingJobs {
    pub fn new(store: SharedStore) -> Self {
        Self {
            credits: CreditLedger::new(store.clone()),
            usage: UsageMeter::new(store.clone()),
            invariants: InvariantChecker::new(store.clone()),
            store,
        }
    }

    /// Expire credits above each user's allowance and grant the new allowance
    pub async fn rollover_credits(&self) -> BillingResult<JobSummary> {
        let users = self.store.list_credit_users().await?;
        let mut summary = JobSummary::default();

        for user_id in users {
            match self.credits.rollover_period(user_id).await {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Credit rollover failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            "Credit rollover complete"
        );
        Ok(summary)
    }

    /// Zero the per-period usage counters of every owner
    pub async fn reset_usage_periods(&self) -> BillingResult<JobSummary> {
        let owners = self.store.list_usage_owners().await?;
        let mut summary = JobSummary::default();

        for owner in owners {
            match self.usage.reset_period(owner).await {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    error!(owner = %owner, error = %e, "Usage period reset failed");
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            "Usage period reset complete"
        );
        Ok(summary)
    }

    pub async fn check_invariants(&self) -> BillingResult<InvariantCheckSummary> {
        let summary = self.invariants.run_all_checks().await?;

        if summary.healthy {
            info!(checks_run = summary.checks_run, "Billing invariants healthy");
        } else {
            for violation in &summary.violations {
                warn!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    subjects = ?violation.subject_ids,
                    description = %violation.description,
                    "Billing invariant violated"
                );
            }
            error!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant check failed"
            );
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gradewise_billing::{InMemoryBillingStore, UsageCounters};
    use gradewise_shared::{OwnerRef, UserRole};

    use super::*;

    #[tokio::test]
    async fn test_rollover_covers_every_user() {
        let store = Arc::new(InMemoryBillingStore::new());
        let heavy = store.create_user("heavy@example.com", UserRole::Instructor);
        let light = store.create_user("light@example.com", UserRole::Instructor);
        store.set_monthly_credits(heavy.id, 100).unwrap();
        store.set_monthly_credits(light.id, 100).unwrap();

        let ledger = CreditLedger::new(store.clone());
        ledger.purchase(heavy.id, 400, "Credit pack").await.unwrap();

        let jobs = BillingJobs::new(store.clone());
        let summary = jobs.rollover_credits().await.unwrap();

        assert_eq!(summary, JobSummary { processed: 2, failed: 0 });
        // 400 -> 100 kept + 100 allowance
        assert_eq!(ledger.get_balance(heavy.id).await.unwrap(), 200);
        assert_eq!(ledger.get_balance(light.id).await.unwrap(), 100);
        assert!(jobs.check_invariants().await.unwrap().healthy);
    }

    #[tokio::test]
    async fn test_usage_reset_keeps_standing_totals() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.create_user("reset@example.com", UserRole::Instructor);
        let owner = OwnerRef::user(user.id);
        store.set_usage(
            owner,
            UsageCounters {
                courses: 3,
                students: 40,
                ai_grades: 45,
                plagiarism_scans: 7,
                ..Default::default()
            },
        );

        let jobs = BillingJobs::new(store.clone());
        let summary = jobs.reset_usage_periods().await.unwrap();
        assert_eq!(summary.processed, 1);

        let counters = UsageMeter::new(store).get(owner).await.unwrap();
        assert_eq!(counters.courses, 3);
        assert_eq!(counters.students, 40);
        assert_eq!(counters.ai_grades, 0);
        assert_eq!(counters.plagiarism_scans, 0);
    }

    #[tokio::test]
    async fn test_invariant_job_reports_drift() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.create_user("drift@example.com", UserRole::Instructor);
        CreditLedger::new(store.clone())
            .purchase(user.id, 50, "Credit pack")
            .await
            .unwrap();
        store.overwrite_cached_balance(user.id, 75).unwrap();

        let summary = BillingJobs::new(store).check_invariants().await.unwrap();
        assert!(!summary.healthy);
        assert_eq!(summary.violations[0].invariant, "ledger_balance_matches");
    }
}
