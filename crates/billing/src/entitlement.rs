//! Entitlement gate
//!
//! Every gated operation passes through [`EntitlementGate`] with a resolved
//! [`BillingContext`]. Checks run in a fixed order and stop at the first
//! denial:
//!
//! 1. billing active (paid tiers only)
//! 2. usage limits for the requested increments, as a batch, against the
//!    owner's stored counters
//! 3. module or minimum-tier capability
//!
//! Only after all three pass are the increments committed, through the
//! store's atomic conditional update. A denial never leaves a partial
//! increment behind.

use std::future::Future;

use gradewise_shared::SubscriptionTier;

use crate::context::BillingContext;
use crate::error::{BillingError, BillingResult};
use crate::plans::{ModuleKey, Plan};
use crate::store::SharedStore;
use crate::usage::{normalize_deltas, UsageDelta, UsageMeter};

#[derive(Clone)]
pub struct EntitlementGate {
    meter: UsageMeter,
}

impl EntitlementGate {
    pub fn new(store: SharedStore) -> Self {
        Self {
            meter: UsageMeter::new(store),
        }
    }

    pub fn meter(&self) -> &UsageMeter {
        &self.meter
    }

    /// Allow `module` for `ctx` and charge `deltas` against the owner's quota.
    ///
    /// Returns the context with the committed counters.
    pub async fn require_module(
        &self,
        module: ModuleKey,
        ctx: BillingContext,
        deltas: &[UsageDelta],
    ) -> BillingResult<BillingContext> {
        let result = self.check_and_commit(module, ctx, deltas).await;
        if let Err(err) = &result {
            tracing::info!(
                module = %module,
                code = err.code(),
                error = %err,
                "Entitlement denied"
            );
        }
        result
    }

    /// Same as [`EntitlementGate::require_module`] for a module key that
    /// arrived as a string. Keys outside the allow-list are `UNKNOWN_MODULE`.
    pub async fn require_module_str(
        &self,
        module: &str,
        ctx: BillingContext,
        deltas: &[UsageDelta],
    ) -> BillingResult<BillingContext> {
        let module = module.parse::<ModuleKey>().inspect_err(|_| {
            tracing::warn!(module = %module, "Rejected unknown module key");
        })?;
        self.require_module(module, ctx, deltas).await
    }

    /// Allow the request only if the context's tier is at least `min_tier`
    pub async fn require_tier(
        &self,
        min_tier: SubscriptionTier,
        ctx: BillingContext,
    ) -> BillingResult<BillingContext> {
        ensure_billing_active(&ctx)?;

        if !ctx.tier.at_least(min_tier) {
            return Err(BillingError::UpgradeRequired {
                required_tier: min_tier,
                module: None,
                current_tier: ctx.tier,
            });
        }
        Ok(ctx)
    }

    /// Run `op` only when the gate allows the request
    pub async fn run_gated<T, F, Fut>(
        &self,
        module: ModuleKey,
        ctx: BillingContext,
        deltas: &[UsageDelta],
        op: F,
    ) -> BillingResult<T>
    where
        F: FnOnce(BillingContext) -> Fut,
        Fut: Future<Output = BillingResult<T>>,
    {
        let ctx = self.require_module(module, ctx, deltas).await?;
        op(ctx).await
    }

    async fn check_and_commit(
        &self,
        module: ModuleKey,
        mut ctx: BillingContext,
        deltas: &[UsageDelta],
    ) -> BillingResult<BillingContext> {
        ensure_billing_active(&ctx)?;

        let deltas = normalize_deltas(deltas)?;
        if !deltas.is_empty() {
            ctx.usage = self.meter.get(ctx.owner).await?;
            UsageMeter::check(&ctx.usage, ctx.tier, &deltas)?;
        }

        if !ctx.plan().includes(module) {
            return Err(BillingError::UpgradeRequired {
                required_tier: Plan::minimum_tier_for(module),
                module: Some(module),
                current_tier: ctx.tier,
            });
        }

        if !deltas.is_empty() {
            // Counters can move after the read; the store re-checks every limit.
            ctx.usage = self.meter.try_increment(ctx.owner, ctx.tier, &deltas).await?;
        }
        Ok(ctx)
    }
}

fn ensure_billing_active(ctx: &BillingContext) -> BillingResult<()> {
    if ctx.is_billing_active() {
        return Ok(());
    }
    Err(BillingError::BillingInactive {
        tier: ctx.tier,
        status: ctx.status,
        owner_type: ctx.owner.owner_type,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use gradewise_shared::{OwnerRef, SubscriptionStatus, UserRole};

    use super::*;
    use crate::context::ContextSource;
    use crate::plans::QuotaKey;
    use crate::store::{InMemoryBillingStore, UsageStore};
    use crate::usage::UsageCounters;

    fn context(
        store: &InMemoryBillingStore,
        tier: SubscriptionTier,
        status: SubscriptionStatus,
        usage: UsageCounters,
    ) -> BillingContext {
        let principal = store.create_user("gate@example.com", UserRole::Instructor);
        let owner = OwnerRef::user(principal.id);
        store.set_usage(owner, usage);
        BillingContext {
            owner,
            tier,
            status,
            usage,
            principal,
            source: ContextSource::Personal,
        }
    }

    #[tokio::test]
    async fn test_billing_inactive_beats_usage_and_capability() {
        let store = Arc::new(InMemoryBillingStore::new());
        let usage = UsageCounters {
            ai_grades: 10_000,
            ..Default::default()
        };
        let ctx = context(&store, SubscriptionTier::Basic, SubscriptionStatus::PastDue, usage);
        let gate = EntitlementGate::new(store);

        let err = gate
            .require_module(
                ModuleKey::LmsIntegration,
                ctx,
                &[UsageDelta::new(QuotaKey::AiGrades, 1)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BILLING_INACTIVE");
    }

    #[tokio::test]
    async fn test_usage_denial_beats_capability() {
        let store = Arc::new(InMemoryBillingStore::new());
        let usage = UsageCounters {
            plagiarism_scans: 0,
            ..Default::default()
        };
        let ctx = context(&store, SubscriptionTier::FreeTrial, SubscriptionStatus::Trialing, usage);
        let gate = EntitlementGate::new(store);

        // Free trial has neither the module nor any plagiarism scan quota
        let err = gate
            .require_module(
                ModuleKey::PlagiarismDetection,
                ctx,
                &[UsageDelta::new(QuotaKey::PlagiarismScans, 1)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "USAGE_LIMIT_EXCEEDED");
    }

    #[tokio::test]
    async fn test_usage_is_judged_on_stored_counters_not_snapshot() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ctx = context(
            &store,
            SubscriptionTier::FreeTrial,
            SubscriptionStatus::Trialing,
            UsageCounters::default(),
        );
        let owner = ctx.owner;
        let exhausted = UsageCounters {
            ai_grades: 50,
            ..Default::default()
        };
        store.set_usage(owner, exhausted);
        let gate = EntitlementGate::new(store.clone());

        // Analytics is outside the free trial too, but the quota is checked first
        let err = gate
            .require_module(
                ModuleKey::Analytics,
                ctx,
                &[UsageDelta::new(QuotaKey::AiGrades, 1)],
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "USAGE_LIMIT_EXCEEDED");
        assert_eq!(err.details()["current"], 50);
        assert_eq!(store.get_usage(owner).await.unwrap().unwrap(), exhausted);
    }

    #[tokio::test]
    async fn test_snapshot_over_limit_allows_after_period_reset() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ctx = context(
            &store,
            SubscriptionTier::FreeTrial,
            SubscriptionStatus::Trialing,
            UsageCounters {
                ai_grades: 50,
                ..Default::default()
            },
        );
        let owner = ctx.owner;
        let gate = EntitlementGate::new(store.clone());
        gate.meter().reset_period(owner).await.unwrap();

        let ctx = gate
            .require_module(
                ModuleKey::AiGrading,
                ctx,
                &[UsageDelta::new(QuotaKey::AiGrades, 1)],
            )
            .await
            .unwrap();
        assert_eq!(ctx.usage.ai_grades, 1);
    }

    #[tokio::test]
    async fn test_upgrade_required_names_minimum_tier() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ctx = context(
            &store,
            SubscriptionTier::Basic,
            SubscriptionStatus::Active,
            UsageCounters::default(),
        );
        let gate = EntitlementGate::new(store);

        let err = gate
            .require_module(ModuleKey::Analytics, ctx, &[])
            .await
            .unwrap_err();
        match err {
            BillingError::UpgradeRequired {
                required_tier,
                module,
                current_tier,
            } => {
                assert_eq!(required_tier, SubscriptionTier::Premium);
                assert_eq!(module, Some(ModuleKey::Analytics));
                assert_eq!(current_tier, SubscriptionTier::Basic);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_commits_and_returns_updated_usage() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ctx = context(
            &store,
            SubscriptionTier::Basic,
            SubscriptionStatus::Active,
            UsageCounters::default(),
        );
        let owner = ctx.owner;
        let gate = EntitlementGate::new(store.clone());

        let ctx = gate
            .require_module(
                ModuleKey::AiGrading,
                ctx,
                &[
                    UsageDelta::new(QuotaKey::AiGrades, 2),
                    UsageDelta::new(QuotaKey::AiGrades, 1),
                ],
            )
            .await
            .unwrap();
        assert_eq!(ctx.usage.ai_grades, 3);
        assert_eq!(store.get_usage(owner).await.unwrap().unwrap().ai_grades, 3);
    }

    #[tokio::test]
    async fn test_unknown_module_string_is_denied() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ctx = context(
            &store,
            SubscriptionTier::Enterprise,
            SubscriptionStatus::Active,
            UsageCounters::default(),
        );
        let gate = EntitlementGate::new(store);

        let err = gate
            .require_module_str("MIND_READING", ctx, &[])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_MODULE");
    }

    #[tokio::test]
    async fn test_require_tier() {
        let store = Arc::new(InMemoryBillingStore::new());
        let ctx = context(
            &store,
            SubscriptionTier::Premium,
            SubscriptionStatus::Active,
            UsageCounters::default(),
        );
        let gate = EntitlementGate::new(store);

        let ctx = gate
            .require_tier(SubscriptionTier::Basic, ctx)
            .await
            .unwrap();
        let err = gate
            .require_tier(SubscriptionTier::Enterprise, ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPGRADE_REQUIRED");
        assert_eq!(err.details()["required_tier"], "ENTERPRISE");
    }

    #[tokio::test]
    async fn test_run_gated_skips_operation_on_denial() {
        let store = Arc::new(InMemoryBillingStore::new());
        let usage = UsageCounters {
            ai_grades: 50,
            ..Default::default()
        };
        let ctx = context(&store, SubscriptionTier::FreeTrial, SubscriptionStatus::Trialing, usage);
        let gate = EntitlementGate::new(store);
        let ran = AtomicBool::new(false);

        let result = gate
            .run_gated(
                ModuleKey::AiGrading,
                ctx,
                &[UsageDelta::new(QuotaKey::AiGrades, 1)],
                |_ctx| async {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;
        assert_eq!(result.unwrap_err().code(), "USAGE_LIMIT_EXCEEDED");
        assert!(!ran.load(Ordering::SeqCst));
    }
}
