// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries structured denial details
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Gradewise Billing
//!
//! Subscription entitlement and usage metering for users and organizations.
//!
//! ## Features
//!
//! - **Plan Catalog**: Static tier table of modules and quota limits
//! - **Context Resolution**: Decide whether a user or one of their organizations pays
//! - **Entitlement Gate**: Billing status, usage and capability checks before gated work
//! - **Usage Metering**: Atomic check-and-increment of per-owner counters
//! - **Credit Ledger**: Append-only credit transactions with a cached balance
//! - **Checkout & Portal**: Payment processor sessions for upgrades and self-service
//! - **Webhooks**: Signed subscription lifecycle events, applied idempotently
//! - **Invariants**: Runnable consistency checks

pub mod checkout;
pub mod client;
pub mod context;
pub mod credits;
pub mod entitlement;
pub mod error;
pub mod invariants;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod plans;
pub mod portal;
pub mod store;
pub mod usage;
pub mod webhooks;


// Checkout
pub use checkout::{owner_metadata, CheckoutService};

// Client
pub use client::{
    CheckoutSessionRequest, PaymentProcessor, PriceIds, ProcessorSession, ProcessorSubscription,
    StripeClient, StripeConfig,
};

// Context
pub use context::{BillingContext, BillingContextResolver, ContextSource};

// Credits
pub use credits::{CreditKind, CreditLedger, CreditTransaction, PeriodRollover};

// Entitlement
pub use entitlement::EntitlementGate;

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Mock processor
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockProcessor;

// Plans
pub use plans::{ModuleKey, Plan, QuotaKey, QuotaLimits, UNLIMITED};

// Portal
pub use portal::PortalService;

// Store
pub use store::{
    BillingStore, InMemoryBillingStore, PgBillingStore, Principal, SharedStore,
    SubscriptionRecord,
};

// Usage
pub use usage::{UsageCounters, UsageDelta, UsageMeter};

// Webhooks
pub use webhooks::{WebhookDisposition, WebhookEventRecord, WebhookHandler};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: SharedStore,
    pub resolver: BillingContextResolver,
    pub gate: EntitlementGate,
    pub usage: UsageMeter,
    pub credits: CreditLedger,
    pub checkout: CheckoutService,
    pub portal: PortalService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables, backed by Postgres and Stripe
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let config = stripe.config().clone();
        let store: SharedStore = Arc::new(PgBillingStore::new(pool));

        Ok(Self::new(config, store, Arc::new(stripe)))
    }

    /// Create a new billing service with explicit config and collaborators
    pub fn new(
        config: StripeConfig,
        store: SharedStore,
        processor: Arc<dyn PaymentProcessor>,
    ) -> Self {
        Self {
            resolver: BillingContextResolver::new(store.clone()),
            gate: EntitlementGate::new(store.clone()),
            usage: UsageMeter::new(store.clone()),
            credits: CreditLedger::new(store.clone()),
            checkout: CheckoutService::new(store.clone(), processor.clone(), config.clone()),
            portal: PortalService::new(store.clone(), processor.clone(), config.clone()),
            webhooks: WebhookHandler::new(store.clone(), processor, config),
            invariants: InvariantChecker::new(store.clone()),
            store,
        }
    }
}
