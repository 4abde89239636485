//! Checkout session initiation

use std::collections::HashMap;
use std::sync::Arc;

use gradewise_shared::{OwnerRef, OwnerType, SubscriptionTier};

use crate::client::{CheckoutSessionRequest, PaymentProcessor, ProcessorSession, StripeConfig};
use crate::context::BillingContextResolver;
use crate::error::{BillingError, BillingResult};
use crate::store::{Principal, SharedStore};

/// Metadata attached to customers, sessions and subscriptions so webhook
/// events can be attributed to their owner
pub fn owner_metadata(owner: OwnerRef) -> HashMap<String, String> {
    HashMap::from([
        ("owner_type".to_string(), owner.owner_type.as_str().to_string()),
        ("owner_id".to_string(), owner.owner_id.to_string()),
    ])
}

#[derive(Clone)]
pub struct CheckoutService {
    store: SharedStore,
    processor: Arc<dyn PaymentProcessor>,
    config: StripeConfig,
    resolver: BillingContextResolver,
}

impl CheckoutService {
    pub fn new(store: SharedStore, processor: Arc<dyn PaymentProcessor>, config: StripeConfig) -> Self {
        Self {
            resolver: BillingContextResolver::new(store.clone()),
            store,
            processor,
            config,
        }
    }

    /// Start a checkout for `tier` on behalf of `owner`
    pub async fn create_checkout_session(
        &self,
        principal: &Principal,
        owner: OwnerRef,
        tier: SubscriptionTier,
    ) -> BillingResult<ProcessorSession> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidTier(tier));
        }
        self.resolver
            .authorize_billing_management(principal, owner)
            .await?;

        let price_id = self
            .config
            .price_id_for_tier(tier)
            .ok_or_else(|| BillingError::Config(format!("no price configured for {}", tier)))?
            .to_string();

        let record = self.resolver.ensure_subscription(owner).await?;
        let customer_id = match record.processor_customer_id {
            Some(id) => id,
            None => self.create_customer(principal, owner).await?,
        };

        let mut metadata = owner_metadata(owner);
        metadata.insert("tier".to_string(), tier.as_str().to_string());

        let session = self
            .processor
            .create_checkout_session(CheckoutSessionRequest {
                customer_id: customer_id.clone(),
                price_id,
                success_url: self.config.success_url(),
                cancel_url: self.config.cancel_url(),
                metadata,
            })
            .await?;

        tracing::info!(
            owner = %owner,
            tier = %tier,
            customer_id = %customer_id,
            session_id = %session.id,
            "Created checkout session"
        );
        Ok(session)
    }

    /// Create a processor customer and record it unless another checkout
    /// got there first. Returns the id on record.
    async fn create_customer(&self, principal: &Principal, owner: OwnerRef) -> BillingResult<String> {
        let name = match owner.owner_type {
            OwnerType::Org => self
                .store
                .get_organization(owner.owner_id)
                .await?
                .map(|org| org.name),
            OwnerType::User => Some(principal.display_name.clone()).filter(|n| !n.is_empty()),
        };

        let created = self
            .processor
            .create_customer(&principal.email, name.as_deref(), owner_metadata(owner))
            .await?;
        let recorded = self.store.set_customer_id_if_absent(owner, &created).await?;

        if recorded != created {
            tracing::warn!(
                owner = %owner,
                created = %created,
                recorded = %recorded,
                "Concurrent checkout recorded a different customer; using the recorded one"
            );
        } else {
            tracing::info!(owner = %owner, customer_id = %created, "Created payment customer");
        }
        Ok(recorded)
    }
}
