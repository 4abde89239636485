//! Billing portal sessions

use std::sync::Arc;

use gradewise_shared::OwnerRef;

use crate::client::{PaymentProcessor, ProcessorSession, StripeConfig};
use crate::context::BillingContextResolver;
use crate::error::{BillingError, BillingResult};
use crate::store::{Principal, SharedStore};

#[derive(Clone)]
pub struct PortalService {
    store: SharedStore,
    processor: Arc<dyn PaymentProcessor>,
    config: StripeConfig,
    resolver: BillingContextResolver,
}

impl PortalService {
    pub fn new(store: SharedStore, processor: Arc<dyn PaymentProcessor>, config: StripeConfig) -> Self {
        Self {
            resolver: BillingContextResolver::new(store.clone()),
            store,
            processor,
            config,
        }
    }

    /// Portal URL for an owner that already has a processor customer
    pub async fn create_portal_session(
        &self,
        principal: &Principal,
        owner: OwnerRef,
    ) -> BillingResult<ProcessorSession> {
        self.resolver
            .authorize_billing_management(principal, owner)
            .await?;

        let customer_id = self
            .store
            .get_subscription(owner)
            .await?
            .and_then(|record| record.processor_customer_id)
            .ok_or(BillingError::NoBillingCustomer(owner))?;

        let session = self
            .processor
            .create_portal_session(&customer_id, &self.config.portal_return_url())
            .await?;

        tracing::info!(owner = %owner, customer_id = %customer_id, "Created billing portal session");
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use gradewise_shared::{SubscriptionTier, UserRole};

    use super::*;
    use crate::checkout::CheckoutService;
    use crate::client::PriceIds;
    use crate::mock::MockProcessor;
    use crate::store::InMemoryBillingStore;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                basic: "price_basic".to_string(),
                premium: "price_premium".to_string(),
                enterprise: "price_enterprise".to_string(),
            },
            app_base_url: "https://app.example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_portal_requires_customer() {
        let store = Arc::new(InMemoryBillingStore::new());
        let user = store.create_user("p@example.com", UserRole::Instructor);
        let owner = OwnerRef::user(user.id);
        let processor = Arc::new(MockProcessor::new());
        let portal = PortalService::new(store.clone(), processor.clone(), config());

        let err = portal.create_portal_session(&user, owner).await.unwrap_err();
        assert_eq!(err.code(), "NO_BILLING_CUSTOMER");

        CheckoutService::new(store, processor.clone(), config())
            .create_checkout_session(&user, owner, SubscriptionTier::Basic)
            .await
            .unwrap();

        let session = portal.create_portal_session(&user, owner).await.unwrap();
        assert!(session.url.starts_with("https://billing.mock.test/"));
        assert_eq!(processor.portal_customers().await.len(), 1);
    }
}
