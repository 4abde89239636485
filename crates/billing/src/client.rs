//! Payment processor client
//!
//! [`PaymentProcessor`] is the contract the engine needs from the external
//! processor. [`StripeClient`] implements it over `async-stripe`; the
//! in-memory `MockProcessor` (feature `test-utils`) implements it for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use gradewise_shared::SubscriptionTier;
use serde::Serialize;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CreateCustomer, Customer, CustomerId, Subscription, SubscriptionId,
};

use crate::error::{BillingError, BillingResult};

/// Processor price ids per paid tier
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub basic: String,
    pub premium: String,
    pub enterprise: String,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    /// Public base URL of the app, used for checkout and portal redirects
    pub app_base_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            secret_key: required_env("STRIPE_SECRET_KEY")?,
            webhook_secret: required_env("STRIPE_WEBHOOK_SECRET")?,
            price_ids: PriceIds {
                basic: required_env("STRIPE_PRICE_BASIC")?,
                premium: required_env("STRIPE_PRICE_PREMIUM")?,
                enterprise: required_env("STRIPE_PRICE_ENTERPRISE")?,
            },
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }

    pub fn price_id_for_tier(&self, tier: SubscriptionTier) -> Option<&str> {
        let id = match tier {
            SubscriptionTier::FreeTrial => return None,
            SubscriptionTier::Basic => &self.price_ids.basic,
            SubscriptionTier::Premium => &self.price_ids.premium,
            SubscriptionTier::Enterprise => &self.price_ids.enterprise,
        };
        (!id.is_empty()).then_some(id.as_str())
    }

    /// Reverse of [`StripeConfig::price_id_for_tier`]
    pub fn tier_for_price_id(&self, price_id: &str) -> Option<SubscriptionTier> {
        SubscriptionTier::ALL
            .into_iter()
            .find(|tier| self.price_id_for_tier(*tier) == Some(price_id))
    }

    pub fn success_url(&self) -> String {
        format!(
            "{}/billing/success?session_id={{CHECKOUT_SESSION_ID}}",
            self.app_base_url.trim_end_matches('/')
        )
    }

    pub fn cancel_url(&self) -> String {
        format!("{}/billing/cancel", self.app_base_url.trim_end_matches('/'))
    }

    pub fn portal_return_url(&self) -> String {
        format!("{}/billing", self.app_base_url.trim_end_matches('/'))
    }
}

fn required_env(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} must be set", name)))
}

// =============================================================================
// Contract
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    /// Copied onto both the session and the subscription it creates
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorSession {
    pub id: String,
    pub url: String,
}

/// Subscription as reported by the processor, before any mapping
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    /// Raw processor status, e.g. `past_due`
    pub status: String,
    pub price_id: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Unix seconds
    pub current_period_end: Option<i64>,
    pub cancel_at_period_end: bool,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProcessorSession>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<ProcessorSession>;

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription>;
}

// =============================================================================
// Stripe
// =============================================================================

#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_customer(
        &self,
        email: &str,
        name: Option<&str>,
        metadata: HashMap<String, String>,
    ) -> BillingResult<String> {
        let mut params = CreateCustomer::new();
        params.email = Some(email);
        params.name = name;
        params.metadata = Some(metadata);

        let customer = Customer::create(&self.inner, params).await?;
        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProcessorSession> {
        let customer_id = request
            .customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::Processor(format!("Invalid customer ID: {}", e)))?;

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(CheckoutSessionMode::Subscription);
        params.success_url = Some(&request.success_url);
        params.cancel_url = Some(&request.cancel_url);
        params.customer = Some(customer_id);
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(request.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(request.metadata.clone());
        params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
            metadata: Some(request.metadata.clone()),
            ..Default::default()
        });

        let session = CheckoutSession::create(&self.inner, params).await?;
        let url = session
            .url
            .ok_or_else(|| BillingError::Processor("Checkout session has no URL".to_string()))?;

        Ok(ProcessorSession {
            id: session.id.to_string(),
            url,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<ProcessorSession> {
        let customer_id = customer_id
            .parse::<CustomerId>()
            .map_err(|e| BillingError::Processor(format!("Invalid customer ID: {}", e)))?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(&self.inner, params).await?;
        Ok(ProcessorSession {
            id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::Processor(format!("Invalid subscription ID: {}", e)))?;

        let sub = Subscription::retrieve(&self.inner, &sub_id, &[]).await?;
        let price_id = sub
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        Ok(ProcessorSubscription {
            id: sub.id.to_string(),
            customer_id: Some(sub.customer.id().to_string()),
            status: sub.status.to_string(),
            price_id,
            metadata: sub.metadata.clone(),
            current_period_end: Some(sub.current_period_end),
            cancel_at_period_end: sub.cancel_at_period_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                basic: "price_basic".to_string(),
                premium: "price_premium".to_string(),
                enterprise: String::new(),
            },
            app_base_url: "https://app.example.com/".to_string(),
        }
    }

    #[test]
    fn test_price_tier_mapping() {
        let config = config();
        assert_eq!(
            config.price_id_for_tier(SubscriptionTier::Premium),
            Some("price_premium")
        );
        assert_eq!(config.price_id_for_tier(SubscriptionTier::FreeTrial), None);
        // Unconfigured tiers have no price
        assert_eq!(config.price_id_for_tier(SubscriptionTier::Enterprise), None);
        assert_eq!(
            config.tier_for_price_id("price_basic"),
            Some(SubscriptionTier::Basic)
        );
        assert_eq!(config.tier_for_price_id("price_unknown"), None);
        assert_eq!(config.tier_for_price_id(""), None);
    }

    #[test]
    fn test_redirect_urls() {
        let config = config();
        assert_eq!(config.cancel_url(), "https://app.example.com/billing/cancel");
        assert!(config
            .success_url()
            .ends_with("/billing/success?session_id={CHECKOUT_SESSION_ID}"));
    }
}
