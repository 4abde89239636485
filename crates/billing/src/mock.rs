//! In-memory payment processor for tests and local runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::client::{
    CheckoutSessionRequest, PaymentProcessor, ProcessorSession, ProcessorSubscription,
};
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct MockState {
    next_id: AtomicU64,
    /// customer id -> email
    customers: DashMap<String, String>,
    checkout_requests: Mutex<Vec<CheckoutSessionRequest>>,
    portal_customers: Mutex<Vec<String>>,
    subscriptions: DashMap<String, ProcessorSubscription>,
    pending_retrieve_failures: AtomicU32,
    retrieve_calls: AtomicU32,
}

#[derive(Clone, Default)]
pub struct MockProcessor {
    state: Arc<MockState>,
}

impl MockProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_id(&self, prefix: &str) -> String {
        let n = self.state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}_mock_{}", prefix, n)
    }

    pub fn customer_count(&self) -> usize {
        self.state.customers.len()
    }

    pub async fn checkout_requests(&self) -> Vec<CheckoutSessionRequest> {
        self.state.checkout_requests.lock().await.clone()
    }

    pub async fn portal_customers(&self) -> Vec<String> {
        self.state.portal_customers.lock().await.clone()
    }

    /// Make a subscription retrievable by id
    pub fn put_subscription(&self, subscription: ProcessorSubscription) {
        self.state
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Fail the next `n` subscription retrievals with a processor error
    pub fn fail_next_retrievals(&self, n: u32) {
        self.state
            .pending_retrieve_failures
            .store(n, Ordering::SeqCst);
    }

    pub fn retrieve_calls(&self) -> u32 {
        self.state.retrieve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentProcessor for MockProcessor {
    async fn create_customer(
        &self,
        email: &str,
        _name: Option<&str>,
        _metadata: HashMap<String, String>,
    ) -> BillingResult<String> {
        let id = self.make_id("cus");
        self.state.customers.insert(id.clone(), email.to_string());
        Ok(id)
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<ProcessorSession> {
        if !self.state.customers.contains_key(&request.customer_id) {
            return Err(BillingError::Processor(format!(
                "No such customer: {}",
                request.customer_id
            )));
        }
        let id = self.make_id("cs");
        self.state.checkout_requests.lock().await.push(request);
        Ok(ProcessorSession {
            url: format!("https://checkout.mock.test/{}", id),
            id,
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        _return_url: &str,
    ) -> BillingResult<ProcessorSession> {
        let id = self.make_id("bps");
        self.state
            .portal_customers
            .lock()
            .await
            .push(customer_id.to_string());
        Ok(ProcessorSession {
            url: format!("https://billing.mock.test/{}", id),
            id,
        })
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        self.state.retrieve_calls.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .state
            .pending_retrieve_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(BillingError::Processor(
                "simulated processor outage".to_string(),
            ));
        }

        self.state
            .subscriptions
            .get(subscription_id)
            .map(|s| s.clone())
            .ok_or_else(|| BillingError::Processor(format!("No such subscription: {}", subscription_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkout_requires_known_customer() {
        let mock = MockProcessor::new();
        let request = CheckoutSessionRequest {
            customer_id: "cus_unknown".to_string(),
            price_id: "price_basic".to_string(),
            success_url: "https://example.test/ok".to_string(),
            cancel_url: "https://example.test/cancel".to_string(),
            metadata: HashMap::new(),
        };
        assert!(mock.create_checkout_session(request.clone()).await.is_err());

        let customer = mock
            .create_customer("a@example.test", None, HashMap::new())
            .await
            .unwrap();
        let session = mock
            .create_checkout_session(CheckoutSessionRequest {
                customer_id: customer,
                ..request
            })
            .await
            .unwrap();
        assert!(session.url.starts_with("https://checkout.mock.test/cs_mock_"));
        assert_eq!(mock.checkout_requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_simulated_retrieve_failures() {
        let mock = MockProcessor::new();
        mock.put_subscription(ProcessorSubscription {
            id: "sub_1".to_string(),
            status: "active".to_string(),
            ..Default::default()
        });
        mock.fail_next_retrievals(1);

        assert!(mock.retrieve_subscription("sub_1").await.is_err());
        assert_eq!(
            mock.retrieve_subscription("sub_1").await.unwrap().status,
            "active"
        );
        assert_eq!(mock.retrieve_calls(), 2);
    }
}
