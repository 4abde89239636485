//! Payment processor webhook handling
//!
//! Verifies the `t=…,v1=…` signature before touching the payload, claims the
//! event id in the webhook event log, then applies subscription lifecycle
//! events to the subscription store. Upserts key on the billing owner and
//! are guarded by the event timestamp, so redelivery converges.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use gradewise_shared::{OwnerRef, OwnerType, ParseEnumError, SubscriptionStatus, SubscriptionTier};
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::client::{PaymentProcessor, ProcessorSubscription, StripeConfig};
use crate::error::{BillingError, BillingResult};
use crate::store::{ProcessorSubscriptionState, SharedStore, SubscriptionRecord};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed payload, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A delivery stuck in `processing` longer than this may be claimed again
pub const PROCESSING_TIMEOUT_MINUTES: i64 = 30;

// =============================================================================
// Signature verification
// =============================================================================

fn compute_signature(payload: &str, timestamp: i64, secret: &str) -> BillingResult<String> {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Build a signature header the way the processor does
pub fn signature_header(payload: &str, secret: &str, timestamp: i64) -> BillingResult<String> {
    Ok(format!(
        "t={},v1={}",
        timestamp,
        compute_signature(payload, timestamp, secret)?
    ))
}

/// Check `header` against `payload` at unix time `now`.
///
/// Any one matching `v1` entry is accepted. The payload is never parsed here.
pub fn verify_signature(payload: &str, header: &str, secret: &str, now: i64) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::InvalidSignature
    })?;
    if candidates.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::InvalidSignature);
    }

    if now.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::InvalidSignature);
    }

    let expected = compute_signature(payload, timestamp, secret)?;
    let matched = candidates
        .iter()
        .any(|candidate| bool::from(expected.as_bytes().ct_eq(candidate.as_bytes())));

    if matched {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::InvalidSignature)
    }
}

// =============================================================================
// Event log records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingResult {
    Processing,
    Success,
    Error,
}

impl ProcessingResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingResult::Processing => "processing",
            ProcessingResult::Success => "success",
            ProcessingResult::Error => "error",
        }
    }
}

impl FromStr for ProcessingResult {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ProcessingResult::Processing),
            "success" => Ok(ProcessingResult::Success),
            "error" => Ok(ProcessingResult::Error),
            other => Err(ParseEnumError::new("processing result", other)),
        }
    }
}

/// How a claimed event finished
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEventOutcome {
    pub result: ProcessingResult,
    pub owner: Option<OwnerRef>,
    pub error_message: Option<String>,
    pub details: Value,
}

impl WebhookEventOutcome {
    pub fn succeeded(owner: Option<OwnerRef>) -> Self {
        Self {
            result: ProcessingResult::Success,
            owner,
            error_message: None,
            details: json!({}),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            result: ProcessingResult::Error,
            owner: None,
            error_message: Some(message.into()),
            details: json!({}),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Stored webhook event log entry
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub owner: Option<OwnerRef>,
    pub processing_result: ProcessingResult,
    pub error_message: Option<String>,
    pub details: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

// =============================================================================
// Payload shapes
// =============================================================================

// async-stripe 0.39 types do not deserialize payloads from newer Stripe API
// versions (period end moved onto items, invoice subscription moved under
// `parent`), so events are read through these minimal shapes instead.

/// Envelope of a processor event. Only the fields the handler reads.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

/// Id field that may arrive bare or expanded into an object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Expandable::Id(id) | Expandable::Object { id } => id,
        }
    }
}

/// Subscription payload, tolerant of both legacy and item-level period fields
#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: Option<Expandable>,
    status: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    items: Option<ItemList>,
}

#[derive(Debug, Deserialize)]
struct ItemList {
    #[serde(default)]
    data: Vec<SubscriptionItem>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionItem {
    price: Option<PriceObject>,
    current_period_end: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PriceObject {
    id: String,
}

impl From<SubscriptionObject> for ProcessorSubscription {
    fn from(object: SubscriptionObject) -> Self {
        let first_item = object.items.and_then(|items| items.data.into_iter().next());
        // Newer API versions report the period end per item
        let item_period_end = first_item.as_ref().and_then(|item| item.current_period_end);

        ProcessorSubscription {
            id: object.id,
            customer_id: object.customer.map(Expandable::into_id),
            status: object.status,
            price_id: first_item.and_then(|item| item.price).map(|price| price.id),
            metadata: object.metadata,
            current_period_end: object.current_period_end.or(item_period_end),
            cancel_at_period_end: object.cancel_at_period_end,
        }
    }
}

/// Invoice payload; `stripe::Invoice` has no `parent` field in 0.39
#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    customer: Option<Expandable>,
    subscription: Option<Expandable>,
    parent: Option<InvoiceParent>,
    attempt_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InvoiceParent {
    subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct InvoiceSubscriptionDetails {
    subscription: Option<Expandable>,
}

impl InvoiceObject {
    fn subscription_id(self) -> Option<String> {
        self.subscription
            .or_else(|| {
                self.parent
                    .and_then(|parent| parent.subscription_details)
                    .and_then(|details| details.subscription)
            })
            .map(Expandable::into_id)
    }
}

pub fn parse_event(payload: &str) -> BillingResult<WebhookEvent> {
    serde_json::from_str(payload).map_err(|e| {
        tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
        BillingError::InvalidEvent(e.to_string())
    })
}

fn parse_object<T: DeserializeOwned>(event: &WebhookEvent) -> BillingResult<T> {
    serde_json::from_value(event.data.object.clone()).map_err(|e| {
        BillingError::InvalidEvent(format!("{} payload: {}", event.event_type, e))
    })
}

/// Processor status → our status
pub fn map_processor_status(status: &str) -> BillingResult<SubscriptionStatus> {
    match status {
        "active" => Ok(SubscriptionStatus::Active),
        "trialing" => Ok(SubscriptionStatus::Trialing),
        "past_due" | "unpaid" | "paused" => Ok(SubscriptionStatus::PastDue),
        "canceled" | "incomplete_expired" => Ok(SubscriptionStatus::Canceled),
        "incomplete" => Ok(SubscriptionStatus::Incomplete),
        other => Err(BillingError::InvalidEvent(format!(
            "unknown subscription status {}",
            other
        ))),
    }
}

fn unix_time(seconds: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(seconds)
        .map_err(|e| BillingError::InvalidEvent(format!("bad timestamp {}: {}", seconds, e)))
}

// =============================================================================
// Handler
// =============================================================================

/// What happened to a verified delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookDisposition {
    Processed,
    Duplicate,
}

/// Effect of a processed event, recorded in the event log
struct Applied {
    owner: Option<OwnerRef>,
    details: Value,
}

#[derive(Clone)]
pub struct WebhookHandler {
    store: SharedStore,
    processor: Arc<dyn PaymentProcessor>,
    config: StripeConfig,
}

impl WebhookHandler {
    pub fn new(store: SharedStore, processor: Arc<dyn PaymentProcessor>, config: StripeConfig) -> Self {
        Self {
            store,
            processor,
            config,
        }
    }

    /// Verify, claim and apply one delivery.
    ///
    /// Errors are surfaced so the processor redelivers; unknown event types
    /// succeed without effect.
    pub async fn handle_webhook(
        &self,
        payload: &str,
        signature: &str,
    ) -> BillingResult<WebhookDisposition> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, &self.config.webhook_secret, now)?;

        let event = parse_event(payload)?;
        self.handle_event(event).await
    }

    /// Apply an already verified event
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookDisposition> {
        if !self.store.claim_event(&event.id, &event.event_type).await? {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(WebhookDisposition::Duplicate);
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing webhook event"
        );

        let result = self.process_event(&event).await;
        let outcome = match &result {
            Ok(applied) => {
                WebhookEventOutcome::succeeded(applied.owner).with_details(applied.details.clone())
            }
            Err(e) => WebhookEventOutcome::failed(e.to_string()),
        };

        if let Err(e) = self.store.complete_event(&event.id, &outcome).await {
            // The claim will time out and the event can be redelivered
            tracing::error!(
                event_id = %event.id,
                processing_result = outcome.result.as_str(),
                error = %e,
                "Failed to record webhook outcome"
            );
        }

        match result {
            Ok(_) => Ok(WebhookDisposition::Processed),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook event processing failed"
                );
                Err(e)
            }
        }
    }

    async fn process_event(&self, event: &WebhookEvent) -> BillingResult<Applied> {
        let event_at = unix_time(event.created)?;

        match event.event_type.as_str() {
            "customer.subscription.created" | "customer.subscription.updated" => {
                let subscription: SubscriptionObject = parse_object(event)?;
                self.sync_subscription(subscription.into(), event_at).await
            }
            "customer.subscription.deleted" => {
                let subscription: SubscriptionObject = parse_object(event)?;
                self.close_subscription(subscription.into(), event_at).await
            }
            "invoice.payment_succeeded" | "invoice.paid" => {
                let invoice: InvoiceObject = parse_object(event)?;
                self.refresh_from_invoice(invoice, event_at).await
            }
            "invoice.payment_failed" => {
                let invoice: InvoiceObject = parse_object(event)?;
                self.record_payment_failure(invoice).await
            }
            other => {
                tracing::info!(
                    event_type = %other,
                    event_id = %event.id,
                    "Unhandled webhook event type"
                );
                Ok(Applied {
                    owner: None,
                    details: json!({ "ignored": true }),
                })
            }
        }
    }

    async fn sync_subscription(
        &self,
        subscription: ProcessorSubscription,
        event_at: OffsetDateTime,
    ) -> BillingResult<Applied> {
        let status = map_processor_status(&subscription.status)?;
        if status == SubscriptionStatus::Canceled {
            return self.close_subscription(subscription, event_at).await;
        }

        let owner = self.resolve_owner(&subscription).await?;
        let existing = self.store.get_subscription(owner).await?;
        let tier = self.resolve_tier(&subscription, existing.as_ref())?;

        let state = ProcessorSubscriptionState {
            tier,
            status,
            customer_id: subscription.customer_id.clone(),
            subscription_id: Some(subscription.id.clone()),
            current_period_end: subscription.current_period_end.map(unix_time).transpose()?,
            cancel_at_period_end: subscription.cancel_at_period_end,
            event_at,
        };
        self.apply(owner, &subscription, state).await
    }

    /// Back to free trial. The customer id is kept for resubscription.
    async fn close_subscription(
        &self,
        subscription: ProcessorSubscription,
        event_at: OffsetDateTime,
    ) -> BillingResult<Applied> {
        let owner = self.resolve_owner(&subscription).await?;
        let state = ProcessorSubscriptionState {
            tier: SubscriptionTier::FreeTrial,
            status: SubscriptionStatus::Canceled,
            customer_id: subscription.customer_id.clone(),
            subscription_id: None,
            current_period_end: subscription.current_period_end.map(unix_time).transpose()?,
            cancel_at_period_end: false,
            event_at,
        };
        self.apply(owner, &subscription, state).await
    }

    async fn apply(
        &self,
        owner: OwnerRef,
        subscription: &ProcessorSubscription,
        state: ProcessorSubscriptionState,
    ) -> BillingResult<Applied> {
        match self.store.apply_processor_state(owner, &state).await? {
            Some(record) => {
                tracing::info!(
                    owner = %owner,
                    subscription_id = %subscription.id,
                    tier = %record.tier,
                    status = %record.status,
                    "Subscription synchronized"
                );
                Ok(Applied {
                    owner: Some(owner),
                    details: json!({
                        "subscription_id": subscription.id,
                        "tier": record.tier,
                        "status": record.status,
                    }),
                })
            }
            None => {
                tracing::info!(
                    owner = %owner,
                    subscription_id = %subscription.id,
                    "Skipped stale subscription event"
                );
                Ok(Applied {
                    owner: Some(owner),
                    details: json!({
                        "subscription_id": subscription.id,
                        "stale": true,
                    }),
                })
            }
        }
    }

    async fn refresh_from_invoice(
        &self,
        invoice: InvoiceObject,
        event_at: OffsetDateTime,
    ) -> BillingResult<Applied> {
        let invoice_id = invoice.id.clone();
        let Some(subscription_id) = invoice.subscription_id() else {
            tracing::debug!(invoice_id = %invoice_id, "Invoice has no subscription");
            return Ok(Applied {
                owner: None,
                details: json!({ "invoice_id": invoice_id }),
            });
        };

        let subscription = self.fetch_subscription(&subscription_id).await?;
        self.sync_subscription(subscription, event_at).await
    }

    async fn fetch_subscription(&self, subscription_id: &str) -> BillingResult<ProcessorSubscription> {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(3);

        Retry::spawn(strategy, || async {
            self.processor
                .retrieve_subscription(subscription_id)
                .await
                .inspect_err(|e| {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        error = %e,
                        "Subscription fetch failed"
                    );
                })
        })
        .await
    }

    async fn record_payment_failure(&self, invoice: InvoiceObject) -> BillingResult<Applied> {
        let customer_id = invoice.customer.map(Expandable::into_id);
        let owner = match &customer_id {
            Some(id) => self.store.find_owner_by_customer(id).await?,
            None => None,
        };

        tracing::warn!(
            invoice_id = %invoice.id,
            customer_id = ?customer_id,
            owner = ?owner,
            attempt_count = ?invoice.attempt_count,
            "Invoice payment failed"
        );

        Ok(Applied {
            owner,
            details: json!({
                "invoice_id": invoice.id,
                "customer_id": customer_id,
                "attempt_count": invoice.attempt_count,
            }),
        })
    }

    /// Metadata first, then the recorded customer id
    async fn resolve_owner(&self, subscription: &ProcessorSubscription) -> BillingResult<OwnerRef> {
        let metadata = &subscription.metadata;
        if let (Some(owner_type), Some(owner_id)) =
            (metadata.get("owner_type"), metadata.get("owner_id"))
        {
            match (owner_type.parse::<OwnerType>(), owner_id.parse::<Uuid>()) {
                (Ok(owner_type), Ok(owner_id)) => return Ok(OwnerRef { owner_type, owner_id }),
                _ => tracing::warn!(
                    subscription_id = %subscription.id,
                    owner_type = %owner_type,
                    owner_id = %owner_id,
                    "Malformed owner metadata, falling back to customer lookup"
                ),
            }
        }

        if let Some(customer_id) = &subscription.customer_id {
            if let Some(owner) = self.store.find_owner_by_customer(customer_id).await? {
                return Ok(owner);
            }
        }

        Err(BillingError::InvalidEvent(format!(
            "subscription {} cannot be attributed to an owner",
            subscription.id
        )))
    }

    /// Metadata `tier`, then the configured price map, then the tier on record
    fn resolve_tier(
        &self,
        subscription: &ProcessorSubscription,
        existing: Option<&SubscriptionRecord>,
    ) -> BillingResult<SubscriptionTier> {
        if let Some(tier) = subscription.metadata.get("tier") {
            match tier.parse::<SubscriptionTier>() {
                Ok(tier) => return Ok(tier),
                Err(e) => tracing::warn!(
                    subscription_id = %subscription.id,
                    error = %e,
                    "Ignoring malformed tier metadata"
                ),
            }
        }

        subscription
            .price_id
            .as_deref()
            .and_then(|price_id| self.config.tier_for_price_id(price_id))
            .or_else(|| existing.map(|record| record.tier))
            .ok_or_else(|| {
                BillingError::InvalidEvent(format!(
                    "cannot determine tier for subscription {}",
                    subscription.id
                ))
            })
    }
}
