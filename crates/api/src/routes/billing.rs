//! Billing routes
//!
//! Entitlement queries and checks, checkout and portal sessions, the
//! caller's credit ledger, and the payment processor webhook.

use axum::{
    extract::{Extension, Query, State},
    http::HeaderMap,
    Json,
};
use gradewise_billing::{
    BillingContext, BillingError, CreditTransaction, Plan, UsageDelta, WebhookDisposition,
};
use gradewise_shared::{OwnerRef, OwnerType, SubscriptionTier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Header carrying the processor's webhook signature
pub const SIGNATURE_HEADER: &str = "stripe-signature";

// =============================================================================
// Request / Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct EntitlementsResponse {
    pub context: BillingContext,
    pub plan: Plan,
}

#[derive(Debug, Deserialize)]
pub struct CheckEntitlementRequest {
    pub module: String,
    #[serde(default)]
    pub usage: Vec<UsageDelta>,
}

#[derive(Debug, Serialize)]
pub struct CheckEntitlementResponse {
    pub allowed: bool,
    pub context: BillingContext,
}

/// Owner defaults to the caller's own user when omitted
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub tier: SubscriptionTier,
    pub owner_type: Option<OwnerType>,
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct PortalRequest {
    pub owner_type: Option<OwnerType>,
    pub owner_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct CreditsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CreditsResponse {
    pub balance: i64,
    pub monthly_credits: i64,
    pub transactions: Vec<CreditTransaction>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub disposition: WebhookDisposition,
}

// =============================================================================
// Handlers
// =============================================================================

/// GET /api/v1/billing/entitlements
pub async fn get_entitlements(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<EntitlementsResponse>> {
    let billing = state.billing_service()?;

    let context = billing.resolver.resolve(Some(auth_user.user_id)).await?;
    let plan = context.plan();

    Ok(Json(EntitlementsResponse { context, plan }))
}

/// POST /api/v1/billing/entitlements/check
///
/// Runs the full gate, committing any usage in the request on success.
pub async fn check_entitlement(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CheckEntitlementRequest>,
) -> ApiResult<Json<CheckEntitlementResponse>> {
    let billing = state.billing_service()?;

    let context = billing.resolver.resolve(Some(auth_user.user_id)).await?;
    let context = billing
        .gate
        .require_module_str(&req.module, context, &req.usage)
        .await?;

    Ok(Json(CheckEntitlementResponse {
        allowed: true,
        context,
    }))
}

/// POST /api/v1/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let billing = state.billing_service()?;

    let owner = requested_owner(req.owner_type, req.owner_id, auth_user.user_id)?;
    let principal = billing.resolver.principal(Some(auth_user.user_id)).await?;
    let session = billing
        .checkout
        .create_checkout_session(&principal, owner, req.tier)
        .await?;

    Ok(Json(SessionResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// POST /api/v1/billing/portal
pub async fn create_portal(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<PortalRequest>,
) -> ApiResult<Json<SessionResponse>> {
    let billing = state.billing_service()?;

    let owner = requested_owner(req.owner_type, req.owner_id, auth_user.user_id)?;
    let principal = billing.resolver.principal(Some(auth_user.user_id)).await?;
    let session = billing.portal.create_portal_session(&principal, owner).await?;

    Ok(Json(SessionResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// GET /api/v1/billing/credits
pub async fn get_credits(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<CreditsQuery>,
) -> ApiResult<Json<CreditsResponse>> {
    let billing = state.billing_service()?;

    let principal = billing.resolver.principal(Some(auth_user.user_id)).await?;
    let balance = billing.credits.get_balance(principal.id).await?;
    let transactions = billing
        .credits
        .recent_transactions(principal.id, query.limit.unwrap_or(20))
        .await?;

    Ok(Json(CreditsResponse {
        balance,
        monthly_credits: principal.monthly_credits,
        transactions,
    }))
}

/// POST /api/v1/billing/webhook
///
/// Unauthenticated; trust comes from the signature over the raw body.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let billing = state.billing_service()?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Webhook delivery without signature header");
            BillingError::InvalidSignature
        })?;

    let disposition = billing
        .webhooks
        .handle_webhook(&body, signature)
        .await
        .inspect_err(|e| {
            tracing::warn!(code = e.code(), error = %e, "Webhook delivery rejected");
        })?;

    Ok(Json(WebhookAck {
        received: true,
        disposition,
    }))
}

// =============================================================================
// Helper Functions
// =============================================================================

fn requested_owner(
    owner_type: Option<OwnerType>,
    owner_id: Option<Uuid>,
    user_id: Uuid,
) -> ApiResult<OwnerRef> {
    match (owner_type, owner_id) {
        (None, None) => Ok(OwnerRef::user(user_id)),
        (Some(owner_type), Some(owner_id)) => Ok(OwnerRef {
            owner_type,
            owner_id,
        }),
        _ => Err(ApiError::Validation(
            "owner_type and owner_id must be given together".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        Router,
    };
    use gradewise_billing::webhooks::signature_header;
    use gradewise_billing::{
        BillingService, CreditLedger, InMemoryBillingStore, MockProcessor, PriceIds,
        StripeConfig, SubscriptionRecord, UsageCounters,
    };
    use gradewise_shared::{OrgRole, SubscriptionStatus, UserRole};
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::JwtManager;
    use crate::config::Config;
    use crate::routes::create_router;

    const WEBHOOK_SECRET: &str = "whsec_api_tests";

    struct TestApp {
        router: Router,
        store: Arc<InMemoryBillingStore>,
        jwt: JwtManager,
    }

    fn config(enable_billing: bool) -> Config {
        Config {
            database_url: "postgres://localhost/unused".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            jwt_secret: "test-jwt-secret-key-for-testing-only".to_string(),
            jwt_expiry_hours: 24,
            allowed_origins: vec![],
            enable_billing,
            run_migrations: false,
        }
    }

    fn stripe_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            price_ids: PriceIds {
                basic: "price_basic".to_string(),
                premium: "price_premium".to_string(),
                enterprise: "price_enterprise".to_string(),
            },
            app_base_url: "https://app.example.com".to_string(),
        }
    }

    fn test_app() -> TestApp {
        let store = Arc::new(InMemoryBillingStore::new());
        let billing = BillingService::new(
            stripe_config(),
            store.clone(),
            Arc::new(MockProcessor::new()),
        );
        let state = AppState::with_billing(config(true), Some(Arc::new(billing)));
        TestApp {
            jwt: state.jwt_manager.clone(),
            router: create_router(state),
            store,
        }
    }

    impl TestApp {
        fn token(&self, user_id: Uuid) -> String {
            self.jwt
                .generate_access_token(user_id, "caller@example.com")
                .unwrap()
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            (status, body)
        }

        async fn get(&self, uri: &str, user_id: Uuid) -> (StatusCode, Value) {
            self.send(
                Request::get(uri)
                    .header("Authorization", format!("Bearer {}", self.token(user_id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
        }

        async fn post(&self, uri: &str, user_id: Uuid, body: Value) -> (StatusCode, Value) {
            self.send(
                Request::post(uri)
                    .header("Authorization", format!("Bearer {}", self.token(user_id)))
                    .header("Content-Type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
        }

        async fn webhook(&self, payload: &str, signature: Option<String>) -> (StatusCode, Value) {
            let mut request = Request::post("/api/v1/billing/webhook")
                .header("Content-Type", "application/json");
            if let Some(signature) = signature {
                request = request.header("Stripe-Signature", signature);
            }
            self.send(request.body(Body::from(payload.to_string())).unwrap())
                .await
        }
    }

    fn sign(payload: &str) -> String {
        signature_header(payload, WEBHOOK_SECRET, OffsetDateTime::now_utc().unix_timestamp())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let app = test_app();
        let (status, body) = app
            .send(Request::get("/health").body(Body::empty()).unwrap())
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["billing_enabled"], true);
    }

    #[tokio::test]
    async fn test_entitlements_require_token() {
        let app = test_app();
        let (status, body) = app
            .send(
                Request::get("/api/v1/billing/entitlements")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_token_for_unknown_user_is_unauthenticated() {
        let app = test_app();
        let (status, body) = app
            .get("/api/v1/billing/entitlements", Uuid::new_v4())
            .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_new_user_gets_free_trial_entitlements() {
        let app = test_app();
        let user = app.store.create_user("new@example.com", UserRole::Instructor);

        let (status, body) = app.get("/api/v1/billing/entitlements", user.id).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["context"]["tier"], "FREE_TRIAL");
        assert_eq!(body["context"]["status"], "TRIALING");
        assert_eq!(body["context"]["source"], "DEFAULT");
        assert_eq!(body["plan"]["limits"]["aiGrades"], 50);
    }

    #[tokio::test]
    async fn test_check_at_limit_is_429_with_details() {
        let app = test_app();
        let user = app.store.create_user("full@example.com", UserRole::Instructor);
        app.store.set_usage(
            OwnerRef::user(user.id),
            UsageCounters {
                ai_grades: 50,
                ..Default::default()
            },
        );

        let (status, body) = app
            .post(
                "/api/v1/billing/entitlements/check",
                user.id,
                json!({
                    "module": "AI_GRADING",
                    "usage": [{ "key": "aiGrades", "increment": 1 }],
                }),
            )
            .await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["code"], "USAGE_LIMIT_EXCEEDED");
        assert_eq!(body["error"]["details"]["current"], 50);
        assert_eq!(body["error"]["details"]["limit"], 50);
    }

    #[tokio::test]
    async fn test_check_commits_usage() {
        let app = test_app();
        let user = app.store.create_user("ok@example.com", UserRole::Instructor);

        let (status, body) = app
            .post(
                "/api/v1/billing/entitlements/check",
                user.id,
                json!({
                    "module": "AI_GRADING",
                    "usage": [{ "key": "aiGrades", "increment": 2 }],
                }),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);
        assert_eq!(body["context"]["usage"]["aiGrades"], 2);
    }

    #[tokio::test]
    async fn test_unknown_module_is_400() {
        let app = test_app();
        let user = app.store.create_user("odd@example.com", UserRole::Instructor);

        let (status, body) = app
            .post(
                "/api/v1/billing/entitlements/check",
                user.id,
                json!({ "module": "TELEPORTATION" }),
            )
            .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "UNKNOWN_MODULE");
    }

    #[tokio::test]
    async fn test_past_due_plan_is_402() {
        let app = test_app();
        let user = app.store.create_user("late@example.com", UserRole::Instructor);
        app.store.put_subscription(SubscriptionRecord {
            tier: SubscriptionTier::Basic,
            status: SubscriptionStatus::PastDue,
            ..SubscriptionRecord::new_default(OwnerRef::user(user.id), OffsetDateTime::now_utc())
        });

        let (status, body) = app
            .post(
                "/api/v1/billing/entitlements/check",
                user.id,
                json!({ "module": "COURSES" }),
            )
            .await;

        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"]["code"], "BILLING_INACTIVE");
        assert_eq!(body["error"]["details"]["status"], "PAST_DUE");
    }

    #[tokio::test]
    async fn test_checkout_then_portal() {
        let app = test_app();
        let user = app.store.create_user("buyer@example.com", UserRole::Instructor);

        let (status, body) = app
            .post("/api/v1/billing/portal", user.id, json!({}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NO_BILLING_CUSTOMER");

        let (status, body) = app
            .post(
                "/api/v1/billing/checkout",
                user.id,
                json!({ "tier": "FREE_TRIAL" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_TIER");

        let (status, body) = app
            .post(
                "/api/v1/billing/checkout",
                user.id,
                json!({ "tier": "PREMIUM" }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"]
            .as_str()
            .unwrap()
            .starts_with("https://checkout.mock.test/"));

        let (status, body) = app
            .post("/api/v1/billing/portal", user.id, json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"]
            .as_str()
            .unwrap()
            .starts_with("https://billing.mock.test/"));
    }

    #[tokio::test]
    async fn test_member_cannot_buy_for_org() {
        let app = test_app();
        let user = app.store.create_user("member@example.com", UserRole::Instructor);
        let org = app.store.create_organization("Lakeside Academy");
        app.store.add_membership(user.id, org.id, OrgRole::Member);

        let (status, body) = app
            .post(
                "/api/v1/billing/checkout",
                user.id,
                json!({ "tier": "BASIC", "owner_type": "ORG", "owner_id": org.id }),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");

        let (status, body) = app
            .post(
                "/api/v1/billing/checkout",
                user.id,
                json!({ "tier": "BASIC", "owner_type": "ORG" }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_credits_reports_ledger() {
        let app = test_app();
        let user = app.store.create_user("credits@example.com", UserRole::Instructor);
        let ledger = CreditLedger::new(app.store.clone());
        ledger.purchase(user.id, 120, "Credit pack").await.unwrap();
        ledger.debit(user.id, 20, "AI grading").await.unwrap();

        let (status, body) = app.get("/api/v1/billing/credits?limit=10", user.id).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 100);
        assert_eq!(body["transactions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_webhook_signature_and_effect() {
        let app = test_app();
        let user = app.store.create_user("sub@example.com", UserRole::Instructor);
        let payload = json!({
            "id": "evt_api_1",
            "type": "customer.subscription.created",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "sub_api",
                "customer": "cus_api",
                "status": "active",
                "current_period_end": 1_702_592_000,
                "metadata": {
                    "owner_type": "USER",
                    "owner_id": user.id.to_string(),
                    "tier": "PREMIUM",
                },
            }},
        })
        .to_string();

        let (status, body) = app.webhook(&payload, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");

        let (status, body) = app.webhook(&payload, Some(sign(&payload))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposition"], "processed");

        let (status, body) = app.webhook(&payload, Some(sign(&payload))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["disposition"], "duplicate");

        let (_, body) = app.get("/api/v1/billing/entitlements", user.id).await;
        assert_eq!(body["context"]["tier"], "PREMIUM");
        assert_eq!(body["context"]["source"], "PERSONAL");
    }

    #[tokio::test]
    async fn test_disabled_billing_is_503() {
        let state = AppState::with_billing(config(false), None);
        let jwt = state.jwt_manager.clone();
        let router = create_router(state);
        let token = jwt
            .generate_access_token(Uuid::new_v4(), "x@example.com")
            .unwrap();

        let response = router
            .oneshot(
                Request::get("/api/v1/billing/entitlements")
                    .header("Authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
