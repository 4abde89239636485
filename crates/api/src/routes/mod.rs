//! HTTP routes

pub mod billing;

use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    // Everything except the webhook needs a user token
    let billing_routes = Router::new()
        .route("/entitlements", get(billing::get_entitlements))
        .route("/entitlements/check", post(billing::check_entitlement))
        .route("/checkout", post(billing::create_checkout))
        .route("/portal", post(billing::create_portal))
        .route("/credits", get(billing::get_credits))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ))
        .route("/webhook", post(billing::stripe_webhook));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/billing", billing_routes)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "billing_enabled": state.billing.is_some(),
    }))
}
