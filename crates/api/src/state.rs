//! Application state

use std::sync::Arc;

use gradewise_billing::BillingService;
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
    error::{ApiError, ApiResult},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// None when billing is disabled or the processor is not configured
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self::with_billing(config, billing)
    }

    /// Build state around an already constructed billing service
    pub fn with_billing(config: Config, billing: Option<Arc<BillingService>>) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);
        Self {
            config,
            jwt_manager,
            billing,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    pub fn billing_service(&self) -> ApiResult<&Arc<BillingService>> {
        self.billing.as_ref().ok_or(ApiError::BillingDisabled)
    }
}
