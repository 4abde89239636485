//! API error type and its HTTP mapping
//!
//! Every error body has the same shape:
//!
//! ```json
//! {"error": {"code": "USAGE_LIMIT_EXCEEDED", "message": "...", "details": {...}}}
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gradewise_billing::BillingError;
use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Billing is not enabled on this server")]
    BillingDisabled,

    #[error("Invalid request: {0}")]
    Validation(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP status for a billing error code
pub fn billing_status(err: &BillingError) -> StatusCode {
    match err {
        BillingError::Unauthenticated => StatusCode::UNAUTHORIZED,
        BillingError::BillingInactive { .. } => StatusCode::PAYMENT_REQUIRED,
        BillingError::UsageLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        BillingError::UpgradeRequired { .. } | BillingError::Forbidden(_) => StatusCode::FORBIDDEN,
        BillingError::InvalidSignature
        | BillingError::UnknownModule(_)
        | BillingError::InvalidTier(_)
        | BillingError::InvalidRequest(_)
        | BillingError::InvalidEvent(_) => StatusCode::BAD_REQUEST,
        BillingError::NoBillingCustomer(_) | BillingError::NotFound(_) => StatusCode::NOT_FOUND,
        BillingError::InsufficientCredits { .. } => StatusCode::CONFLICT,
        BillingError::Processor(_) => StatusCode::BAD_GATEWAY,
        BillingError::Database(_) | BillingError::Config(_) | BillingError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(err) => billing_status(err),
            ApiError::BillingDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Billing(err) => err.code(),
            ApiError::BillingDisabled => "BILLING_DISABLED",
            ApiError::Validation(_) => "INVALID_REQUEST",
        }
    }

    fn details(&self) -> Value {
        match self {
            ApiError::Billing(err) => err.details(),
            _ => json!({}),
        }
    }
}

/// Shared error envelope, also used by the auth middleware
pub fn error_body(code: &str, message: &str, details: Value) -> Json<Value> {
    Json(json!({
        "error": {
            "code": code,
            "message": message,
            "details": details,
        }
    }))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let message = match status {
            // Logged in full, reported generically
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(code = self.code(), error = %self, "Request failed");
                "Internal server error".to_string()
            }
            StatusCode::BAD_GATEWAY => {
                tracing::error!(code = self.code(), error = %self, "Payment processor call failed");
                self.to_string()
            }
            _ => self.to_string(),
        };

        (status, error_body(self.code(), &message, self.details())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use gradewise_billing::QuotaKey;
    use gradewise_shared::{OwnerType, SubscriptionStatus, SubscriptionTier};

    use super::*;

    #[test]
    fn test_denial_statuses() {
        let inactive = BillingError::BillingInactive {
            tier: SubscriptionTier::Basic,
            status: SubscriptionStatus::PastDue,
            owner_type: OwnerType::User,
        };
        assert_eq!(billing_status(&inactive), StatusCode::PAYMENT_REQUIRED);

        let over = BillingError::UsageLimitExceeded {
            key: QuotaKey::AiGrades,
            current: 50,
            limit: 50,
            requested: 1,
            tier: SubscriptionTier::FreeTrial,
        };
        assert_eq!(billing_status(&over), StatusCode::TOO_MANY_REQUESTS);

        assert_eq!(
            billing_status(&BillingError::UnknownModule("X".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            billing_status(&BillingError::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            billing_status(&BillingError::Processor("timeout".into())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_api_error_codes() {
        assert_eq!(ApiError::BillingDisabled.code(), "BILLING_DISABLED");
        assert_eq!(
            ApiError::BillingDisabled.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ApiError::Validation("x".into()).code(), "INVALID_REQUEST");
        assert_eq!(
            ApiError::from(BillingError::InvalidSignature).code(),
            "INVALID_SIGNATURE"
        );
    }
}
