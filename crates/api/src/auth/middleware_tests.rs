//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Bearer header and cookie tokens
//! - Missing, malformed and expired tokens
//! - Error envelope on rejection

#[cfg(test)]
mod tests {
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::super::jwt::JwtManager;
    use super::super::middleware::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    async fn whoami(Extension(user): Extension<AuthUser>) -> String {
        user.user_id.to_string()
    }

    fn app() -> Router {
        let auth_state = AuthState {
            jwt_manager: JwtManager::new(SECRET, 24),
        };
        Router::new()
            .route("/me", get(whoami))
            .route_layer(middleware::from_fn_with_state(auth_state, require_auth))
    }

    fn token(user_id: Uuid) -> String {
        JwtManager::new(SECRET, 24)
            .generate_access_token(user_id, "t@example.com")
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_bearer_header_is_accepted() {
        let user_id = Uuid::new_v4();
        let response = app()
            .oneshot(
                Request::get("/me")
                    .header("Authorization", format!("Bearer {}", token(user_id)))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes, user_id.to_string());
    }

    #[tokio::test]
    async fn test_cookie_is_accepted() {
        let user_id = Uuid::new_v4();
        let response = app()
            .oneshot(
                Request::get("/me")
                    .header(
                        "Cookie",
                        format!("theme=dark; {}={}", AUTH_COOKIE, token(user_id)),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated() {
        let response = app()
            .oneshot(Request::get("/me").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
        assert_eq!(body["error"]["message"], "Authentication required");
    }

    #[tokio::test]
    async fn test_foreign_token_is_rejected() {
        let foreign = JwtManager::new("some-other-deployment-secret-value", 24)
            .generate_access_token(Uuid::new_v4(), "x@example.com")
            .unwrap();
        let response = app()
            .oneshot(
                Request::get("/me")
                    .header("Authorization", format!("Bearer {}", foreign))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["message"], "Invalid token");
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let expired = JwtManager::new(SECRET, -2)
            .generate_access_token(Uuid::new_v4(), "x@example.com")
            .unwrap();
        let response = app()
            .oneshot(
                Request::get("/me")
                    .header("Authorization", format!("Bearer {}", expired))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"]["message"], "Token expired");
    }

    #[tokio::test]
    async fn test_non_bearer_scheme_is_missing_auth() {
        let response = app()
            .oneshot(
                Request::get("/me")
                    .header("Authorization", "Basic dXNlcjpwYXNz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["error"]["message"],
            "Authentication required"
        );
    }
}
