//! JWT issuing and validation (HS256)

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: Uuid,
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token expired")]
    Expired,
    #[error("Invalid token: {0}")]
    Invalid(String),
    #[error("Failed to sign token: {0}")]
    Signing(String),
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl std::fmt::Debug for JwtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtManager")
            .field("expiry_hours", &self.expiry_hours)
            .finish_non_exhaustive()
    }
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    /// Issue an access token for a user
    pub fn generate_access_token(&self, user_id: Uuid, email: &str) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + Duration::hours(self.expiry_hours)).unix_timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Signing(e.to_string()))
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, JwtError> {
        let validation = Validation::new(Algorithm::HS256);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    #[test]
    fn test_issued_token_validates() {
        let manager = JwtManager::new(SECRET, 24);
        let user_id = Uuid::new_v4();

        let token = manager
            .generate_access_token(user_id, "instructor@example.com")
            .unwrap();
        let claims = manager.validate_access_token(&token).unwrap();

        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "instructor@example.com");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let issuer = JwtManager::new(SECRET, 24);
        let other = JwtManager::new("a-completely-different-secret-value", 24);

        let token = issuer
            .generate_access_token(Uuid::new_v4(), "x@example.com")
            .unwrap();
        assert!(matches!(
            other.validate_access_token(&token),
            Err(JwtError::Invalid(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        // Well past the default validation leeway
        let manager = JwtManager::new(SECRET, -2);

        let token = manager
            .generate_access_token(Uuid::new_v4(), "late@example.com")
            .unwrap();
        assert!(matches!(
            manager.validate_access_token(&token),
            Err(JwtError::Expired)
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let manager = JwtManager::new(SECRET, 24);
        assert!(manager.validate_access_token("not.a.jwt").is_err());
    }
}
