//! Authentication for the Gradewise API

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtError, JwtManager};
pub use middleware::{require_auth, AuthError, AuthState, AuthUser};
