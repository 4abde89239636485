#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Gradewise shared types and database helpers
//!
//! Everything in here is used by more than one crate in the workspace: the
//! canonical tier/status enums, owner references and the Postgres pool setup.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{
    OrgRole, OwnerRef, OwnerType, ParseEnumError, SubscriptionStatus, SubscriptionTier, UserRole,
};
