// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Unit tests for postgres-provisioner
//!
//! These drive the reconcilers end to end against in-memory stores and a fake
//! PostgreSQL server:
//! - Generic reconcile loop (finalizer, status, events, error policy)
//! - Engine validation and connection pool eviction
//! - Database, role, schema and extension provisioning
//! - User role logins, rotation, draining and generated secrets
//! - Publications and their replication slots

#[path = "../common/mod.rs"]
mod common;

mod database;
mod registry;
mod user_role;
