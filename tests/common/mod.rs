// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    dead_code
)]

//! Common test utilities shared across test targets
//!
//! In-memory fakes for the object store, secrets, events and the PostgreSQL
//! engine, plus record builders and a harness that wires them into a
//! `Context`.
//!
//! # Usage
//!
//! Include this module in your test file:
//! ```rust,ignore
//! #[path = "../common/mod.rs"]
//! mod common;
//! use common::*;
//! ```

mod fixtures;

pub use fakes::*;
pub use fixtures::*;
