//! Shared test utilities for sheetdiff integration tests.
//!
//! This module provides:
//! - `TestHarness`: an in-process runtime over an in-memory database and
//!   object store
//! - `ConfigBuilder` for test configurations with fast retries
//! - Synthetic drawing sheets and known transforms

pub mod builders;
pub mod harness;
pub mod sheets;

pub use builders::*;
pub use harness::TestHarness;
pub use sheets::*;
