//! Common test utilities and helpers
//!
//! This module provides shared utilities for all tests including:
//! - Device fixtures wiring a store, mutation API and sync engine together
//! - Event collection helpers
//! - Custom assertion macros

#[macro_use]
pub mod assertions;
pub mod fixtures;

// Re-export commonly used utilities
pub use assertions::*;
pub use fixtures::*;
