//! Integration tests
//!
//! End-to-end behaviour of devices sharing one in-memory remote.

pub mod crash_recovery;
pub mod scenarios;
