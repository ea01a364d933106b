//! Property-based tests

pub mod conflict_proptest;
pub mod convergence_proptest;
