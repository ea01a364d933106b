//! Custom assertion macros and utilities
//!
//! Provides enhanced assertion macros for better test output and
//! more descriptive error messages.

use uuid::Uuid;
use xfsync::shared::{OperationOutcome, SyncEvent};

/// Assert that a result is ok and return the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is an error
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        assert!($result.is_err(), "Expected Err, got Ok");
    };
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => {}
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => panic!("Expected different error variant, got: {:?}", e),
        }
    };
}

/// Terminal outcomes published for `operation_id`
pub fn outcomes_for(events: &[SyncEvent], operation_id: Uuid) -> Vec<OperationOutcome> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::OperationCompleted {
                operation_id: id,
                outcome,
                ..
            } if *id == operation_id => Some(outcome.clone()),
            _ => None,
        })
        .collect()
}
