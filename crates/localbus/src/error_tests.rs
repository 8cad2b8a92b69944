//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(BusError::SessionCannotBeLocked {
        session_id: "test".to_string(),
        locked_until: Timestamp::now(),
    }
    .is_transient());

    assert!(!BusError::EntityNotFound {
        entity: "orders".to_string(),
    }
    .is_transient());

    assert!(BusError::MessageLockLost {
        lock_token: "token".to_string(),
    }
    .is_transient());

    assert!(!BusError::MessageTooLarge {
        size: 1000,
        max_size: 500
    }
    .is_transient());

    assert!(!BusError::Unauthorized {
        key_name: "listen-only".to_string(),
        right: "Send".to_string(),
        entity: "orders".to_string(),
    }
    .is_transient());
}

#[test]
fn test_retry_suggestions() {
    let session_locked = BusError::SessionCannotBeLocked {
        session_id: "test".to_string(),
        locked_until: Timestamp::now(),
    };
    assert_eq!(session_locked.retry_after(), Some(Duration::seconds(5)));

    let not_found = BusError::EntityNotFound {
        entity: "test".to_string(),
    };
    assert_eq!(not_found.retry_after(), None);
}

#[test]
fn test_filter_error_converts_into_bus_error() {
    let filter_error = FilterError::Syntax {
        position: 7,
        message: "unexpected token".to_string(),
    };

    let error: BusError = filter_error.into();

    assert!(matches!(error, BusError::FilterError(FilterError::Syntax { position: 7, .. })));
    assert!(!error.is_transient());
    assert!(error.to_string().contains("position 7"));
}
