//! Test assertion macros and helpers.

use crate::error::GraftError;

/// Assert that a result is Ok.
///
/// # Example
///
/// ```ignore
/// assert_ok!(runner.run(&migrations, RunOptions::default()).await);
/// ```
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: expected Ok, got Err({:?})", e),
        }
    };
    ($expr:expr, $($arg:tt)+) => {
        match &$expr {
            Ok(_) => (),
            Err(e) => panic!("assertion failed: {}: expected Ok, got Err({:?})", format_args!($($arg)+), e),
        }
    };
}

/// Assert that an error matches a specific variant.
///
/// # Example
///
/// ```ignore
/// assert_err_variant!(pool.get(&cancel).await, GraftError::Pool(PoolError::Timeout(_)));
/// ```
#[macro_export]
macro_rules! assert_err_variant {
    ($expr:expr, $variant:pat) => {
        match &$expr {
            Err($variant) => (),
            Err(e) => panic!(
                "assertion failed: expected {}, got {:?}",
                stringify!($variant),
                e
            ),
            Ok(_) => panic!(
                "assertion failed: expected Err({}), got Ok",
                stringify!($variant)
            ),
        }
    };
}

/// Assert that an error's message contains the given text.
pub fn assert_error_contains(err: &GraftError, expected: &str) {
    let message = err.to_string();
    assert!(
        message.contains(expected),
        "expected error containing '{}', got '{}'",
        expected,
        message
    );
}

/// Name of the migration a [`GraftError::Migration`] refers to, unwrapping nothing else.
pub fn failed_migration(err: &GraftError) -> Option<&str> {
    match err {
        GraftError::Migration { name, .. } => Some(name),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MigrationPhase, PoolError};

    #[test]
    fn test_assert_ok() {
        let result: Result<i32, GraftError> = Ok(1);
        assert_ok!(result);
        assert_ok!(result, "with context {}", 1);
    }

    #[test]
    fn test_assert_err_variant() {
        let result: Result<(), GraftError> = Err(PoolError::Closed.into());
        assert_err_variant!(result, GraftError::Pool(PoolError::Closed));
    }

    #[test]
    #[should_panic(expected = "expected Err")]
    fn test_assert_err_variant_on_ok() {
        let result: Result<(), GraftError> = Ok(());
        assert_err_variant!(result, GraftError::Cancelled);
    }

    #[test]
    fn test_failed_migration() {
        let err = GraftError::migration("003_x", MigrationPhase::Down, GraftError::Cancelled);
        assert_eq!(failed_migration(&err), Some("003_x"));
        assert_eq!(failed_migration(&GraftError::Cancelled), None);
        assert_error_contains(&err, "during down");
    }
}
