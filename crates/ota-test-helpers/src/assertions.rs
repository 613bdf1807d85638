//! Assertion macros for update scenarios.

/// Assert that an attempt left the device booting its current image:
/// no boot switch, no restart and no write session left open.
///
/// Works with any value exposing `boot_switches()`, `restarted()` and
/// `has_open_session()`, such as [`MockPartitionStore`](crate::mock::MockPartitionStore).
#[macro_export]
macro_rules! assert_boot_untouched {
    ($store:expr $(,)?) => {{
        let store = &$store;
        assert_eq!(store.boot_switches(), 0, "boot partition was switched");
        assert!(!store.restarted(), "device was restarted");
        assert!(!store.has_open_session(), "write session left open");
    }};
}

/// Assert that a result failed with the given error category.
///
/// ```rust,ignore
/// assert_category!(orchestrator.run_attempt().await, ErrorCategory::Policy);
/// ```
#[macro_export]
macro_rules! assert_category {
    ($result:expr, $category:expr $(,)?) => {{
        match $result {
            Ok(v) => panic!(
                "assertion failed: expected {:?} error, got Ok({:?})",
                $category, v
            ),
            Err(e) => assert_eq!(
                e.category(),
                $category,
                "unexpected error category for `{}`",
                e
            ),
        }
    }};
}

/// Assert that every write session that was begun was closed exactly once,
/// either by `end_write` or `abort_write`.
#[macro_export]
macro_rules! assert_sessions_balanced {
    ($store:expr $(,)?) => {{
        let store = &$store;
        assert_eq!(
            store.begin_count(),
            store.end_count() + store.abort_count(),
            "begin/end/abort mismatch: {:?}",
            store.calls()
        );
    }};
}
