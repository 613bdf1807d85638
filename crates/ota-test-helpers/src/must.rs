//! Unwrap helpers with good panic messages.
//!
//! Test code uses these instead of `unwrap()`/`expect()`; `#[track_caller]`
//! keeps the panic location at the call site.

use std::fmt::Debug;
use std::future::Future;

/// Unwrap a `Result`, panicking with the error on `Err`.
///
/// # Example
///
/// ```rust
/// use ota_test_helpers::must;
///
/// let result: Result<u32, &str> = Ok(288);
/// assert_eq!(must(result), 288);
/// ```
///
/// # Panics
///
/// Panics if the result is `Err`.
#[track_caller]
pub fn must<T, E: Debug>(result: Result<T, E>) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("must: unexpected Err: {e:?}"),
    }
}

/// Unwrap an `Option`, panicking with `msg` on `None`.
///
/// # Panics
///
/// Panics if the option is `None`.
#[track_caller]
pub fn must_some<T>(option: Option<T>, msg: &str) -> T {
    match option {
        Some(v) => v,
        None => panic!("must_some: {msg}"),
    }
}

/// Unwrap a `Result`, prefixing the panic message with `context`.
///
/// # Panics
///
/// Panics if the result is `Err`.
#[track_caller]
pub fn must_with<T, E: Debug>(result: Result<T, E>, context: &str) -> T {
    match result {
        Ok(v) => v,
        Err(e) => panic!("must_with: {context}: {e:?}"),
    }
}

/// Await a fallible future and unwrap its output.
///
/// # Panics
///
/// Panics if the future resolves to `Err`.
#[track_caller]
pub async fn must_async<F, T, E>(future: F) -> T
where
    F: Future<Output = Result<T, E>>,
    E: Debug,
{
    match future.await {
        Ok(v) => v,
        Err(e) => panic!("must_async: unexpected Err: {e:?}"),
    }
}
