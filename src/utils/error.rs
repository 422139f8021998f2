//! Error handling utilities for graceful degradation
//!
//! Helpers for the "log and carry on" patterns used around optional
//! collaborators such as the persistent store backend.

use tracing::warn;

/// Execute an operation and log errors without failing
///
/// Returns `Some(T)` on success, `None` on error (after logging).
///
/// # Example
/// ```rust
/// use resource_loader::utils::log_error;
///
/// let parsed = log_error(|| "42".parse::<u32>(), "Failed to parse");
/// assert_eq!(parsed, Some(42));
/// ```
pub fn log_error<F, T, E>(operation: F, context: &str) -> Option<T>
where
    F: FnOnce() -> Result<T, E>,
    E: std::fmt::Display,
{
    match operation() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{}: {}", context, e);
            None
        }
    }
}

/// Execute an operation with a fallback on error
///
/// Logs a warning when the fallback is used.
///
/// # Example
/// ```rust
/// use resource_loader::utils::with_fallback;
///
/// let value = with_fallback(|| "x".parse::<u32>(), || 7, "Parse failed, using fallback");
/// assert_eq!(value, 7);
/// ```
pub fn with_fallback<F1, F2, T, E>(primary: F1, fallback: F2, context: &str) -> T
where
    F1: FnOnce() -> Result<T, E>,
    F2: FnOnce() -> T,
    E: std::fmt::Display,
{
    match primary() {
        Ok(value) => value,
        Err(e) => {
            warn!("{}: {}", context, e);
            fallback()
        }
    }
}
