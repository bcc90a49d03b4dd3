//! Results of side effects whose failure must not fail the caller.
//!
//! Cache reads and writes, cache invalidation and the fast-path flush all
//! return a `BestEffort`. The caller acknowledges it with `absorb`, which logs
//! and counts a failure and hands back the value on success, so every place
//! that drops an error is visible at the call site.
use std::fmt::Display;

use tracing::warn;

#[must_use = "acknowledge best-effort results with `absorb`"]
#[derive(Debug)]
pub struct BestEffort<T, E>(Result<T, E>);

impl<T, E: Display> BestEffort<T, E> {
    /// Log and count a failure under `operation`, returning the value on success.
    pub fn absorb(self, operation: &'static str) -> Option<T> {
        match self.0 {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(operation, %error, "best-effort operation failed");
                metrics::counter!("best_effort_failures_total", "operation" => operation)
                    .increment(1);
                None
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.0.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.0
    }
}

impl<T, E> From<Result<T, E>> for BestEffort<T, E> {
    fn from(result: Result<T, E>) -> Self {
        BestEffort(result)
    }
}
