//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::time::Duration;

/// Idle wait used by test work lists. Short so tests stay fast.
pub const SLEEP: Duration = Duration::from_millis(5);

/// Poll `cond` until it holds or `timeout` elapses. Returns the last result.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
