//! Bounded exponential backoff for retryable operations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::types::{MareaError, Result};

pub const BACKOFF_INITIAL_MS: u64 = 10;
pub const BACKOFF_MAX_MS: u64 = 1_000;
pub const BACKOFF_MAX_ATTEMPTS: u32 = 40;

/// Retries `op` under exponential backoff until it succeeds, the attempt
/// budget is exhausted (returning the last error), or `stop` is observed
/// (returning `Shutdown`).
pub fn with_backoff<T>(
    label: &'static str,
    stop: &AtomicBool,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = BACKOFF_INITIAL_MS;
    let mut attempt = 0u32;
    loop {
        if stop.load(Ordering::Acquire) {
            return Err(MareaError::Shutdown(label));
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= BACKOFF_MAX_ATTEMPTS {
                    return Err(err);
                }
                debug!(label, attempt, delay_ms, error = %err, "retry.backoff");
                thread::sleep(Duration::from_millis(delay_ms));
                delay_ms = (delay_ms * 2).min(BACKOFF_MAX_MS);
            }
        }
    }
}
