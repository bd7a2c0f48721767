//! Retry utilities: backoff builders for broker reconnection.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker reconnection.
///
/// - Min delay: `min`
/// - Max delay: `max`
/// - Max attempts: unbounded
/// - Jitter enabled
pub fn reconnect_backoff(min: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .with_max_times(usize::MAX)
        .with_jitter()
}
