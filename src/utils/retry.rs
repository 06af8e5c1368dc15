//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. Provides standard
//! backoff configurations for broker connects, resubscribes and explicit
//! publish retries.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker connection retries.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
///
/// Callers narrow it with the configured bounds.
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Backoff for re-registering a consumer after its stream ended.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 10
/// - Jitter enabled
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(10)
        .with_jitter()
}

/// Backoff for caller-requested publish retries.
///
/// - Min delay: 10ms
/// - Max delay: 2s
/// - Jitter enabled
///
/// Attempt count comes from the retry policy.
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(2))
        .with_jitter()
}
