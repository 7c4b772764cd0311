//! Core environment context trait for Senseye nodes.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Abstracts time and task spawning so the pipeline can run against the real
/// clock in production and a stepped clock in tests.
///
/// # Implementations
///
/// - **Production**: [`crate::TokioContext`] wrapping `tokio::time`
/// - **Tests**: stepped contexts that advance time manually
#[async_trait]
pub trait SenseContext: Send + Sync + 'static {
    /// Monotonic time since context creation.
    ///
    /// Used for backoff timers and duration measurement.
    fn now(&self) -> Duration;

    /// Wall-clock time in seconds since the Unix epoch.
    ///
    /// Stamped onto outgoing beliefs and compared against peer timestamps
    /// for staleness. Best-effort NTP is assumed; no skew correction.
    fn system_time_s(&self) -> f64;

    /// Suspends the calling task for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Spawns a named background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;
}
