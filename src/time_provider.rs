//! Time abstraction layer for testable time-dependent operations
//!
//! Liveness sweeps, reconnect backoff, health sampling, and position-memory
//! snapshots all consume time through this trait so tests can advance a mock
//! clock instead of sleeping.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep as tokio_sleep;

/// Shared handle to a time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Trait for providing time-related functionality
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Sleep for the specified duration
    async fn sleep(&self, duration: Duration);

    /// Current wall-clock time as UTC
    #[must_use]
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Real time provider for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

#[async_trait]
impl TimeProvider for RealTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns the production time provider
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider)
}

/// Mock time provider for tests
///
/// Sleeps yield instead of waiting, and the reported clock can be advanced
/// manually so idle-timeout logic is exercised without real delays.
#[derive(Debug, Default)]
pub struct MockTimeProvider {
    offset_ms: AtomicI64,
    real_delays: AtomicBool,
}

impl MockTimeProvider {
    /// Creates a mock clock that skips delays
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the reported wall clock
    pub fn advance(&self, duration: Duration) {
        self.offset_ms
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    async fn sleep(&self, duration: Duration) {
        if self.real_delays.load(Ordering::Relaxed) {
            tokio_sleep(duration).await;
        } else {
            // Yield so concurrent tasks make progress, without real waiting
            tokio::task::yield_now().await;
        }
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_clock_advances_without_sleeping() {
        let clock = MockTimeProvider::new();
        let before = clock.now_utc();
        clock.advance(Duration::from_secs(90));
        let after = clock.now_utc();
        assert!(after - before >= chrono::Duration::seconds(89));
        // Sleep returns immediately
        clock.sleep(Duration::from_secs(3600)).await;
    }

    #[test]
    fn real_provider_reports_current_time() {
        let clock = RealTimeProvider;
        let delta = (Utc::now() - clock.now_utc()).num_seconds().abs();
        assert!(delta <= 1);
    }
}
