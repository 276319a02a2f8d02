//! Process-wide collaborators shared by a replay controller.
//!
//! Everything that would otherwise be an ambient global (the clock, the
//! rate-limit table, the sticky storage, the transport and the recorder
//! factory) is grouped in a [`ReplayContext`] and handed to the controller
//! at construction. The rate-limit table lives as long as the context, so
//! a controller restarted with the same context keeps honouring limits.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::delivery::rate_limits::RateLimiter;
use crate::delivery::transport::Transport;
use crate::recording::recorder::DomRecorder;
use crate::storage::storage_trait::SessionStorage;

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall-clock anchor advanced by tokio's monotonic clock.
///
/// Under a paused tokio runtime the reported time moves with
/// `tokio::time::advance`, keeping timestamps consistent with timers.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_ms: i64,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now().timestamp_millis())
    }

    pub fn starting_at(anchor_ms: i64) -> Self {
        Self {
            anchor_ms,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as i64
    }
}

#[derive(Clone)]
pub struct ReplayContext {
    pub clock: Arc<dyn Clock>,
    pub rate_limits: RateLimiter,
    pub storage: Arc<dyn SessionStorage>,
    pub transport: Arc<dyn Transport>,
    pub recorder: Arc<dyn DomRecorder>,
}

impl ReplayContext {
    pub fn new(
        storage: Arc<dyn SessionStorage>,
        transport: Arc<dyn Transport>,
        recorder: Arc<dyn DomRecorder>,
    ) -> Self {
        Self {
            clock: Arc::new(TokioClock::new()),
            rate_limits: RateLimiter::new(),
            storage,
            transport,
            recorder,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl fmt::Debug for ReplayContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayContext")
            .field("now_ms", &self.clock.now_ms())
            .field("rate_limits", &self.rate_limits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        tokio::time::advance(Duration::from_millis(2_500)).await;
        assert_eq!(clock.now_ms(), 3_500);
    }
}
