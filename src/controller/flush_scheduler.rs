//! Flush scheduling primitives.
//!
//! Components:
//! - [`Debouncer`]: collapses bursts of flush requests into one call, run
//!   `wait` after the last request but never later than `max_wait` after
//!   the first one of the burst.
//! - [`FlushLock`]: lets one flush run at a time and remembers whether
//!   anything asked for a flush meanwhile, so exactly one follow-up can be
//!   scheduled once it settles.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub type FlushCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct PendingCall {
    first_call: Instant,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct DebounceState {
    generation: u64,
    pending: Option<PendingCall>,
}

/// Trailing-edge debouncer with a maximum wait.
pub struct Debouncer {
    wait: Duration,
    max_wait: Duration,
    callback: FlushCallback,
    state: Arc<Mutex<DebounceState>>,
}

impl Debouncer {
    pub fn new(wait: Duration, max_wait: Duration, callback: FlushCallback) -> Self {
        Self {
            wait,
            max_wait: max_wait.max(wait),
            callback,
            state: Arc::new(Mutex::new(DebounceState::default())),
        }
    }

    /// Requests a call. Must run inside a tokio runtime.
    pub fn schedule(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let now = Instant::now();
        let first_call = match state.pending.take() {
            Some(pending) => {
                pending.timer.abort();
                pending.first_call
            }
            None => now,
        };
        state.generation += 1;
        let generation = state.generation;
        let deadline = (now + self.wait).min(first_call + self.max_wait);

        let shared = Arc::clone(&self.state);
        let callback = Arc::clone(&self.callback);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let fire = match shared.lock() {
                Ok(mut state) if state.generation == generation => {
                    state.pending = None;
                    true
                }
                _ => false,
            };
            if fire {
                callback().await;
            }
        });
        state.pending = Some(PendingCall { first_call, timer });
    }

    /// Drops the pending call, if any.
    pub fn cancel(&self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(pending) = state.pending.take() {
                trace!("Cancelling scheduled flush");
                pending.timer.abort();
            }
            state.generation += 1;
        }
    }

    /// Runs the pending call now instead of at its deadline.
    ///
    /// Returns the call to await, or `None` if nothing was pending.
    pub fn flush_now(&self) -> Option<BoxFuture<'static, ()>> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };
        let pending = state.pending.take()?;
        pending.timer.abort();
        state.generation += 1;
        Some((self.callback)())
    }

    pub fn is_pending(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.pending.is_some())
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct LockState {
    in_flight: bool,
    follow_up: bool,
}

/// Single-flight gate for flushes.
#[derive(Debug)]
pub struct FlushLock {
    state: Mutex<LockState>,
    idle: watch::Sender<bool>,
}

impl Default for FlushLock {
    fn default() -> Self {
        Self::new()
    }
}

impl FlushLock {
    pub fn new() -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            state: Mutex::new(LockState::default()),
            idle,
        }
    }

    /// Takes the lock, or records a follow-up request if a flush is running.
    pub fn try_acquire(&self) -> Option<FlushGuard<'_>> {
        let mut state = self.state.lock().ok()?;
        if state.in_flight {
            state.follow_up = true;
            return None;
        }
        state.in_flight = true;
        self.idle.send_replace(false);
        Some(FlushGuard {
            lock: self,
            released: false,
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.in_flight)
            .unwrap_or(false)
    }

    /// Resolves once no flush is running.
    pub async fn wait_idle(&self) {
        let mut rx = self.idle.subscribe();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    fn release(&self) -> bool {
        let follow_up = match self.state.lock() {
            Ok(mut state) => {
                state.in_flight = false;
                std::mem::take(&mut state.follow_up)
            }
            Err(_) => false,
        };
        self.idle.send_replace(true);
        follow_up
    }
}

/// Held while a flush runs. Dropping it releases the lock as well.
pub struct FlushGuard<'a> {
    lock: &'a FlushLock,
    released: bool,
}

impl FlushGuard<'_> {
    /// Releases the lock. Returns whether a follow-up flush was requested
    /// while it was held.
    pub fn release(mut self) -> bool {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_debouncer(wait_ms: u64, max_wait_ms: u64) -> (Debouncer, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let callback: FlushCallback = Arc::new(move || -> BoxFuture<'static, ()> {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        (
            Debouncer::new(
                Duration::from_millis(wait_ms),
                Duration::from_millis(max_wait_ms),
                callback,
            ),
            calls,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_call() {
        let (debouncer, calls) = counting_debouncer(5_000, 5_500);
        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        debouncer.schedule();
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Capped at max_wait after the first request.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_the_pending_call() {
        let (debouncer, calls) = counting_debouncer(100, 100);
        debouncer.schedule();
        debouncer.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_now_runs_only_when_pending() {
        let (debouncer, calls) = counting_debouncer(5_000, 5_000);
        assert!(debouncer.flush_now().is_none());

        debouncer.schedule();
        debouncer.flush_now().unwrap().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_requests_leave_a_single_follow_up() {
        let lock = FlushLock::new();
        let guard = lock.try_acquire().unwrap();
        for _ in 0..5 {
            assert!(lock.try_acquire().is_none());
        }
        assert!(lock.is_in_flight());
        assert!(guard.release());

        let guard = lock.try_acquire().unwrap();
        assert!(!guard.release());
    }

    #[test]
    fn wait_idle_wakes_when_the_flush_settles() {
        let lock = FlushLock::new();
        let guard = lock.try_acquire().unwrap();
        let mut waiter = tokio_test::task::spawn(lock.wait_idle());
        tokio_test::assert_pending!(waiter.poll());

        guard.release();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn dropped_guard_releases_the_lock() {
        let lock = FlushLock::new();
        drop(lock.try_acquire().unwrap());
        assert!(!lock.is_in_flight());
        lock.wait_idle().await;
        assert!(lock.try_acquire().is_some());
    }
}
