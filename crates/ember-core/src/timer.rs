//! Timers backing reconnect, rejoin and heartbeat scheduling.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

/// Computes the delay for a given attempt number.
pub type TimerCalculation = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Reconnect schedule for a lost transport.
///
/// Steps through a fixed table, then saturates at five seconds.
pub fn reconnect_after(tries: u32) -> Duration {
    const STEPS: [u64; 10] = [10, 10, 50, 100, 150, 200, 250, 500, 1_000, 2_000];
    STEPS
        .get(tries as usize)
        .map(|ms| Duration::from_millis(*ms))
        .unwrap_or(Duration::from_secs(5))
}

/// Rejoin schedule for a channel after a failed or lost join.
///
/// Steps through a fixed table, then saturates at ten seconds.
pub fn rejoin_after(tries: u32) -> Duration {
    const STEPS: [u64; 4] = [1, 1, 2, 5];
    STEPS
        .get(tries as usize)
        .map(|s| Duration::from_secs(*s))
        .unwrap_or(Duration::from_secs(10))
}

// =============================================================================
// TimeoutTimer
// =============================================================================

/// A one-shot timer with an attempt counter.
///
/// Each [`schedule_timeout`](TimeoutTimer::schedule_timeout) cancels any
/// pending fire, asks the injected calculation for the next delay, and bumps
/// the counter. Firing does not auto-reschedule; callers that want
/// exponential behavior call `schedule_timeout` again from the callback.
pub struct TimeoutTimer {
    callback: Arc<dyn Fn() + Send + Sync>,
    calculation: TimerCalculation,
    tries: AtomicU32,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutTimer {
    /// Creates a timer with the given fire callback and delay calculation.
    pub fn new(
        callback: impl Fn() + Send + Sync + 'static,
        calculation: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        Self {
            callback: Arc::new(callback),
            calculation: Arc::new(calculation),
            tries: AtomicU32::new(0),
            task: Mutex::new(None),
        }
    }

    /// Cancels any pending fire and resets the attempt counter.
    pub fn reset(&self) {
        self.tries.store(0, Ordering::Relaxed);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// Schedules the callback after the delay for the next attempt.
    pub fn schedule_timeout(&self) {
        let mut task = self.task.lock();
        if let Some(prev) = task.take() {
            prev.abort();
        }
        let attempt = self.tries.load(Ordering::Relaxed) + 1;
        self.tries.store(attempt, Ordering::Relaxed);
        let delay = (self.calculation)(attempt);
        let callback = Arc::clone(&self.callback);
        *task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        }));
    }

    /// Attempts made since the last reset.
    pub fn tries(&self) -> u32 {
        self.tries.load(Ordering::Relaxed)
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// =============================================================================
// HeartbeatTimer
// =============================================================================

/// A repeating timer driving the socket heartbeat.
///
/// The tick loop runs on its own spawned task so liveness detection keeps
/// working while the dispatch path is busy. Delivery jitter is acceptable:
/// missed ticks are delayed, not burst.
#[derive(Clone)]
pub struct HeartbeatTimer {
    interval: Duration,
    inner: Arc<HeartbeatInner>,
}

impl std::fmt::Debug for HeartbeatTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatTimer")
            .field("interval", &self.interval)
            .finish()
    }
}

struct HeartbeatInner {
    handler: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatTimer {
    /// Creates a stopped timer with the given period.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            inner: Arc::new(HeartbeatInner {
                handler: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    /// Starts ticking, replacing any previous handler.
    ///
    /// The first tick fires one full period after `start`.
    pub fn start(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.stop();
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::new(handler);
        *self.inner.handler.lock() = Some(Arc::clone(&handler));

        let period = self.interval;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                handler();
            }
        });
        *self.inner.task.lock() = Some(task);
    }

    /// Stops ticking and drops the handler.
    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        *self.inner.handler.lock() = None;
    }

    /// Whether the timer is currently ticking.
    pub fn is_valid(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Invokes the handler immediately, out of band. Test hook.
    pub fn fire(&self) {
        let handler = self.inner.handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl PartialEq for HeartbeatTimer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for HeartbeatTimer {}

impl Drop for HeartbeatInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn reconnect_schedule_matches_table() {
        assert_eq!(reconnect_after(0), Duration::from_millis(10));
        assert_eq!(reconnect_after(1), Duration::from_millis(10));
        assert_eq!(reconnect_after(2), Duration::from_millis(50));
        assert_eq!(reconnect_after(5), Duration::from_millis(200));
        assert_eq!(reconnect_after(9), Duration::from_millis(2_000));
        assert_eq!(reconnect_after(10), Duration::from_secs(5));
        assert_eq!(reconnect_after(500), Duration::from_secs(5));
    }

    #[test]
    fn rejoin_schedule_matches_table() {
        assert_eq!(rejoin_after(0), Duration::from_secs(1));
        assert_eq!(rejoin_after(1), Duration::from_secs(1));
        assert_eq!(rejoin_after(2), Duration::from_secs(2));
        assert_eq!(rejoin_after(3), Duration::from_secs(5));
        assert_eq!(rejoin_after(4), Duration::from_secs(10));
        assert_eq!(rejoin_after(100), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_timer_counts_attempts_and_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let timer = TimeoutTimer::new(
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            |_| Duration::from_millis(5),
        );

        timer.schedule_timeout();
        assert_eq!(timer.tries(), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        timer.schedule_timeout();
        assert_eq!(timer.tries(), 2);
        timer.reset();
        assert_eq!(timer.tries(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The reset cancelled the pending fire.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reschedule_cancels_previous_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let timer = TimeoutTimer::new(
            move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            },
            |_| Duration::from_millis(20),
        );

        timer.schedule_timeout();
        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn heartbeat_fire_invokes_handler_directly() {
        let beats = Arc::new(AtomicUsize::new(0));
        let beats_clone = Arc::clone(&beats);
        let timer = HeartbeatTimer::new(Duration::from_secs(60));
        timer.start(move || {
            beats_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timer.is_valid());
        timer.fire();
        timer.fire();
        assert_eq!(beats.load(Ordering::SeqCst), 2);

        timer.stop();
        assert!(!timer.is_valid());
        timer.fire();
        assert_eq!(beats.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn heartbeat_ticks_on_interval() {
        let beats = Arc::new(AtomicUsize::new(0));
        let beats_clone = Arc::clone(&beats);
        let timer = HeartbeatTimer::new(Duration::from_millis(10));
        timer.start(move || {
            beats_clone.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        timer.stop();
        assert!(beats.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn heartbeat_timers_compare_by_instance() {
        let a = HeartbeatTimer::new(Duration::from_secs(1));
        let b = HeartbeatTimer::new(Duration::from_secs(1));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }
}
