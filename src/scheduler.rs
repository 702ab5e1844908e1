//! Rate-limited scheduler (C5).
//!
//! Drives every active feed of one session on a shared clock so that the
//! total request rate never exceeds `MAX_REQS_PER_HOUR`. On each tick
//! every registered feed gets one refresh "shot"; all shots for a tick
//! are drained together so a user's timelines all refresh in the same
//! breath, then the scheduler waits `REFRESH_DELAY * N_active` seconds
//! before the next tick — total load scales with the number of feeds
//! the user watches but never exceeds the hourly budget.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

type ShotFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct RegisteredFeed {
    shot: ShotFn,
}

struct SchedulerInner {
    feeds: DashMap<u64, RegisteredFeed>,
    next_id: AtomicU64,
    running: AtomicBool,
    /// Woken by resched()/wait_rate_limit()/destroy() to make the tick
    /// loop re-evaluate its sleep target early. Multiple wakeups before
    /// the loop gets a chance to observe them coalesce into one,
    /// because `Notify::notify_one` only ever holds a single permit.
    wake: Notify,
    /// The instant the next tick is allowed to run. Normally advanced by
    /// `REFRESH_DELAY * N_active` after every tick; `wait_rate_limit`
    /// may push it further out, never closer.
    next_tick_at: parking_lot::Mutex<Instant>,
    refresh_delay: Duration,
}

impl SchedulerInner {
    /// Push the next tick out to `reset_at` if that is further away than
    /// the base interval; never pulls it closer. Shared by
    /// [`Scheduler::wait_rate_limit`] and [`FeedHandle::wait_rate_limit`].
    fn wait_rate_limit(&self, reset_at: Instant) {
        let base_floor = Instant::now() + self.refresh_delay;
        if reset_at > base_floor {
            let mut next = self.next_tick_at.lock();
            *next = reset_at;
            drop(next);
            self.wake.notify_one();
        }
    }
}

/// Drives all of one session's feeds. One instance per authenticated
/// session (per `spec.md`'s ownership model: "Per-session: everything
/// else" besides the process-global identity cache and account store).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    task: Arc<parking_lot::Mutex<Option<JoinHandle<()>>>>,
}

/// A handle to a single registered feed, returned by [`Scheduler::register`].
pub struct FeedHandle {
    id: u64,
    inner: Arc<SchedulerInner>,
    destroyed: AtomicBool,
}

impl FeedHandle {
    /// Mark this feed pending for the next tick. Since every tick already
    /// drains every registered feed, the practical effect is waking an
    /// idle scheduler (or a scheduler mid-sleep between ticks) so the
    /// next tick happens now rather than at the end of its normal wait.
    /// Multiple calls before the next tick runs collapse into one.
    pub fn resched(&self) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let mut next = self.inner.next_tick_at.lock();
        if *next > now {
            *next = now;
        }
        drop(next);
        self.inner.wake.notify_one();
    }

    /// Called by the owning feed when the remote API signals budget
    /// exhaustion (`spec.md` §4.5/§7 kind-3): push the next tick out to
    /// `reset_at` instead of pulling it to now, the way `resched()` would.
    pub fn wait_rate_limit(&self, reset_at: Instant) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.wait_rate_limit(reset_at);
    }

    /// Remove this feed from the active set. A destroyed handle must
    /// never be invoked again.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.feeds.remove(&self.id);
        self.inner.wake.notify_one();
    }
}

impl Scheduler {
    pub fn new(refresh_delay: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                feeds: DashMap::new(),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                wake: Notify::new(),
                next_tick_at: parking_lot::Mutex::new(Instant::now()),
                refresh_delay,
            }),
            task: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    /// Register a feed's refresh shot. If the scheduler is running, the
    /// feed joins the very next tick.
    pub fn register<F, Fut>(&self, shot: F) -> FeedHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.feeds.insert(
            id,
            RegisteredFeed {
                shot: Arc::new(move || Box::pin(shot())),
            },
        );
        self.inner.wake.notify_one();
        FeedHandle {
            id,
            inner: self.inner.clone(),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Called by a feed when the remote API signals budget exhaustion.
    /// Pushes the next tick out to `reset_at` if that is further away
    /// than the scheduler's base interval; never pulls it closer.
    pub fn wait_rate_limit(&self, reset_at: Instant) {
        self.inner.wait_rate_limit(reset_at);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.inner.feeds.len()
    }

    /// Start the tick loop as a background task. No-op if already running.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.inner.next_tick_at.lock() = Instant::now();

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            while inner.running.load(Ordering::SeqCst) {
                let target = *inner.next_tick_at.lock();
                let now = Instant::now();
                if target > now {
                    tokio::select! {
                        _ = tokio::time::sleep(target - now) => {}
                        _ = inner.wake.notified() => {
                            // woken early by resched()/wait_rate_limit()/destroy();
                            // loop back around and re-check the (possibly updated) target.
                            continue;
                        }
                    }
                }
                if !inner.running.load(Ordering::SeqCst) {
                    break;
                }

                if inner.feeds.is_empty() {
                    // nothing to do; wait for a registration to wake us.
                    inner.wake.notified().await;
                    continue;
                }

                let shots: Vec<ShotFn> =
                    inner.feeds.iter().map(|e| e.value().shot.clone()).collect();
                futures_util::future::join_all(shots.iter().map(|s| s())).await;

                let n = shots.len().max(1) as u32;
                *inner.next_tick_at.lock() = Instant::now() + inner.refresh_delay * n;
            }
        });

        *self.task.lock() = Some(handle);
    }

    /// Stop the tick loop, cancelling any pending tick.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn tick_interval_scales_with_active_feed_count() {
        let sched = Scheduler::new(Duration::from_millis(100));
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = calls.clone();
        let h1 = sched.register(move || {
            let c1 = c1.clone();
            async move {
                c1.fetch_add(1, Ordering::SeqCst);
            }
        });
        let c2 = calls.clone();
        let h2 = sched.register(move || {
            let c2 = c2.clone();
            async move {
                c2.fetch_add(1, Ordering::SeqCst);
            }
        });

        sched.start();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "first tick drains every registered feed");

        // with 2 active feeds, next tick is 100ms * 2 = 200ms away.
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "too early for the next tick");

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4, "second tick fires once interval elapses");

        sched.stop();
        h1.destroy();
        h2.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn destroyed_handle_is_never_called_again() {
        let sched = Scheduler::new(Duration::from_millis(50));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = sched.register(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        sched.start();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.destroy();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no further shots after destroy");
        sched.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_rate_limit_extends_next_tick_past_reset_time() {
        let sched = Scheduler::new(Duration::from_millis(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = sched.register(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        sched.start();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // reset is far beyond the 10ms base interval
        sched.wait_rate_limit(Instant::now() + Duration::from_secs(10));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "tick postponed past the reset time");

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        sched.stop();
        handle.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn resched_wakes_an_idle_scheduler_early() {
        let sched = Scheduler::new(Duration::from_secs(3600));
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = sched.register(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        sched.start();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.resched();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "resched triggers an immediate extra tick");

        sched.stop();
        handle.destroy();
    }
}
