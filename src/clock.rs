//! Pluggable time source every time-dependent processor is built against.
//!
//! The teacher's own reconnection backoff (`p2panda-net`'s `Backoff` helper)
//! swaps `std::time::Instant` for `mock_instant`'s thread-local clock under
//! `#[cfg(test)]`. That works for a single global clock, but this crate needs
//! many independent processors under test at once (a batcher and a debounce
//! in the same test advancing on different schedules), so instead of a
//! thread-local swap we inject the clock as an explicit dependency — the
//! same shape the teacher uses for stores (`OperationStore`) and engines
//! (`Engine`), just applied to time.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;

/// A source of time: wall-clock reads, sleeps, and periodic tickers.
///
/// `now()` returns `SystemTime` (not `Instant`) so it composes directly
/// with [`crate::metadata::WindowMetadata`] and `StreamError::at` without a
/// conversion step — every timestamp a processor ever records comes from
/// its injected clock.
///
/// Implemented by [`RealClock`] (backed by `tokio::time`) and [`FakeClock`]
/// (manually advanced, for deterministic tests). Processors hold their
/// clock as `Arc<dyn Clock>` so it can be shared with spawned workers.
#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;

    async fn sleep(&self, duration: Duration);

    /// Returns a fresh, independent ticker firing every `period`.
    fn ticker(&self, period: Duration) -> Box<dyn Ticker>;
}

/// A periodic timer. Each call to [`tick`](Ticker::tick) resolves once per
/// period, matching `tokio::time::Interval::tick`.
#[async_trait]
pub trait Ticker: Send {
    async fn tick(&mut self);
}

/// The real clock: every method delegates to `tokio::time`.
#[derive(Debug, Clone, Default)]
pub struct RealClock;

impl RealClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn ticker(&self, period: Duration) -> Box<dyn Ticker> {
        Box::new(RealTicker(tokio::time::interval(period)))
    }
}

struct RealTicker(tokio::time::Interval);

#[async_trait]
impl Ticker for RealTicker {
    async fn tick(&mut self) {
        self.0.tick().await;
    }
}

/// A manually driven virtual clock for deterministic tests.
///
/// `now()` always equals a fixed base `Instant` plus the virtual offset
/// accumulated by [`advance`](FakeClock::advance). [`block_until_ready`]
/// is the synchronization barrier: it resolves only once every sleep and
/// ticker callback scheduled at or before the current virtual time has
/// fired, so a test can `advance` and then immediately observe the
/// resulting emissions without a race against task scheduling.
///
/// Always constructed behind an `Arc` (via [`FakeClock::new`]) since every
/// ticker it hands out needs to outlive the borrow that created it.
#[derive(Debug)]
pub struct FakeClock {
    base: SystemTime,
    offset: Mutex<Duration>,
    /// Deadlines (as an offset from `base`) of every outstanding sleep or
    /// tick wait that has not yet fired.
    pending: Mutex<Vec<Duration>>,
    notify: Notify,
    self_handle: Weak<FakeClock>,
}

impl FakeClock {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| FakeClock {
            base: SystemTime::now(),
            offset: Mutex::new(Duration::ZERO),
            pending: Mutex::new(Vec::new()),
            notify: Notify::new(),
            self_handle: weak.clone(),
        })
    }

    /// Advances virtual time by `duration`. Does not itself wait for
    /// woken tasks to finish reacting — pair with [`block_until_ready`]
    /// when a test needs that guarantee.
    ///
    /// [`block_until_ready`]: FakeClock::block_until_ready
    pub fn advance(&self, duration: Duration) {
        {
            let mut offset = self.offset.lock().unwrap();
            *offset += duration;
        }
        self.notify.notify_waiters();
    }

    /// Blocks until every sleep/tick deadline at or before the current
    /// virtual time has fired (i.e. the waiting future has resumed and
    /// deregistered itself). Yields to the scheduler between checks so
    /// woken tasks get a chance to run.
    pub async fn block_until_ready(&self) {
        loop {
            let offset = *self.offset.lock().unwrap();
            let still_due = self
                .pending
                .lock()
                .unwrap()
                .iter()
                .any(|deadline| *deadline <= offset);
            if !still_due {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    fn register(&self, deadline: Duration) {
        self.pending.lock().unwrap().push(deadline);
    }

    fn deregister(&self, deadline: Duration) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(pos) = pending.iter().position(|d| *d == deadline) {
            pending.remove(pos);
        }
    }

    async fn wait_until(&self, deadline: Duration) {
        self.register(deadline);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if *self.offset.lock().unwrap() >= deadline {
                break;
            }
            notified.await;
        }
        self.deregister(deadline);
    }

    fn arc_handle(&self) -> Arc<FakeClock> {
        self.self_handle
            .upgrade()
            .expect("FakeClock used after its owning Arc was dropped")
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        self.base + *self.offset.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = *self.offset.lock().unwrap() + duration;
        self.wait_until(deadline).await;
    }

    fn ticker(&self, period: Duration) -> Box<dyn Ticker> {
        Box::new(FakeTicker {
            clock: self.arc_handle(),
            period,
            next_deadline: *self.offset.lock().unwrap() + period,
        })
    }
}

struct FakeTicker {
    clock: Arc<FakeClock>,
    period: Duration,
    next_deadline: Duration,
}

#[async_trait]
impl Ticker for FakeTicker {
    async fn tick(&mut self) {
        self.clock.wait_until(self.next_deadline).await;
        self.next_deadline += self.period;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_resolves_only_after_advance() {
        let clock = FakeClock::new();
        let c2 = clock.clone();
        let handle = tokio::spawn(async move {
            c2.sleep(Duration::from_millis(50)).await;
        });

        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        clock.advance(Duration::from_millis(50));
        clock.block_until_ready().await;
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ticker_fires_once_per_period() {
        let clock = FakeClock::new();
        let mut ticker = clock.ticker(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            ticker.tick().await;
            ticker.tick().await;
        });

        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(10));
        clock.block_until_ready().await;
        tokio::task::yield_now().await;

        clock.advance(Duration::from_millis(10));
        clock.block_until_ready().await;

        handle.await.unwrap();
    }
}
