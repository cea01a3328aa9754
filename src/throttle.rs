//! Throttle — §4.5.
//!
//! Admits at most one item per `interval` using a clock-driven ticker;
//! items arriving while no token is available are dropped and counted.
//! Errors always pass through without consuming a token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::clock::Clock;
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Rate-limits a stream to at most one successful item per `interval`.
pub struct Throttle<T> {
    name: String,
    interval: Duration,
    clock: Arc<dyn Clock>,
    dropped: Arc<AtomicU64>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Throttle<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            interval,
            clock,
            dropped: Arc::new(AtomicU64::new(0)),
            _marker: std::marker::PhantomData,
        }
    }

    /// Equivalent constructor for callers thinking in terms of a rate
    /// rather than an interval.
    pub fn from_rate_per_sec(name: impl Into<String>, rate_per_sec: u32, clock: Arc<dyn Clock>) -> Self {
        assert!(rate_per_sec > 0, "rate_per_sec must be positive");
        Self::new(name, Duration::from_secs(1) / rate_per_sec, clock)
    }

    /// Total items dropped for lack of an available token so far. Shares
    /// state with every clone handed to `process`, so it can be read
    /// after the processor has been spawned.
    pub fn dropped_count(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl<T> Processor<T, T> for Throttle<T>
where
    T: Clone + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut ticker = self.clock.ticker(self.interval);
            // The first item is admitted immediately; thereafter one token
            // is granted per tick.
            let mut available = true;

            loop {
                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => return,

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => {
                                if res.is_error() {
                                    if !send_or_cancel(&tx, res, &ctx).await {
                                        return;
                                    }
                                } else if available {
                                    available = false;
                                    if !send_or_cancel(&tx, res, &ctx).await {
                                        return;
                                    }
                                } else {
                                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                                    trace!(processor = %self.name, total_dropped = total, "throttled item dropped");
                                }
                            }
                            None => return,
                        }
                    }

                    _ = ticker.tick() => {
                        available = true;
                    }
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[tokio::test]
    async fn admits_one_item_per_interval_and_drops_the_rest() {
        let clock = FakeClock::new();
        let throttle = Throttle::new("throttle", Duration::from_millis(100), clock.clone());
        let dropped = throttle.dropped_count();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = throttle.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::success(2)).await.unwrap();
        tx.send(Res::success(3)).await.unwrap();
        tokio::task::yield_now().await;

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value(), 1);
        assert_eq!(dropped.load(Ordering::Relaxed), 2);

        clock.advance(Duration::from_millis(100));
        clock.block_until_ready().await;
        tx.send(Res::success(4)).await.unwrap();
        tokio::task::yield_now().await;

        let second = out.recv().await.unwrap();
        assert_eq!(*second.value(), 4);
        drop(tx);
    }
}
