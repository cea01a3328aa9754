//! Retry — §4.18. Wraps an inner [`Processor<T, T>`], resubmitting failing
//! items after an exponential backoff delay instead of letting the failure
//! propagate immediately.
//!
//! Grounded on the teacher's `Backoff` helper
//! (`p2panda-net-next/src/actors/discovery/backoff.rs`): a `ChaCha20Rng`-
//! seeded jitter source and a `tokio::time::sleep`-driven delay, adapted
//! from that helper's incremental-random-walk scheme to the capped
//! exponential formula this processor specifies. Retries run on a parallel
//! path and may complete out of order relative to items that were never
//! retried — this mirrors the teacher's own willingness to trade strict
//! ordering for throughput under backoff.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::metadata::Metadata;
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Internal bookkeeping key recording how many attempts an item has used.
/// Not part of the well-known metadata registry (`TIMESTAMP`/`PROCESSOR`/
/// `WINDOW`/`ROUTE`) — private to this module, carried on the same opaque
/// key→value mapping every `Res<T>` already exposes.
const RETRY_ATTEMPT: &str = "retry.attempt";

/// A predicate deciding whether a given failure is worth retrying.
pub type IsRetryable = Arc<dyn Fn(&(dyn std::error::Error + Send + Sync)) -> bool + Send + Sync>;

/// Configuration for [`Retry`].
pub struct Config {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub is_retryable: IsRetryable,
}

impl Config {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
            is_retryable: Arc::new(|_| true),
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_is_retryable(
        mut self,
        f: impl Fn(&(dyn std::error::Error + Send + Sync)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_retryable = Arc::new(f);
        self
    }
}

/// `min(max_delay, base_delay * 2^(attempt-1))`, then "equal jitter"
/// (half the delay fixed, half randomized) when `jitter` is enabled —
/// keeps the sleep close to the computed delay rather than occasionally
/// collapsing to near-zero the way "full jitter" would.
fn backoff_delay(config: &Config, rng: &Mutex<ChaCha8Rng>, attempt: u64) -> Duration {
    let shift = attempt.saturating_sub(1).min(62) as u32;
    let scaled = config.base_delay.as_millis().saturating_mul(1u128 << shift);
    let capped = scaled.min(config.max_delay.as_millis()) as u64;

    if !config.jitter || capped == 0 {
        return Duration::from_millis(capped);
    }

    let half = capped / 2;
    let extra = {
        let mut rng = rng.lock().unwrap();
        rng.random_range(0..=(capped - half))
    };
    Duration::from_millis(half + extra)
}

/// Wraps an inner `Processor<T, T>`, retrying failures under an exponential
/// backoff with an attempt ceiling.
pub struct Retry<T, P> {
    name: String,
    inner: P,
    config: Config,
    clock: Arc<dyn Clock>,
    rng: Mutex<ChaCha8Rng>,
    _marker: std::marker::PhantomData<T>,
}

impl<T, P> Retry<T, P>
where
    T: Clone + Send + 'static,
    P: Processor<T, T>,
{
    pub fn new(name: impl Into<String>, inner: P, config: Config, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            inner,
            config,
            clock,
            rng: Mutex::new(ChaCha8Rng::from_os_rng()),
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T, P> Processor<T, T> for Retry<T, P>
where
    T: Clone + Send + 'static,
    P: Processor<T, T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (inner_tx, inner_rx) = mpsc::channel::<Res<T>>(DEFAULT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        // Items dispatched into the inner processor but not yet finalized
        // (forwarded to `out_tx`). A retry keeps its item "in flight" for
        // the whole resubmission cycle, so the output only closes once the
        // input is exhausted and nothing is left waiting on a retry.
        let in_flight = Arc::new(AtomicI64::new(0));
        let dispatcher_done = Arc::new(AtomicBool::new(false));
        let stop_notify = Arc::new(Notify::new());

        {
            let dispatch_tx = inner_tx.clone();
            let in_flight = in_flight.clone();
            let dispatcher_done = dispatcher_done.clone();
            let stop_notify = stop_notify.clone();
            let dispatch_ctx = ctx.clone();
            let mut input = input;
            tokio::spawn(async move {
                while let Some(item) = recv_or_cancel(&mut input, &dispatch_ctx).await {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    let tagged = item.with_metadata(RETRY_ATTEMPT, Metadata::U64(1));
                    if !send_or_cancel(&dispatch_tx, tagged, &dispatch_ctx).await {
                        return;
                    }
                }
                dispatcher_done.store(true, Ordering::SeqCst);
                stop_notify.notify_waiters();
            });
        }

        let mut inner_rx2 = self.inner.process(ctx.clone(), inner_rx);

        let observe_ctx = ctx.clone();
        let config = self.config;
        let clock = self.clock.clone();
        let rng = self.rng;
        tokio::spawn(async move {
            loop {
                let notified = stop_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if dispatcher_done.load(Ordering::SeqCst) && in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }

                tokio::select! {
                    biased;
                    _ = observe_ctx.cancelled() => return,
                    item = inner_rx2.recv() => {
                        let Some(item) = item else { continue };

                        if item.is_success() {
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            if !send_or_cancel(&out_tx, item, &observe_ctx).await {
                                return;
                            }
                            continue;
                        }

                        let attempt = item
                            .get_metadata(RETRY_ATTEMPT)
                            .and_then(Metadata::as_u64)
                            .unwrap_or(1);
                        let retryable = (config.is_retryable)(item.error_ref().source.as_ref());
                        let exhausted = attempt >= config.max_attempts as u64;
                        let retry_value = item.error_ref().value.clone();

                        if !retryable || exhausted || retry_value.is_none() {
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            if !send_or_cancel(&out_tx, item, &observe_ctx).await {
                                return;
                            }
                            continue;
                        }

                        let delay = backoff_delay(&config, &rng, attempt);
                        let retry_tx = inner_tx.clone();
                        let retry_clock = clock.clone();
                        let retry_ctx = observe_ctx.clone();
                        let value = retry_value.expect("checked above");
                        let next_attempt = attempt + 1;
                        tokio::spawn(async move {
                            tokio::select! {
                                biased;
                                _ = retry_ctx.cancelled() => return,
                                _ = retry_clock.sleep(delay) => {}
                            }
                            let resubmit =
                                Res::success(value).with_metadata(RETRY_ATTEMPT, Metadata::U64(next_attempt));
                            let _ = send_or_cancel(&retry_tx, resubmit, &retry_ctx).await;
                        });
                    }
                    _ = notified => {}
                }
            }
        });

        out_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::io;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `fail_times` attempts for any given value, then
    /// succeeds — tracked globally rather than per-value since the tests
    /// only ever send one value through at a time.
    struct FlakyOnce {
        fail_times: u32,
        seen: Arc<AtomicU32>,
    }

    impl Processor<i32, i32> for FlakyOnce {
        fn name(&self) -> &str {
            "flaky-once"
        }

        fn process(
            self,
            ctx: CancellationToken,
            mut input: mpsc::Receiver<Res<i32>>,
        ) -> mpsc::Receiver<Res<i32>> {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                    let value = *item.value();
                    let attempt = self.seen.fetch_add(1, Ordering::SeqCst) + 1;
                    let out = if attempt <= self.fail_times {
                        Res::error(Some(value), io::Error::other("transient"), "flaky-once")
                    } else {
                        Res::success(value)
                    };
                    if !send_or_cancel(&tx, out, &ctx).await {
                        return;
                    }
                }
            });
            rx
        }
    }

    #[tokio::test]
    async fn retries_until_success_within_attempt_budget() {
        let clock = FakeClock::new();
        let config = Config::new(5, Duration::from_millis(10), Duration::from_millis(100)).with_jitter(false);
        let inner = FlakyOnce {
            fail_times: 2,
            seen: Arc::new(AtomicU32::new(0)),
        };
        let retry = Retry::new("retry", inner, config, clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = retry.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        drop(tx);

        for _ in 0..2 {
            clock.advance(Duration::from_millis(20));
            clock.block_until_ready().await;
            tokio::task::yield_now().await;
        }

        let result = out.recv().await.unwrap();
        assert!(result.is_success());
        assert_eq!(*result.value(), 1);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn non_retryable_errors_are_emitted_immediately() {
        let clock = FakeClock::new();
        let config = Config::new(5, Duration::from_millis(10), Duration::from_millis(100))
            .with_is_retryable(|_| false);
        let inner = FlakyOnce {
            fail_times: 10,
            seen: Arc::new(AtomicU32::new(0)),
        };
        let retry = Retry::new("retry", inner, config, clock);
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = retry.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        drop(tx);

        let result = out.recv().await.unwrap();
        assert!(result.is_error());
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn exhausting_max_attempts_emits_the_final_error() {
        let clock = FakeClock::new();
        let config = Config::new(2, Duration::from_millis(5), Duration::from_millis(50)).with_jitter(false);
        let inner = FlakyOnce {
            fail_times: 10,
            seen: Arc::new(AtomicU32::new(0)),
        };
        let retry = Retry::new("retry", inner, config, clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = retry.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        drop(tx);

        clock.advance(Duration::from_millis(10));
        clock.block_until_ready().await;
        tokio::task::yield_now().await;

        let result = out.recv().await.unwrap();
        assert!(result.is_error());
        assert!(out.recv().await.is_none());
    }
}
