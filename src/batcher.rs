//! Batcher — §4.3.
//!
//! Accumulates successful values into a growing `Vec<T>`, emitting when the
//! batch reaches `max_size` or `max_latency` elapses since the *first* item
//! of the current batch. Failure results pass through immediately as an
//! error `Res<Vec<T>>`, without consuming a slot in the open batch and
//! without resetting its deadline.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::ConfigError;
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::{Res, StreamError};

/// Buckets a stream of `Res<T>` into `Res<Vec<T>>` by size and/or latency.
pub struct Batcher<T> {
    name: String,
    max_size: usize,
    max_latency: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Batcher<T>
where
    T: Clone + Send + 'static,
{
    /// `max_size == 0` means size-unbounded (latency-only batching);
    /// `max_latency == Duration::ZERO` means latency-disabled (size-only
    /// batching). At least one of the two must be set.
    pub fn new(
        name: impl Into<String>,
        max_size: usize,
        max_latency: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if max_size == 0 && max_latency == Duration::ZERO {
            return Err(ConfigError::NeitherSet {
                processor: "Batcher",
                a: "max_size",
                b: "max_latency",
            });
        }
        Ok(Self {
            name: name.into(),
            max_size,
            max_latency,
            clock,
            _marker: std::marker::PhantomData,
        })
    }
}

fn error_as_vec<T>(err: StreamError<T>) -> StreamError<Vec<T>> {
    StreamError {
        value: err.value.map(|v| vec![v]),
        source: err.source,
        processor: err.processor,
        at: err.at,
        chain: err.chain,
    }
}

impl<T> Processor<T, Vec<T>> for Batcher<T>
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
    ) -> mpsc::Receiver<Res<Vec<T>>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut bucket: Vec<T> = Vec::new();
            let mut batch_start: SystemTime = self.clock.now();

            loop {
                let latency_armed = !bucket.is_empty() && self.max_latency > Duration::ZERO;
                let remaining = if latency_armed {
                    let elapsed = self
                        .clock
                        .now()
                        .duration_since(batch_start)
                        .unwrap_or(Duration::ZERO);
                    self.max_latency.saturating_sub(elapsed)
                } else {
                    Duration::ZERO
                };

                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => return,

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => {
                                match res.as_success() {
                                    Some(value) => {
                                        if bucket.is_empty() {
                                            batch_start = self.clock.now();
                                        }
                                        bucket.push(value.clone());
                                        if self.max_size > 0 && bucket.len() >= self.max_size {
                                            let batch = std::mem::take(&mut bucket);
                                            if !send_or_cancel(&tx, Res::success(batch), &ctx).await {
                                                return;
                                            }
                                        }
                                    }
                                    None => {
                                        let err = error_as_vec(res.into_error());
                                        if !send_or_cancel(&tx, Res::from_error(err), &ctx).await {
                                            return;
                                        }
                                    }
                                }
                            }
                            None => {
                                if !bucket.is_empty() {
                                    if !send_or_cancel(&tx, Res::success(bucket), &ctx).await {
                                        return;
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = self.clock.sleep(remaining), if latency_armed => {
                        let batch = std::mem::take(&mut bucket);
                        if !send_or_cancel(&tx, Res::success(batch), &ctx).await {
                            return;
                        }
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
    use assert_matches::assert_matches;
    use std::io;

    #[tokio::test]
    async fn emits_on_size_trigger() {
        let clock = FakeClock::new();
        let batcher = Batcher::new("batcher", 3, Duration::from_secs(3600), clock).unwrap();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = batcher.process(ctx, input);

        for v in 1..=7 {
            tx.send(Res::success(v)).await.unwrap();
        }
        drop(tx);

        assert_eq!(*out.recv().await.unwrap().value(), vec![1, 2, 3]);
        assert_eq!(*out.recv().await.unwrap().value(), vec![4, 5, 6]);
        assert_eq!(*out.recv().await.unwrap().value(), vec![7]);
        assert_matches!(out.recv().await, None);
    }

    #[tokio::test]
    async fn emits_on_latency_trigger() {
        let clock = FakeClock::new();
        let batcher = Batcher::new("batcher", 100, Duration::from_millis(50), clock.clone()).unwrap();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = batcher.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(20));
        clock.block_until_ready().await;

        tx.send(Res::success(2)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(30));
        clock.block_until_ready().await;

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value(), vec![1, 2]);

        tx.send(Res::success(3)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(80));
        clock.block_until_ready().await;

        let second = out.recv().await.unwrap();
        assert_eq!(*second.value(), vec![3]);
        drop(tx);
    }

    #[tokio::test]
    async fn error_passes_through_without_breaking_batch() {
        let clock = FakeClock::new();
        let batcher = Batcher::new("batcher", 2, Duration::from_secs(3600), clock).unwrap();
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = batcher.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::error(Some(99), io::Error::other("boom"), "source")).await.unwrap();
        tx.send(Res::success(2)).await.unwrap();
        drop(tx);

        let first = out.recv().await.unwrap();
        assert!(first.is_error());
        assert_eq!(first.error_ref().value, Some(vec![99]));

        let second = out.recv().await.unwrap();
        assert_eq!(*second.value(), vec![1, 2]);
    }

    #[tokio::test]
    async fn rejects_when_neither_bound_set() {
        let clock = FakeClock::new();
        let result = Batcher::<i32>::new("batcher", 0, Duration::ZERO, clock);
        assert!(result.is_err());
    }
}
