//! Debounce — §4.4.
//!
//! Emits only the most recent value seen during a window of silence: each
//! arrival resets a `quiet` timer; when the timer expires, the pending value
//! is emitted. Errors pass through immediately and do not touch the pending
//! value or its timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Holds at most one pending value, emitted once `quiet` has elapsed since
/// it last arrived.
pub struct Debounce<T> {
    name: String,
    quiet: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Debounce<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, quiet: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            quiet,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, T> for Debounce<T>
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
            // Single pending slot; re-armed on every arrival. No mutex is
            // needed here — the pending value lives entirely on this task's
            // stack, and it is always moved out (never read-while-held)
            // before the send that might yield across an await.
            let mut pending: Option<Res<T>> = None;

            loop {
                let armed = pending.is_some();

                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => return,

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => {
                                if res.is_success() {
                                    pending = Some(res);
                                } else if !send_or_cancel(&tx, res, &ctx).await {
                                    return;
                                }
                            }
                            None => {
                                if let Some(res) = pending.take() {
                                    let _ = send_or_cancel(&tx, res, &ctx).await;
                                }
                                return;
                            }
                        }
                    }

                    _ = self.clock.sleep(self.quiet), if armed => {
                        let res = pending.take().expect("armed implies pending is Some");
                        if !send_or_cancel(&tx, res, &ctx).await {
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
    use std::io;

    #[tokio::test]
    async fn emits_only_the_latest_value_after_quiet_period() {
        let clock = FakeClock::new();
        let debounce = Debounce::new("debounce", Duration::from_millis(50), clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = debounce.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(20));
        clock.block_until_ready().await;

        // Resets the timer; 1 is superseded and never emitted.
        tx.send(Res::success(2)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(50));
        clock.block_until_ready().await;

        let emitted = out.recv().await.unwrap();
        assert_eq!(*emitted.value(), 2);
    }

    #[tokio::test]
    async fn error_passes_through_without_touching_pending_value() {
        let clock = FakeClock::new();
        let debounce = Debounce::new("debounce", Duration::from_millis(50), clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = debounce.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::error(None::<i32>, io::Error::other("boom"), "source")).await.unwrap();
        tokio::task::yield_now().await;

        let err = out.recv().await.unwrap();
        assert!(err.is_error());

        clock.advance(Duration::from_millis(50));
        clock.block_until_ready().await;
        let emitted = out.recv().await.unwrap();
        assert_eq!(*emitted.value(), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn flushes_pending_value_on_input_close() {
        let clock = FakeClock::new();
        let debounce = Debounce::new("debounce", Duration::from_secs(3600), clock);
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = debounce.process(ctx, input);

        tx.send(Res::success(7)).await.unwrap();
        drop(tx);

        let emitted = out.recv().await.unwrap();
        assert_eq!(*emitted.value(), 7);
        assert!(out.recv().await.is_none());
    }
}
