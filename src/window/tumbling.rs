//! Tumbling (disjoint, fixed-size) windows — §4.8.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::clock::Clock;
use crate::metadata::{Metadata, WindowKind, WindowMetadata};
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Buckets items into fixed, non-overlapping windows of `size` and flushes
/// each bucket on a clock-driven ticker aligned to `size`.
pub struct TumblingWindow<T> {
    name: String,
    size: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> TumblingWindow<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, size: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            size,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, T> for TumblingWindow<T>
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
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut ticker = self.clock.ticker(self.size);
            let mut bucket: Vec<Res<T>> = Vec::new();
            let mut window_start = self.clock.now();

            loop {
                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => {
                        // Cancellation discards residual state (§5): no final flush.
                        return;
                    }

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => bucket.push(res),
                            None => {
                                // Input closed: flush the open bucket before closing.
                                if !bucket.is_empty() {
                                    let meta = WindowMetadata {
                                        start: window_start,
                                        end: self.clock.now(),
                                        kind: WindowKind::Tumbling,
                                        size: Some(self.size),
                                        slide: None,
                                        gap: None,
                                    };
                                    for res in bucket.drain(..) {
                                        if !send_or_cancel(&tx, attach(res, meta), &ctx).await {
                                            return;
                                        }
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        let now = self.clock.now();
                        trace!(processor = %name, count = bucket.len(), "tumbling window flush");
                        if !bucket.is_empty() {
                            let meta = WindowMetadata {
                                start: window_start,
                                end: now,
                                kind: WindowKind::Tumbling,
                                size: Some(self.size),
                                slide: None,
                                gap: None,
                            };
                            for res in bucket.drain(..) {
                                if !send_or_cancel(&tx, attach(res, meta), &ctx).await {
                                    return;
                                }
                            }
                        }
                        window_start = now;
                    }
                }
            }
        });

        rx
    }
}

fn attach<T: Clone>(res: Res<T>, meta: WindowMetadata) -> Res<T> {
    res.with_metadata(crate::metadata::WINDOW, Metadata::Window(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn drain(rx: &mut mpsc::Receiver<Res<i32>>) -> Vec<i32> {
        let mut out = Vec::new();
        while let Some(r) = rx.recv().await {
            out.push(*r.value());
        }
        out
    }

    #[tokio::test]
    async fn flushes_on_tick_boundary() {
        let clock = FakeClock::new();
        let win = TumblingWindow::new("tumbling", Duration::from_secs(1), clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = win.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::success(2)).await.unwrap();
        tx.send(Res::success(3)).await.unwrap();
        tokio::task::yield_now().await;

        clock.advance(Duration::from_secs(1));
        clock.block_until_ready().await;

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value(), 1);
        assert!(first.get_metadata(crate::metadata::WINDOW).is_some());
        assert_eq!(*out.recv().await.unwrap().value(), 2);
        assert_eq!(*out.recv().await.unwrap().value(), 3);

        drop(tx);
        assert!(out.recv().await.is_none());
    }

    #[tokio::test]
    async fn final_flush_on_input_close() {
        let clock = FakeClock::new();
        let win = TumblingWindow::new("tumbling", Duration::from_secs(1), clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = win.process(ctx, input);

        tx.send(Res::success(42)).await.unwrap();
        drop(tx);

        let values = drain(&mut out).await;
        assert_eq!(values, vec![42]);
    }

    #[tokio::test]
    async fn cancellation_discards_residual_bucket() {
        let clock = FakeClock::new();
        let win = TumblingWindow::new("tumbling", Duration::from_secs(1), clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = win.process(ctx.clone(), input);

        tx.send(Res::success(1)).await.unwrap();
        tokio::task::yield_now().await;
        ctx.cancel();

        assert!(out.recv().await.is_none());
    }
}
