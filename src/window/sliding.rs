//! Sliding (overlapping, fixed-size) windows — §4.9.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::metadata::{Metadata, WindowKind, WindowMetadata};
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

struct OpenWindow<T> {
    meta: WindowMetadata,
    results: Vec<Res<T>>,
}

/// Opens a new window every `slide` and closes it `size` after it opened;
/// a result belongs to every window open at the time it arrives.
pub struct SlidingWindow<T> {
    name: String,
    size: Duration,
    slide: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> SlidingWindow<T>
where
    T: Clone + Send + 'static,
{
    /// Panics if `slide > size` — the spec requires `slide <= size`
    /// (`slide == size` degenerates into [`TumblingWindow`](super::TumblingWindow)).
    pub fn new(name: impl Into<String>, size: Duration, slide: Duration, clock: Arc<dyn Clock>) -> Self {
        assert!(slide <= size, "sliding window requires slide <= size");
        Self {
            name: name.into(),
            size,
            slide,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, T> for SlidingWindow<T>
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
            let mut ticker = self.clock.ticker(self.slide);
            let mut windows: VecDeque<OpenWindow<T>> = VecDeque::new();

            // The very first window opens immediately so items arriving
            // before the first slide tick still have a home.
            windows.push_back(open_window(self.clock.now(), self.size, self.slide));

            loop {
                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => return,

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => {
                                for w in windows.iter_mut() {
                                    w.results.push(res.clone());
                                }
                            }
                            None => {
                                // Flush every still-open window, oldest first.
                                for w in windows.drain(..) {
                                    for res in w.results {
                                        if !send_or_cancel(&tx, attach(res, w.meta), &ctx).await {
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

                        // Close every window whose end has passed, oldest first
                        // (windows close in FIFO order by construction).
                        while windows.front().is_some_and(|w| w.meta.end <= now) {
                            let w = windows.pop_front().unwrap();
                            for res in w.results {
                                if !send_or_cancel(&tx, attach(res, w.meta), &ctx).await {
                                    return;
                                }
                            }
                        }

                        windows.push_back(open_window(now, self.size, self.slide));
                    }
                }
            }
        });

        rx
    }
}

fn open_window<T>(start: std::time::SystemTime, size: Duration, slide: Duration) -> OpenWindow<T> {
    OpenWindow {
        meta: WindowMetadata {
            start,
            end: start + size,
            kind: WindowKind::Sliding,
            size: Some(size),
            slide: Some(slide),
            gap: None,
        },
        results: Vec::new(),
    }
}

fn attach<T: Clone>(res: Res<T>, meta: WindowMetadata) -> Res<T> {
    res.with_metadata(crate::metadata::WINDOW, Metadata::Window(meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[tokio::test]
    async fn item_belongs_to_every_currently_open_window() {
        let clock = FakeClock::new();
        let win = SlidingWindow::new(
            "sliding",
            Duration::from_millis(100),
            Duration::from_millis(50),
            clock.clone(),
        );
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = win.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tokio::task::yield_now().await;

        clock.advance(Duration::from_millis(50));
        clock.block_until_ready().await;

        tx.send(Res::success(2)).await.unwrap();
        tokio::task::yield_now().await;

        clock.advance(Duration::from_millis(50));
        clock.block_until_ready().await;

        // First window [0,100) closes, containing both items (item 2 arrived
        // at t=50ms, while this window was still open).
        let a = out.recv().await.unwrap();
        let b = out.recv().await.unwrap();
        assert_eq!(*a.value(), 1);
        assert_eq!(*b.value(), 2);
    }

    #[tokio::test]
    async fn degenerate_slide_equals_size_behaves_like_tumbling() {
        let clock = FakeClock::new();
        let win = SlidingWindow::new(
            "sliding",
            Duration::from_millis(100),
            Duration::from_millis(100),
            clock.clone(),
        );
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = win.process(ctx, input);

        tx.send(Res::success(10)).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(100));
        clock.block_until_ready().await;

        let first = out.recv().await.unwrap();
        assert_eq!(*first.value(), 10);
        drop(tx);
    }
}
