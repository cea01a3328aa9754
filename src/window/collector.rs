//! Window collector — §4.11.
//!
//! A stateless (per-item) aggregator that groups already-windowed `Res<T>`
//! by [`WindowId`] and, once a window's identity stops appearing in the
//! input for `quiet_period`, emits the accumulated group downstream as a
//! single `Res<Vec<T>>` paired with its errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::metadata::WindowId;
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// The accumulated contents of one window, produced by [`WindowCollector`].
#[derive(Debug, Clone)]
pub struct Collected<T> {
    pub id: WindowId,
    values: Vec<T>,
    errors: Vec<String>,
}

impl<T> Collected<T> {
    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn count(&self) -> usize {
        self.values.len() + self.errors.len()
    }
}

struct Group<T> {
    collected: Collected<T>,
    last_seen: Duration,
}

/// Aggregates windowed results by [`WindowId`]. Requires its input to carry
/// window metadata (i.e. to have passed through a [`crate::window::TumblingWindow`],
/// [`crate::window::SlidingWindow`], or [`crate::window::SessionWindow`]);
/// a `Res` with no window metadata is dropped with a warning, since there is
/// no identity to group it under.
pub struct WindowCollector<T> {
    name: String,
    quiet_period: Duration,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<T>,
}

impl<T> WindowCollector<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, quiet_period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            quiet_period,
            clock,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, Collected<T>> for WindowCollector<T>
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
    ) -> mpsc::Receiver<Res<Collected<T>>> {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let sweep_interval = std::cmp::max(self.quiet_period / 4, Duration::from_millis(10));
            let mut reaper = self.clock.ticker(sweep_interval);
            let mut groups: HashMap<WindowId, Group<T>> = HashMap::new();

            loop {
                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => return,

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => {
                                let id = match res.get_metadata(crate::metadata::WINDOW).and_then(|m| m.as_window()) {
                                    Some(meta) => meta.id(),
                                    None => {
                                        tracing::warn!(processor = %self.name, "dropping result with no window metadata");
                                        continue;
                                    }
                                };
                                let now = self.clock.now();
                                let offset = now
                                    .duration_since(std::time::SystemTime::UNIX_EPOCH)
                                    .unwrap_or_default();
                                let group = groups.entry(id).or_insert_with(|| Group {
                                    collected: Collected { id, values: Vec::new(), errors: Vec::new() },
                                    last_seen: offset,
                                });
                                group.last_seen = offset;
                                match res.as_success() {
                                    Some(v) => group.collected.values.push(v.clone()),
                                    None => group.collected.errors.push(res.error_ref().to_string()),
                                }
                            }
                            None => {
                                for (_, group) in groups.drain() {
                                    if !send_or_cancel(&tx, Res::success(group.collected), &ctx).await {
                                        return;
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = reaper.tick() => {
                        let now = self.clock.now();
                        let offset = now
                            .duration_since(std::time::SystemTime::UNIX_EPOCH)
                            .unwrap_or_default();
                        let ready: Vec<WindowId> = groups
                            .iter()
                            .filter(|(_, g)| offset.saturating_sub(g.last_seen) >= self.quiet_period)
                            .map(|(id, _)| *id)
                            .collect();
                        for id in ready {
                            if let Some(group) = groups.remove(&id) {
                                if !send_or_cancel(&tx, Res::success(group.collected), &ctx).await {
                                    return;
                                }
                            }
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
    use crate::metadata::{Metadata, WindowKind, WindowMetadata};

    fn tagged(value: i32, start_ms: u64, end_ms: u64) -> Res<i32> {
        let epoch = std::time::SystemTime::UNIX_EPOCH;
        let meta = WindowMetadata {
            start: epoch + Duration::from_millis(start_ms),
            end: epoch + Duration::from_millis(end_ms),
            kind: WindowKind::Tumbling,
            size: Some(Duration::from_millis(end_ms - start_ms)),
            slide: None,
            gap: None,
        };
        Res::success(value).with_metadata(crate::metadata::WINDOW, Metadata::Window(meta))
    }

    #[tokio::test]
    async fn groups_by_window_identity_and_flushes_on_quiet_period() {
        let clock = FakeClock::new();
        let collector = WindowCollector::new("collector", Duration::from_millis(100), clock.clone());
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = collector.process(ctx, input);

        tx.send(tagged(1, 0, 100)).await.unwrap();
        tx.send(tagged(2, 0, 100)).await.unwrap();
        tokio::task::yield_now().await;

        clock.advance(Duration::from_millis(100));
        clock.block_until_ready().await;
        tokio::task::yield_now().await;

        let result = out.recv().await.unwrap();
        let collected = result.value();
        assert_eq!(collected.values(), &[1, 2]);
        assert_eq!(collected.count(), 2);

        drop(tx);
    }
}
