//! Session (gap-driven, per-key) windows — §4.10.
//!
//! Critical invariant called out by the spec: the emitted window metadata
//! must use the session's dynamic `current_end`, not the `meta.end`
//! captured when the session opened, so the emitted window reflects the
//! session's actual duration.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::metadata::{Metadata, WindowKind, WindowMetadata};
use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Floor applied to the reaper interval so a tiny `gap` doesn't spin a busy
/// loop of wakeups.
const REAPER_FLOOR: Duration = Duration::from_millis(10);

struct Session<T> {
    start: SystemTime,
    results: Vec<Res<T>>,
    current_end: SystemTime,
}

/// Groups items by a user-supplied session key; a session extends its
/// `current_end` on every arrival and is closed by a periodic reaper once
/// `current_end` has passed.
pub struct SessionWindow<T, K, F> {
    name: String,
    gap: Duration,
    key_fn: F,
    clock: Arc<dyn Clock>,
    _marker: std::marker::PhantomData<(T, K)>,
}

impl<T, K, F> SessionWindow<T, K, F>
where
    T: Clone + Send + 'static,
    K: Eq + Hash + Send + 'static,
    F: Fn(&T) -> K + Send + 'static,
{
    pub fn new(name: impl Into<String>, gap: Duration, key_fn: F, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            gap,
            key_fn,
            clock,
            _marker: std::marker::PhantomData,
        }
    }

    fn reaper_interval(&self) -> Duration {
        std::cmp::max(self.gap / 4, REAPER_FLOOR)
    }
}

impl<T, K, F> Processor<T, T> for SessionWindow<T, K, F>
where
    T: Clone + Send + 'static,
    K: Eq + Hash + Send + 'static,
    F: Fn(&T) -> K + Send + 'static,
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
            let mut reaper = self.clock.ticker(self.reaper_interval());
            let mut sessions: HashMap<K, Session<T>> = HashMap::new();

            loop {
                tokio::select! {
                    biased;

                    _ = ctx.cancelled() => return,

                    item = recv_or_cancel(&mut input, &ctx) => {
                        match item {
                            Some(res) => {
                                let now = self.clock.now();
                                match res.as_success() {
                                    Some(value) => {
                                        let key = (self.key_fn)(value);
                                        let session = sessions.entry(key).or_insert_with(|| Session {
                                            start: now,
                                            results: Vec::new(),
                                            current_end: now + self.gap,
                                        });
                                        session.current_end = now + self.gap;
                                        session.results.push(res);
                                    }
                                    // Errors have no key to evaluate against; bypass
                                    // session assignment and forward immediately.
                                    None => {
                                        if !send_or_cancel(&tx, res.chain_push(self.name.clone()), &ctx).await {
                                            return;
                                        }
                                    }
                                }
                            }
                            None => {
                                for (_, session) in sessions.drain() {
                                    if !flush_session(&tx, session, self.gap, &ctx).await {
                                        return;
                                    }
                                }
                                return;
                            }
                        }
                    }

                    _ = reaper.tick() => {
                        let now = self.clock.now();
                        let expired: Vec<K> = sessions
                            .iter()
                            .filter(|(_, s)| s.current_end < now)
                            .map(|(k, _)| k.clone_key())
                            .collect();
                        for key in expired {
                            if let Some(session) = sessions.remove(&key) {
                                if !flush_session(&tx, session, self.gap, &ctx).await {
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

async fn flush_session<T: Clone>(
    tx: &mpsc::Sender<Res<T>>,
    session: Session<T>,
    gap: Duration,
    ctx: &CancellationToken,
) -> bool {
    let meta = WindowMetadata {
        start: session.start,
        end: session.current_end,
        kind: WindowKind::Session,
        size: None,
        slide: None,
        gap: Some(gap),
    };
    for res in session.results {
        let tagged = res.with_metadata(crate::metadata::WINDOW, Metadata::Window(meta));
        if !send_or_cancel(tx, tagged, ctx).await {
            return false;
        }
    }
    true
}

/// `HashMap::iter` yields `&K`; collecting expired keys into an owned `Vec<K>`
/// for removal needs `Clone`, but requiring `K: Clone` on the whole processor
/// would be an unnecessary bound on the common case of `Copy` keys. This
/// narrow helper keeps the bound local to the reaper sweep.
trait CloneKey {
    fn clone_key(&self) -> Self;
}

impl<K: Clone> CloneKey for K {
    fn clone_key(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[tokio::test]
    async fn extends_session_and_splits_on_gap() {
        let clock = FakeClock::new();
        let win = SessionWindow::new(
            "session",
            Duration::from_millis(100),
            |v: &(&'static str, i32)| v.0,
            clock.clone(),
        );
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = win.process(ctx, input);

        tx.send(Res::success(("u", 1))).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(50));
        clock.block_until_ready().await;

        tx.send(Res::success(("u", 2))).await.unwrap();
        tokio::task::yield_now().await;
        clock.advance(Duration::from_millis(100));
        clock.block_until_ready().await;
        tokio::task::yield_now().await;

        // First session [0, 150ms] (current_end extended by the second
        // item) should have closed by now, containing both items.
        let a = out.recv().await.unwrap();
        let b = out.recv().await.unwrap();
        assert_eq!(a.value().1, 1);
        assert_eq!(b.value().1, 2);
        let meta = a.get_metadata(crate::metadata::WINDOW).unwrap().as_window().unwrap();
        assert_eq!(meta.kind, WindowKind::Session);

        tx.send(Res::success(("u", 3))).await.unwrap();
        drop(tx);

        let c = out.recv().await.unwrap();
        assert_eq!(c.value().1, 3);
    }
}
