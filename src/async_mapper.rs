//! AsyncMapper — §4.12, order-preserving parallel mapping.
//!
//! Arriving items are tagged with monotonically increasing sequence
//! numbers and distributed to a worker pool; each worker writes its result
//! into a pending map under its sequence number; a single emitter advances
//! a cursor, emitting `cursor`, `cursor + 1`, … as they become available,
//! stalling emission (not the workers) while the cursor's result is
//! missing.
//!
//! Grounded on the teacher's worker-pool shape (`p2panda-net`'s actor
//! tasks reading off a shared channel) generalized with a sequence
//! number / pending-map emitter, the standard technique for turning an
//! unordered worker pool back into an ordered stream.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::{Res, StreamError};

type MapFn<In, Out> = Arc<dyn Fn(In) -> Pin<Box<dyn Future<Output = Res<Out>> + Send>> + Send + Sync>;

/// Bound on how far the cursor may lag the highest sequence number handed
/// to a worker, expressed as a multiple of `workers`. Keeps the pending
/// map's size bounded by `workers + k·workers` regardless of total items
/// processed, per the invariant in §4.12.
const GAP_MULTIPLE: usize = 4;

struct Sequenced<In> {
    seq: u64,
    item: Res<In>,
}

fn error_as_out<In, Out>(err: StreamError<In>) -> StreamError<Out> {
    StreamError {
        value: None,
        source: err.source,
        processor: err.processor,
        at: err.at,
        chain: err.chain,
    }
}

/// Maps `In` to `Out` across `workers` concurrent tasks while preserving
/// input order on the output side.
pub struct AsyncMapper<In, Out> {
    name: String,
    workers: usize,
    map_fn: MapFn<In, Out>,
}

impl<In, Out> AsyncMapper<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, workers: usize, map_fn: F) -> Self
    where
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Res<Out>> + Send + 'static,
    {
        assert!(workers > 0, "AsyncMapper requires at least one worker");
        Self {
            name: name.into(),
            workers,
            map_fn: Arc::new(move |input| Box::pin(map_fn(input))),
        }
    }
}

impl<In, Out> Processor<In, Out> for AsyncMapper<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<In>>,
    ) -> mpsc::Receiver<Res<Out>> {
        let (out_tx, out_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        // Bounded so a worker stalls (rather than the pending map growing
        // unboundedly) once the cursor falls `GAP_MULTIPLE * workers` items
        // behind the highest sequence number dispatched.
        let work_capacity = self.workers * GAP_MULTIPLE;
        let (work_tx, work_rx) = mpsc::channel::<Sequenced<In>>(work_capacity);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let pending: Arc<Mutex<HashMap<u64, Res<Out>>>> = Arc::new(Mutex::new(HashMap::new()));
        let pending_notify = Arc::new(Notify::new());
        let workers_done = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..self.workers {
            let work_rx = work_rx.clone();
            let pending = pending.clone();
            let pending_notify = pending_notify.clone();
            let map_fn = self.map_fn.clone();
            let workers_done = workers_done.clone();
            tokio::spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    match next {
                        Some(Sequenced { seq, item }) => {
                            let result = match item.is_success() {
                                true => (map_fn)(item.into_value()).await,
                                false => Res::from_error(error_as_out(item.into_error())),
                            };
                            pending.lock().await.insert(seq, result);
                            pending_notify.notify_waiters();
                        }
                        None => break,
                    }
                }
                workers_done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                pending_notify.notify_waiters();
            });
        }

        let dispatcher_ctx = ctx.clone();
        tokio::spawn(async move {
            let mut next_seq: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = dispatcher_ctx.cancelled() => return,
                    item = recv_or_cancel(&mut input, &dispatcher_ctx) => {
                        match item {
                            Some(res) => {
                                let seq = next_seq;
                                next_seq += 1;
                                tokio::select! {
                                    biased;
                                    _ = dispatcher_ctx.cancelled() => return,
                                    send = work_tx.send(Sequenced { seq, item: res }) => {
                                        if send.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
            // `work_tx` drops here, closing the work channel so every
            // worker's `recv()` returns `None` once drained.
        });

        tokio::spawn(async move {
            let mut cursor: u64 = 0;
            loop {
                let ready = pending.lock().await.remove(&cursor);
                match ready {
                    Some(result) => {
                        cursor += 1;
                        if !send_or_cancel(&out_tx, result, &ctx).await {
                            return;
                        }
                    }
                    None => {
                        let all_workers_done =
                            workers_done.load(std::sync::atomic::Ordering::SeqCst) == self.workers;
                        if all_workers_done && pending.lock().await.is_empty() {
                            return;
                        }
                        tokio::select! {
                            biased;
                            _ = ctx.cancelled() => return,
                            _ = pending_notify.notified() => {}
                        }
                    }
                }
            }
        });

        out_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn preserves_input_order_despite_unordered_completion() {
        let mapper = AsyncMapper::new("mapper", 4, |v: u64| async move {
            // Odd items finish faster than even ones, forcing the emitter
            // to actually stall on the cursor rather than coincidentally
            // draining in order.
            let delay = if v % 2 == 0 { 20 } else { 1 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Res::success(v * 10)
        });

        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = mapper.process(ctx, input);

        for v in 0..6u64 {
            tx.send(Res::success(v)).await.unwrap();
        }
        drop(tx);

        let mut results = Vec::new();
        while let Some(r) = out.recv().await {
            results.push(*r.value());
        }
        assert_eq!(results, vec![0, 10, 20, 30, 40, 50]);
    }

    #[tokio::test]
    async fn error_items_are_forwarded_in_place() {
        let mapper = AsyncMapper::new("mapper", 2, |v: u64| async move { Res::success(v + 1) });
        let (tx, input) = mpsc::channel(16);
        let ctx = CancellationToken::new();
        let mut out = mapper.process(ctx, input);

        tx.send(Res::success(1)).await.unwrap();
        tx.send(Res::error(Some(2u64), std::io::Error::other("boom"), "source")).await.unwrap();
        tx.send(Res::success(3)).await.unwrap();
        drop(tx);

        assert_eq!(*out.recv().await.unwrap().value(), 2);
        assert!(out.recv().await.unwrap().is_error());
        assert_eq!(*out.recv().await.unwrap().value(), 4);
    }
}
