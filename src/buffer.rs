//! Buffer / DroppingBuffer / SlidingBuffer — §4.16.
//!
//! All three decouple producer and consumer via an in-memory queue of
//! capacity `n`; they differ only in what happens when the queue is full.
//! All three close their output after the input is closed and the queue
//! is drained.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::processor::{recv_or_cancel, send_or_cancel, Processor, DEFAULT_CHANNEL_CAPACITY};
use crate::result::Res;

/// Blocks the producer when full — a thin, named wrapper around a bounded
/// `tokio::sync::mpsc` channel, kept as its own [`Processor`] so it
/// composes in a pipeline the same way `DroppingBuffer`/`SlidingBuffer` do.
pub struct Buffer<T> {
    name: String,
    capacity: usize,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Buffer<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "Buffer requires a positive capacity");
        Self {
            name: name.into(),
            capacity,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Processor<T, T> for Buffer<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                if !send_or_cancel(&tx, item, &ctx).await {
                    return;
                }
            }
        });
        rx
    }
}

/// Optional observer invoked with every item a `DroppingBuffer` or
/// `SlidingBuffer` discards.
pub type DropCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// When full, drops the *newest* arrival rather than blocking the
/// producer.
pub struct DroppingBuffer<T> {
    name: String,
    capacity: usize,
    on_drop: Option<DropCallback<T>>,
    dropped: Arc<AtomicU64>,
}

impl<T> DroppingBuffer<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "DroppingBuffer requires a positive capacity");
        Self {
            name: name.into(),
            capacity,
            on_drop: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_on_drop(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_drop = Some(Arc::new(callback));
        self
    }

    pub fn dropped_count(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

impl<T> Processor<T, T> for DroppingBuffer<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        tokio::spawn(async move {
            while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                match tx.try_send(item) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(item)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        if let (Some(cb), Some(value)) = (&self.on_drop, item.as_success()) {
                            cb(value);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        });
        rx
    }
}

/// When full, evicts the *oldest* queued item and appends the newest.
pub struct SlidingBuffer<T> {
    name: String,
    capacity: usize,
    on_evict: Option<DropCallback<T>>,
}

impl<T> SlidingBuffer<T>
where
    T: Send + 'static,
{
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        assert!(capacity > 0, "SlidingBuffer requires a positive capacity");
        Self {
            name: name.into(),
            capacity,
            on_evict: None,
        }
    }

    pub fn with_on_evict(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Arc::new(callback));
        self
    }
}

impl<T> Processor<T, T> for SlidingBuffer<T>
where
    T: Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process(
        self,
        ctx: CancellationToken,
        mut input: mpsc::Receiver<Res<T>>,
    ) -> mpsc::Receiver<Res<T>> {
        // The sliding eviction policy needs to pop the oldest queued item,
        // which a `tokio::sync::mpsc::Sender::try_send` cannot express (it
        // can reject a send but not retract one already queued). So the
        // actual N-sized queue is a plain `VecDeque` guarded by a `Mutex`,
        // shared between a receiver task (push + evict) and a forwarder
        // task (pop + send); `tx`/`rx` are just the one-at-a-time conduit
        // handed to the forwarder, unrelated to `capacity`.
        let (tx, rx) = mpsc::channel(1);
        let queue: Arc<tokio::sync::Mutex<std::collections::VecDeque<Res<T>>>> =
            Arc::new(tokio::sync::Mutex::new(std::collections::VecDeque::with_capacity(self.capacity)));
        let notify = Arc::new(tokio::sync::Notify::new());
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let capacity = self.capacity;
        let on_evict = self.on_evict.clone();
        {
            let queue = queue.clone();
            let notify = notify.clone();
            let closed = closed.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                while let Some(item) = recv_or_cancel(&mut input, &ctx).await {
                    let mut q = queue.lock().await;
                    if q.len() >= capacity {
                        if let Some(evicted) = q.pop_front() {
                            if let (Some(cb), Some(value)) = (&on_evict, evicted.as_success()) {
                                cb(value);
                            }
                        }
                    }
                    q.push_back(item);
                    drop(q);
                    notify.notify_waiters();
                }
                closed.store(true, std::sync::atomic::Ordering::SeqCst);
                notify.notify_waiters();
            });
        }

        tokio::spawn(async move {
            loop {
                // Register for the next notification before checking state,
                // so a push that races between our check and the wait is
                // never missed (mirrors `FakeClock::wait_until`'s discipline).
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let next = queue.lock().await.pop_front();
                match next {
                    Some(item) => {
                        if !send_or_cancel(&tx, item, &ctx).await {
                            return;
                        }
                    }
                    None => {
                        if closed.load(std::sync::atomic::Ordering::SeqCst) {
                            return;
                        }
                        tokio::select! {
                            biased;
                            _ = ctx.cancelled() => return,
                            _ = notified => {}
                        }
                    }
                }
            }
        });

        rx
    }
}
